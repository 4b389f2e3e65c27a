//! Contact names and group-member aliases.
//!
//! Only what the bridge needs to label messages: a name per wxid and the
//! per-group display names. Refreshes are skipped, not queued, while another
//! refresh of the same table is running.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::{AccountInfo, ChatClient};
use crate::error::{Error, Result};

pub const STORE_FILE: &str = "comwechat.bridge.json";

type GroupMembers = HashMap<String, HashMap<String, String>>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    group_members: GroupMembers,
}

#[derive(Debug, Default)]
pub struct Directory {
    account: RwLock<Option<AccountInfo>>,
    contacts: RwLock<HashMap<String, String>>,
    group_members: RwLock<GroupMembers>,
    store: Mutex<Option<PathBuf>>,
    account_refresh: Mutex<()>,
    contact_refresh: Mutex<()>,
    group_refresh: Mutex<()>,
    member_fetch: Mutex<()>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(&self) -> Option<AccountInfo> {
        self.account.read().clone()
    }

    pub fn set_account(&self, account: AccountInfo) {
        *self.account.write() = Some(account);
    }

    pub fn clear_account(&self) {
        *self.account.write() = None;
    }

    pub fn has_contacts(&self) -> bool {
        !self.contacts.read().is_empty()
    }

    /// Points persistence at `path` and merges whatever it already holds.
    pub fn load(&self, path: &Path) -> Result<()> {
        *self.store.lock() = Some(path.to_path_buf());
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(Error::io(format!("read {}", path.display()), err)),
        };
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        let mut members = self.group_members.write();
        for (group, aliases) in snapshot.group_members {
            members.entry(group).or_default().extend(aliases);
        }
        info!("loaded group aliases for {} groups", members.len());
        Ok(())
    }

    fn dump(&self) {
        let Some(path) = self.store.lock().clone() else {
            return;
        };
        let snapshot = Snapshot {
            group_members: self.group_members.read().clone(),
        };
        let result = serde_json::to_vec(&snapshot)
            .map_err(Error::from)
            .and_then(|bytes| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::io(format!("mkdir {}", parent.display()), e))?;
                }
                std::fs::write(&path, bytes)
                    .map_err(|e| Error::io(format!("write {}", path.display()), e))
            });
        if let Err(err) = result {
            warn!("persist group aliases failed: {err}");
        }
    }

    /// Cached display name; an empty cached name counts as unknown.
    pub fn cached_name(&self, wxid: &str) -> Option<String> {
        self.contacts
            .read()
            .get(wxid)
            .filter(|name| !name.is_empty())
            .cloned()
    }

    /// Display name for `wxid`, falling back to a single-contact lookup and
    /// then to the id itself.
    pub fn name_of<C>(&self, client: &C, wxid: &str) -> String
    where
        C: ChatClient + ?Sized,
    {
        if let Some(name) = self.contacts.read().get(wxid) {
            return if name.is_empty() {
                wxid.to_string()
            } else {
                name.clone()
            };
        }
        match client.contact(wxid) {
            Ok(Some(record)) => {
                let name = record.display_name();
                if name.is_empty() {
                    wxid.to_string()
                } else {
                    name
                }
            }
            Ok(None) => wxid.to_string(),
            Err(err) => {
                debug!("contact lookup for {wxid} failed: {err}");
                wxid.to_string()
            }
        }
    }

    /// Group display name of `wxid` in `group`. Fetches the group's member
    /// table on first use unless another fetch is already running.
    pub fn member_alias<C>(&self, client: &C, group: &str, wxid: &str) -> Option<String>
    where
        C: ChatClient + ?Sized,
    {
        if let Some(members) = self.group_members.read().get(group) {
            return members.get(wxid).cloned();
        }
        let _fetching = self.member_fetch.try_lock()?;
        match client.group_members(group) {
            Ok(members) => {
                self.merge_group_members(group, members);
            }
            Err(err) => {
                debug!("member lookup for {group} failed: {err}");
                return None;
            }
        }
        self.group_members
            .read()
            .get(group)
            .and_then(|members| members.get(wxid).cloned())
    }

    pub fn self_alias(&self, group: &str) -> Option<String> {
        let account = self.account()?;
        self.group_members
            .read()
            .get(group)
            .and_then(|members| members.get(&account.wxid).cloned())
    }

    /// Records an alias seen in a mention; persisted when it changed anything.
    pub fn learn_alias(&self, group: &str, wxid: &str, alias: &str) {
        let changed = {
            let mut members = self.group_members.write();
            let entry = members.entry(group.to_string()).or_default();
            entry.insert(wxid.to_string(), alias.to_string()).as_deref() != Some(alias)
        };
        if changed {
            self.dump();
        }
    }

    /// Merges `new_members` into `group`; persists and returns true when
    /// anything changed.
    pub fn merge_group_members(&self, group: &str, new_members: HashMap<String, String>) -> bool {
        let updated = {
            let mut members = self.group_members.write();
            let entry = members.entry(group.to_string()).or_default();
            let mut updated = false;
            for (wxid, alias) in new_members {
                if entry.get(&wxid) != Some(&alias) {
                    entry.insert(wxid, alias);
                    updated = true;
                }
            }
            updated
        };
        if updated {
            self.dump();
        }
        updated
    }

    /// Looks the account up, waiting for a lookup already in flight instead
    /// of repeating it. The flag is `true` only for the call that fetched it.
    pub fn refresh_account<C>(&self, client: &C) -> Option<(AccountInfo, bool)>
    where
        C: ChatClient + ?Sized,
    {
        let _guard = self.account_refresh.lock();
        if let Some(account) = self.account() {
            return Some((account, false));
        }
        match client.account() {
            Ok(account) => {
                self.set_account(account.clone());
                Some((account, true))
            }
            Err(err) => {
                warn!("account lookup failed: {err}");
                None
            }
        }
    }

    /// Returns false when skipped because another refresh holds the lock.
    pub fn refresh_contacts<C>(&self, client: &C) -> bool
    where
        C: ChatClient + ?Sized,
    {
        let Some(_guard) = self.contact_refresh.try_lock() else {
            debug!("contact refresh already running, skipped");
            return false;
        };
        match client.contacts() {
            Ok(records) => {
                let mut contacts = self.contacts.write();
                for (wxid, record) in records {
                    contacts.insert(wxid, record.display_name());
                }
                debug!("contact table holds {} entries", contacts.len());
            }
            Err(err) => warn!("contact refresh failed: {err}"),
        }
        true
    }

    pub fn refresh_groups<C>(&self, client: &C) -> bool
    where
        C: ChatClient + ?Sized,
    {
        let Some(_guard) = self.group_refresh.try_lock() else {
            debug!("group refresh already running, skipped");
            return false;
        };
        match client.all_group_members() {
            Ok(groups) => {
                for (group, members) in groups {
                    self.merge_group_members(&group, members);
                }
            }
            Err(err) => warn!("group refresh failed: {err}"),
        }
        true
    }
}
