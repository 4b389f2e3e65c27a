//! The bridge coordinator.
//!
//! [`Bridge`] owns every table the bridge keeps (pending sends, file locks,
//! deferred media, delivered ids, staged files, directory), each behind its
//! own lock. Event callbacks enter through [`Bridge::handle_event`], which
//! never fails; outbound sends enter through [`Bridge::send_message`] and
//! block the calling thread until confirmed or timed out. A single poll loop
//! drives [`Bridge::tick`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::client::{AccountInfo, ChatClient};
use crate::config::BridgeConfig;
use crate::correlate::{MatchOutcome, correlate_sent};
use crate::dedup::DeliveryCache;
use crate::directory::{Directory, STORE_FILE};
use crate::error::{Error, Result};
use crate::file_locks::FileLocks;
use crate::master::Master;
use crate::media_queue::{DeferredMedia, MediaOutcome, MediaQueue, recover_voice};
use crate::normalize;
use crate::notice::{self, ContactCard, FriendRequest, Transfer};
use crate::pending::PendingSends;
use crate::staging::StagedFiles;
use crate::types::{
    Author, Chat, EventCategory, InboundEvent, MasterStatus, is_group_id,
};
use crate::xml;

mod outbound;

pub use outbound::FORWARD_LINK;

/// Uid and name of the system chat the bridge reports its own state in.
pub const SYSTEM_CHAT: &str = "ComWeChat";

/// Separator the client puts between a mention and the message body.
const MENTION_SEPARATOR: char = '\u{2005}';

pub struct Bridge<C, M> {
    config: BridgeConfig,
    client: C,
    master: M,
    directory: Directory,
    pending: PendingSends,
    seen: DeliveryCache,
    file_locks: FileLocks,
    media: MediaQueue,
    staged: StagedFiles,
    base_path: RwLock<Option<String>>,
    forward_token: String,
    ticks: AtomicU64,
}

impl<C, M> Bridge<C, M>
where
    C: ChatClient,
    M: Master,
{
    pub fn new(config: BridgeConfig, client: C, master: M) -> Self {
        let window = config.media_timeout();
        let digest = hex::encode(Sha256::digest(config.channel_id.as_bytes()));
        Self {
            seen: DeliveryCache::new(config.dedup_capacity, window),
            media: MediaQueue::new(window),
            staged: StagedFiles::new(window),
            base_path: RwLock::new(config.base_path.clone()),
            forward_token: digest[..32].to_string(),
            directory: Directory::new(),
            pending: PendingSends::new(),
            file_locks: FileLocks::new(),
            ticks: AtomicU64::new(0),
            config,
            client,
            master,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn master(&self) -> &M {
        &self.master
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn pending(&self) -> &PendingSends {
        &self.pending
    }

    pub fn media_queue(&self) -> &MediaQueue {
        &self.media
    }

    pub fn staged_files(&self) -> &StagedFiles {
        &self.staged
    }

    /// Resolves the logged-in account and loads its directory. Posts a
    /// system notice when the client is not logged in.
    pub fn start(&self) -> Result<AccountInfo> {
        match self.ensure_account() {
            Some(account) => {
                info!("bridge started for {} ({})", account.nickname, account.wxid);
                Ok(account)
            }
            None => {
                self.notify_system("Not logged in. Log in on the chat client, then retry.");
                Err(Error::NotLoggedIn)
            }
        }
    }

    /// Forces a contact and group refresh; skipped tables were already being
    /// refreshed.
    pub fn refresh_directory(&self) -> Result<()> {
        self.ensure_account().ok_or(Error::NotLoggedIn)?;
        let contacts = self.directory.refresh_contacts(&self.client);
        let groups = self.directory.refresh_groups(&self.client);
        debug!("directory refresh ran contacts={contacts} groups={groups}");
        Ok(())
    }

    pub(crate) fn ensure_account(&self) -> Option<AccountInfo> {
        if let Some(account) = self.directory.account() {
            return Some(account);
        }
        match self.client.is_logged_in() {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                warn!("login check failed: {err}");
                return None;
            }
        }
        let (account, fetched) = self.directory.refresh_account(&self.client)?;
        if fetched {
            self.on_login(&account);
        }
        Some(account)
    }

    fn on_login(&self, account: &AccountInfo) {
        {
            let mut base_path = self.base_path.write();
            if base_path.is_none() {
                base_path.clone_from(&account.file_savepath);
            }
        }
        let store = self.config.dir.join(&account.wxid).join(STORE_FILE);
        if let Err(err) = self.directory.load(&store) {
            warn!("loading {} failed: {err}", store.display());
        }
        self.directory.refresh_contacts(&self.client);
        self.directory.refresh_groups(&self.client);
    }

    fn ensure_directory(&self) {
        if !self.directory.has_contacts() && self.ensure_account().is_some() {
            self.directory.refresh_contacts(&self.client);
        }
    }

    /// Entry point for every chat-client callback.
    pub fn handle_event(&self, category: EventCategory, event: InboundEvent) {
        debug!("{}: {event:?}", category.as_str());
        if category != EventCategory::Sent {
            self.ensure_directory();
        }
        match category {
            EventCategory::Sent => self.on_sent(&event),
            EventCategory::SelfMsg => self.on_self(event),
            EventCategory::Friend => self.on_friend(event),
            EventCategory::Group => self.on_group(event),
            EventCategory::Revoke => self.on_revoke(&event),
            EventCategory::Transfer => self.on_transfer(event),
            EventCategory::FriendVerify => self.on_friend_verify(&event),
            EventCategory::Card => self.on_card(&event),
        }
    }

    fn on_sent(&self, event: &InboundEvent) {
        if let MatchOutcome::Resolved(key) = correlate_sent(&self.pending, &self.seen, event) {
            debug!("confirmed {key:?} as {}", event.msgid);
        }
    }

    fn on_self(&self, event: InboundEvent) {
        let name = self.directory.name_of(&self.client, &event.sender);
        let chat = Chat::for_conversation(&event.sender, name);
        let mut author = Author::myself();
        if is_group_id(&chat.uid) {
            author.alias = self.directory.self_alias(&chat.uid);
        }
        self.handle_message(event, author, chat);
    }

    fn on_friend(&self, event: InboundEvent) {
        if event.msg_type == "eventnotify" {
            return;
        }
        let name = self.directory.name_of(&self.client, &event.sender);
        let chat = Chat::private(&event.sender, name);
        let author = Author::peer_of(&chat);
        self.handle_message(event, author, chat);
    }

    fn on_group(&self, event: InboundEvent) {
        let group = event.sender.clone();
        let chat = Chat::group(&group, self.directory.name_of(&self.client, &group));
        let name = self
            .directory
            .cached_name(&event.wxid)
            .unwrap_or_else(|| event.wxid.clone());

        if let Some(mentioned) = xml::tag(&event.extrainfo, "atuserlist") {
            let users: Vec<&str> = mentioned.split(',').filter(|u| !u.is_empty()).collect();
            if let [user] = users.as_slice() {
                let alias = mention_alias(&event.message);
                if !alias.is_empty() && alias != name {
                    self.directory.learn_alias(&group, user, alias);
                }
            }
        }

        let alias = self.directory.member_alias(&self.client, &group, &event.wxid);
        let author = Author::member(&event.wxid, name, alias);
        self.handle_message(event, author, chat);
    }

    fn on_revoke(&self, event: &InboundEvent) {
        let name = self.directory.name_of(&self.client, &event.sender);
        let chat = Chat::for_conversation(&event.sender, name);
        let Some(uid) = xml::tag(&event.message, "newmsgid") else {
            warn!("revoke from {} carries no newmsgid", event.sender);
            return;
        };
        self.master.status(MasterStatus::MessageRemoval { chat, uid });
    }

    fn on_transfer(&self, event: InboundEvent) {
        let name = self.directory.name_of(&self.client, &event.sender);
        if notice::is_phone_transfer(&event) {
            let chat = Chat::private(&event.sender, name);
            let author = Author::peer_of(&chat);
            self.handle_message(event, author, chat);
            return;
        }
        match Transfer::parse(&event.message) {
            Some(transfer) => {
                let uid = notice_uid(&event);
                self.master
                    .deliver(transfer.notice(uid, &event.sender, &name));
            }
            None => warn!("unrecognised transfer message from {}", event.sender),
        }
    }

    fn on_friend_verify(&self, event: &InboundEvent) {
        match FriendRequest::parse(&event.message) {
            Some(request) => self
                .master
                .deliver(request.notice(notice_uid(event), &event.sender)),
            None => warn!("friend request without v3/v4 tickets from {}", event.sender),
        }
    }

    fn on_card(&self, event: &InboundEvent) {
        let name = self.directory.name_of(&self.client, &event.sender);
        let card = ContactCard::parse(&event.message);
        self.master
            .deliver(card.notice(notice_uid(event), &event.sender, &name));
    }

    /// Duplicate filter, then immediate or deferred delivery.
    pub fn handle_message(&self, mut event: InboundEvent, author: Author, chat: Chat) {
        if !event.msgid.is_empty() {
            let delivery = self.seen.observe(&event.msgid, &event.msg_type);
            if !delivery.should_deliver() {
                debug!("dropping duplicate delivery of {}", event.msgid);
                return;
            }
        }

        if let Some(path) = self.media_path(&event) {
            event.filepath = path.to_string_lossy().into_owned();
            if path.exists() {
                self.master
                    .deliver(normalize::normalize(&event, chat, author));
            } else {
                self.media
                    .enqueue(path, DeferredMedia::new(event, author, chat));
            }
            return;
        }
        self.master.deliver(normalize::normalize(&event, chat, author));
    }

    /// Local path a media event's file will be written to, if it has one.
    fn media_path(&self, event: &InboundEvent) -> Option<PathBuf> {
        if event.filepath.contains("FileStorage") && !event.filepath.contains("Cache") {
            return Some(self.local_path(&event.filepath));
        }
        if event.msg_type == "video" && !event.thumb_path.is_empty() {
            return Some(self.local_path(&event.thumb_path.replace(".jpg", ".mp4")));
        }
        if event.msg_type == "voice" {
            let Some(clientmsgid) = xml::attr(&event.message, "clientmsgid") else {
                warn!("voice message {} has no clientmsgid", event.msgid);
                return None;
            };
            let owner = if event.self_wxid.is_empty() {
                self.directory.account()?.wxid
            } else {
                event.self_wxid.clone()
            };
            return Some(self.config.dir.join(owner).join(format!("{clientmsgid}.amr")));
        }
        None
    }

    /// Maps a client-relative path (backslash separated) into the local mirror.
    fn local_path(&self, client_relative: &str) -> PathBuf {
        let relative = client_relative.replace('\\', "/");
        self.config.dir.join(relative.trim_start_matches('/'))
    }

    /// One pass of the media queue and the staged-file reaper, plus the
    /// periodic directory refresh and login check.
    pub fn tick(&self, now: Instant) {
        let finalized = self.media.poll(now, |path, media| {
            recover_voice(&self.client, &media.event.msgid, path)
        });
        for done in finalized {
            let DeferredMedia {
                event, author, chat, ..
            } = done.media;
            let message = match done.outcome {
                MediaOutcome::Delivered | MediaOutcome::Recovered => {
                    normalize::finalized(&event, &done.path, chat, author)
                }
                MediaOutcome::TimedOut => {
                    warn!("media for {} never arrived at {}", event.msgid, done.path.display());
                    normalize::timed_out(&event, chat, author)
                }
            };
            self.master.deliver(message);
        }

        let swept = self.staged.sweep(now);
        if swept > 0 {
            debug!("removed {swept} staged files");
        }

        let count = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let every = self.config.directory_refresh_ticks.max(1);
        if count % every == 0 && self.directory.account().is_some() {
            self.directory.refresh_groups(&self.client);
            self.directory.refresh_contacts(&self.client);
        }
        if count % every == 3 % every {
            self.check_login();
        }
    }

    fn check_login(&self) {
        match self.client.is_logged_in() {
            Ok(true) => {}
            Ok(false) => {
                warn!("chat client reports no logged-in account");
                self.directory.clear_account();
                self.notify_system("The chat client is logged out. Log in again to keep bridging.");
            }
            Err(err) => warn!("login check failed: {err}"),
        }
    }

    /// Ticks every configured interval until `stop` is set.
    pub fn run_poll_loop(&self, stop: &AtomicBool) {
        let interval = self.config.tick();
        info!("media poll loop running every {interval:?}");
        while !stop.load(Ordering::Relaxed) {
            std::thread::sleep(interval);
            self.tick(Instant::now());
        }
        info!("media poll loop stopped");
    }

    pub(crate) fn notify_system(&self, text: &str) {
        self.master.deliver(notice::system_notice(
            timestamp_uid(),
            SYSTEM_CHAT,
            SYSTEM_CHAT,
            text,
        ));
    }

    pub(crate) fn forward_token(&self) -> &str {
        &self.forward_token
    }

    pub(crate) fn base_path(&self) -> Option<String> {
        self.base_path.read().clone()
    }

    pub(crate) fn files_dir(&self, account: &AccountInfo) -> PathBuf {
        self.config.dir.join(&account.wxid)
    }

    pub(crate) fn wait_for_file(&self, path: &Path) -> bool {
        let attempts = self.config.retry_poll_attempts;
        for attempt in 0..=attempts {
            if path.exists() {
                return true;
            }
            if attempt < attempts {
                std::thread::sleep(self.config.tick());
            }
        }
        false
    }

    pub(crate) fn send_timeout(&self) -> Duration {
        self.config.send_timeout()
    }
}

/// Display name the sender typed for the single user mentioned at the start
/// of `message`.
fn mention_alias(message: &str) -> &str {
    let head = message.split(MENTION_SEPARATOR).next().unwrap_or_default();
    head.rsplit('@').next().unwrap_or_default()
}

fn notice_uid(event: &InboundEvent) -> String {
    if event.msgid.is_empty() {
        timestamp_uid()
    } else {
        event.msgid.clone()
    }
}

pub(crate) fn timestamp_uid() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().to_string())
        .unwrap_or_default()
}
