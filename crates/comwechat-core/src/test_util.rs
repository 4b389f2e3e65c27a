//! Test doubles for the chat client and the master.

use std::collections::HashMap;
use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::client::{AccountInfo, ChatClient, ClientResult, ContactRecord};
use crate::error::ClientError;
use crate::master::Master;
use crate::types::{Author, MasterMessage, MasterStatus};

/// A command the fake client received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Text { wxid: String, text: String },
    Xml { wxid: String, xml: String },
    Image { wxid: String, path: String },
    File { wxid: String, path: String },
    Emotion { wxid: String, path: String },
    Forward { wxid: String, msgid: String },
    Query { db: String, sql: String },
    Download { msgid: String },
    AcceptTransfer { transaction_id: String, transfer_id: String, wxid: String },
    VerifyFriend { v3: String, v4: String },
    AddContact { v3: String },
}

impl Call {
    pub fn wxid(&self) -> &str {
        match self {
            Self::Text { wxid, .. }
            | Self::Xml { wxid, .. }
            | Self::Image { wxid, .. }
            | Self::File { wxid, .. }
            | Self::Emotion { wxid, .. }
            | Self::Forward { wxid, .. }
            | Self::AcceptTransfer { wxid, .. } => wxid,
            _ => "",
        }
    }
}

/// In-memory chat client. Every command is recorded and, when a watcher is
/// attached, mirrored to it so a test can answer with callbacks.
pub struct FakeClient {
    pub logged_in: Mutex<bool>,
    pub account: Mutex<AccountInfo>,
    /// How long an account lookup takes.
    pub account_delay: Mutex<Duration>,
    pub calls: Mutex<Vec<Call>>,
    pub contacts: Mutex<HashMap<String, ContactRecord>>,
    pub members: Mutex<HashMap<String, HashMap<String, String>>>,
    /// Rows answered to every database query, header first.
    pub rows: Mutex<Vec<Vec<String>>>,
    pub cdn_path: Mutex<Option<String>>,
    pub fail_sends: Mutex<bool>,
    watcher: Mutex<Option<mpsc::Sender<Call>>>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            logged_in: Mutex::new(true),
            account: Mutex::new(AccountInfo {
                wxid: "wxid_me".into(),
                nickname: "Me".into(),
                file_savepath: None,
            }),
            account_delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
            contacts: Mutex::new(HashMap::new()),
            members: Mutex::new(HashMap::new()),
            rows: Mutex::new(Vec::new()),
            cdn_path: Mutex::new(None),
            fail_sends: Mutex::new(false),
            watcher: Mutex::new(None),
        }
    }

    pub fn watch(&self) -> mpsc::Receiver<Call> {
        let (tx, rx) = mpsc::channel();
        *self.watcher.lock() = Some(tx);
        rx
    }

    pub fn add_contact_record(&self, wxid: &str, remark: &str, nickname: &str) {
        self.contacts.lock().insert(
            wxid.to_string(),
            ContactRecord {
                wxid: wxid.to_string(),
                remark: remark.to_string(),
                nickname: nickname.to_string(),
                contact_type: 3,
            },
        );
    }

    pub fn set_group_members(&self, group: &str, members: &[(&str, &str)]) {
        self.members.lock().insert(
            group.to_string(),
            members
                .iter()
                .map(|(wxid, alias)| ((*wxid).to_string(), (*alias).to_string()))
                .collect(),
        );
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn record(&self, call: Call) -> ClientResult<()> {
        self.calls.lock().push(call.clone());
        if let Some(tx) = self.watcher.lock().as_ref() {
            let _ = tx.send(call);
        }
        Ok(())
    }

    fn send(&self, call: Call) -> ClientResult<()> {
        if *self.fail_sends.lock() {
            return Err(ClientError::Transport("connection refused".into()));
        }
        self.record(call)
    }
}

impl ChatClient for FakeClient {
    fn is_logged_in(&self) -> ClientResult<bool> {
        Ok(*self.logged_in.lock())
    }

    fn account(&self) -> ClientResult<AccountInfo> {
        let delay = *self.account_delay.lock();
        std::thread::sleep(delay);
        Ok(self.account.lock().clone())
    }

    fn send_text(&self, wxid: &str, text: &str) -> ClientResult<()> {
        self.send(Call::Text {
            wxid: wxid.into(),
            text: text.into(),
        })
    }

    fn send_xml(&self, wxid: &str, xml: &str) -> ClientResult<()> {
        self.send(Call::Xml {
            wxid: wxid.into(),
            xml: xml.into(),
        })
    }

    fn send_image(&self, wxid: &str, client_path: &str) -> ClientResult<()> {
        self.send(Call::Image {
            wxid: wxid.into(),
            path: client_path.into(),
        })
    }

    fn send_file(&self, wxid: &str, client_path: &str) -> ClientResult<()> {
        self.send(Call::File {
            wxid: wxid.into(),
            path: client_path.into(),
        })
    }

    fn send_emotion(&self, wxid: &str, client_path: &str) -> ClientResult<()> {
        self.send(Call::Emotion {
            wxid: wxid.into(),
            path: client_path.into(),
        })
    }

    fn forward_message(&self, wxid: &str, msgid: &str) -> ClientResult<()> {
        self.send(Call::Forward {
            wxid: wxid.into(),
            msgid: msgid.into(),
        })
    }

    fn query_database(&self, db_name: &str, sql: &str) -> ClientResult<Vec<Vec<String>>> {
        self.record(Call::Query {
            db: db_name.into(),
            sql: sql.into(),
        })?;
        Ok(self.rows.lock().clone())
    }

    fn contacts(&self) -> ClientResult<HashMap<String, ContactRecord>> {
        Ok(self.contacts.lock().clone())
    }

    fn contact(&self, wxid: &str) -> ClientResult<Option<ContactRecord>> {
        Ok(self.contacts.lock().get(wxid).cloned())
    }

    fn group_members(&self, group: &str) -> ClientResult<HashMap<String, String>> {
        Ok(self.members.lock().get(group).cloned().unwrap_or_default())
    }

    fn all_group_members(&self) -> ClientResult<HashMap<String, HashMap<String, String>>> {
        Ok(self.members.lock().clone())
    }

    fn download_media(&self, msgid: &str) -> ClientResult<Option<String>> {
        self.record(Call::Download {
            msgid: msgid.into(),
        })?;
        Ok(self.cdn_path.lock().clone())
    }

    fn accept_transfer(
        &self,
        transaction_id: &str,
        transfer_id: &str,
        wxid: &str,
    ) -> ClientResult<bool> {
        self.record(Call::AcceptTransfer {
            transaction_id: transaction_id.into(),
            transfer_id: transfer_id.into(),
            wxid: wxid.into(),
        })?;
        Ok(true)
    }

    fn verify_friend_request(&self, v3: &str, v4: &str) -> ClientResult<bool> {
        self.record(Call::VerifyFriend {
            v3: v3.into(),
            v4: v4.into(),
        })?;
        Ok(true)
    }

    fn add_contact(&self, v3: &str, _greeting: &str) -> ClientResult<bool> {
        self.record(Call::AddContact { v3: v3.into() })?;
        Ok(false)
    }
}

/// Master that keeps everything it is handed.
#[derive(Default)]
pub struct RecordingMaster {
    pub messages: Mutex<Vec<MasterMessage>>,
    pub statuses: Mutex<Vec<MasterStatus>>,
    pub authors: Mutex<HashMap<String, Author>>,
}

impl RecordingMaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<MasterMessage> {
        self.messages.lock().clone()
    }

    pub fn statuses(&self) -> Vec<MasterStatus> {
        self.statuses.lock().clone()
    }
}

impl Master for RecordingMaster {
    fn deliver(&self, message: MasterMessage) {
        self.authors
            .lock()
            .insert(message.uid.clone(), message.author.clone());
        self.messages.lock().push(message);
    }

    fn status(&self, status: MasterStatus) {
        self.statuses.lock().push(status);
    }

    fn message_author(&self, _chat_uid: &str, msgid: &str) -> Option<Author> {
        self.authors.lock().get(msgid).cloned()
    }
}
