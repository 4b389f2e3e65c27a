//! Command sink of the chat-client automation API.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub wxid: String,
    pub nickname: String,
    /// Account storage directory as seen by the chat client.
    #[serde(default)]
    pub file_savepath: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactRecord {
    pub wxid: String,
    pub remark: String,
    pub nickname: String,
    pub contact_type: i64,
}

impl ContactRecord {
    /// `remark(nickname)` when a remark is set, otherwise the nickname.
    pub fn display_name(&self) -> String {
        if self.remark.is_empty() {
            self.nickname.clone()
        } else {
            format!("{}({})", self.remark, self.nickname)
        }
    }
}

/// Fire-and-forget commands and lookups issued to the chat client.
///
/// Send commands return once the client accepted the command; delivery is
/// confirmed separately through a `sent_msg` callback.
pub trait ChatClient: Send + Sync {
    fn is_logged_in(&self) -> ClientResult<bool>;
    fn account(&self) -> ClientResult<AccountInfo>;

    fn send_text(&self, wxid: &str, text: &str) -> ClientResult<()>;
    fn send_xml(&self, wxid: &str, xml: &str) -> ClientResult<()>;
    fn send_image(&self, wxid: &str, client_path: &str) -> ClientResult<()>;
    fn send_file(&self, wxid: &str, client_path: &str) -> ClientResult<()>;
    fn send_emotion(&self, wxid: &str, client_path: &str) -> ClientResult<()>;
    fn forward_message(&self, wxid: &str, msgid: &str) -> ClientResult<()>;

    /// Raw query against one of the client's local databases. The first row
    /// holds the column names.
    fn query_database(&self, db_name: &str, sql: &str) -> ClientResult<Vec<Vec<String>>>;

    fn contacts(&self) -> ClientResult<HashMap<String, ContactRecord>>;
    fn contact(&self, wxid: &str) -> ClientResult<Option<ContactRecord>>;
    /// `wxid -> group display name` for one group.
    fn group_members(&self, group: &str) -> ClientResult<HashMap<String, String>>;
    fn all_group_members(&self) -> ClientResult<HashMap<String, HashMap<String, String>>>;

    /// Asks the client to fetch a message's media; returns the client-side path.
    fn download_media(&self, msgid: &str) -> ClientResult<Option<String>>;

    fn accept_transfer(&self, transaction_id: &str, transfer_id: &str, wxid: &str)
    -> ClientResult<bool>;
    fn verify_friend_request(&self, v3: &str, v4: &str) -> ClientResult<bool>;
    fn add_contact(&self, v3: &str, greeting: &str) -> ClientResult<bool>;
}
