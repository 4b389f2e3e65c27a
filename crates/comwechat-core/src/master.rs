use crate::types::{Author, MasterMessage, MasterStatus};

/// The message-routing side of the bridge.
pub trait Master: Send + Sync {
    fn deliver(&self, message: MasterMessage);
    fn status(&self, status: MasterStatus);

    /// Author of a message previously delivered, when the master still knows it.
    fn message_author(&self, _chat_uid: &str, _msgid: &str) -> Option<Author> {
        None
    }
}
