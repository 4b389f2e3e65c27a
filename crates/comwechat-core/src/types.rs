use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

/// Callback families pushed by the chat client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    #[serde(rename = "sent_msg")]
    Sent,
    #[serde(rename = "self_msg")]
    SelfMsg,
    #[serde(rename = "friend_msg")]
    Friend,
    #[serde(rename = "group_msg")]
    Group,
    #[serde(rename = "revoke_msg")]
    Revoke,
    #[serde(rename = "transfer_msg")]
    Transfer,
    #[serde(rename = "frdver_msg")]
    FriendVerify,
    #[serde(rename = "card_msg")]
    Card,
}

impl EventCategory {
    pub const ALL: [EventCategory; 8] = [
        EventCategory::Sent,
        EventCategory::SelfMsg,
        EventCategory::Friend,
        EventCategory::Group,
        EventCategory::Revoke,
        EventCategory::Transfer,
        EventCategory::FriendVerify,
        EventCategory::Card,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent_msg",
            Self::SelfMsg => "self_msg",
            Self::Friend => "friend_msg",
            Self::Group => "group_msg",
            Self::Revoke => "revoke_msg",
            Self::Transfer => "transfer_msg",
            Self::FriendVerify => "frdver_msg",
            Self::Card => "card_msg",
        }
    }
}

/// Raw event payload as pushed by the chat client.
///
/// Every field is optional on the wire. Numeric ids are accepted either as
/// JSON numbers or strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundEvent {
    pub sender: String,
    pub wxid: String,
    #[serde(deserialize_with = "string_or_number")]
    pub msgid: String,
    #[serde(rename = "type", deserialize_with = "string_or_number")]
    pub msg_type: String,
    pub message: String,
    pub filepath: String,
    pub thumb_path: String,
    pub extrainfo: String,
    #[serde(rename = "self")]
    pub self_wxid: String,
    #[serde(rename = "isSendMsg", deserialize_with = "flag")]
    pub is_send_msg: bool,
    #[serde(rename = "isSendByPhone", deserialize_with = "flag")]
    pub is_send_by_phone: bool,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        serde_json::Value::String(s) => matches!(s.trim(), "1" | "true"),
        _ => false,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
    System,
}

impl ChatKind {
    /// Chat kind as carried by retry directives.
    pub fn directive_name(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
            Self::System => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub uid: String,
    pub name: String,
    pub kind: ChatKind,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_mp: bool,
}

impl Chat {
    pub fn private(uid: impl Into<String>, name: impl Into<String>) -> Self {
        let uid = uid.into();
        let is_mp = uid.starts_with("gh_");
        Self {
            uid,
            name: name.into(),
            kind: ChatKind::Private,
            is_mp,
        }
    }

    pub fn group(uid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            kind: ChatKind::Group,
            is_mp: false,
        }
    }

    pub fn system(uid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            kind: ChatKind::System,
            is_mp: false,
        }
    }

    /// Group ids carry the `@chatroom` suffix; everything else is a private chat.
    pub fn for_conversation(uid: &str, name: impl Into<String>) -> Self {
        if is_group_id(uid) {
            Self::group(uid, name)
        } else {
            Self::private(uid, name)
        }
    }
}

pub fn is_group_id(uid: &str) -> bool {
    uid.contains("@chatroom")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorRole {
    /// The logged-in account.
    SelfMember,
    /// The other side of a private chat.
    Peer,
    /// A member of a group chat.
    Member,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub uid: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub role: AuthorRole,
}

impl Author {
    pub fn myself() -> Self {
        Self {
            uid: "__self__".to_string(),
            name: "You".to_string(),
            alias: None,
            role: AuthorRole::SelfMember,
        }
    }

    pub fn peer_of(chat: &Chat) -> Self {
        Self {
            uid: chat.uid.clone(),
            name: chat.name.clone(),
            alias: None,
            role: AuthorRole::Peer,
        }
    }

    pub fn member(uid: impl Into<String>, name: impl Into<String>, alias: Option<String>) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            alias,
            role: AuthorRole::Member,
        }
    }

    pub fn system() -> Self {
        Self {
            uid: "__system__".to_string(),
            name: "System".to_string(),
            alias: None,
            role: AuthorRole::System,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgKind {
    Text,
    Image,
    Voice,
    Video,
    File,
    Link,
    Sticker,
    Animation,
    Location,
}

impl MsgKind {
    pub fn carries_media(self) -> bool {
        matches!(
            self,
            Self::Image | Self::Voice | Self::Video | Self::File | Self::Sticker | Self::Animation
        )
    }
}

/// An action the master can offer on a message and call back into the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCommand {
    pub name: String,
    pub callable: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

impl MessageCommand {
    pub fn new(name: &str, callable: &str, args: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            callable: callable.to_string(),
            args: args
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }
}

pub const RETRY_DOWNLOAD: &str = "retry_download";

/// Manual re-fetch of a media message whose download timed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDirective {
    pub msgid: String,
    pub msgtype: String,
    pub chattype: String,
    pub chatuid: String,
}

impl RetryDirective {
    pub fn for_message(msgid: &str, msgtype: &str, chat: &Chat) -> Self {
        Self {
            msgid: msgid.to_string(),
            msgtype: msgtype.to_string(),
            chattype: chat.kind.directive_name().to_string(),
            chatuid: chat.uid.clone(),
        }
    }

    pub fn to_command(&self) -> MessageCommand {
        MessageCommand::new(
            "Retry",
            RETRY_DOWNLOAD,
            &[
                ("msgid", self.msgid.as_str()),
                ("msgtype", self.msgtype.as_str()),
                ("chattype", self.chattype.as_str()),
                ("chatuid", self.chatuid.as_str()),
            ],
        )
    }

    pub fn from_args(args: &BTreeMap<String, String>) -> Option<Self> {
        Some(Self {
            msgid: args.get("msgid")?.clone(),
            msgtype: args.get("msgtype")?.clone(),
            chattype: args.get("chattype")?.clone(),
            chatuid: args.get("chatuid")?.clone(),
        })
    }
}

/// Normalized message handed to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterMessage {
    pub uid: String,
    pub chat: Chat,
    pub author: Author,
    pub kind: MsgKind,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub edit: bool,
    #[serde(default)]
    pub edit_media: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<MessageCommand>,
    /// Uid of the message this one refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vendor: BTreeMap<String, String>,
}

impl MasterMessage {
    pub fn text(uid: impl Into<String>, chat: Chat, author: Author, text: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            chat,
            author,
            kind: MsgKind::Text,
            text: text.into(),
            path: None,
            edit: false,
            edit_media: false,
            commands: Vec::new(),
            target: None,
            vendor: BTreeMap::new(),
        }
    }

    pub fn as_edit(mut self) -> Self {
        self.edit = true;
        self.edit_media = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterStatus {
    MessageRemoval { chat: Chat, uid: String },
}

/// The message a reply quotes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuoteTarget {
    /// Master-side uid; may be a JSON list of chat-client ids.
    pub uid: String,
    pub author_uid: String,
    pub author_name: String,
    pub from_self: bool,
    pub kind: Option<MsgKind>,
    pub text: String,
    /// Original XML of the quoted message, when the chat client provided one.
    pub wx_xml: Option<String>,
    /// Declared chat-client type of the quoted message.
    pub wechat_type: Option<String>,
}

/// A send request coming from the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(default)]
    pub uid: String,
    pub chat_uid: String,
    pub kind: MsgKind,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub target: Option<QuoteTarget>,
}

impl OutboundMessage {
    pub fn text(chat_uid: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            uid: String::new(),
            chat_uid: chat_uid.into(),
            kind: MsgKind::Text,
            text: text.into(),
            file: None,
            filename: None,
            target: None,
        }
    }
}

/// Outcome of an outbound send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    /// Confirmed chat-client message ids, in send order.
    pub ids: Vec<String>,
    /// Whether the chat client accepted a command that produces no
    /// confirmation, or the message needed no command at all.
    pub accepted: bool,
}

impl SendReceipt {
    /// Master-visible uid covering every confirmed id.
    pub fn message_uid(&self) -> Option<String> {
        if self.ids.is_empty() {
            return None;
        }
        serde_json::to_string(&self.ids).ok()
    }

    pub fn succeeded(&self) -> bool {
        self.accepted || !self.ids.is_empty()
    }
}

/// Inverse of [`SendReceipt::message_uid`]; plain uids yield themselves.
pub fn message_ids(uid: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(uid) {
        Ok(ids) if !ids.is_empty() => ids,
        _ => vec![uid.to_string()],
    }
}
