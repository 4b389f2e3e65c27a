//! Mapping of chat-client events onto master messages.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::types::{Author, Chat, InboundEvent, MasterMessage, MsgKind, RetryDirective};
use crate::xml;

/// Master kind for a declared chat-client type; `None` when unsupported.
pub fn kind_for(declared: &str, has_file: bool) -> Option<MsgKind> {
    Some(match declared {
        "text" => MsgKind::Text,
        "image" => MsgKind::Image,
        "voice" => MsgKind::Voice,
        "video" => MsgKind::Video,
        "share" | "file" if has_file => MsgKind::File,
        "share" | "file" => MsgKind::Link,
        "animatedsticker" => MsgKind::Sticker,
        "location" => MsgKind::Location,
        _ => return None,
    })
}

/// Builds the master message for `event`.
///
/// Media kinds carry `event.filepath` as their local path; it is the
/// caller's job to have rewritten it into the local mirror.
pub fn normalize(event: &InboundEvent, chat: Chat, author: Author) -> MasterMessage {
    let has_file = !event.filepath.is_empty();
    let mut message = MasterMessage::text(event.msgid.clone(), chat, author, String::new());
    message
        .vendor
        .insert("wechat_msgtype".to_string(), event.msg_type.clone());
    if event.message.trim_start().starts_with('<') {
        message.vendor.insert("wx_xml".to_string(), event.message.clone());
    }

    let Some(kind) = kind_for(&event.msg_type, has_file) else {
        message.text = format!("[unsupported {}] {}", event.msg_type, event.message)
            .trim_end()
            .to_string();
        return message;
    };
    message.kind = kind;
    message.text = match kind {
        MsgKind::Text => event.message.clone(),
        MsgKind::Link => link_text(&event.message),
        MsgKind::Location => location_text(&event.message),
        MsgKind::File => xml::tag(&event.message, "title").unwrap_or_default(),
        _ => String::new(),
    };
    if kind.carries_media() && has_file {
        message.path = Some(PathBuf::from(&event.filepath));
    }
    message
}

/// Final form of a deferred media message once its file is on disk.
pub fn finalized(event: &InboundEvent, path: &Path, chat: Chat, author: Author) -> MasterMessage {
    let mut event = event.clone();
    event.filepath = path.to_string_lossy().into_owned();
    normalize(&event, chat, author).as_edit()
}

/// Text stand-in for media that never arrived, carrying a retry action.
pub fn timed_out(event: &InboundEvent, chat: Chat, author: Author) -> MasterMessage {
    let directive = RetryDirective::for_message(&event.msgid, &event.msg_type, &chat);
    let text = format!(
        "[{} download timed out, check it on your phone]",
        event.msg_type
    );
    let mut message = MasterMessage::text(event.msgid.clone(), chat, author, text).as_edit();
    message.commands.push(directive.to_command());
    message.vendor = BTreeMap::from([("wechat_msgtype".to_string(), event.msg_type.clone())]);
    message
}

fn link_text(message: &str) -> String {
    let title = xml::tag(message, "title").unwrap_or_default();
    let url = xml::tag(message, "url").unwrap_or_default();
    match (title.is_empty(), url.is_empty()) {
        (false, false) => format!("{title}\n{url}"),
        (true, false) => url,
        (false, true) => title,
        (true, true) => message.to_string(),
    }
}

fn location_text(message: &str) -> String {
    let poi = xml::attr(message, "poiname").unwrap_or_default();
    let label = xml::attr(message, "label").unwrap_or_default();
    let coords = match (xml::attr(message, "x"), xml::attr(message, "y")) {
        (Some(x), Some(y)) => format!("({x}, {y})"),
        _ => String::new(),
    };
    [poi, label, coords]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
