use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info, warn};

use super::{Bridge, timestamp_uid};
use crate::client::{AccountInfo, ChatClient};
use crate::error::{ConfigError, Error, Result};
use crate::master::Master;
use crate::normalize;
use crate::notice::{self, ADD_FRIEND, PROCESS_FRIEND_REQUEST, PROCESS_TRANSFER};
use crate::pending::CorrelationKey;
use crate::types::{
    Author, Chat, InboundEvent, MasterMessage, MsgKind, OutboundMessage, QuoteTarget,
    RETRY_DOWNLOAD, RetryDirective, SendReceipt, message_ids,
};
use crate::xml;

pub const FORWARD_LINK: &str = "forward_link";

/// Chat-client type numbers used in the `refermsg` of a quote reply.
fn refer_type(target: &QuoteTarget) -> u32 {
    match (target.wechat_type.as_deref(), target.kind) {
        (Some("animatedsticker"), _) => 47,
        (_, Some(MsgKind::Image)) => 3,
        (_, Some(MsgKind::Voice)) => 34,
        (_, Some(MsgKind::Video)) => 43,
        (_, Some(MsgKind::Sticker | MsgKind::Animation)) => 47,
        (_, Some(MsgKind::Location)) => 48,
        (_, Some(MsgKind::File)) => 49,
        (Some("share"), _) => 49,
        _ => 1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileCommand {
    Image,
    File,
    Emotion,
}

impl<C, M> Bridge<C, M>
where
    C: ChatClient,
    M: Master,
{
    /// Sends `message` and collects the ids the client confirms.
    ///
    /// A message that produced no id gets a failure notice pointing at it;
    /// `@openim` chats never confirm, so they are exempt.
    pub fn send_message(&self, message: &OutboundMessage) -> Result<SendReceipt> {
        let Some(account) = self.ensure_account() else {
            self.notify_system("Not logged in. Log in on the chat client, then resend.");
            return Err(Error::NotLoggedIn);
        };
        let chat = message.chat_uid.as_str();

        if let Some((token, msgid)) = parse_forward_link(&message.text) {
            if token != self.forward_token() {
                debug!("forward link {token}/{msgid} belongs to another bridge, ignored");
                return Ok(SendReceipt {
                    ids: Vec::new(),
                    accepted: true,
                });
            }
            self.client.forward_message(chat, &msgid)?;
            info!("forwarded {msgid} to {chat}");
            return Ok(SendReceipt {
                ids: Vec::new(),
                accepted: true,
            });
        }

        let quote = message.target.as_ref();
        let mut results = Vec::with_capacity(2);
        match message.kind {
            MsgKind::Text | MsgKind::Link | MsgKind::Location => {
                results.push(self.send_text(chat, &message.text, quote));
            }
            kind => {
                let command = match kind {
                    MsgKind::Image => FileCommand::Image,
                    MsgKind::Sticker | MsgKind::Animation => FileCommand::Emotion,
                    _ => FileCommand::File,
                };
                results.push(self.send_attachment(&account, chat, message, command));
                if !message.text.is_empty() {
                    results.push(self.send_text(chat, &message.text, quote));
                }
            }
        }

        let mut receipt = SendReceipt::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(Some(id)) => receipt.ids.push(id),
                Ok(None) => {}
                Err(err) => {
                    warn!("send to {chat} failed: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }

        if receipt.ids.is_empty() {
            warn!(
                "no confirmation for {:?} message {} to {chat}",
                message.kind, message.uid
            );
            if !chat.contains("@openim") {
                self.notify_failure(message);
            }
        }
        match first_error {
            Some(err) if receipt.ids.is_empty() => Err(err),
            _ => Ok(receipt),
        }
    }

    fn notify_failure(&self, message: &OutboundMessage) {
        let mut notice = notice::system_notice(
            timestamp_uid(),
            &message.chat_uid,
            "\u{2139} System",
            "Failed to send, confirm on your phone",
        );
        if !message.uid.is_empty() {
            notice.target = Some(message.uid.clone());
        }
        self.master.deliver(notice);
    }

    /// Sends text, or a quote reply when `quote` is given, and waits for its
    /// confirmation.
    pub fn send_text(
        &self,
        chat: &str,
        text: &str,
        quote: Option<&QuoteTarget>,
    ) -> Result<Option<String>> {
        let xml = match quote {
            Some(target) if !text.is_empty() => Some(self.quote_xml(text, target)?),
            _ => None,
        };
        let key = CorrelationKey::content(chat, xml.as_deref().unwrap_or(text));
        let ticket = self.pending.register(key);
        let issued = match &xml {
            Some(xml) => self.client.send_xml(chat, xml),
            None => self.client.send_text(chat, text),
        };
        if let Err(err) = issued {
            self.pending.cancel(ticket);
            return Err(err.into());
        }
        Ok(self.pending.wait(ticket, self.send_timeout()))
    }

    /// Renders the `refermsg` reply XML for `text` quoting `target`.
    pub fn quote_xml(&self, text: &str, target: &QuoteTarget) -> Result<String> {
        let account = self.ensure_account().ok_or(Error::NotLoggedIn)?;
        let (sender, display_name) = if target.from_self {
            (account.wxid.clone(), account.nickname.clone())
        } else {
            (target.author_uid.clone(), target.author_name.clone())
        };
        // Media sent as several client messages is quoted through its first id.
        let svrid = message_ids(&target.uid).into_iter().next().unwrap_or_default();
        let quoted = match target.wx_xml.as_deref().filter(|x| !x.is_empty()) {
            Some(original) => xml::escape(original),
            None => xml::escape(&target.text),
        };
        let content = if quoted.is_empty() {
            "<content />".to_string()
        } else {
            format!("<content>{quoted}</content>")
        };

        Ok(format!(
            concat!(
                "<?xml version=\"1.0\"?><msg><appmsg appid=\"\" sdkver=\"0\">",
                "<title>{title}</title><des /><action /><type>57</type>",
                "<showtype>0</showtype><content /><url /><appattach><totallen>0</totallen>",
                "</appattach><refermsg><type>{refer}</type><svrid>{svrid}</svrid>",
                "<fromusr>{sender}</fromusr><chatusr>{sender}</chatusr>",
                "<displayname>{display}</displayname>{content}</refermsg></appmsg>",
                "<fromusername>{me}</fromusername><scene>0</scene>",
                "<appinfo><version>1</version><appname /></appinfo></msg>"
            ),
            title = xml::escape(text),
            refer = refer_type(target),
            svrid = svrid,
            sender = xml::escape(&sender),
            display = xml::escape(&display_name),
            content = content,
            me = account.wxid,
        ))
    }

    pub fn send_image(&self, chat: &str, message: &OutboundMessage) -> Result<Option<String>> {
        let account = self.ensure_account().ok_or(Error::NotLoggedIn)?;
        self.send_attachment(&account, chat, message, FileCommand::Image)
    }

    pub fn send_file(&self, chat: &str, message: &OutboundMessage) -> Result<Option<String>> {
        let account = self.ensure_account().ok_or(Error::NotLoggedIn)?;
        self.send_attachment(&account, chat, message, FileCommand::File)
    }

    pub fn send_emotion(&self, chat: &str, message: &OutboundMessage) -> Result<Option<String>> {
        let account = self.ensure_account().ok_or(Error::NotLoggedIn)?;
        self.send_attachment(&account, chat, message, FileCommand::Emotion)
    }

    /// Takes the chat's file lock, then registers the chat's file slot,
    /// stages, issues and waits while holding it. File sends to one chat
    /// share a key, so the slot must belong to the lock holder.
    fn send_attachment(
        &self,
        account: &AccountInfo,
        chat: &str,
        message: &OutboundMessage,
        command: FileCommand,
    ) -> Result<Option<String>> {
        let source = message
            .file
            .as_deref()
            .ok_or(Error::MissingFile(kind_label(message.kind)))?;
        let rename = command == FileCommand::File;

        let _guard = self.file_locks.acquire(chat);
        let ticket = self.pending.register(CorrelationKey::file_op(chat));
        let issued = self
            .stage(account, source, message.filename.as_deref(), rename)
            .and_then(|client_path| {
                let sent = match command {
                    FileCommand::Image => self.client.send_image(chat, &client_path),
                    FileCommand::File => self.client.send_file(chat, &client_path),
                    FileCommand::Emotion => self.client.send_emotion(chat, &client_path),
                };
                sent.map_err(Error::from)
            });
        if let Err(err) = issued {
            self.pending.cancel(ticket);
            return Err(err);
        }
        Ok(self.pending.wait(ticket, self.send_timeout()))
    }

    /// Copies `source` into the account's directory of the client mirror and
    /// returns the same file's path as the client sees it.
    fn stage(
        &self,
        account: &AccountInfo,
        source: &Path,
        filename: Option<&str>,
        rename: bool,
    ) -> Result<String> {
        let base_path = self
            .base_path()
            .ok_or(Error::Config(ConfigError::Missing("base_path")))?;
        let mut name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or(Error::MissingFile("named"))?;
        if rename && let Some(filename) = filename.and_then(bare_file_name) {
            name = filename.to_string();
        }

        let dir = self.files_dir(account);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::io(format!("mkdir {}", dir.display()), e))?;
        let local = dir.join(&name);
        if local != source {
            std::fs::copy(source, &local).map_err(|e| {
                Error::io(format!("copy {} to {}", source.display(), local.display()), e)
            })?;
        }
        self.staged.stage(&local);

        Ok(format!(
            "{}\\{}\\{}",
            base_path.trim_end_matches(['\\', '/']),
            account.wxid,
            name
        ))
    }

    /// Link that, sent back through the bridge into any chat, forwards
    /// `msgid` there. Only numeric client ids can be forwarded.
    pub fn forward_link(&self, msgid: &str) -> Option<String> {
        if msgid.is_empty() || !msgid.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Some(format!(
            "comwechat://{}/forward/{msgid}",
            self.forward_token()
        ))
    }

    /// Runs a command the master invoked on one of our messages.
    pub fn invoke_command(&self, callable: &str, args: &BTreeMap<String, String>) -> Result<String> {
        let arg = |name: &str| {
            args.get(name)
                .map(String::as_str)
                .ok_or_else(|| Error::InvalidCommand(format!("{callable}: missing `{name}`")))
        };
        let verdict = |ok: bool| String::from(if ok { "Success" } else { "Failed" });

        match callable {
            RETRY_DOWNLOAD => {
                let directive = RetryDirective::from_args(args)
                    .ok_or_else(|| Error::InvalidCommand(callable.to_string()))?;
                self.retry_download(&directive)
            }
            PROCESS_TRANSFER => {
                let ok = self.client.accept_transfer(
                    arg("transaction_id")?,
                    arg("transfer_id")?,
                    arg("wxid")?,
                )?;
                Ok(verdict(ok))
            }
            PROCESS_FRIEND_REQUEST => {
                let ok = self.client.verify_friend_request(arg("v3")?, arg("v4")?)?;
                Ok(verdict(ok))
            }
            ADD_FRIEND => {
                let ok = self.client.add_contact(arg("v3")?, "")?;
                Ok(verdict(ok))
            }
            FORWARD_LINK => {
                let msgid = arg("msgid")?;
                self.forward_link(msgid)
                    .ok_or_else(|| Error::InvalidCommand(format!("cannot forward {msgid}")))
            }
            other => Err(Error::InvalidCommand(other.to_string())),
        }
    }

    /// Re-fetches timed-out media and delivers it as an edit of the
    /// placeholder.
    pub fn retry_download(&self, directive: &RetryDirective) -> Result<String> {
        let uid = directive.chatuid.as_str();
        let chat = match directive.chattype.as_str() {
            "group" => Chat::group(uid, self.directory.name_of(&self.client, uid)),
            "private" => Chat::private(uid, self.directory.name_of(&self.client, uid)),
            other => return Ok(format!("[unsupported chat type: {other}]")),
        };
        let author = self
            .master
            .message_author(uid, &directive.msgid)
            .unwrap_or_else(|| Author::peer_of(&chat));

        let path = self.fetch_media(&directive.msgid);
        let message = match &path {
            Some(path) => {
                let event = InboundEvent {
                    msgid: directive.msgid.clone(),
                    msg_type: directive.msgtype.clone(),
                    ..Default::default()
                };
                normalize::finalized(&event, path, chat, author)
            }
            None => MasterMessage::text(
                directive.msgid.clone(),
                chat,
                author,
                format!(
                    "[retrying {} failed, check it on your phone]",
                    directive.msgtype
                ),
            )
            .as_edit(),
        };
        self.master.deliver(message);
        Ok(if path.is_some() {
            "Download succeeded".to_string()
        } else {
            "Download failed".to_string()
        })
    }

    /// Asks the client to download a message's media and waits for the file
    /// to show up in the local mirror.
    fn fetch_media(&self, msgid: &str) -> Option<PathBuf> {
        let client_path = match self.client.download_media(msgid) {
            Ok(Some(path)) => path,
            Ok(None) => {
                warn!("client has no media to download for {msgid}");
                return None;
            }
            Err(err) => {
                warn!("download request for {msgid} failed: {err}");
                return None;
            }
        };
        let path = self.mirror_path(&client_path);
        if self.wait_for_file(&path) {
            debug!("downloaded {msgid} to {}", path.display());
            Some(path)
        } else {
            warn!("timed out retrying download of {msgid} at {}", path.display());
            None
        }
    }

    /// Rewrites an absolute client path under the configured prefix into the
    /// local mirror.
    fn mirror_path(&self, client_path: &str) -> PathBuf {
        let normalized = client_path.replace('\\', "/");
        match normalized.strip_prefix(self.config.client_files_prefix.as_str()) {
            Some(rest) => self.config.dir.join(rest),
            None => PathBuf::from(normalized),
        }
    }
}

fn parse_forward_link(text: &str) -> Option<(String, String)> {
    let re = Regex::new(r"comwechat://([^/\s]+)/forward/(\d+)").ok()?;
    let caps = re.captures(text)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

/// Last component of a master-supplied file name; `None` when nothing
/// usable is left.
fn bare_file_name(filename: &str) -> Option<&str> {
    let name = filename.rsplit(['/', '\\']).next()?.trim();
    match name {
        "" | "." | ".." => None,
        name => Some(name),
    }
}

fn kind_label(kind: MsgKind) -> &'static str {
    match kind {
        MsgKind::Text => "text",
        MsgKind::Image => "image",
        MsgKind::Voice => "voice",
        MsgKind::Video => "video",
        MsgKind::File => "file",
        MsgKind::Link => "link",
        MsgKind::Sticker => "sticker",
        MsgKind::Animation => "animation",
        MsgKind::Location => "location",
    }
}
