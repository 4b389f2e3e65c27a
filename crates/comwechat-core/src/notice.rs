//! System notices built from transfer, friend-request and contact-card events.

use regex::Regex;

use crate::types::{Author, Chat, InboundEvent, MasterMessage, MessageCommand};
use crate::xml;

pub const PROCESS_TRANSFER: &str = "process_transfer";
pub const PROCESS_FRIEND_REQUEST: &str = "process_friend_request";
pub const ADD_FRIEND: &str = "add_friend";

/// Text notice from the system author of a system chat.
pub fn system_notice(
    uid: impl Into<String>,
    chat_uid: &str,
    chat_name: &str,
    text: impl Into<String>,
) -> MasterMessage {
    MasterMessage::text(
        uid,
        Chat::system(chat_uid, chat_name),
        Author::system(),
        text,
    )
}

/// Amount and ids of an incoming transfer. The amount is read from the
/// client's own (localized) summary line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub amount: String,
    pub transaction_id: String,
    pub transfer_id: String,
}

impl Transfer {
    pub fn parse(message: &str) -> Option<Self> {
        let amount = Regex::new("收到转账(.*?)元")
            .ok()?
            .captures(message)?
            .get(1)?
            .as_str()
            .to_string();
        Some(Self {
            amount,
            transaction_id: xml::tag(message, "transcationid")?,
            transfer_id: xml::tag(message, "transferid")?,
        })
    }

    pub fn notice(&self, uid: String, sender: &str, name: &str) -> MasterMessage {
        let text = format!("Transfer from {name}:\nAmount {} CNY\n", self.amount);
        let mut message = system_notice(uid, sender, name, text);
        message.commands.push(MessageCommand::new(
            "Accept",
            PROCESS_TRANSFER,
            &[
                ("transaction_id", self.transaction_id.as_str()),
                ("transfer_id", self.transfer_id.as_str()),
                ("wxid", sender),
            ],
        ));
        message
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendRequest {
    pub nickname: String,
    pub content: String,
    pub avatar: String,
    pub v3: String,
    pub v4: String,
}

impl FriendRequest {
    pub fn parse(message: &str) -> Option<Self> {
        let v3 = xml::attr(message, "encryptusername").filter(|v| v.starts_with("v3"))?;
        let v4 = xml::attr(message, "ticket").filter(|v| v.starts_with("v4"))?;
        Some(Self {
            nickname: xml::attr(message, "fromnickname").unwrap_or_default(),
            content: xml::attr(message, "content").unwrap_or_default(),
            avatar: xml::attr(message, "bigheadimgurl").unwrap_or_default(),
            v3,
            v4,
        })
    }

    pub fn notice(&self, uid: String, sender: &str) -> MasterMessage {
        let text = format!(
            "Friend request:\nName: {}\nMessage: {}\nAvatar: {}",
            self.nickname, self.content, self.avatar
        );
        let mut message = system_notice(uid, sender, "\u{2139} System", text);
        message.commands.push(MessageCommand::new(
            "Accept",
            PROCESS_FRIEND_REQUEST,
            &[("v3", self.v3.as_str()), ("v4", self.v4.as_str())],
        ));
        message
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactCard {
    pub nickname: String,
    pub city: String,
    pub province: String,
    pub sex: String,
    pub avatar: String,
    pub username: String,
}

impl ContactCard {
    pub fn parse(message: &str) -> Self {
        let field = |name| xml::attr(message, name).unwrap_or_default();
        Self {
            nickname: field("nickname"),
            city: field("city"),
            province: field("province"),
            sex: field("sex"),
            avatar: field("bigheadimgurl"),
            username: field("username"),
        }
    }

    pub fn notice(&self, uid: String, sender: &str, name: &str) -> MasterMessage {
        let mut text = String::from("Contact card:\n");
        for (label, value) in [
            ("Nickname", self.nickname.as_str()),
            ("City", self.city.as_str()),
            ("Province", self.province.as_str()),
        ] {
            if !value.is_empty() {
                text.push_str(&format!("{label}: {value}\n"));
            }
        }
        match self.sex.as_str() {
            "0" => text.push_str("Gender: unknown\n"),
            "1" => text.push_str("Gender: male\n"),
            "2" => text.push_str("Gender: female\n"),
            _ => {}
        }
        if !self.avatar.is_empty() {
            text.push_str(&format!("Avatar: {}\n", self.avatar));
        }

        let mut message = system_notice(uid, sender, name, text);
        // Only stranger cards carry a v3 ticket that can be used to add them.
        if self.username.starts_with("v3_") {
            message.commands.push(MessageCommand::new(
                "Add To Friend",
                ADD_FRIEND,
                &[("v3", self.username.as_str())],
            ));
        }
        message
    }
}

/// A private-chat echo of a transfer the account itself sent from the phone.
pub fn is_phone_transfer(event: &InboundEvent) -> bool {
    event.is_send_msg && event.is_send_by_phone
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthorRole, ChatKind};

    #[test]
    fn transfer_notice_offers_accept() {
        let wire = "收到转账0.50元。<transcationid><![CDATA[tx-1]]></transcationid><transferid><![CDATA[tr-9]]></transferid>";
        let transfer = Transfer::parse(wire).unwrap();
        assert_eq!(transfer.amount, "0.50");

        let notice = transfer.notice("1".into(), "wxid_payer", "Payer");
        assert_eq!(notice.chat.kind, ChatKind::System);
        assert_eq!(notice.author.role, AuthorRole::System);
        assert!(notice.text.contains("0.50"));
        let accept = &notice.commands[0];
        assert_eq!(accept.callable, PROCESS_TRANSFER);
        assert_eq!(accept.args["transaction_id"], "tx-1");
        assert_eq!(accept.args["transfer_id"], "tr-9");
        assert_eq!(accept.args["wxid"], "wxid_payer");
    }

    #[test]
    fn friend_request_requires_tickets() {
        let wire = r#"<msg fromnickname="Ann" content="hello" bigheadimgurl="http://img" encryptusername="v3_abc@stranger" ticket="v4_def@stranger"/>"#;
        let request = FriendRequest::parse(wire).unwrap();
        assert_eq!(request.v3, "v3_abc@stranger");
        let notice = request.notice("2".into(), "fmessage");
        assert_eq!(notice.commands[0].callable, PROCESS_FRIEND_REQUEST);
        assert_eq!(notice.commands[0].args["v4"], "v4_def@stranger");

        assert_eq!(FriendRequest::parse(r#"<msg fromnickname="Ann"/>"#), None);
    }

    #[test]
    fn card_lists_known_fields_only() {
        let wire = r#"<msg bigheadimgurl="" nickname="Bo" province="" city="Oslo" sex="1" username="wxid_bo"/>"#;
        let notice = ContactCard::parse(wire).notice("3".into(), "wxid_abc", "Abc");
        assert_eq!(notice.text, "Contact card:\nNickname: Bo\nCity: Oslo\nGender: male\n");
        assert!(notice.commands.is_empty());

        let stranger = ContactCard {
            username: "v3_zz@stranger".into(),
            ..Default::default()
        };
        assert_eq!(
            stranger.notice("4".into(), "wxid_abc", "Abc").commands[0].callable,
            ADD_FRIEND
        );
    }
}
