//! HTTP client for the ComWeChat control interface.
//!
//! Every command is a JSON `POST` to `<api_url>?type=<n>`. Database lookups
//! go through the client's own SQLite handles, so contacts and group members
//! come from `MicroMsg.db` rather than dedicated commands.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use comwechat_core::{AccountInfo, ChatClient, ClientError, ClientResult, ContactRecord};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const CONTACT_DB: &str = "MicroMsg.db";
/// Separator between entries of `ChatRoom.UserNameList` / `DisplayNameList`.
const LIST_SEPARATOR: &str = "^G";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiCommand {
    IsLogin,
    SelfInfo,
    SendText,
    SendImage,
    SendFile,
    AddByV3,
    VerifyApply,
    DbHandles,
    QueryDb,
    Forward,
    SendXml,
    Transfer,
    SendEmotion,
    GetCdn,
}

impl ApiCommand {
    fn code(self) -> u16 {
        match self {
            Self::IsLogin => 0,
            Self::SelfInfo => 1,
            Self::SendText => 2,
            Self::SendImage => 5,
            Self::SendFile => 6,
            Self::AddByV3 => 21,
            Self::VerifyApply => 23,
            Self::DbHandles => 32,
            Self::QueryDb => 34,
            Self::Forward => 40,
            Self::SendXml => 43,
            Self::Transfer => 45,
            Self::SendEmotion => 46,
            Self::GetCdn => 47,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::IsLogin => "is_login",
            Self::SelfInfo => "self_info",
            Self::SendText => "send_text",
            Self::SendImage => "send_image",
            Self::SendFile => "send_file",
            Self::AddByV3 => "add_by_v3",
            Self::VerifyApply => "verify_apply",
            Self::DbHandles => "db_handles",
            Self::QueryDb => "query_db",
            Self::Forward => "forward",
            Self::SendXml => "send_xml",
            Self::Transfer => "transfer",
            Self::SendEmotion => "send_emotion",
            Self::GetCdn => "get_cdn",
        }
    }
}

#[derive(Debug, Deserialize)]
struct SelfInfo {
    #[serde(rename = "wxId")]
    wxid: String,
    #[serde(rename = "wxNickName", default)]
    nickname: String,
    #[serde(rename = "wxFilePath", default)]
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DbHandle {
    db_name: String,
    handle: u64,
}

pub struct HttpChatClient {
    http: reqwest::blocking::Client,
    api_url: String,
    db_handles: Mutex<HashMap<String, u64>>,
}

impl HttpChatClient {
    /// Must be called outside the async runtime.
    pub fn new(api_url: &str) -> anyhow::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            api_url: api_url.to_string(),
            db_handles: Mutex::new(HashMap::new()),
        })
    }

    fn post(&self, command: ApiCommand, body: Value) -> ClientResult<Value> {
        let url = format!("{}?type={}", self.api_url, command.code());
        debug!("POST {url} {body}");
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Rejected {
                command: command.name(),
                message: format!("http status {status}"),
            });
        }
        resp.json::<Value>().map_err(|err| ClientError::Decode {
            command: command.name(),
            message: err.to_string(),
        })
    }

    /// Posts a command whose only result is the `msg` status flag.
    fn post_accepted(&self, command: ApiCommand, body: Value) -> ClientResult<bool> {
        let resp = self.post(command, body)?;
        Ok(accepted(&resp))
    }

    fn post_send(&self, command: ApiCommand, body: Value) -> ClientResult<()> {
        let resp = self.post(command, body)?;
        if accepted(&resp) {
            Ok(())
        } else {
            Err(ClientError::Rejected {
                command: command.name(),
                message: resp.to_string(),
            })
        }
    }

    fn db_handle(&self, db_name: &str) -> ClientResult<u64> {
        if let Some(handle) = self.db_handles.lock().get(db_name) {
            return Ok(*handle);
        }
        let resp = self.post(ApiCommand::DbHandles, json!({}))?;
        let handles = parse_db_handles(&resp)?;
        let mut cached = self.db_handles.lock();
        cached.clear();
        cached.extend(handles);
        cached
            .get(db_name)
            .copied()
            .ok_or_else(|| ClientError::Rejected {
                command: ApiCommand::DbHandles.name(),
                message: format!("no handle for {db_name}"),
            })
    }

    fn contact_rows(&self, sql: &str) -> ClientResult<Vec<ContactRecord>> {
        let rows = self.query_database(CONTACT_DB, sql)?;
        Ok(rows.into_iter().skip(1).filter_map(contact_from_row).collect())
    }
}

impl ChatClient for HttpChatClient {
    fn is_logged_in(&self) -> ClientResult<bool> {
        let resp = self.post(ApiCommand::IsLogin, json!({}))?;
        let logged_in = resp.get("is_login").and_then(Value::as_i64) == Some(1);
        if !logged_in {
            // Handles belong to the previous session.
            self.db_handles.lock().clear();
        }
        Ok(logged_in)
    }

    fn account(&self) -> ClientResult<AccountInfo> {
        let resp = self.post(ApiCommand::SelfInfo, json!({}))?;
        let data = resp.get("data").cloned().unwrap_or(Value::Null);
        let info: SelfInfo = serde_json::from_value(data).map_err(|err| ClientError::Decode {
            command: ApiCommand::SelfInfo.name(),
            message: err.to_string(),
        })?;
        let file_savepath = info
            .file_path
            .as_deref()
            .and_then(|path| files_root(path, &info.wxid));
        Ok(AccountInfo {
            wxid: info.wxid,
            nickname: info.nickname,
            file_savepath,
        })
    }

    fn send_text(&self, wxid: &str, text: &str) -> ClientResult<()> {
        self.post_send(ApiCommand::SendText, json!({ "wxid": wxid, "msg": text }))
    }

    fn send_xml(&self, wxid: &str, xml: &str) -> ClientResult<()> {
        self.post_send(
            ApiCommand::SendXml,
            json!({ "wxid": wxid, "xml": xml, "img_path": "" }),
        )
    }

    fn send_image(&self, wxid: &str, client_path: &str) -> ClientResult<()> {
        self.post_send(
            ApiCommand::SendImage,
            json!({ "receiver": wxid, "img_path": client_path }),
        )
    }

    fn send_file(&self, wxid: &str, client_path: &str) -> ClientResult<()> {
        self.post_send(
            ApiCommand::SendFile,
            json!({ "receiver": wxid, "file_path": client_path }),
        )
    }

    fn send_emotion(&self, wxid: &str, client_path: &str) -> ClientResult<()> {
        self.post_send(
            ApiCommand::SendEmotion,
            json!({ "wxid": wxid, "img_path": client_path }),
        )
    }

    fn forward_message(&self, wxid: &str, msgid: &str) -> ClientResult<()> {
        let msgid: u64 = msgid.parse().map_err(|_| ClientError::Rejected {
            command: ApiCommand::Forward.name(),
            message: format!("msgid {msgid} is not numeric"),
        })?;
        self.post_send(ApiCommand::Forward, json!({ "wxid": wxid, "msgid": msgid }))
    }

    fn query_database(&self, db_name: &str, sql: &str) -> ClientResult<Vec<Vec<String>>> {
        let handle = self.db_handle(db_name)?;
        let resp = self.post(ApiCommand::QueryDb, json!({ "db_handle": handle, "sql": sql }))?;
        rows_from(&resp)
    }

    fn contacts(&self) -> ClientResult<HashMap<String, ContactRecord>> {
        let records = self.contact_rows("SELECT UserName, Remark, NickName, Type FROM Contact")?;
        Ok(records
            .into_iter()
            .map(|record| (record.wxid.clone(), record))
            .collect())
    }

    fn contact(&self, wxid: &str) -> ClientResult<Option<ContactRecord>> {
        let sql = format!(
            "SELECT UserName, Remark, NickName, Type FROM Contact WHERE UserName = {}",
            sql_quote(wxid)
        );
        Ok(self.contact_rows(&sql)?.into_iter().next())
    }

    fn group_members(&self, group: &str) -> ClientResult<HashMap<String, String>> {
        let sql = format!(
            "SELECT ChatRoomName, UserNameList, DisplayNameList FROM ChatRoom WHERE ChatRoomName = {}",
            sql_quote(group)
        );
        let rows = self.query_database(CONTACT_DB, &sql)?;
        Ok(parse_chatrooms(rows).remove(group).unwrap_or_default())
    }

    fn all_group_members(&self) -> ClientResult<HashMap<String, HashMap<String, String>>> {
        let rows = self.query_database(
            CONTACT_DB,
            "SELECT ChatRoomName, UserNameList, DisplayNameList FROM ChatRoom",
        )?;
        Ok(parse_chatrooms(rows))
    }

    fn download_media(&self, msgid: &str) -> ClientResult<Option<String>> {
        let resp = self.post(ApiCommand::GetCdn, json!({ "msgid": msgid }))?;
        if resp.get("msg").and_then(Value::as_i64) != Some(1) {
            warn!("cdn download of {msgid} refused: {resp}");
            return Ok(None);
        }
        Ok(resp
            .get("path")
            .and_then(Value::as_str)
            .filter(|path| !path.is_empty())
            .map(str::to_string))
    }

    fn accept_transfer(
        &self,
        transaction_id: &str,
        transfer_id: &str,
        wxid: &str,
    ) -> ClientResult<bool> {
        self.post_accepted(
            ApiCommand::Transfer,
            json!({
                "transcationid": transaction_id,
                "transferid": transfer_id,
                "wxid": wxid,
            }),
        )
    }

    fn verify_friend_request(&self, v3: &str, v4: &str) -> ClientResult<bool> {
        self.post_accepted(ApiCommand::VerifyApply, json!({ "v3": v3, "v4": v4 }))
    }

    fn add_contact(&self, v3: &str, greeting: &str) -> ClientResult<bool> {
        self.post_accepted(ApiCommand::AddByV3, json!({ "v3": v3, "msg": greeting }))
    }
}

/// The client reports success as any `msg` other than `0`.
fn accepted(resp: &Value) -> bool {
    match resp.get("msg") {
        Some(Value::Number(n)) => n.as_i64() != Some(0),
        Some(Value::String(s)) => s != "0",
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}

fn parse_db_handles(resp: &Value) -> ClientResult<HashMap<String, u64>> {
    let data = resp.get("data").cloned().unwrap_or(Value::Null);
    let handles: Vec<DbHandle> =
        serde_json::from_value(data).map_err(|err| ClientError::Decode {
            command: ApiCommand::DbHandles.name(),
            message: err.to_string(),
        })?;
    Ok(handles
        .into_iter()
        .map(|handle| (handle.db_name, handle.handle))
        .collect())
}

fn rows_from(resp: &Value) -> ClientResult<Vec<Vec<String>>> {
    let Some(rows) = resp.get("data").and_then(Value::as_array) else {
        return Err(ClientError::Decode {
            command: ApiCommand::QueryDb.name(),
            message: format!("no data rows in {resp}"),
        });
    };
    Ok(rows
        .iter()
        .map(|row| {
            row.as_array()
                .map(|cells| cells.iter().map(cell_text).collect())
                .unwrap_or_default()
        })
        .collect())
}

fn cell_text(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn contact_from_row(row: Vec<String>) -> Option<ContactRecord> {
    let mut cells = row.into_iter();
    let wxid = cells.next().filter(|wxid| !wxid.is_empty())?;
    let remark = cells.next().unwrap_or_default();
    let nickname = cells.next().unwrap_or_default();
    let contact_type = cells
        .next()
        .and_then(|t| t.trim().parse().ok())
        .unwrap_or(0);
    Some(ContactRecord {
        wxid,
        remark,
        nickname,
        contact_type,
    })
}

/// `group -> (wxid -> display name)` from `ChatRoom` rows, header first.
fn parse_chatrooms(rows: Vec<Vec<String>>) -> HashMap<String, HashMap<String, String>> {
    let mut groups = HashMap::new();
    for row in rows.into_iter().skip(1) {
        let [group, users, names] = match <[String; 3]>::try_from(row) {
            Ok(cells) => cells,
            Err(row) => {
                warn!("skipping malformed ChatRoom row {row:?}");
                continue;
            }
        };
        let names: Vec<&str> = names.split(LIST_SEPARATOR).collect();
        let members = users
            .split(LIST_SEPARATOR)
            .enumerate()
            .filter(|(_, wxid)| !wxid.is_empty())
            .map(|(i, wxid)| {
                let name = names.get(i).copied().unwrap_or_default();
                (wxid.to_string(), name.to_string())
            })
            .collect();
        groups.insert(group, members);
    }
    groups
}

/// The `WeChat Files` directory from the account's own storage path
/// (`...\WeChat Files\<wxid>\`).
fn files_root(file_path: &str, wxid: &str) -> Option<String> {
    let trimmed = file_path.trim_end_matches(['\\', '/']);
    if trimmed.is_empty() {
        return None;
    }
    let root = trimmed
        .strip_suffix(wxid)
        .map(|rest| rest.trim_end_matches(['\\', '/']))
        .unwrap_or(trimmed);
    Some(root.to_string())
}

fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_flag_follows_client_convention() {
        assert!(accepted(&json!({"msg": 1, "result": "OK"})));
        assert!(accepted(&json!({"msg": "1"})));
        assert!(!accepted(&json!({"msg": 0})));
        assert!(!accepted(&json!({"msg": "0"})));
        assert!(!accepted(&json!({"result": "OK"})));
    }

    #[test]
    fn db_handles_are_keyed_by_name() {
        let resp = json!({
            "data": [
                {"db_name": "MicroMsg.db", "handle": 2313571952u64, "tables": []},
                {"db_name": "MediaMSG0.db", "handle": 2313571000u64, "tables": []}
            ],
            "result": "OK"
        });
        let handles = parse_db_handles(&resp).unwrap();
        assert_eq!(handles["MicroMsg.db"], 2313571952);
        assert_eq!(handles["MediaMSG0.db"], 2313571000);
        assert!(parse_db_handles(&json!({"result": "OK"})).is_err());
    }

    #[test]
    fn query_rows_are_stringified() {
        let resp = json!({
            "data": [["UserName", "Remark", "NickName", "Type"], ["wxid_a", "", "Alice", 3], ["wxid_b", null, "Bob", 0]],
            "msg": 1
        });
        let rows = rows_from(&resp).unwrap();
        assert_eq!(rows[1], vec!["wxid_a", "", "Alice", "3"]);
        assert_eq!(rows[2][1], "");

        let contacts: Vec<ContactRecord> = rows.into_iter().skip(1).filter_map(contact_from_row).collect();
        assert_eq!(contacts[0].contact_type, 3);
        assert_eq!(contacts[1].contact_type, 0);
    }

    #[test]
    fn chatroom_lists_pair_members_with_display_names() {
        let rows = vec![
            vec!["ChatRoomName".into(), "UserNameList".into(), "DisplayNameList".into()],
            vec![
                "123@chatroom".into(),
                "wxid_a^Gwxid_b^Gwxid_c".into(),
                "Ally^G^GCharlie".into(),
            ],
            vec!["456@chatroom".into(), "wxid_a".into(), String::new()],
        ];
        let groups = parse_chatrooms(rows);
        let first = &groups["123@chatroom"];
        assert_eq!(first["wxid_a"], "Ally");
        assert_eq!(first["wxid_b"], "");
        assert_eq!(first["wxid_c"], "Charlie");
        assert_eq!(groups["456@chatroom"]["wxid_a"], "");
    }

    #[test]
    fn files_root_strips_account_directory() {
        assert_eq!(
            files_root(r"C:\Users\me\Documents\WeChat Files\wxid_me\", "wxid_me").as_deref(),
            Some(r"C:\Users\me\Documents\WeChat Files")
        );
        assert_eq!(
            files_root(r"D:\WeChat Files\", "wxid_me").as_deref(),
            Some(r"D:\WeChat Files")
        );
        assert_eq!(files_root("", "wxid_me"), None);
    }

    #[test]
    fn sql_literals_escape_quotes() {
        assert_eq!(sql_quote("wxid_a"), "'wxid_a'");
        assert_eq!(sql_quote("o'brien"), "'o''brien'");
    }

    #[test]
    fn command_numbers_match_control_interface() {
        assert_eq!(ApiCommand::SendText.code(), 2);
        assert_eq!(ApiCommand::QueryDb.code(), 34);
        assert_eq!(ApiCommand::GetCdn.code(), 47);
    }
}
