//! JSONL sidecar protocol.
//!
//! The master drives the daemon with one JSON command per stdin line and
//! reads replies and bridged messages from stdout. Chat-client callbacks
//! arrive as `{"category", "payload"}` lines on a TCP listener and are
//! handed to one worker thread per category, so events of a category are
//! handled in order while categories proceed independently.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc as std_mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use comwechat_core::{
    Author, Bridge, BridgeConfig, Chat, ChatClient, Error, EventCategory, InboundEvent, Master,
    MasterMessage, MasterStatus, OutboundMessage, SendReceipt,
};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: u32 = 1;

/// How many delivered messages keep their author for retries.
const AUTHOR_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(4096) {
    Some(v) => v,
    None => panic!("author cache size must be non-zero"),
};

/// Upper bound on flushing queued stdout lines at shutdown.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

type SharedBridge<C> = Arc<Bridge<C, JsonlMaster>>;

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum InCmd {
    SendMessage {
        #[serde(default)]
        request_id: Option<String>,
        message: OutboundMessage,
    },
    InvokeCommand {
        #[serde(default)]
        request_id: Option<String>,
        callable: String,
        #[serde(default)]
        args: BTreeMap<String, String>,
    },
    RefreshDirectory {
        #[serde(default)]
        request_id: Option<String>,
    },
    Shutdown {
        #[serde(default)]
        request_id: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutMsg {
    Ready {
        protocol_version: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        wxid: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
    },
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: String,
        message: String,
    },
    Message {
        message: MasterMessage,
    },
    MessageRemoved {
        chat: Chat,
        uid: String,
    },
}

fn out_error(request_id: Option<String>, code: &str, message: impl Into<String>) -> OutMsg {
    OutMsg::Error {
        request_id,
        code: code.to_string(),
        message: message.into(),
    }
}

fn out_ok(request_id: Option<String>, result: Option<serde_json::Value>) -> OutMsg {
    OutMsg::Ok { request_id, result }
}

fn error_code(err: &Error) -> &'static str {
    match err {
        Error::Client(_) => "client_error",
        Error::Config(_) => "config_error",
        Error::Io { .. } => "io_error",
        Error::Json(_) => "json_error",
        Error::NotLoggedIn => "not_logged_in",
        Error::MissingFile(_) => "missing_file",
        Error::InvalidCommand(_) => "invalid_command",
    }
}

fn error_reply(request_id: Option<String>, err: &Error) -> OutMsg {
    out_error(request_id, error_code(err), err.to_string())
}

fn send_reply(request_id: Option<String>, result: comwechat_core::Result<SendReceipt>) -> OutMsg {
    match result {
        Ok(receipt) if receipt.succeeded() => out_ok(
            request_id,
            Some(json!({
                "uid": receipt.message_uid(),
                "ids": receipt.ids,
                "accepted": receipt.accepted,
            })),
        ),
        Ok(_) => out_error(
            request_id,
            "unconfirmed",
            "the chat client did not confirm the message",
        ),
        Err(err) => error_reply(request_id, &err),
    }
}

/// [`Master`] that writes bridged messages to stdout.
pub struct JsonlMaster {
    out: mpsc::UnboundedSender<OutMsg>,
    authors: Mutex<LruCache<(String, String), Author>>,
}

impl JsonlMaster {
    fn new(out: mpsc::UnboundedSender<OutMsg>) -> Self {
        Self {
            out,
            authors: Mutex::new(LruCache::new(AUTHOR_CACHE_SIZE)),
        }
    }

    fn emit(&self, msg: OutMsg) {
        if self.out.send(msg).is_err() {
            warn!("stdout writer is gone, dropping output");
        }
    }
}

impl Master for JsonlMaster {
    fn deliver(&self, message: MasterMessage) {
        self.authors.lock().put(
            (message.chat.uid.clone(), message.uid.clone()),
            message.author.clone(),
        );
        self.emit(OutMsg::Message { message });
    }

    fn status(&self, status: MasterStatus) {
        match status {
            MasterStatus::MessageRemoval { chat, uid } => {
                self.emit(OutMsg::MessageRemoved { chat, uid });
            }
        }
    }

    fn message_author(&self, chat_uid: &str, msgid: &str) -> Option<Author> {
        self.authors
            .lock()
            .get(&(chat_uid.to_string(), msgid.to_string()))
            .cloned()
    }
}

#[derive(Debug, Deserialize)]
struct FeedEnvelope {
    category: EventCategory,
    #[serde(default)]
    payload: InboundEvent,
}

/// Fans feed events out to the per-category workers.
struct EventRouter {
    workers: HashMap<EventCategory, std_mpsc::Sender<InboundEvent>>,
}

impl EventRouter {
    fn route(&self, envelope: FeedEnvelope) {
        let FeedEnvelope { category, payload } = envelope;
        match self.workers.get(&category) {
            Some(tx) => {
                if tx.send(payload).is_err() {
                    warn!("{} worker has stopped, dropping event", category.as_str());
                }
            }
            None => warn!("no worker for {}", category.as_str()),
        }
    }
}

fn spawn_category_workers<C>(
    bridge: &SharedBridge<C>,
) -> anyhow::Result<(EventRouter, Vec<JoinHandle<()>>)>
where
    C: ChatClient + 'static,
{
    let mut workers = HashMap::new();
    let mut handles = Vec::new();
    for category in EventCategory::ALL {
        let (tx, rx) = std_mpsc::channel::<InboundEvent>();
        let bridge = bridge.clone();
        let handle = thread::Builder::new()
            .name(format!("comwechat-{}", category.as_str()))
            .spawn(move || {
                for event in rx {
                    bridge.handle_event(category, event);
                }
                debug!("{} worker stopped", category.as_str());
            })
            .with_context(|| format!("spawn {} worker", category.as_str()))?;
        workers.insert(category, tx);
        handles.push(handle);
    }
    Ok((EventRouter { workers }, handles))
}

async fn serve_event_feed(listener: TcpListener, router: Arc<EventRouter>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("event feed connected from {peer}");
                    connections.spawn(read_event_feed(stream, peer, router.clone()));
                }
                Err(err) => warn!("event feed accept failed: {err}"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn read_event_feed(stream: TcpStream, peer: SocketAddr, router: Arc<EventRouter>) {
    let mut lines = tokio::io::BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<FeedEnvelope>(trimmed) {
                    Ok(envelope) => router.route(envelope),
                    Err(err) => warn!("invalid event json from {peer}: {err} line={trimmed}"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!("event feed {peer} read failed: {err}");
                break;
            }
        }
    }
    info!("event feed {peer} disconnected");
}

async fn stdout_writer(mut rx: mpsc::UnboundedReceiver<OutMsg>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(msg) = rx.recv().await {
        let line = serde_json::to_string(&msg).context("encode out msg")?;
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

/// Runs `work` on a blocking thread and writes its reply.
fn spawn_blocking_reply<F>(
    out_tx: &mpsc::UnboundedSender<OutMsg>,
    request_id: Option<String>,
    work: F,
) where
    F: FnOnce(Option<String>) -> OutMsg + Send + 'static,
{
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        let fallback_id = request_id.clone();
        let reply = match tokio::task::spawn_blocking(move || work(request_id)).await {
            Ok(reply) => reply,
            Err(err) => out_error(fallback_id, "internal", format!("worker failed: {err}")),
        };
        out_tx.send(reply).ok();
    });
}

pub async fn daemon_main<C>(config: BridgeConfig, client: C, listen: &str) -> anyhow::Result<()>
where
    C: ChatClient + 'static,
{
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind event feed on {listen}"))?;
    info!("event feed listening on {listen}");

    let (out_tx, out_rx) = mpsc::unbounded_channel::<OutMsg>();
    let writer = tokio::spawn(async move {
        if let Err(err) = stdout_writer(out_rx).await {
            eprintln!("[comwechatd] stdout writer failed: {err:#}");
        }
    });

    let bridge: SharedBridge<C> =
        Arc::new(Bridge::new(config, client, JsonlMaster::new(out_tx.clone())));

    let account = {
        let bridge = bridge.clone();
        tokio::task::spawn_blocking(move || bridge.start())
            .await
            .context("bridge start task")?
    };
    let account = match account {
        Ok(account) => Some(account),
        Err(err) => {
            warn!("bridge started without an account: {err}");
            None
        }
    };

    let (router, workers) = spawn_category_workers(&bridge)?;
    let feed = tokio::spawn(serve_event_feed(listener, Arc::new(router)));

    let stop = Arc::new(AtomicBool::new(false));
    let poller = {
        let bridge = bridge.clone();
        let stop = stop.clone();
        thread::Builder::new()
            .name("comwechat-poll".to_string())
            .spawn(move || bridge.run_poll_loop(&stop))
            .context("spawn poll thread")?
    };

    out_tx
        .send(OutMsg::Ready {
            protocol_version: PROTOCOL_VERSION,
            wxid: account.as_ref().map(|a| a.wxid.clone()),
            nickname: account.map(|a| a.nickname),
        })
        .ok();

    // stdin command reader
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<InCmd>();
    tokio::spawn(async move {
        let stdin = tokio::io::stdin();
        let mut lines = tokio::io::BufReader::new(stdin).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<InCmd>(trimmed) {
                Ok(cmd) => {
                    cmd_tx.send(cmd).ok();
                }
                Err(err) => {
                    warn!("invalid cmd json: {err} line={trimmed}");
                }
            }
        }
    });

    let mut shutdown = false;
    while !shutdown {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break; };
                match cmd {
                    InCmd::SendMessage { request_id, message } => {
                        let bridge = bridge.clone();
                        spawn_blocking_reply(&out_tx, request_id, move |request_id| {
                            send_reply(request_id, bridge.send_message(&message))
                        });
                    }
                    InCmd::InvokeCommand { request_id, callable, args } => {
                        let bridge = bridge.clone();
                        spawn_blocking_reply(&out_tx, request_id, move |request_id| {
                            match bridge.invoke_command(&callable, &args) {
                                Ok(text) => out_ok(request_id, Some(json!({ "text": text }))),
                                Err(err) => error_reply(request_id, &err),
                            }
                        });
                    }
                    InCmd::RefreshDirectory { request_id } => {
                        let bridge = bridge.clone();
                        spawn_blocking_reply(&out_tx, request_id, move |request_id| {
                            match bridge.refresh_directory() {
                                Ok(()) => out_ok(request_id, None),
                                Err(err) => error_reply(request_id, &err),
                            }
                        });
                    }
                    InCmd::Shutdown { request_id } => {
                        out_tx.send(out_ok(request_id, None)).ok();
                        shutdown = true;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    info!("shutting down");
    feed.abort();
    stop.store(true, Ordering::Relaxed);
    // The bridge owns the blocking HTTP client, which must not be dropped on
    // a runtime thread.
    let joined = tokio::task::spawn_blocking(move || {
        if poller.join().is_err() {
            warn!("poll thread panicked");
        }
        for worker in workers {
            if worker.join().is_err() {
                warn!("category worker panicked");
            }
        }
        drop(bridge);
    })
    .await;
    if let Err(err) = joined {
        warn!("joining bridge threads failed: {err}");
    }

    drop(out_tx);
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        warn!("stdout writer did not drain within {WRITER_DRAIN:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use comwechat_core::{AuthorRole, ClientError, MsgKind};

    use super::*;

    fn sample_message(uid: &str) -> MasterMessage {
        MasterMessage::text(
            uid,
            Chat::group("123@chatroom", "team"),
            Author::member("wxid_a", "Alice", Some("Ally".into())),
            "hi",
        )
    }

    #[test]
    fn parses_send_message_command() {
        let cmd: InCmd = serde_json::from_str(
            r#"{"cmd":"send_message","request_id":"r1","message":{"chat_uid":"wxid_b","kind":"text","text":"hello"}}"#,
        )
        .expect("parse cmd");
        match cmd {
            InCmd::SendMessage {
                request_id,
                message,
            } => {
                assert_eq!(request_id.as_deref(), Some("r1"));
                assert_eq!(message.chat_uid, "wxid_b");
                assert_eq!(message.kind, MsgKind::Text);
                assert_eq!(message.text, "hello");
                assert!(message.target.is_none());
            }
            other => panic!("expected send_message, got {other:?}"),
        }
    }

    #[test]
    fn parses_invoke_command_with_default_args() {
        let cmd: InCmd =
            serde_json::from_str(r#"{"cmd":"invoke_command","callable":"forward_link"}"#).unwrap();
        match cmd {
            InCmd::InvokeCommand {
                request_id,
                callable,
                args,
            } => {
                assert_eq!(request_id, None);
                assert_eq!(callable, "forward_link");
                assert!(args.is_empty());
            }
            other => panic!("expected invoke_command, got {other:?}"),
        }
        assert!(matches!(
            serde_json::from_str::<InCmd>(r#"{"cmd":"shutdown"}"#),
            Ok(InCmd::Shutdown { request_id: None })
        ));
        assert!(serde_json::from_str::<InCmd>(r#"{"cmd":"login"}"#).is_err());
    }

    #[test]
    fn parses_feed_envelope() {
        let envelope: FeedEnvelope = serde_json::from_str(
            r#"{"category":"group_msg","payload":{"sender":"123@chatroom","wxid":"wxid_a","msgid":42,"type":"text","message":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.category, EventCategory::Group);
        assert_eq!(envelope.payload.msgid, "42");
        assert_eq!(envelope.payload.wxid, "wxid_a");

        assert!(serde_json::from_str::<FeedEnvelope>(r#"{"category":"bogus_msg"}"#).is_err());
    }

    #[test]
    fn router_delivers_to_category_worker() {
        let (group_tx, group_rx) = std_mpsc::channel();
        let router = EventRouter {
            workers: HashMap::from([(EventCategory::Group, group_tx)]),
        };
        router.route(FeedEnvelope {
            category: EventCategory::Group,
            payload: InboundEvent {
                msgid: "7".into(),
                ..InboundEvent::default()
            },
        });
        // No worker for this category; dropped with a warning.
        router.route(FeedEnvelope {
            category: EventCategory::Card,
            payload: InboundEvent::default(),
        });
        assert_eq!(group_rx.try_recv().unwrap().msgid, "7");
        assert!(group_rx.try_recv().is_err());
    }

    #[test]
    fn out_msgs_are_tagged_by_type() {
        let ready = serde_json::to_value(OutMsg::Ready {
            protocol_version: PROTOCOL_VERSION,
            wxid: None,
            nickname: None,
        })
        .unwrap();
        assert_eq!(ready, json!({"type": "ready", "protocol_version": 1}));

        let ok = serde_json::to_value(out_ok(None, None)).unwrap();
        assert_eq!(ok, json!({"type": "ok"}));

        let err = serde_json::to_value(out_error(Some("r2".into()), "not_logged_in", "x")).unwrap();
        assert_eq!(
            err,
            json!({"type": "error", "request_id": "r2", "code": "not_logged_in", "message": "x"})
        );
    }

    #[test]
    fn master_emits_messages_and_remembers_authors() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let master = JsonlMaster::new(tx);

        master.deliver(sample_message("42"));
        let Ok(OutMsg::Message { message }) = rx.try_recv() else {
            panic!("expected a message line");
        };
        assert_eq!(message.uid, "42");

        let author = master.message_author("123@chatroom", "42").unwrap();
        assert_eq!(author.role, AuthorRole::Member);
        assert_eq!(author.alias.as_deref(), Some("Ally"));
        assert!(master.message_author("123@chatroom", "43").is_none());
        assert!(master.message_author("other@chatroom", "42").is_none());

        master.status(MasterStatus::MessageRemoval {
            chat: Chat::private("wxid_b", "Bob"),
            uid: "99".into(),
        });
        let removed = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
        assert_eq!(removed["type"], "message_removed");
        assert_eq!(removed["uid"], "99");
        assert_eq!(removed["chat"]["uid"], "wxid_b");
    }

    #[test]
    fn send_replies_distinguish_confirmed_and_unconfirmed() {
        let confirmed = send_reply(
            Some("r1".into()),
            Ok(SendReceipt {
                ids: vec!["1001".into(), "1002".into()],
                accepted: false,
            }),
        );
        let value = serde_json::to_value(confirmed).unwrap();
        assert_eq!(value["type"], "ok");
        assert_eq!(value["result"]["uid"], r#"["1001","1002"]"#);

        let unconfirmed = serde_json::to_value(send_reply(None, Ok(SendReceipt::default()))).unwrap();
        assert_eq!(unconfirmed["code"], "unconfirmed");

        let ignored = send_reply(
            Some("r2".into()),
            Ok(SendReceipt {
                ids: Vec::new(),
                accepted: true,
            }),
        );
        let value = serde_json::to_value(ignored).unwrap();
        assert_eq!(value["type"], "ok");
        assert_eq!(value["result"]["accepted"], true);

        let failed = serde_json::to_value(send_reply(
            None,
            Err(Error::Client(ClientError::Transport("refused".into()))),
        ))
        .unwrap();
        assert_eq!(failed["code"], "client_error");
        assert_eq!(failed["message"], "chat client unreachable: refused");
    }
}
