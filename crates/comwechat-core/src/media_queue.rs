//! Inbound messages waiting for their media to land on local storage.
//!
//! The chat client downloads attachments on its own schedule, so an inbound
//! event often names a file that does not exist yet. Entries are polled once
//! per tick by a single loop and leave the queue in one of three ways:
//! the file shows up ([`MediaOutcome::Delivered`]), a voice clip is pulled
//! out of the client's media database ([`MediaOutcome::Recovered`]), or the
//! timeout passes ([`MediaOutcome::TimedOut`]).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::client::ChatClient;
use crate::types::{Author, Chat, InboundEvent};

pub const MEDIA_DB: &str = "MediaMSG0.db";

#[derive(Debug, Clone)]
pub struct DeferredMedia {
    pub event: InboundEvent,
    pub author: Author,
    pub chat: Chat,
    pub created_at: Instant,
}

impl DeferredMedia {
    pub fn new(event: InboundEvent, author: Author, chat: Chat) -> Self {
        Self::created_at(event, author, chat, Instant::now())
    }

    pub fn created_at(event: InboundEvent, author: Author, chat: Chat, at: Instant) -> Self {
        Self {
            event,
            author,
            chat,
            created_at: at,
        }
    }

    pub fn is_voice(&self) -> bool {
        self.event.msg_type == "voice"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaOutcome {
    Delivered,
    Recovered,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct Finalized {
    pub path: PathBuf,
    pub media: DeferredMedia,
    pub outcome: MediaOutcome,
}

#[derive(Debug)]
pub struct MediaQueue {
    timeout: Duration,
    entries: Mutex<HashMap<PathBuf, DeferredMedia>>,
}

impl MediaQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Queues `media` until `path` exists. A second entry for the same path
    /// replaces the first.
    pub fn enqueue(&self, path: impl Into<PathBuf>, media: DeferredMedia) {
        let path = path.into();
        debug!("deferring {} until {} exists", media.event.msgid, path.display());
        self.entries.lock().insert(path, media);
    }

    /// Evaluates every pending entry once.
    ///
    /// `recover_voice` is only consulted for voice entries whose file is
    /// missing and that have not timed out; it returns whether it wrote the
    /// file. The queue lock is not held while it runs.
    pub fn poll<F>(&self, now: Instant, mut recover_voice: F) -> Vec<Finalized>
    where
        F: FnMut(&Path, &DeferredMedia) -> bool,
    {
        let snapshot: Vec<(PathBuf, DeferredMedia)> = self
            .entries
            .lock()
            .iter()
            .map(|(path, media)| (path.clone(), media.clone()))
            .collect();

        let mut finalized = Vec::new();
        for (path, media) in snapshot {
            let outcome = if path.exists() {
                MediaOutcome::Delivered
            } else if now.saturating_duration_since(media.created_at) > self.timeout {
                MediaOutcome::TimedOut
            } else if media.is_voice() && recover_voice(&path, &media) {
                MediaOutcome::Recovered
            } else {
                continue;
            };
            finalized.push(Finalized {
                path,
                media,
                outcome,
            });
        }

        if !finalized.is_empty() {
            let mut entries = self.entries.lock();
            finalized.retain(|done| {
                // Re-queued under the same path while we were polling: leave it.
                let current = entries
                    .get(&done.path)
                    .is_some_and(|m| m.created_at == done.media.created_at);
                if current {
                    entries.remove(&done.path);
                }
                current
            });
        }
        finalized
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pulls a voice clip for `msgid` out of the client's media database and
/// writes it to `path`.
///
/// The query answers with a header row plus, once the clip is stored, one
/// data row whose first column is the base64 blob.
pub fn recover_voice<C>(client: &C, msgid: &str, path: &Path) -> bool
where
    C: ChatClient + ?Sized,
{
    if msgid.is_empty() || !msgid.chars().all(|c| c.is_ascii_digit()) {
        warn!("voice recovery skipped for non-numeric msgid {msgid:?}");
        return false;
    }
    let sql = format!("SELECT Buf FROM Media WHERE Reserved0 = {msgid}");
    let rows = match client.query_database(MEDIA_DB, &sql) {
        Ok(rows) => rows,
        Err(err) => {
            debug!("voice lookup for {msgid} failed: {err}");
            return false;
        }
    };
    if rows.len() != 2 {
        return false;
    }
    let Some(blob) = rows[1].first() else {
        return false;
    };
    let decoded = match base64::engine::general_purpose::STANDARD.decode(blob.trim()) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("voice blob for {msgid} is not base64: {err}");
            return false;
        }
    };
    if let Some(parent) = path.parent()
        && let Err(err) = std::fs::create_dir_all(parent)
    {
        warn!("create {} failed: {err}", parent.display());
        return false;
    }
    match std::fs::write(path, decoded) {
        Ok(()) => {
            debug!("recovered voice {msgid} into {}", path.display());
            true
        }
        Err(err) => {
            warn!("write {} failed: {err}", path.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(120);

    fn media(msg_type: &str, at: Instant) -> DeferredMedia {
        let chat = Chat::private("wxid_abc", "Abc");
        let event = InboundEvent {
            sender: "wxid_abc".into(),
            msgid: "123".into(),
            msg_type: msg_type.into(),
            ..Default::default()
        };
        DeferredMedia::created_at(event, Author::peer_of(&chat), chat, at)
    }

    #[test]
    fn appearing_file_is_delivered_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        let queue = MediaQueue::new(TIMEOUT);
        let start = Instant::now();
        queue.enqueue(&path, media("image", start));

        assert!(queue.poll(start, |_, _| false).is_empty());
        std::fs::write(&path, b"jpeg").unwrap();

        let done = queue.poll(start + Duration::from_secs(1), |_, _| false);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].outcome, MediaOutcome::Delivered);
        assert!(queue.is_empty());
        assert!(queue.poll(start + Duration::from_secs(2), |_, _| false).is_empty());
    }

    #[test]
    fn missing_file_times_out_after_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.mp4");
        let queue = MediaQueue::new(TIMEOUT);
        let start = Instant::now();
        queue.enqueue(&path, media("video", start));

        assert!(queue.poll(start + TIMEOUT, |_, _| false).is_empty());
        let done = queue.poll(start + TIMEOUT + Duration::from_secs(1), |_, _| false);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].outcome, MediaOutcome::TimedOut);
        assert!(queue.is_empty());
    }

    #[test]
    fn only_voice_entries_try_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MediaQueue::new(TIMEOUT);
        let start = Instant::now();
        queue.enqueue(dir.path().join("a.jpg"), media("image", start));
        queue.enqueue(dir.path().join("b.amr"), media("voice", start));

        let mut asked = Vec::new();
        let done = queue.poll(start, |path, _| {
            asked.push(path.to_path_buf());
            std::fs::write(path, b"amr").unwrap();
            true
        });
        assert_eq!(asked, vec![dir.path().join("b.amr")]);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].outcome, MediaOutcome::Recovered);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn entry_requeued_during_poll_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.amr");
        let queue = MediaQueue::new(TIMEOUT);
        let start = Instant::now();
        queue.enqueue(&path, media("voice", start));

        let later = start + Duration::from_secs(5);
        let done = queue.poll(later, |p, _| {
            queue.enqueue(p, media("voice", later));
            true
        });
        assert!(done.is_empty());
        assert!(queue.contains(&path));
    }
}
