//! Outbound sends awaiting their `sent_msg` confirmation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

/// Marker carried by file-operation keys.
pub const FILE_OP_MARKER: &str = "__file_op__";

/// Matches an outbound send to its later confirmation.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// Exact text or quote XML sent to a chat.
    Content { chat: String, payload: String },
    /// Any file-bearing send to a chat. These always collide with each other,
    /// so callers serialize them per chat.
    FileOp { chat: String },
}

impl CorrelationKey {
    pub fn content(chat: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::Content {
            chat: chat.into(),
            payload: payload.into(),
        }
    }

    pub fn file_op(chat: impl Into<String>) -> Self {
        Self::FileOp { chat: chat.into() }
    }

    pub fn chat(&self) -> &str {
        match self {
            Self::Content { chat, .. } | Self::FileOp { chat } => chat,
        }
    }
}

impl fmt::Debug for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Content { chat, payload } => write!(f, "({chat:?}, {payload:?})"),
            Self::FileOp { chat } => write!(f, "({chat:?}, None, {FILE_OP_MARKER:?})"),
        }
    }
}

#[derive(Debug, Default)]
struct SlotState {
    signaled: bool,
    result: Option<String>,
}

#[derive(Debug, Default)]
struct Slot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

/// A registered wait slot; consumed by [`PendingSends::wait`].
#[derive(Debug)]
#[must_use = "a registered send must be waited on or its slot leaks until replaced"]
pub struct PendingSend {
    key: CorrelationKey,
    slot: Arc<Slot>,
}

impl PendingSend {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }
}

#[derive(Debug, Default)]
pub struct PendingSends {
    slots: Mutex<HashMap<CorrelationKey, Arc<Slot>>>,
}

impl PendingSends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh slot for `key`, replacing any slot already registered
    /// under it. Must happen before the command is issued to the client.
    pub fn register(&self, key: CorrelationKey) -> PendingSend {
        let slot = Arc::new(Slot::default());
        let replaced = self.slots.lock().insert(key.clone(), slot.clone());
        if replaced.is_some() {
            warn!("pending send {key:?} replaced an in-flight slot with the same key");
        }
        PendingSend { key, slot }
    }

    /// Stores `msgid` for `key` and wakes its waiter. Returns whether a slot
    /// was found.
    pub fn resolve(&self, key: &CorrelationKey, msgid: &str) -> bool {
        self.resolve_first(std::slice::from_ref(key), msgid).is_some()
    }

    /// Resolves the first registered key among `candidates`, checked in order
    /// under a single lock.
    pub fn resolve_first(
        &self,
        candidates: &[CorrelationKey],
        msgid: &str,
    ) -> Option<CorrelationKey> {
        let slots = self.slots.lock();
        let (key, slot) = candidates
            .iter()
            .find_map(|key| slots.get(key).map(|slot| (key, slot)))?;

        let mut state = slot.state.lock();
        if state.signaled {
            warn!("pending send {key:?} already confirmed, ignoring msgid {msgid}");
            return Some(key.clone());
        }
        state.result = Some(msgid.to_string());
        state.signaled = true;
        slot.cond.notify_all();
        debug!("matched sent message {key:?} with msgid {msgid}");
        Some(key.clone())
    }

    /// Blocks until the send is confirmed or `timeout` elapses, then removes
    /// the slot.
    ///
    /// A slot replaced by a later registration under the same key stays with
    /// that later waiter.
    pub fn wait(&self, pending: PendingSend, timeout: Duration) -> Option<String> {
        let PendingSend { key, slot } = pending;
        debug!("waiting for confirmation of {key:?} (timeout {timeout:?})");
        {
            let mut state = slot.state.lock();
            if !state.signaled {
                let _ = slot
                    .cond
                    .wait_while_for(&mut state, |s| !s.signaled, timeout);
            }
        }

        let (signaled, result) = {
            let mut slots = self.slots.lock();
            if slots.get(&key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                slots.remove(&key);
            }
            let mut state = slot.state.lock();
            (state.signaled, state.result.take())
        };

        match (signaled, result) {
            (true, Some(msgid)) => {
                debug!("received msgid {msgid} for {key:?}");
                Some(msgid)
            }
            (true, None) => {
                error!("confirmation for {key:?} signaled without a msgid");
                None
            }
            (false, _) => {
                warn!("timed out waiting for send confirmation of {key:?}");
                None
            }
        }
    }

    /// Drops a slot whose command never reached the client.
    pub fn cancel(&self, pending: PendingSend) {
        let PendingSend { key, slot } = pending;
        let mut slots = self.slots.lock();
        if slots.get(&key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
            slots.remove(&key);
            debug!("cancelled pending send {key:?}");
        }
    }

    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn resolved_before_wait_returns_id_and_clears_slot() {
        let pending = PendingSends::new();
        let key = CorrelationKey::content("wxid_abc", "hello");
        let ticket = pending.register(key.clone());

        assert!(pending.resolve(&key, "1001"));
        assert_eq!(
            pending.wait(ticket, Duration::from_millis(50)),
            Some("1001".to_string())
        );
        assert!(!pending.contains(&key));
        assert!(pending.is_empty());
    }

    #[test]
    fn unresolved_wait_times_out_and_clears_slot() {
        let pending = PendingSends::new();
        let key = CorrelationKey::file_op("wxid_abc");
        let ticket = pending.register(key.clone());

        let started = Instant::now();
        assert_eq!(pending.wait(ticket, Duration::from_millis(80)), None);
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert!(!pending.contains(&key));
    }

    #[test]
    fn resolve_from_another_thread_wakes_waiter() {
        let pending = Arc::new(PendingSends::new());
        let key = CorrelationKey::content("wxid_abc", "hello");
        let ticket = pending.register(key.clone());

        let resolver = {
            let pending = pending.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                pending.resolve(&key, "2002")
            })
        };

        let started = Instant::now();
        let got = pending.wait(ticket, Duration::from_secs(5));
        assert_eq!(got.as_deref(), Some("2002"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(resolver.join().unwrap());
    }

    #[test]
    fn unknown_key_is_dropped() {
        let pending = PendingSends::new();
        assert!(!pending.resolve(&CorrelationKey::content("a", "b"), "1"));
    }

    #[test]
    fn second_resolve_keeps_first_id() {
        let pending = PendingSends::new();
        let key = CorrelationKey::content("a", "b");
        let ticket = pending.register(key.clone());
        pending.resolve(&key, "first");
        pending.resolve(&key, "second");
        assert_eq!(
            pending.wait(ticket, Duration::from_millis(10)).as_deref(),
            Some("first")
        );
    }

    #[test]
    fn resolve_first_prefers_earlier_candidates() {
        let pending = PendingSends::new();
        let content = CorrelationKey::content("a", "b");
        let file = CorrelationKey::file_op("a");
        let _content_ticket = pending.register(content.clone());
        let _file_ticket = pending.register(file.clone());

        assert_eq!(
            pending.resolve_first(&[content.clone(), file.clone()], "9"),
            Some(content)
        );
        assert_eq!(
            pending.resolve_first(&[CorrelationKey::content("a", "zzz"), file.clone()], "10"),
            Some(file)
        );
    }

    #[test]
    fn replaced_slot_belongs_to_latest_registration() {
        let pending = PendingSends::new();
        let key = CorrelationKey::content("a", "same text");
        let first = pending.register(key.clone());
        let second = pending.register(key.clone());

        // The first waiter no longer owns the key and must not evict the second.
        assert_eq!(pending.wait(first, Duration::from_millis(10)), None);
        assert!(pending.contains(&key));

        assert!(pending.resolve(&key, "77"));
        assert_eq!(
            pending.wait(second, Duration::from_millis(10)).as_deref(),
            Some("77")
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn cancel_only_removes_own_slot() {
        let pending = PendingSends::new();
        let key = CorrelationKey::file_op("wxid_abc");
        let stale = pending.register(key.clone());
        let live = pending.register(key.clone());
        pending.cancel(stale);
        assert!(pending.contains(&key));
        pending.cancel(live);
        assert!(pending.is_empty());
    }

    #[test]
    fn file_key_debug_shows_marker() {
        let key = CorrelationKey::file_op("wxid_abc");
        assert_eq!(format!("{key:?}"), r#"("wxid_abc", None, "__file_op__")"#);
        assert_eq!(key.chat(), "wxid_abc");
    }
}
