use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

/// Held for the issue + wait span of one file-bearing send.
pub type FileLockGuard = ArcMutexGuard<RawMutex, ()>;

/// One lock per destination chat, created on first use.
#[derive(Debug, Default)]
pub struct FileLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, chat: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(chat.to_string())
            .or_default()
            .clone()
    }

    /// Blocks until no other file send to `chat` is in flight.
    pub fn acquire(&self, chat: &str) -> FileLockGuard {
        // The table lock is released before blocking on the chat lock.
        let lock = self.lock_for(chat);
        lock.lock_arc()
    }

    pub fn try_acquire(&self, chat: &str) -> Option<FileLockGuard> {
        self.lock_for(chat).try_lock_arc()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
