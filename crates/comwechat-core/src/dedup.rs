use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// First sighting of this message id.
    First,
    /// Seen before under a different declared type; deliver again.
    Retyped,
    /// Seen before with the same declared type; drop.
    Duplicate,
}

impl Delivery {
    pub fn should_deliver(self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

#[derive(Debug, Clone)]
struct Seen {
    declared_type: String,
    at: Instant,
}

/// Recently seen inbound message ids, bounded and time-expiring.
#[derive(Debug)]
pub struct DeliveryCache {
    ttl: Duration,
    entries: Mutex<LruCache<String, Seen>>,
}

impl DeliveryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn observe(&self, msgid: &str, declared_type: &str) -> Delivery {
        self.observe_at(msgid, declared_type, Instant::now())
    }

    /// Records `msgid` the first time it is seen. A later sighting under a
    /// different type does not overwrite the recorded type.
    pub fn observe_at(&self, msgid: &str, declared_type: &str, now: Instant) -> Delivery {
        let mut entries = self.entries.lock();
        if let Some(seen) = entries.get(msgid) {
            if now.saturating_duration_since(seen.at) <= self.ttl {
                return if seen.declared_type == declared_type {
                    Delivery::Duplicate
                } else {
                    Delivery::Retyped
                };
            }
        }
        entries.put(
            msgid.to_string(),
            Seen {
                declared_type: declared_type.to_string(),
                at: now,
            },
        );
        Delivery::First
    }

    pub fn contains(&self, msgid: &str) -> bool {
        self.contains_at(msgid, Instant::now())
    }

    pub fn contains_at(&self, msgid: &str, now: Instant) -> bool {
        self.entries
            .lock()
            .peek(msgid)
            .is_some_and(|seen| now.saturating_duration_since(seen.at) <= self.ttl)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(120);

    #[test]
    fn same_id_same_type_is_dropped() {
        let cache = DeliveryCache::new(200, TTL);
        assert_eq!(cache.observe("1", "image"), Delivery::First);
        assert_eq!(cache.observe("1", "image"), Delivery::Duplicate);
        assert!(!Delivery::Duplicate.should_deliver());
    }

    #[test]
    fn same_id_other_type_is_delivered() {
        let cache = DeliveryCache::new(200, TTL);
        assert_eq!(cache.observe("1", "text"), Delivery::First);
        assert_eq!(cache.observe("1", "share"), Delivery::Retyped);
        assert!(Delivery::Retyped.should_deliver());
        // The first recorded type still wins.
        assert_eq!(cache.observe("1", "text"), Delivery::Duplicate);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = DeliveryCache::new(200, TTL);
        let start = Instant::now();
        cache.observe_at("1", "text", start);
        assert!(cache.contains_at("1", start + TTL));
        assert!(!cache.contains_at("1", start + TTL + Duration::from_secs(1)));
        assert_eq!(
            cache.observe_at("1", "text", start + TTL + Duration::from_secs(1)),
            Delivery::First
        );
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let cache = DeliveryCache::new(2, TTL);
        cache.observe("1", "text");
        cache.observe("2", "text");
        cache.observe("3", "text");
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("1"));
        assert!(cache.contains("3"));
    }
}
