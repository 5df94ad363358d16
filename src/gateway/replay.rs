//! Replay-window deduplication keyed by provider message id.
//!
//! Meta redelivers webhook batches on timeout or non-2xx responses; marking
//! each message id for a short window keeps redeliveries from reaching the
//! pipeline twice.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct ReplayCache {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    max_entries: usize,
}

impl ReplayCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Atomic check-and-mark. Returns `true` if `message_id` was already seen
    /// inside the TTL window (caller must discard the event); a fresh id is
    /// marked seen and yields `false`.
    pub fn check_and_mark(&self, message_id: &str) -> bool {
        self.check_and_mark_at(message_id, Instant::now())
    }

    fn check_and_mark_at(&self, message_id: &str, now: Instant) -> bool {
        let mut seen = self.seen.lock();

        seen.retain(|_, marked_at| now.duration_since(*marked_at) < self.ttl);

        if seen.contains_key(message_id) {
            return true;
        }

        // At capacity, evict the oldest entry rather than refusing new ids.
        if seen.len() >= self.max_entries {
            if let Some(oldest) = seen
                .iter()
                .min_by_key(|(_, marked_at)| **marked_at)
                .map(|(id, _)| id.clone())
            {
                seen.remove(&oldest);
            }
        }

        seen.insert(message_id.to_string(), now);
        false
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_fresh() {
        let cache = ReplayCache::new(Duration::from_secs(300), 100);
        assert!(!cache.check_and_mark("msg:mid.1"));
    }

    #[test]
    fn duplicate_within_ttl_is_flagged() {
        let cache = ReplayCache::new(Duration::from_secs(300), 100);
        assert!(!cache.check_and_mark("msg:mid.1"));
        assert!(cache.check_and_mark("msg:mid.1"));
        assert!(!cache.check_and_mark("msg:mid.2"));
    }

    #[test]
    fn entry_expires_after_ttl() {
        let cache = ReplayCache::new(Duration::from_millis(100), 100);
        let start = Instant::now();
        assert!(!cache.check_and_mark_at("msg:mid.1", start));
        assert!(cache.check_and_mark_at("msg:mid.1", start + Duration::from_millis(50)));
        assert!(!cache.check_and_mark_at("msg:mid.1", start + Duration::from_millis(150)));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = ReplayCache::new(Duration::from_secs(300), 2);
        let start = Instant::now();
        assert!(!cache.check_and_mark_at("a", start));
        assert!(!cache.check_and_mark_at("b", start + Duration::from_millis(1)));
        assert!(!cache.check_and_mark_at("c", start + Duration::from_millis(2)));
        assert_eq!(cache.len(), 2);
        // "a" was the oldest, so it is no longer a known duplicate.
        assert!(!cache.check_and_mark_at("a", start + Duration::from_millis(3)));
        // "c" is still tracked.
        assert!(cache.check_and_mark_at("c", start + Duration::from_millis(4)));
    }

    #[test]
    fn zero_capacity_clamps_to_one() {
        let cache = ReplayCache::new(Duration::from_secs(300), 0);
        assert!(!cache.check_and_mark("a"));
        assert!(cache.check_and_mark("a"));
    }
}
