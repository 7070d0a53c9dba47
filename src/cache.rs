//! Two-tier result cache: LRU on capacity, lazy TTL on access.
//!
//! One instance caches embeddings keyed by exact input text, another
//! caches generated answers keyed by project + prompt. Both share this
//! implementation; only capacity and TTL differ.

use crate::context::Clock;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Embedding tier: 1000 entries, 1 h TTL.
pub const EMBED_CACHE_CAPACITY: usize = 1000;
pub const EMBED_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Answer tier: 500 entries, 5 min TTL.
pub const ANSWER_CACHE_CAPACITY: usize = 500;
pub const ANSWER_CACHE_TTL: Duration = Duration::from_secs(300);

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// LRU cache with per-entry expiry. All operations are linearizable under
/// a single mutex; expired entries are removed at access time rather than
/// by a sweeper.
pub struct TtlCache<V> {
    inner: Mutex<LruCache<String, Entry<V>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self { inner: Mutex::new(LruCache::new(capacity)), ttl, clock }
    }

    pub fn embedding_tier(clock: Arc<dyn Clock>) -> Self {
        Self::new(EMBED_CACHE_CAPACITY, EMBED_CACHE_TTL, clock)
    }

    pub fn answer_tier(clock: Arc<dyn Clock>) -> Self {
        Self::new(ANSWER_CACHE_CAPACITY, ANSWER_CACHE_TTL, clock)
    }

    /// Value for `key` if present and unexpired. A hit refreshes recency;
    /// an expired entry is dropped and reported as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        // Present but expired: lazy eviction at access time.
        inner.pop(key);
        None
    }

    /// Upsert, refreshing expiry to `now + ttl`. The LRU layer evicts the
    /// least recently used entry when the cache is full.
    pub fn set(&self, key: String, value: V) {
        let expires_at = self.clock.now() + self.ttl;
        let mut inner = self.inner.lock().unwrap();
        inner.put(key, Entry { value, expires_at });
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ManualClock;

    fn cache(capacity: usize, ttl_secs: u64) -> (TtlCache<String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (TtlCache::new(capacity, Duration::from_secs(ttl_secs), clock.clone()), clock)
    }

    #[test]
    fn get_after_set_within_ttl() {
        let (cache, _clock) = cache(10, 60);
        cache.set("k".into(), "v".into());
        assert_eq!(cache.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn expired_entry_is_absent_and_removed() {
        let (cache, clock) = cache(10, 60);
        cache.set("k".into(), "v".into());
        clock.advance(Duration::from_secs(61));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn set_refreshes_expiry() {
        let (cache, clock) = cache(10, 60);
        cache.set("k".into(), "v1".into());
        clock.advance(Duration::from_secs(50));
        cache.set("k".into(), "v2".into());
        clock.advance(Duration::from_secs(50));
        // 100s since first set, 50s since refresh — still live.
        assert_eq!(cache.get("k").as_deref(), Some("v2"));
    }

    #[test]
    fn capacity_overflow_evicts_least_recently_used() {
        let (cache, _clock) = cache(2, 60);
        cache.set("a".into(), "1".into());
        cache.set("b".into(), "2".into());
        // Touch "a" so "b" becomes the LRU entry.
        assert!(cache.get("a").is_some());
        cache.set("c".into(), "3".into());
        assert_eq!(cache.get("b"), None);
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn clear_empties_the_cache() {
        let (cache, _clock) = cache(10, 60);
        cache.set("a".into(), "1".into());
        cache.set("b".into(), "2".into());
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get("a"), None);
    }
}
