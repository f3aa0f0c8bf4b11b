use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::trace;

/// HTML page bodies go stale fast; refetch after ten minutes.
pub const HTML_TTL: Duration = Duration::from_secs(10 * 60);
/// Reachability verdicts, positive and negative alike.
pub const REACHABILITY_TTL: Duration = Duration::from_secs(30 * 60);
/// Decoded pixel dimensions never change for a given URL within a session.
pub const DIMENSIONS_TTL: Duration = Duration::from_secs(60 * 60);

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn expired(&self) -> bool {
        self.stored_at.elapsed() > self.ttl
    }
}

/// String-keyed value cache with per-entry expiry.
///
/// Expiry is lazy: a read past the entry's deadline removes it and reports a
/// miss. There is no size cap; the cache lives only as long as the session.
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.expired() {
                trace!(key, "cache hit");
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        // Expired: purge so repeated reads of dead keys don't accumulate.
        self.entries.remove(key);
        None
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
