//! Short-lived cache of list counts.
//!
//! Counting large tables on every paged listing is expensive, so counts are
//! kept for a minute per distinct count query and parameter set.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a cached count stays valid.
pub const COUNT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Interval of the purge sweep.
pub const COUNT_CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy)]
struct CachedCount {
    count: i64,
    stored_at: Instant,
}

/// Count cache keyed by the hash of `{query, fieldValues}`.
#[derive(Debug)]
pub struct CountCache {
    entries: DashMap<String, CachedCount>,
    ttl: Duration,
}

impl Default for CountCache {
    fn default() -> Self {
        Self::new(COUNT_CACHE_TTL)
    }
}

impl CountCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Cached count, unless it has expired.
    pub fn get(&self, key: &str) -> Option<i64> {
        let entry = self.entries.get(key)?;
        if entry.stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.count)
    }

    pub fn put(&self, key: String, count: i64) {
        self.entries.insert(
            key,
            CachedCount {
                count,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.stored_at.elapsed() <= ttl);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged, "purged count cache entries");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
