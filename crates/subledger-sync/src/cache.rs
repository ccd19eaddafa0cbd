use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

/// In-memory set of recently-processed external transaction ids, mapped to
/// the time each was first marked. Shared across all polling tasks and the
/// cleanup task.
///
/// This is an optimization to avoid redundant backend calls within the
/// lookback window; correctness depends only on the backend's external-id
/// uniqueness, never on cache membership.
#[derive(Debug, Default)]
pub struct ProcessedCache {
    entries: DashMap<String, Instant>,
}

impl ProcessedCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.entries.contains_key(tx_id)
    }

    /// Marks a transaction processed. The first mark wins; re-marking does
    /// not refresh the entry's age.
    pub fn mark(&self, tx_id: &str) {
        self.entries
            .entry(tx_id.to_string())
            .or_insert_with(Instant::now);
    }

    /// Evicts entries older than `max_age`, returning how many were removed.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, marked_at| marked_at.elapsed() < max_age);
        let evicted = before - self.entries.len();

        if evicted > 0 {
            debug!(
                evicted = evicted,
                remaining = self.entries.len(),
                "Cleaned up processed transaction ids"
            );
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_and_contains() {
        let cache = ProcessedCache::new();
        assert!(!cache.contains("tx1"));

        cache.mark("tx1");
        assert!(cache.contains("tx1"));
        assert_eq!(cache.len(), 1);

        // re-marking is idempotent
        cache.mark("tx1");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_respects_age() {
        let cache = ProcessedCache::new();
        cache.mark("tx1");
        cache.mark("tx2");

        // nothing is older than an hour
        assert_eq!(cache.evict_older_than(Duration::from_secs(3600)), 0);
        assert_eq!(cache.len(), 2);

        // everything is older than zero
        assert_eq!(cache.evict_older_than(Duration::ZERO), 2);
        assert!(cache.is_empty());

        // eviction does not resurrect correctness issues: a re-observed id
        // can simply be marked again
        cache.mark("tx1");
        assert!(cache.contains("tx1"));
    }
}
