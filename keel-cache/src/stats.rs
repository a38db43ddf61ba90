//! Cache usage statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Index fetches served from a populated entry.
    pub hits: u64,
    /// Index fetches that had to populate an entry.
    pub misses: u64,
    /// Calls made to a backing provider.
    pub backing_fetches: u64,
    /// Entries dropped from the reclaimable tier.
    pub evictions: u64,
    /// Identities currently held by the primary identity map.
    pub identity_count: u64,
    /// Index entries currently held across all index groups.
    pub index_entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    backing_fetches: AtomicU64,
    evictions: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn backing_fetch(&self) {
        self.backing_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self, count: u64) {
        if count > 0 {
            self.evictions.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self, identity_count: u64, index_entry_count: u64) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            backing_fetches: self.backing_fetches.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            identity_count,
            index_entry_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_recorder_snapshot() {
        let recorder = StatsRecorder::default();
        recorder.hit();
        recorder.miss();
        recorder.miss();
        recorder.backing_fetch();
        recorder.evicted(0);
        recorder.evicted(3);
        let stats = recorder.snapshot(5, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.backing_fetches, 1);
        assert_eq!(stats.evictions, 3);
        assert_eq!(stats.identity_count, 5);
        assert_eq!(stats.index_entry_count, 2);
    }
}
