//! Two-tier entry storage.
//!
//! Globally visible cache structures keep their entries in the
//! [`Retention::Reclaimable`] tier: a bounded LRU that may drop any entry,
//! after which the next access repopulates it. Transaction-local structures
//! use [`Retention::Pinned`]: a plain map that only its owner clears.

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

/// Retention policy of an [`EntryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// May drop least-recently-used entries beyond `capacity`.
    Reclaimable { capacity: NonZeroUsize },
    /// Never drops entries on its own.
    Pinned,
}

/// Keyed entry container with an explicit retention policy.
pub(crate) enum EntryStore<K: Hash + Eq, V> {
    Reclaimable(LruCache<K, V>),
    Pinned(HashMap<K, V>),
}

impl<K: Hash + Eq + Clone, V: Clone> EntryStore<K, V> {
    pub(crate) fn new(retention: Retention) -> Self {
        match retention {
            Retention::Reclaimable { capacity } => Self::Reclaimable(LruCache::new(capacity)),
            Retention::Pinned => Self::Pinned(HashMap::new()),
        }
    }

    /// Look up an entry, refreshing its recency in the reclaimable tier.
    pub(crate) fn get(&mut self, key: &K) -> Option<V> {
        match self {
            Self::Reclaimable(lru) => lru.get(key).cloned(),
            Self::Pinned(map) => map.get(key).cloned(),
        }
    }

    /// Look up an entry without touching recency.
    pub(crate) fn peek(&self, key: &K) -> Option<&V> {
        match self {
            Self::Reclaimable(lru) => lru.peek(key),
            Self::Pinned(map) => map.get(key),
        }
    }

    /// Insert or replace. Returns the previous value for `key` and, for the
    /// reclaimable tier, whether another entry was dropped to make room.
    pub(crate) fn insert(&mut self, key: K, value: V) -> (Option<V>, bool) {
        match self {
            Self::Reclaimable(lru) => {
                let previous = lru.pop(&key);
                let evicted = lru.push(key, value).is_some();
                (previous, evicted)
            }
            Self::Pinned(map) => (map.insert(key, value), false),
        }
    }

    /// Existing entry for `key`, or a fresh one from `make`.
    ///
    /// Returns the entry, whether it was created, and whether creating it
    /// dropped another entry.
    pub(crate) fn get_or_insert_with(
        &mut self,
        key: K,
        make: impl FnOnce() -> V,
    ) -> (V, bool, bool) {
        if let Some(existing) = self.get(&key) {
            return (existing, false, false);
        }
        let value = make();
        let (_, evicted) = self.insert(key, value.clone());
        (value, true, evicted)
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<V> {
        match self {
            Self::Reclaimable(lru) => lru.pop(key),
            Self::Pinned(map) => map.remove(key),
        }
    }

    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.len();
        match self {
            Self::Reclaimable(lru) => lru.clear(),
            Self::Pinned(map) => map.clear(),
        }
        dropped
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Reclaimable(lru) => lru.len(),
            Self::Pinned(map) => map.len(),
        }
    }

    pub(crate) fn values(&self) -> Vec<V> {
        match self {
            Self::Reclaimable(lru) => lru.iter().map(|(_, v)| v.clone()).collect(),
            Self::Pinned(map) => map.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reclaimable(capacity: usize) -> EntryStore<u32, &'static str> {
        EntryStore::new(Retention::Reclaimable {
            capacity: NonZeroUsize::new(capacity).unwrap(),
        })
    }

    #[test]
    fn test_reclaimable_drops_least_recent() {
        let mut store = reclaimable(2);
        assert_eq!(store.insert(1, "a"), (None, false));
        assert_eq!(store.insert(2, "b"), (None, false));
        // Touch 1 so 2 becomes the eviction candidate.
        assert_eq!(store.get(&1), Some("a"));
        assert_eq!(store.insert(3, "c"), (None, true));
        assert!(store.peek(&2).is_none());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_replace_does_not_count_as_eviction() {
        let mut store = reclaimable(1);
        store.insert(1, "a");
        assert_eq!(store.insert(1, "b"), (Some("a"), false));
        assert_eq!(store.peek(&1), Some(&"b"));
    }

    #[test]
    fn test_pinned_never_drops() {
        let mut store: EntryStore<u32, u32> = EntryStore::new(Retention::Pinned);
        for i in 0..1_000 {
            store.insert(i, i);
        }
        assert_eq!(store.len(), 1_000);
        assert_eq!(store.clear(), 1_000);
    }

    #[test]
    fn test_get_or_insert_with_reports_creation() {
        let mut store = reclaimable(4);
        let (v, created, evicted) = store.get_or_insert_with(1, || "a");
        assert_eq!((v, created, evicted), ("a", true, false));
        let (v, created, _) = store.get_or_insert_with(1, || "z");
        assert_eq!((v, created), ("a", false));
    }
}
