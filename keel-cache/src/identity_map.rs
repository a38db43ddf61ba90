//! Primary identity map.
//!
//! Maps each [`Identity`] to the single live [`Record`] representing it.
//! Entries are reclaimable: once dropped, the next `canonicalize` wraps the
//! raw tuple again.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use keel_core::{Identity, KeelError, KeelResult, Record, Tuple, VersionedRecord};

use crate::stats::StatsRecorder;
use crate::store::{EntryStore, Retention};

/// Canonical identity to record map for one entity cache.
pub struct PrimaryIdentityMap {
    entries: Mutex<EntryStore<Identity, Record>>,
    stats: Arc<StatsRecorder>,
}

impl PrimaryIdentityMap {
    pub(crate) fn new(capacity: NonZeroUsize, stats: Arc<StatsRecorder>) -> Self {
        Self {
            entries: Mutex::new(EntryStore::new(Retention::Reclaimable { capacity })),
            stats,
        }
    }

    /// The live record for `raw`'s identity, wrapping `raw` if there is none.
    ///
    /// The first wrapper wins; `raw`'s data is ignored when a record exists.
    /// A tombstone is returned as is so callers can tell the record is gone.
    pub fn canonicalize(&self, raw: Tuple) -> KeelResult<Record> {
        let identity = raw.identity();
        let (record, created, evicted) = self
            .lock()?
            .get_or_insert_with(identity, || VersionedRecord::wrap(raw));
        if created {
            tracing::trace!(%identity, "Wrapped new record");
        }
        if evicted {
            self.stats.evicted(1);
        }
        Ok(record)
    }

    /// The live record for `identity`, without creating one.
    pub fn get(&self, identity: Identity) -> KeelResult<Option<Record>> {
        Ok(self.lock()?.get(&identity))
    }

    /// Swap the record for `identity`, returning the one it replaced.
    ///
    /// `None` removes the entry.
    pub fn replace(
        &self,
        identity: Identity,
        record: Option<Record>,
    ) -> KeelResult<Option<Record>> {
        let mut entries = self.lock()?;
        match record {
            Some(record) => {
                let (previous, evicted) = entries.insert(identity, record);
                if evicted {
                    self.stats.evicted(1);
                }
                Ok(previous)
            }
            None => Ok(entries.remove(&identity)),
        }
    }

    /// Drop the entry for `identity`, as memory pressure would.
    pub fn evict(&self, identity: Identity) -> KeelResult<bool> {
        let dropped = self.lock()?.remove(&identity).is_some();
        if dropped {
            self.stats.evicted(1);
        }
        Ok(dropped)
    }

    /// Drop every entry. Returns how many were dropped.
    pub fn clear(&self) -> KeelResult<usize> {
        let dropped = self.lock()?.clear();
        self.stats.evicted(dropped as u64);
        Ok(dropped)
    }

    /// Every record currently held, in no particular order.
    pub fn records(&self) -> KeelResult<Vec<Record>> {
        Ok(self.lock()?.values())
    }

    pub fn len(&self) -> KeelResult<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> KeelResult<bool> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> KeelResult<MutexGuard<'_, EntryStore<Identity, Record>>> {
        self.entries
            .lock()
            .map_err(|_| KeelError::LockPoisoned("primary identity map"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(capacity: usize) -> PrimaryIdentityMap {
        PrimaryIdentityMap::new(
            NonZeroUsize::new(capacity).unwrap(),
            Arc::new(StatsRecorder::default()),
        )
    }

    #[test]
    fn test_canonicalize_returns_same_instance() {
        let map = map(16);
        let id = Identity::new();
        let first = map.canonicalize(Tuple::new(id).with("email", "a@x.com")).unwrap();
        let second = map.canonicalize(Tuple::new(id).with("email", "stale@x.com")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        // First wrapper wins.
        assert_eq!(
            second.value().get("email").and_then(|v| v.as_text()),
            Some("a@x.com")
        );
    }

    #[test]
    fn test_canonicalize_rewraps_after_eviction() {
        let map = map(16);
        let id = Identity::new();
        let first = map.canonicalize(Tuple::new(id)).unwrap();
        assert!(map.evict(id).unwrap());
        let second = map.canonicalize(Tuple::new(id)).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.identity(), id);
    }

    #[test]
    fn test_replace_returns_previous_and_removes() {
        let map = map(16);
        let id = Identity::new();
        let original = map.canonicalize(Tuple::new(id)).unwrap();
        let next = VersionedRecord::wrap(Tuple::new(id).with("n", 1i64));

        let previous = map.replace(id, Some(Arc::clone(&next))).unwrap().unwrap();
        assert!(Arc::ptr_eq(&previous, &original));
        assert!(Arc::ptr_eq(&map.get(id).unwrap().unwrap(), &next));

        let removed = map.replace(id, None).unwrap().unwrap();
        assert!(Arc::ptr_eq(&removed, &next));
        assert!(map.get(id).unwrap().is_none());
    }

    #[test]
    fn test_capacity_bound_reclaims() {
        let map = map(2);
        for _ in 0..5 {
            map.canonicalize(Tuple::new(Identity::new())).unwrap();
        }
        assert_eq!(map.len().unwrap(), 2);
    }
}
