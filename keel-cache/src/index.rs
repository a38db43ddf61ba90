//! Global secondary indexes.
//!
//! An [`IndexGroup`] maps key values to [`IndexEntry`] instances, each the
//! set of committed-visible records under one key. Entries are populated
//! once from a backing provider and then maintained incrementally by
//! `inserted`/`deleted`/`updated` as branches publish or retract changes.
//!
//! Each entry carries its own lock, so misses on different keys populate in
//! parallel while racing misses on the same key serialize and the loser
//! reads the winner's result.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use keel_core::{
    DataAccessError, Identity, IndexDefinition, KeelError, KeelResult, KeyValue, Record,
};

use crate::identity_map::PrimaryIdentityMap;
use crate::provider::{read_all, BackingProvider};
use crate::stats::StatsRecorder;
use crate::store::{EntryStore, Retention};

/// Records under one key, plus whether the backing provider has been read.
///
/// Before population `members` only holds records published by maintenance
/// that the backing provider cannot know about yet.
#[derive(Debug, Default)]
pub(crate) struct Membership {
    populated: bool,
    members: BTreeMap<Identity, Record>,
}

impl Membership {
    pub(crate) fn is_populated(&self) -> bool {
        self.populated
    }

    /// Defensive copy; callers never observe later mutation.
    pub(crate) fn snapshot(&self) -> Vec<Record> {
        self.members.values().cloned().collect()
    }

    pub(crate) fn members(&self) -> impl Iterator<Item = &Record> {
        self.members.values()
    }

    pub(crate) fn put(&mut self, record: Record) {
        self.members.insert(record.identity(), record);
    }

    pub(crate) fn remove(&mut self, identity: Identity) -> Option<Record> {
        self.members.remove(&identity)
    }

    /// Mark populated, merging `records` under anything maintenance already put.
    pub(crate) fn install(&mut self, records: Vec<Record>) {
        for record in records {
            self.members.entry(record.identity()).or_insert(record);
        }
        self.populated = true;
    }
}

/// Globally visible set of records matching one key of one index.
#[derive(Debug)]
pub struct IndexEntry {
    key: KeyValue,
    state: Mutex<Membership>,
}

impl IndexEntry {
    fn new(key: KeyValue) -> Self {
        Self {
            key,
            state: Mutex::new(Membership::default()),
        }
    }

    pub fn key(&self) -> &KeyValue {
        &self.key
    }

    pub(crate) fn lock(&self) -> KeelResult<MutexGuard<'_, Membership>> {
        self.state
            .lock()
            .map_err(|_| KeelError::LockPoisoned("index entry"))
    }
}

/// Populated contents of one entry, as seen by a consistency audit.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub key: KeyValue,
    pub populated: bool,
    pub records: Vec<Record>,
}

/// Key to entry table shared by global index groups and branch overlays.
///
/// The retention tier is the only difference between the two.
pub(crate) struct EntryTable {
    definition: IndexDefinition,
    entries: Mutex<EntryStore<KeyValue, Arc<IndexEntry>>>,
    stats: Option<Arc<StatsRecorder>>,
}

impl EntryTable {
    pub(crate) fn new(
        definition: IndexDefinition,
        retention: Retention,
        stats: Option<Arc<StatsRecorder>>,
    ) -> Self {
        Self {
            definition,
            entries: Mutex::new(EntryStore::new(retention)),
            stats,
        }
    }

    pub(crate) fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    /// Entry for `key`, created unpopulated when absent.
    pub(crate) fn entry(&self, key: &KeyValue) -> KeelResult<Arc<IndexEntry>> {
        let (entry, _, evicted) = self
            .lock()?
            .get_or_insert_with(key.clone(), || Arc::new(IndexEntry::new(key.clone())));
        if evicted {
            self.record_evictions(1);
        }
        Ok(entry)
    }

    pub(crate) fn existing(&self, key: &KeyValue) -> KeelResult<Option<Arc<IndexEntry>>> {
        Ok(self.lock()?.peek(key).cloned())
    }

    /// Add `record` under its key.
    pub(crate) fn inserted(&self, record: &Record) -> KeelResult<()> {
        let key = self.definition.extract(record.value());
        self.entry(&key)?.lock()?.put(Arc::clone(record));
        Ok(())
    }

    /// Remove `record` from the key it was filed under.
    pub(crate) fn deleted(&self, record: &Record) -> KeelResult<()> {
        let key = self.definition.extract(record.value());
        if let Some(entry) = self.existing(&key)? {
            entry.lock()?.remove(record.identity());
        }
        Ok(())
    }

    /// Move `old` to `new`, in place when the key did not change.
    pub(crate) fn updated(&self, old: &Record, new: &Record) -> KeelResult<()> {
        let old_key = self.definition.extract(old.value());
        let new_key = self.definition.extract(new.value());
        if old_key == new_key {
            self.entry(&new_key)?.lock()?.put(Arc::clone(new));
            Ok(())
        } else {
            self.deleted(old)?;
            self.inserted(new)
        }
    }

    /// Apply the transition `old -> new` of one identity's live record.
    ///
    /// `None` on either side means the identity is absent or a tombstone
    /// there, so this covers insert, delete, update, and their inverses.
    pub(crate) fn transition(&self, old: Option<&Record>, new: Option<&Record>) -> KeelResult<()> {
        match (old, new) {
            (None, Some(new)) => self.inserted(new),
            (Some(old), None) => self.deleted(old),
            (Some(old), Some(new)) => self.updated(old, new),
            (None, None) => Ok(()),
        }
    }

    pub(crate) fn evict(&self, key: &KeyValue) -> KeelResult<bool> {
        let dropped = self.lock()?.remove(key).is_some();
        if dropped {
            self.record_evictions(1);
        }
        Ok(dropped)
    }

    pub(crate) fn clear(&self) -> KeelResult<usize> {
        let dropped = self.lock()?.clear();
        self.record_evictions(dropped as u64);
        Ok(dropped)
    }

    pub(crate) fn len(&self) -> KeelResult<usize> {
        Ok(self.lock()?.len())
    }

    pub(crate) fn entries(&self) -> KeelResult<Vec<EntrySnapshot>> {
        let entries = self.lock()?.values();
        entries
            .into_iter()
            .map(|entry| {
                let state = entry.lock()?;
                Ok(EntrySnapshot {
                    key: entry.key().clone(),
                    populated: state.is_populated(),
                    records: state.snapshot(),
                })
            })
            .collect()
    }

    fn record_evictions(&self, count: u64) {
        if let Some(stats) = &self.stats {
            stats.evicted(count);
        }
    }

    fn lock(&self) -> KeelResult<MutexGuard<'_, EntryStore<KeyValue, Arc<IndexEntry>>>> {
        self.entries
            .lock()
            .map_err(|_| KeelError::LockPoisoned("index entry table"))
    }
}

/// All globally visible entries of one index definition.
pub struct IndexGroup {
    table: EntryTable,
    stats: Arc<StatsRecorder>,
}

impl IndexGroup {
    pub(crate) fn new(
        definition: IndexDefinition,
        capacity: NonZeroUsize,
        stats: Arc<StatsRecorder>,
    ) -> Self {
        Self {
            table: EntryTable::new(
                definition,
                Retention::Reclaimable { capacity },
                Some(Arc::clone(&stats)),
            ),
            stats,
        }
    }

    pub fn definition(&self) -> &IndexDefinition {
        self.table.definition()
    }

    /// Globally visible records for `key`, populating from `provider` on miss.
    pub fn fetch(
        &self,
        key: &KeyValue,
        primary: &PrimaryIdentityMap,
        provider: &dyn BackingProvider,
    ) -> KeelResult<Vec<Record>> {
        let entry = self.table.entry(key)?;
        let mut state = entry.lock()?;
        if state.is_populated() {
            self.stats.hit();
            return Ok(state.snapshot());
        }

        self.stats.miss();
        self.stats.backing_fetch();
        tracing::debug!(index = self.definition().name(), key = %key, "Index entry miss");
        let records = populate(self.definition(), key, primary, provider)?;
        state.install(records);
        Ok(state.snapshot())
    }

    // Maintenance primitives. Publication and rollback drive these under the
    // cache monitor; readers never call them.

    /// File `record` under its key, creating the entry if needed.
    pub fn inserted(&self, record: &Record) -> KeelResult<()> {
        self.table.inserted(record)
    }

    /// Unfile `record` from the key it extracts to.
    pub fn deleted(&self, record: &Record) -> KeelResult<()> {
        self.table.deleted(record)
    }

    /// Refile `old` as `new`, migrating between keys when they differ.
    pub fn updated(&self, old: &Record, new: &Record) -> KeelResult<()> {
        self.table.updated(old, new)
    }

    pub(crate) fn transition(&self, old: Option<&Record>, new: Option<&Record>) -> KeelResult<()> {
        self.table.transition(old, new)
    }

    /// Reject publishing `record` into a unique key another live record holds.
    ///
    /// Holders for which `vacating` returns true leave the key in the same
    /// publication and do not count.
    pub(crate) fn check_unique(
        &self,
        record: &Record,
        vacating: impl Fn(Identity) -> bool,
    ) -> KeelResult<()> {
        let definition = self.definition();
        if !definition.is_unique() {
            return Ok(());
        }
        let key = definition.extract(record.value());
        let Some(entry) = self.table.existing(&key)? else {
            return Ok(());
        };
        let state = entry.lock()?;
        let conflict = state
            .members()
            .find(|holder| holder.identity() != record.identity() && !vacating(holder.identity()));
        match conflict {
            Some(holder) => Err(DataAccessError::UniqueViolation {
                index: definition.name().to_string(),
                key: key.to_string(),
                existing: holder.identity(),
                incoming: record.identity(),
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Drop the entry for `key`, as memory pressure would.
    pub fn evict(&self, key: &KeyValue) -> KeelResult<bool> {
        self.table.evict(key)
    }

    pub fn clear(&self) -> KeelResult<usize> {
        self.table.clear()
    }

    pub fn len(&self) -> KeelResult<usize> {
        self.table.len()
    }

    pub fn is_empty(&self) -> KeelResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Copy of every entry currently held.
    pub fn entries(&self) -> KeelResult<Vec<EntrySnapshot>> {
        self.table.entries()
    }
}

/// Read `key` from the backing provider and canonicalize the rows.
///
/// Rows whose live record is a tombstone, or whose live version has moved
/// to another key, are dropped: the identity map is newer than the backing
/// store for anything published but not yet durable.
pub(crate) fn populate(
    definition: &IndexDefinition,
    key: &KeyValue,
    primary: &PrimaryIdentityMap,
    provider: &dyn BackingProvider,
) -> KeelResult<Vec<Record>> {
    let rows = read_all(provider, definition, key)?;

    let mut distinct = BTreeMap::new();
    for row in rows {
        distinct.insert(row.identity(), row);
    }
    if definition.is_unique() && distinct.len() > 1 {
        return Err(DataAccessError::Cardinality {
            index: definition.name().to_string(),
            key: key.to_string(),
            count: distinct.len(),
        }
        .into());
    }

    let mut records = Vec::with_capacity(distinct.len());
    for row in distinct.into_values() {
        let record = primary.canonicalize(row)?;
        if !record.is_deleted() && definition.matches(record.value(), key) {
            records.push(record);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{FailurePoint, MemoryBackingProvider};
    use keel_core::{Tuple, VersionedRecord};

    struct Fixture {
        stats: Arc<StatsRecorder>,
        primary: PrimaryIdentityMap,
        group: IndexGroup,
    }

    fn fixture(definition: IndexDefinition) -> Fixture {
        let stats = Arc::new(StatsRecorder::default());
        Fixture {
            primary: PrimaryIdentityMap::new(NonZeroUsize::new(64).unwrap(), Arc::clone(&stats)),
            group: IndexGroup::new(definition, NonZeroUsize::new(64).unwrap(), Arc::clone(&stats)),
            stats,
        }
    }

    fn row(region: &str) -> Tuple {
        Tuple::new(Identity::new()).with("region", region)
    }

    #[test]
    fn test_fetch_populates_once() {
        let fx = fixture(IndexDefinition::new("region", ["region"]));
        let provider = MemoryBackingProvider::with_rows([row("eu"), row("eu"), row("us")]);
        let key = KeyValue::single("eu");

        let first = fx.group.fetch(&key, &fx.primary, &provider).unwrap();
        let second = fx.group.fetch(&key, &fx.primary, &provider).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(provider.fetch_count(), 1);
        assert!(first.iter().zip(&second).all(|(a, b)| Arc::ptr_eq(a, b)));

        let stats = fx.stats.snapshot(0, 0);
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_snapshot_is_defensive_copy() {
        let fx = fixture(IndexDefinition::new("region", ["region"]));
        let provider = MemoryBackingProvider::with_rows([row("eu")]);
        let key = KeyValue::single("eu");
        let snapshot = fx.group.fetch(&key, &fx.primary, &provider).unwrap();

        fx.group.inserted(&VersionedRecord::wrap(row("eu"))).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(fx.group.fetch(&key, &fx.primary, &provider).unwrap().len(), 2);
    }

    #[test]
    fn test_updated_migrates_between_keys() {
        let fx = fixture(IndexDefinition::new("region", ["region"]));
        let original = row("eu");
        let provider = MemoryBackingProvider::with_rows([original.clone()]);
        let eu = KeyValue::single("eu");
        let us = KeyValue::single("us");

        let old = fx.group.fetch(&eu, &fx.primary, &provider).unwrap().remove(0);
        assert!(fx.group.fetch(&us, &fx.primary, &provider).unwrap().is_empty());

        let moved = VersionedRecord::wrap(Tuple::new(old.identity()).with("region", "us"));
        fx.group.updated(&old, &moved).unwrap();

        assert!(fx.group.fetch(&eu, &fx.primary, &provider).unwrap().is_empty());
        let in_us = fx.group.fetch(&us, &fx.primary, &provider).unwrap();
        assert_eq!(in_us.len(), 1);
        assert!(Arc::ptr_eq(&in_us[0], &moved));
    }

    #[test]
    fn test_updated_same_key_replaces_in_place() {
        let fx = fixture(IndexDefinition::new("region", ["region"]));
        let provider = MemoryBackingProvider::with_rows([row("eu")]);
        let eu = KeyValue::single("eu");
        let old = fx.group.fetch(&eu, &fx.primary, &provider).unwrap().remove(0);

        let renamed = VersionedRecord::wrap(
            Tuple::new(old.identity()).with("region", "eu").with("name", "Ada"),
        );
        fx.group.updated(&old, &renamed).unwrap();
        let members = fx.group.fetch(&eu, &fx.primary, &provider).unwrap();
        assert_eq!(members.len(), 1);
        assert!(Arc::ptr_eq(&members[0], &renamed));
    }

    #[test]
    fn test_inserted_before_population_is_merged() {
        let fx = fixture(IndexDefinition::new("region", ["region"]));
        let provider = MemoryBackingProvider::with_rows([row("eu")]);
        let published = VersionedRecord::wrap(row("eu"));
        fx.group.inserted(&published).unwrap();

        let members = fx.group.fetch(&KeyValue::single("eu"), &fx.primary, &provider).unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().any(|r| Arc::ptr_eq(r, &published)));
    }

    #[test]
    fn test_population_skips_moved_and_deleted_rows() {
        let fx = fixture(IndexDefinition::new("region", ["region"]));
        let moved = row("eu");
        let deleted = row("eu");
        let provider = MemoryBackingProvider::with_rows([moved.clone(), deleted.clone(), row("eu")]);

        // The identity map is ahead of the backing store for both rows.
        fx.primary
            .replace(
                moved.identity(),
                Some(VersionedRecord::wrap(Tuple::new(moved.identity()).with("region", "us"))),
            )
            .unwrap();
        let stale = fx.primary.canonicalize(deleted.clone()).unwrap();
        let tombstone = stale.prepare(&keel_core::Delta::delete(deleted.clone())).unwrap();
        fx.primary.replace(deleted.identity(), Some(tombstone)).unwrap();

        let members = fx.group.fetch(&KeyValue::single("eu"), &fx.primary, &provider).unwrap();
        assert_eq!(members.len(), 1);
    }

    #[test]
    fn test_unique_population_cardinality_violation() {
        let fx = fixture(IndexDefinition::unique("email", ["email"]));
        let provider = MemoryBackingProvider::with_rows([
            Tuple::new(Identity::new()).with("email", "dup@x.com"),
            Tuple::new(Identity::new()).with("email", "dup@x.com"),
        ]);
        let key = KeyValue::single("dup@x.com");
        let result = fx.group.fetch(&key, &fx.primary, &provider);
        assert!(matches!(
            result,
            Err(KeelError::DataAccess(DataAccessError::Cardinality { count: 2, .. }))
        ));
        // Nothing installed: the next fetch goes back to the provider.
        let _ = fx.group.fetch(&key, &fx.primary, &provider);
        assert_eq!(provider.fetch_count(), 2);
    }

    #[test]
    fn test_failed_population_leaves_entry_unpopulated() {
        let fx = fixture(IndexDefinition::new("region", ["region"]));
        let provider = MemoryBackingProvider::with_rows([row("eu"), row("eu")]);
        let key = KeyValue::single("eu");
        provider.fail_next(FailurePoint::AfterRows(1), "connection dropped").unwrap();

        assert!(fx.group.fetch(&key, &fx.primary, &provider).is_err());
        let entries = fx.group.entries().unwrap();
        assert!(entries.iter().all(|e| !e.populated && e.records.is_empty()));

        assert_eq!(fx.group.fetch(&key, &fx.primary, &provider).unwrap().len(), 2);
    }

    #[test]
    fn test_check_unique_ignores_vacating_holders() {
        let fx = fixture(IndexDefinition::unique("email", ["email"]));
        let holder = Tuple::new(Identity::new()).with("email", "a@x.com");
        let provider = MemoryBackingProvider::with_rows([holder.clone()]);
        fx.group
            .fetch(&KeyValue::single("a@x.com"), &fx.primary, &provider)
            .unwrap();

        let incoming =
            VersionedRecord::wrap(Tuple::new(Identity::new()).with("email", "a@x.com"));
        assert!(matches!(
            fx.group.check_unique(&incoming, |_| false),
            Err(KeelError::DataAccess(DataAccessError::UniqueViolation { .. }))
        ));
        assert!(fx
            .group
            .check_unique(&incoming, |id| id == holder.identity())
            .is_ok());
    }
}
