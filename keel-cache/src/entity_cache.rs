//! Entity cache façade.
//!
//! An [`EntityCache`] owns the identity map and index groups for one record
//! type and routes every operation down one of two paths: straight to the
//! global structures, or through the branch of the transaction active on
//! the calling context.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use keel_core::{
    CacheConfig, ConfigError, Delta, Identity, IndexDefinition, KeelError, KeelResult, KeyValue,
    ProtocolError, Record, ThreadTransactionContext, TransactionContext, Tuple,
};

use crate::branch::{single, TransactionBranch};
use crate::identity_map::PrimaryIdentityMap;
use crate::index::IndexGroup;
use crate::provider::BackingProvider;
use crate::registry::BranchRegistry;
use crate::stats::{CacheStats, StatsRecorder};

// ============================================================================
// SHARED CORE
// ============================================================================

/// Globally visible state shared by the façade and every branch.
pub(crate) struct CacheCore {
    name: String,
    config: CacheConfig,
    primary: PrimaryIdentityMap,
    indexes: BTreeMap<String, IndexGroup>,
    /// Serializes every change to globally visible state.
    monitor: Mutex<()>,
    stats: Arc<StatsRecorder>,
}

impl CacheCore {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn primary(&self) -> &PrimaryIdentityMap {
        &self.primary
    }

    pub(crate) fn groups(&self) -> impl Iterator<Item = &IndexGroup> {
        self.indexes.values()
    }

    pub(crate) fn group(&self, name: &str) -> KeelResult<&IndexGroup> {
        self.indexes.get(name).ok_or_else(|| {
            ConfigError::UnknownIndex {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub(crate) fn lock_monitor(&self) -> KeelResult<MutexGuard<'_, ()>> {
        self.monitor
            .lock()
            .map_err(|_| KeelError::LockPoisoned("cache monitor"))
    }
}

fn capacity(field: &str, value: usize) -> KeelResult<NonZeroUsize> {
    NonZeroUsize::new(value).ok_or_else(|| {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: format!("{} must be greater than 0", field),
        }
        .into()
    })
}

// ============================================================================
// READ PATH
// ============================================================================

/// Which structures one operation reads through, resolved once up front.
enum ReadPath<'a> {
    Direct(&'a CacheCore),
    Branched(Arc<TransactionBranch>),
}

// ============================================================================
// CONSISTENCY AUDIT
// ============================================================================

/// What is wrong with one indexed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// A tombstone is still filed in an index.
    Tombstone,
    /// The record is filed under a key it does not extract to.
    Misfiled,
    /// The identity map holds a different record for the identity.
    Stale,
    /// A populated entry lacks a live record that extracts to its key.
    Missing,
}

/// One divergence between an index group and the identity map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyViolation {
    pub index: String,
    pub key: KeyValue,
    pub identity: Identity,
    pub kind: ViolationKind,
}

// ============================================================================
// ENTITY CACHE
// ============================================================================

/// Transactional cache of one record type.
pub struct EntityCache {
    core: Arc<CacheCore>,
    registry: BranchRegistry,
}

impl EntityCache {
    /// Create a cache with one index group per definition.
    pub fn new(
        name: impl Into<String>,
        indexes: impl IntoIterator<Item = IndexDefinition>,
        config: CacheConfig,
        context: Arc<dyn TransactionContext>,
    ) -> KeelResult<Self> {
        config.validate()?;
        let stats = Arc::new(StatsRecorder::default());
        let index_capacity = capacity("index_entry_capacity", config.index_entry_capacity)?;

        let mut groups = BTreeMap::new();
        for definition in indexes {
            let name = definition.name().to_string();
            if groups.contains_key(&name) {
                return Err(ConfigError::DuplicateIndex { name }.into());
            }
            groups.insert(
                name,
                IndexGroup::new(definition, index_capacity, Arc::clone(&stats)),
            );
        }

        let core = Arc::new(CacheCore {
            name: name.into(),
            primary: PrimaryIdentityMap::new(
                capacity("identity_capacity", config.identity_capacity)?,
                Arc::clone(&stats),
            ),
            indexes: groups,
            monitor: Mutex::new(()),
            stats,
            config,
        });
        let registry = BranchRegistry::new(
            Arc::clone(&core),
            context,
            capacity("completed_history", core.config.completed_history)?,
        );
        tracing::info!(
            cache = core.name(),
            indexes = core.indexes.len(),
            identity_capacity = core.config.identity_capacity,
            "Entity cache created"
        );
        Ok(Self { core, registry })
    }

    /// Default configuration, transactions resolved per thread.
    pub fn with_defaults(
        name: impl Into<String>,
        indexes: impl IntoIterator<Item = IndexDefinition>,
    ) -> KeelResult<Self> {
        Self::new(
            name,
            indexes,
            CacheConfig::default(),
            Arc::new(ThreadTransactionContext::new()),
        )
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn config(&self) -> &CacheConfig {
        self.core.config()
    }

    pub fn registry(&self) -> &BranchRegistry {
        &self.registry
    }

    pub fn identity_map(&self) -> &PrimaryIdentityMap {
        self.core.primary()
    }

    pub fn index_group(&self, name: &str) -> KeelResult<&IndexGroup> {
        self.core.group(name)
    }

    pub fn index_definitions(&self) -> impl Iterator<Item = &IndexDefinition> {
        self.core.groups().map(IndexGroup::definition)
    }

    fn read_path(&self) -> KeelResult<ReadPath<'_>> {
        Ok(match self.registry.current_branch()? {
            Some(branch) => ReadPath::Branched(branch),
            None => ReadPath::Direct(&self.core),
        })
    }

    /// The canonical record for `raw`'s identity.
    pub fn cache(&self, raw: Tuple) -> KeelResult<Record> {
        match self.read_path()? {
            ReadPath::Branched(branch) => branch.canonicalize(raw),
            ReadPath::Direct(core) => {
                let _monitor = core.lock_monitor()?;
                core.primary().canonicalize(raw)
            }
        }
    }

    /// Records matching `key` on `index`, as the caller's transaction sees them.
    pub fn fetch(
        &self,
        index: &IndexDefinition,
        key: &KeyValue,
        provider: &dyn BackingProvider,
    ) -> KeelResult<Vec<Record>> {
        match self.read_path()? {
            ReadPath::Branched(branch) => branch.fetch(index, key, provider),
            ReadPath::Direct(core) => {
                core.group(index.name())?
                    .fetch(key, core.primary(), provider)
            }
        }
    }

    /// Zero or one record matching `key`; more is a cardinality violation.
    pub fn fetch_one(
        &self,
        index: &IndexDefinition,
        key: &KeyValue,
        provider: &dyn BackingProvider,
    ) -> KeelResult<Option<Record>> {
        single(index, key, self.fetch(index, key, provider)?)
    }

    /// Enlist `delta` in the active transaction's branch.
    pub fn write(&self, delta: Delta) -> KeelResult<Record> {
        match self.read_path()? {
            ReadPath::Branched(branch) => branch.update(delta),
            ReadPath::Direct(_) => {
                Err(ProtocolError::TransactionRequired { operation: "write" }.into())
            }
        }
    }

    // ========================================================================
    // RECLAMATION
    // ========================================================================

    /// Drop every reclaimable entry. Returns how many were dropped.
    pub fn reclaim(&self) -> KeelResult<usize> {
        let _monitor = self.core.lock_monitor()?;
        let mut dropped = self.core.primary().clear()?;
        for group in self.core.groups() {
            dropped += group.clear()?;
        }
        tracing::debug!(cache = self.name(), dropped, "Reclaimed cache entries");
        Ok(dropped)
    }

    pub fn evict_identity(&self, identity: Identity) -> KeelResult<bool> {
        self.core.primary().evict(identity)
    }

    pub fn evict_index_entry(&self, index: &str, key: &KeyValue) -> KeelResult<bool> {
        self.core.group(index)?.evict(key)
    }

    pub fn stats(&self) -> KeelResult<CacheStats> {
        let identities = self.core.primary().len()? as u64;
        let mut entries = 0u64;
        for group in self.core.groups() {
            entries += group.len()? as u64;
        }
        Ok(self.core.stats.snapshot(identities, entries))
    }

    /// Compare every index group against the identity map.
    ///
    /// Identities the map has reclaimed are not reported.
    pub fn verify_consistency(&self) -> KeelResult<Vec<ConsistencyViolation>> {
        let _monitor = self.core.lock_monitor()?;
        let primary = self.core.primary();
        let live: Vec<Record> = primary
            .records()?
            .into_iter()
            .filter(|record| !record.is_deleted())
            .collect();

        let mut violations = Vec::new();
        for group in self.core.groups() {
            let definition = group.definition();
            for entry in group.entries()? {
                let mut report = |identity: Identity, kind: ViolationKind| {
                    violations.push(ConsistencyViolation {
                        index: definition.name().to_string(),
                        key: entry.key.clone(),
                        identity,
                        kind,
                    });
                };
                for record in &entry.records {
                    let identity = record.identity();
                    if record.is_deleted() {
                        report(identity, ViolationKind::Tombstone);
                    } else if !definition.matches(record.value(), &entry.key) {
                        report(identity, ViolationKind::Misfiled);
                    }
                    if let Some(current) = primary.get(identity)? {
                        if !Arc::ptr_eq(&current, record) {
                            report(identity, ViolationKind::Stale);
                        }
                    }
                }
                if entry.populated {
                    for record in &live {
                        let filed = entry
                            .records
                            .iter()
                            .any(|member| member.identity() == record.identity());
                        if !filed && definition.matches(record.value(), &entry.key) {
                            report(record.identity(), ViolationKind::Missing);
                        }
                    }
                }
            }
        }
        Ok(violations)
    }
}

impl std::fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("name", &self.core.name())
            .field("indexes", &self.core.indexes.keys().collect::<Vec<_>>())
            .finish()
    }
}
