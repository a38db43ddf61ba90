//! Transaction branches.
//!
//! A [`TransactionBranch`] holds one transaction's uncommitted writes to one
//! entity cache and takes part in the outer transaction's two-phase commit.
//! Writes land in per-identity pending changes and branch-local index
//! overlays; `prepare` publishes them into the global identity map and
//! index groups, `commit` tells the touched records publication is final,
//! and `rollback` restores whatever `prepare` published.
//!
//! Lock order inside a branch is state, then changes, then overlays. The
//! changes lock is released before overlay entries are touched on the
//! write path, since a branch read takes an overlay entry first and the
//! changes lock inside it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use keel_core::{
    BranchState, Delta, DeltaKind, Identity, IndexDefinition, KeelError, KeelResult, KeyValue,
    ProtocolError, Record, Transaction, TransactionId, TransactionParticipant, Tuple,
    ValidationError, VersionedRecord,
};

use crate::entity_cache::CacheCore;
use crate::overlay::{IndexOverlay, SharedOverlay};
use crate::provider::BackingProvider;
use crate::registry::RegistryState;

/// The live side of a record: `None` for a tombstone.
fn live(record: Option<&Record>) -> Option<&Record> {
    record.filter(|record| !record.is_deleted())
}

/// Whether a branch moving a holder to `redo` takes it out of `key`.
fn vacates(redo: Option<&Record>, definition: &IndexDefinition, key: &KeyValue) -> bool {
    match redo {
        Some(redo) => redo.is_deleted() || !definition.matches(redo.value(), key),
        None => false,
    }
}

/// One identity's enlisted write within a branch.
#[derive(Debug)]
struct PendingChange {
    /// Record the branch started from; `None` when the branch inserted it.
    undo: Option<Record>,
    /// Record `prepare` publishes; a tombstone for deletes.
    redo: Record,
    /// Whether `redo` is currently published globally.
    applied: bool,
}

#[derive(Debug, Default)]
struct ChangeSet {
    order: Vec<Identity>,
    by_identity: HashMap<Identity, PendingChange>,
    deltas: Vec<Delta>,
    /// Set when a publish stopped part way; only rollback may follow.
    publish_failed: bool,
}

impl ChangeSet {
    /// How this branch sees `record`: its own redo if it changed the identity.
    fn view(&self, record: Record) -> Record {
        match self.by_identity.get(&record.identity()) {
            Some(change) => Arc::clone(&change.redo),
            None => record,
        }
    }

    fn clear(&mut self) {
        self.order.clear();
        self.by_identity.clear();
        self.deltas.clear();
        self.publish_failed = false;
    }
}

/// One transaction's branch of one entity cache.
pub struct TransactionBranch {
    transaction: Arc<Transaction>,
    core: Arc<CacheCore>,
    registry: Weak<RegistryState>,
    state: Mutex<BranchState>,
    changes: Mutex<ChangeSet>,
    overlays: Mutex<HashMap<String, SharedOverlay>>,
}

impl TransactionBranch {
    pub(crate) fn new(
        transaction: Arc<Transaction>,
        core: Arc<CacheCore>,
        registry: Weak<RegistryState>,
    ) -> Self {
        Self {
            transaction,
            core,
            registry,
            state: Mutex::new(BranchState::Started),
            changes: Mutex::new(ChangeSet::default()),
            overlays: Mutex::new(HashMap::new()),
        }
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction.id()
    }

    pub fn state(&self) -> KeelResult<BranchState> {
        Ok(*self.lock_state()?)
    }

    // ========================================================================
    // WRITE PATH
    // ========================================================================

    /// Enlist `delta` and return the record this branch now sees for it.
    ///
    /// Nothing global changes; the branch's overlays are maintained so its
    /// own reads see the write.
    pub fn update(&self, delta: Delta) -> KeelResult<Record> {
        let state = self.lock_state()?;
        self.require(*state, &[BranchState::Started], "update")?;

        let identity = delta.identity();
        let (seen, redo) = {
            let mut changes = self.lock_changes()?;
            if changes.publish_failed {
                return Err(self.illegal(*state, "update"));
            }
            let enlisted = match changes.by_identity.get_mut(&identity) {
                Some(change) => self.restage(change, &delta)?,
                None => {
                    let (undo, redo) = self.stage(&delta)?;
                    let seen = undo.clone();
                    changes.order.push(identity);
                    changes.by_identity.insert(
                        identity,
                        PendingChange {
                            undo,
                            redo: Arc::clone(&redo),
                            applied: false,
                        },
                    );
                    (seen, redo)
                }
            };
            changes.deltas.push(delta);
            enlisted
        };

        for overlay in self.all_overlays()? {
            overlay.transition(live(seen.as_ref()), live(Some(&redo)))?;
        }
        tracing::trace!(
            transaction = %self.transaction_id(),
            %identity,
            version = redo.version(),
            deleted = redo.is_deleted(),
            "Enlisted write"
        );
        Ok(redo)
    }

    /// First write to an identity in this branch.
    fn stage(&self, delta: &Delta) -> KeelResult<(Option<Record>, Record)> {
        match delta.kind() {
            DeltaKind::Insert => {
                if self.core.primary().get(delta.identity())?.is_some() {
                    return Err(ProtocolError::IdentityExists {
                        identity: delta.identity(),
                    }
                    .into());
                }
                Ok((None, VersionedRecord::inserted(delta)))
            }
            DeltaKind::Update | DeltaKind::Delete => {
                let original = delta
                    .original()
                    .cloned()
                    .unwrap_or_else(|| delta.updated().clone());
                let base = self.core.primary().canonicalize(original)?;
                let redo = base.prepare(delta)?;
                Ok((Some(base), redo))
            }
        }
    }

    /// Later write to an identity this branch already changed.
    ///
    /// The new redo replaces the previous one; the record the branch started
    /// from stays the undo.
    fn restage(
        &self,
        change: &mut PendingChange,
        delta: &Delta,
    ) -> KeelResult<(Option<Record>, Record)> {
        if delta.kind() == DeltaKind::Insert {
            return Err(ProtocolError::DuplicateInsert {
                transaction: self.transaction_id(),
                identity: delta.identity(),
            }
            .into());
        }
        if change.redo.is_deleted() {
            return Err(ValidationError::RecordDeleted {
                identity: delta.identity(),
            }
            .into());
        }
        let redo = match &change.undo {
            Some(undo) => {
                undo.rollback()?;
                undo.prepare(delta)?
            }
            None => VersionedRecord::inserted(delta),
        };
        let seen = std::mem::replace(&mut change.redo, Arc::clone(&redo));
        Ok((Some(seen), redo))
    }

    // ========================================================================
    // TWO-PHASE COMMIT
    // ========================================================================

    /// Publish every enlisted change into the global identity map and indexes.
    ///
    /// On failure the branch stays STARTED with some changes published; the
    /// caller must roll back. Until it does, `update`, `prepare` and `commit`
    /// are refused.
    pub fn prepare(&self) -> KeelResult<()> {
        let _monitor = self.core.lock_monitor()?;
        let mut state = self.lock_state()?;
        self.require(*state, &[BranchState::Started], "prepare")?;
        self.publish(*state, "prepare")?;
        self.transition(&mut state, BranchState::Prepared);
        Ok(())
    }

    /// Make publication final. From STARTED this publishes first.
    pub fn commit(&self) -> KeelResult<()> {
        let _monitor = self.core.lock_monitor()?;
        let mut state = self.lock_state()?;
        self.require(
            *state,
            &[BranchState::Started, BranchState::Prepared],
            "commit",
        )?;
        if *state == BranchState::Started {
            self.publish(*state, "commit")?;
        }

        let changes = self.lock_changes()?;
        for change in changes.by_identity.values() {
            if let Some(undo) = &change.undo {
                undo.commit()?;
            }
        }
        drop(changes);
        self.transition(&mut state, BranchState::Committed);
        Ok(())
    }

    /// Restore everything `prepare` published and drop staged versions.
    ///
    /// Safe after a partial prepare: only published changes are undone.
    pub fn rollback(&self) -> KeelResult<()> {
        let _monitor = self.core.lock_monitor()?;
        let mut state = self.lock_state()?;
        self.require(
            *state,
            &[BranchState::Started, BranchState::Prepared],
            "rollback",
        )?;

        let mut changes = self.lock_changes()?;
        let order = changes.order.clone();
        let primary = self.core.primary();
        for identity in order.iter().rev() {
            let Some(change) = changes.by_identity.get_mut(identity) else {
                continue;
            };
            if change.applied {
                primary.replace(*identity, change.undo.clone())?;
                for group in self.core.groups() {
                    group.transition(live(Some(&change.redo)), live(change.undo.as_ref()))?;
                }
                change.applied = false;
            }
            if let Some(undo) = &change.undo {
                undo.rollback()?;
            }
        }
        changes.publish_failed = false;
        drop(changes);
        self.transition(&mut state, BranchState::Aborted);
        Ok(())
    }

    /// Release the branch. Exactly once, after commit or rollback.
    pub fn complete(&self) -> KeelResult<()> {
        let mut state = self.lock_state()?;
        self.require(
            *state,
            &[BranchState::Committed, BranchState::Aborted],
            "complete",
        )?;
        self.lock_changes()?.clear();
        let overlays = std::mem::take(&mut *self.lock_overlays()?);
        for overlay in overlays.values() {
            overlay.clear()?;
        }
        self.transition(&mut state, BranchState::Completed);
        drop(state);

        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.transaction_id())?;
        }
        Ok(())
    }

    /// Publish unpublished changes under the monitor held by the caller.
    fn publish(&self, state: BranchState, operation: &'static str) -> KeelResult<()> {
        let mut changes = self.lock_changes()?;
        if changes.publish_failed {
            return Err(self.illegal(state, operation));
        }
        let result = self.publish_changes(&mut changes);
        if result.is_err() {
            changes.publish_failed = true;
        }
        result
    }

    fn publish_changes(&self, changes: &mut ChangeSet) -> KeelResult<()> {
        let redos: HashMap<Identity, Record> = changes
            .by_identity
            .iter()
            .map(|(identity, change)| (*identity, Arc::clone(&change.redo)))
            .collect();
        let enforce_unique = self.core.config().enforce_unique_on_prepare;
        let primary = self.core.primary();

        let order = changes.order.clone();
        for identity in order {
            let Some(change) = changes.by_identity.get_mut(&identity) else {
                continue;
            };
            if change.applied {
                continue;
            }
            if change.undo.is_none() && primary.get(identity)?.is_some() {
                // Another writer published this identity after it was staged.
                return Err(ProtocolError::IdentityExists { identity }.into());
            }
            let redo = live(Some(&change.redo));
            if let (true, Some(redo)) = (enforce_unique, redo) {
                for group in self.core.groups() {
                    let definition = group.definition();
                    let key = definition.extract(redo.value());
                    group.check_unique(redo, |holder| {
                        vacates(redos.get(&holder), definition, &key)
                    })?;
                }
            }

            let previous = primary.replace(identity, Some(Arc::clone(&change.redo)))?;
            change.applied = true;
            let old = previous.or_else(|| change.undo.clone());
            for group in self.core.groups() {
                group.transition(live(old.as_ref()), redo)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    /// Records matching `key` as this transaction sees them.
    ///
    /// The first read of a key resolves through the global index (populating
    /// it from `provider` on a miss) and maps each record to this branch's
    /// version of it; later reads are served from the overlay.
    pub fn fetch(
        &self,
        index: &IndexDefinition,
        key: &KeyValue,
        provider: &dyn BackingProvider,
    ) -> KeelResult<Vec<Record>> {
        self.require_open("fetch")?;
        let group = self.core.group(index.name())?;
        let overlay = self.overlay(group.definition())?;
        overlay.fetch(key, || {
            let global = group.fetch(key, self.core.primary(), provider)?;
            let changes = self.lock_changes()?;
            let definition = group.definition();
            Ok(global
                .into_iter()
                .map(|record| changes.view(record))
                .filter(|record| !record.is_deleted() && definition.matches(record.value(), key))
                .collect())
        })
    }

    /// Like [`fetch`](Self::fetch) for a unique index: zero or one record.
    pub fn fetch_one(
        &self,
        index: &IndexDefinition,
        key: &KeyValue,
        provider: &dyn BackingProvider,
    ) -> KeelResult<Option<Record>> {
        single(index, key, self.fetch(index, key, provider)?)
    }

    /// The record this branch sees for `raw`'s identity.
    pub fn canonicalize(&self, raw: Tuple) -> KeelResult<Record> {
        self.require_open("cache")?;
        let changes = self.lock_changes()?;
        if let Some(change) = changes.by_identity.get(&raw.identity()) {
            return Ok(Arc::clone(&change.redo));
        }
        drop(changes);
        self.core.primary().canonicalize(raw)
    }

    /// Ordered log of every delta enlisted so far.
    pub fn deltas(&self) -> KeelResult<Vec<Delta>> {
        Ok(self.lock_changes()?.deltas.clone())
    }

    /// Identities with an enlisted change, in first-write order.
    pub fn enlisted(&self) -> KeelResult<Vec<Identity>> {
        Ok(self.lock_changes()?.order.clone())
    }

    /// This branch's overlay for `index`, if it has touched one.
    pub fn overlay_for(&self, index: &str) -> KeelResult<Option<SharedOverlay>> {
        Ok(self.lock_overlays()?.get(index).cloned())
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn overlay(&self, definition: &IndexDefinition) -> KeelResult<SharedOverlay> {
        let mut overlays = self.lock_overlays()?;
        let overlay = overlays
            .entry(definition.name().to_string())
            .or_insert_with(|| Arc::new(IndexOverlay::new(definition.clone())));
        Ok(Arc::clone(overlay))
    }

    fn all_overlays(&self) -> KeelResult<Vec<SharedOverlay>> {
        self.core
            .groups()
            .map(|group| self.overlay(group.definition()))
            .collect()
    }

    fn require(
        &self,
        state: BranchState,
        allowed: &[BranchState],
        operation: &'static str,
    ) -> KeelResult<()> {
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(self.illegal(state, operation))
        }
    }

    fn require_open(&self, operation: &'static str) -> KeelResult<()> {
        let state = self.state()?;
        if state == BranchState::Completed {
            return Err(self.illegal(state, operation));
        }
        Ok(())
    }

    fn illegal(&self, state: BranchState, operation: &'static str) -> KeelError {
        ProtocolError::IllegalState {
            transaction: self.transaction_id(),
            state,
            operation,
        }
        .into()
    }

    fn transition(&self, state: &mut BranchState, next: BranchState) {
        tracing::debug!(
            cache = self.core.name(),
            transaction = %self.transaction_id(),
            from = ?*state,
            to = ?next,
            "Branch state transition"
        );
        *state = next;
    }

    fn lock_state(&self) -> KeelResult<MutexGuard<'_, BranchState>> {
        self.state
            .lock()
            .map_err(|_| KeelError::LockPoisoned("branch state"))
    }

    fn lock_changes(&self) -> KeelResult<MutexGuard<'_, ChangeSet>> {
        self.changes
            .lock()
            .map_err(|_| KeelError::LockPoisoned("branch changes"))
    }

    fn lock_overlays(&self) -> KeelResult<MutexGuard<'_, HashMap<String, SharedOverlay>>> {
        self.overlays
            .lock()
            .map_err(|_| KeelError::LockPoisoned("branch overlays"))
    }
}

impl std::fmt::Debug for TransactionBranch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionBranch")
            .field("transaction", &self.transaction_id())
            .field("state", &self.state.lock().ok().map(|state| *state))
            .finish()
    }
}

impl TransactionParticipant for TransactionBranch {
    fn prepare(&self) -> KeelResult<()> {
        TransactionBranch::prepare(self)
    }

    fn commit(&self) -> KeelResult<()> {
        TransactionBranch::commit(self)
    }

    fn rollback(&self) -> KeelResult<()> {
        TransactionBranch::rollback(self)
    }

    fn complete(&self) -> KeelResult<()> {
        TransactionBranch::complete(self)
    }
}

/// Collapse a unique-index result to at most one record.
pub(crate) fn single(
    index: &IndexDefinition,
    key: &KeyValue,
    mut records: Vec<Record>,
) -> KeelResult<Option<Record>> {
    if records.len() > 1 {
        return Err(keel_core::DataAccessError::Cardinality {
            index: index.name().to_string(),
            key: key.to_string(),
            count: records.len(),
        }
        .into());
    }
    Ok(records.pop())
}
