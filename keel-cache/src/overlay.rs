//! Branch-local index overlays.
//!
//! An [`IndexOverlay`] shadows one global index for one transaction branch
//! so the branch reads its own uncommitted writes. Its entries live in the
//! pinned tier: they hold state that exists nowhere else, and dropping one
//! would silently hide a write from the transaction that made it.

use std::sync::Arc;

use keel_core::{IndexDefinition, KeelResult, KeyValue, Record};

use crate::index::{EntrySnapshot, EntryTable, IndexEntry};
use crate::store::Retention;

/// Transaction-local counterpart of [`IndexEntry`].
pub type OverlayEntry = IndexEntry;

/// One transaction's view of one index.
pub struct IndexOverlay {
    table: EntryTable,
}

impl IndexOverlay {
    pub(crate) fn new(definition: IndexDefinition) -> Self {
        Self {
            table: EntryTable::new(definition, Retention::Pinned, None),
        }
    }

    pub fn definition(&self) -> &IndexDefinition {
        self.table.definition()
    }

    /// Branch-visible records for `key`.
    ///
    /// On first access `resolve` supplies the records the branch sees from
    /// the global side; they are merged under anything this branch already
    /// filed for the key and the entry is never re-resolved.
    pub(crate) fn fetch(
        &self,
        key: &KeyValue,
        resolve: impl FnOnce() -> KeelResult<Vec<Record>>,
    ) -> KeelResult<Vec<Record>> {
        let entry = self.table.entry(key)?;
        let mut state = entry.lock()?;
        if !state.is_populated() {
            state.install(resolve()?);
        }
        Ok(state.snapshot())
    }

    /// Apply one identity's branch-visible transition `old -> new`.
    pub(crate) fn transition(&self, old: Option<&Record>, new: Option<&Record>) -> KeelResult<()> {
        self.table.transition(old, new)
    }

    pub fn len(&self) -> KeelResult<usize> {
        self.table.len()
    }

    pub fn is_empty(&self) -> KeelResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn entries(&self) -> KeelResult<Vec<EntrySnapshot>> {
        self.table.entries()
    }

    pub(crate) fn clear(&self) -> KeelResult<usize> {
        self.table.clear()
    }
}

impl std::fmt::Debug for IndexOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexOverlay")
            .field("index", &self.definition().name())
            .finish()
    }
}

/// Overlay handle shared between a branch and its readers.
pub type SharedOverlay = Arc<IndexOverlay>;
