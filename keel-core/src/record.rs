//! Versioned record: the cache's unit of storage
//!
//! Every version of a logical record is its own [`VersionedRecord`]. A
//! record may stage exactly one pending successor produced by a delta;
//! `commit` makes the succession permanent and `rollback` forgets it.

use crate::{Delta, Identity, KeelError, KeelResult, ProtocolError, Tuple, ValidationError};
use std::sync::{Arc, Mutex};

/// Shared handle to one record version.
pub type Record = Arc<VersionedRecord>;

#[derive(Debug, Default)]
struct VersionState {
    pending: Option<Record>,
    superseded: bool,
}

/// One version of a logical record.
#[derive(Debug)]
pub struct VersionedRecord {
    identity: Identity,
    version: u64,
    value: Tuple,
    deleted: bool,
    state: Mutex<VersionState>,
}

impl VersionedRecord {
    /// Wrap a raw tuple as a first-seen record.
    pub fn wrap(value: Tuple) -> Record {
        Arc::new(Self {
            identity: value.identity(),
            version: 0,
            value,
            deleted: false,
            state: Mutex::new(VersionState::default()),
        })
    }

    /// Record for a tuple that does not exist yet outside the inserting transaction.
    pub fn inserted(delta: &Delta) -> Record {
        Arc::new(Self {
            identity: delta.identity(),
            version: 0,
            value: delta.updated().clone(),
            deleted: delta.is_deleted(),
            state: Mutex::new(VersionState::default()),
        })
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn value(&self) -> &Tuple {
        &self.value
    }

    /// Tombstone versions mark a deletion published ahead of the backing store.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Compute and stage the successor version for `delta`.
    ///
    /// Does not touch any globally visible structure; the caller publishes
    /// the returned record when it is ready to.
    pub fn prepare(&self, delta: &Delta) -> KeelResult<Record> {
        if delta.identity() != self.identity {
            return Err(ValidationError::IdentityMismatch {
                expected: self.identity,
                got: delta.identity(),
            }
            .into());
        }
        if self.deleted {
            return Err(ValidationError::RecordDeleted {
                identity: self.identity,
            }
            .into());
        }
        let mut state = self.lock_state()?;
        if state.pending.is_some() {
            return Err(ProtocolError::PendingVersionExists {
                identity: self.identity,
                version: self.version,
            }
            .into());
        }
        let next = Arc::new(Self {
            identity: self.identity,
            version: self.version + 1,
            value: delta.updated().clone(),
            deleted: delta.is_deleted(),
            state: Mutex::new(VersionState::default()),
        });
        state.pending = Some(Arc::clone(&next));
        Ok(next)
    }

    pub fn pending_version(&self) -> KeelResult<Option<Record>> {
        Ok(self.lock_state()?.pending.clone())
    }

    /// True once a successor version has been committed over this one.
    pub fn is_superseded(&self) -> KeelResult<bool> {
        Ok(self.lock_state()?.superseded)
    }

    /// Make the staged succession permanent and drop the link to it.
    pub fn commit(&self) -> KeelResult<()> {
        let mut state = self.lock_state()?;
        if state.pending.take().is_some() {
            state.superseded = true;
        }
        Ok(())
    }

    /// Forget the staged successor; this version stays current.
    pub fn rollback(&self) -> KeelResult<()> {
        self.lock_state()?.pending = None;
        Ok(())
    }

    fn lock_state(&self) -> KeelResult<std::sync::MutexGuard<'_, VersionState>> {
        self.state
            .lock()
            .map_err(|_| KeelError::LockPoisoned("record version state"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer(email: &str) -> Tuple {
        Tuple::new(Identity::new()).with("email", email)
    }

    #[test]
    fn test_prepare_stages_successor() {
        let original = customer("a@x.com");
        let record = VersionedRecord::wrap(original.clone());
        let updated = Tuple::new(record.identity()).with("email", "b@x.com");
        let delta = Delta::update(original, updated.clone()).unwrap();

        let next = record.prepare(&delta).unwrap();
        assert_eq!(next.version(), 1);
        assert_eq!(next.value(), &updated);
        let pending = record.pending_version().unwrap().unwrap();
        assert!(Arc::ptr_eq(&pending, &next));
    }

    #[test]
    fn test_second_prepare_is_rejected() {
        let original = customer("a@x.com");
        let record = VersionedRecord::wrap(original.clone());
        let delta = Delta::delete(original);
        record.prepare(&delta).unwrap();
        let result = record.prepare(&delta);
        assert!(matches!(
            result,
            Err(KeelError::Protocol(ProtocolError::PendingVersionExists { .. }))
        ));
    }

    #[test]
    fn test_commit_supersedes_and_rollback_clears() {
        let original = customer("a@x.com");
        let record = VersionedRecord::wrap(original.clone());
        let delta = Delta::delete(original);

        let tombstone = record.prepare(&delta).unwrap();
        assert!(tombstone.is_deleted());
        record.rollback().unwrap();
        assert!(record.pending_version().unwrap().is_none());
        assert!(!record.is_superseded().unwrap());

        record.prepare(&delta).unwrap();
        record.commit().unwrap();
        assert!(record.pending_version().unwrap().is_none());
        assert!(record.is_superseded().unwrap());
    }

    #[test]
    fn test_prepare_on_tombstone_is_rejected() {
        let original = customer("a@x.com");
        let record = VersionedRecord::wrap(original.clone());
        let tombstone = record.prepare(&Delta::delete(original.clone())).unwrap();
        let result = tombstone.prepare(&Delta::delete(original));
        assert!(matches!(
            result,
            Err(KeelError::Validation(ValidationError::RecordDeleted { .. }))
        ));
    }
}
