//! Per-cache registry of transaction branches.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use keel_core::{
    KeelError, KeelResult, ProtocolError, Transaction, TransactionContext, TransactionId,
};

use crate::branch::TransactionBranch;
use crate::entity_cache::CacheCore;
use crate::store::{EntryStore, Retention};

struct Branches {
    active: HashMap<TransactionId, Arc<TransactionBranch>>,
    /// Recently completed transactions, so late references are rejected.
    completed: EntryStore<TransactionId, ()>,
}

/// Registry state shared with branches so `complete` can deregister.
pub(crate) struct RegistryState {
    branches: Mutex<Branches>,
}

impl RegistryState {
    fn lock(&self) -> KeelResult<MutexGuard<'_, Branches>> {
        self.branches
            .lock()
            .map_err(|_| KeelError::LockPoisoned("branch registry"))
    }

    pub(crate) fn deregister(&self, transaction: TransactionId) -> KeelResult<()> {
        let mut branches = self.lock()?;
        branches.active.remove(&transaction);
        branches.completed.insert(transaction, ());
        tracing::debug!(%transaction, "Branch deregistered");
        Ok(())
    }
}

/// Maps outer transactions to this cache's branches for them.
pub struct BranchRegistry {
    core: Arc<CacheCore>,
    context: Arc<dyn TransactionContext>,
    state: Arc<RegistryState>,
}

impl BranchRegistry {
    pub(crate) fn new(
        core: Arc<CacheCore>,
        context: Arc<dyn TransactionContext>,
        completed_history: NonZeroUsize,
    ) -> Self {
        Self {
            core,
            context,
            state: Arc::new(RegistryState {
                branches: Mutex::new(Branches {
                    active: HashMap::new(),
                    completed: EntryStore::new(Retention::Reclaimable {
                        capacity: completed_history,
                    }),
                }),
            }),
        }
    }

    /// Branch for `transaction`, created on first reference.
    ///
    /// Errors if the transaction has already completed.
    pub fn branch_for(&self, transaction: &Arc<Transaction>) -> KeelResult<Arc<TransactionBranch>> {
        let id = transaction.id();
        let completed =
            || -> KeelError { ProtocolError::TransactionCompleted { transaction: id }.into() };
        if transaction.is_completed() {
            return Err(completed());
        }

        let mut branches = self.state.lock()?;
        if let Some(branch) = branches.active.get(&id) {
            return Ok(Arc::clone(branch));
        }
        if branches.completed.peek(&id).is_some() {
            return Err(completed());
        }
        let branch = Arc::new(TransactionBranch::new(
            Arc::clone(transaction),
            Arc::clone(&self.core),
            Arc::downgrade(&self.state),
        ));
        branches.active.insert(id, Arc::clone(&branch));
        tracing::debug!(cache = self.core.name(), transaction = %id, "Branch enlisted");
        Ok(branch)
    }

    /// Branch for the transaction active on the calling context, if any.
    pub fn current_branch(&self) -> KeelResult<Option<Arc<TransactionBranch>>> {
        self.context
            .current_transaction()
            .map(|transaction| self.branch_for(&transaction))
            .transpose()
    }

    /// Branches created and not yet completed.
    pub fn active_count(&self) -> KeelResult<usize> {
        Ok(self.state.lock()?.active.len())
    }

    pub fn is_active(&self, transaction: TransactionId) -> KeelResult<bool> {
        Ok(self.state.lock()?.active.contains_key(&transaction))
    }
}

impl std::fmt::Debug for BranchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchRegistry")
            .field("cache", &self.core.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityCache;
    use keel_core::{CacheConfig, IndexDefinition};

    /// Context whose active transaction the test sets directly.
    #[derive(Default)]
    struct FixedContext {
        active: Mutex<Option<Arc<Transaction>>>,
    }

    impl FixedContext {
        fn set(&self, transaction: Option<Arc<Transaction>>) {
            *self.active.lock().unwrap() = transaction;
        }
    }

    impl TransactionContext for FixedContext {
        fn current_transaction(&self) -> Option<Arc<Transaction>> {
            self.active.lock().unwrap().clone()
        }
    }

    fn cache(context: Arc<FixedContext>, history: usize) -> EntityCache {
        EntityCache::new(
            "customer",
            [IndexDefinition::new("region", ["region"])],
            CacheConfig::default().with_completed_history(history),
            context,
        )
        .unwrap()
    }

    #[test]
    fn test_branch_for_is_stable_per_transaction() {
        let cache = cache(Arc::default(), 8);
        let txn = Transaction::begin();
        let first = cache.registry().branch_for(&txn).unwrap();
        let second = cache.registry().branch_for(&txn).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = cache.registry().branch_for(&Transaction::begin()).unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(cache.registry().active_count().unwrap(), 2);
    }

    #[test]
    fn test_current_branch_follows_context() {
        let context = Arc::new(FixedContext::default());
        let cache = cache(Arc::clone(&context), 8);
        assert!(cache.registry().current_branch().unwrap().is_none());

        let txn = Transaction::begin();
        context.set(Some(Arc::clone(&txn)));
        let branch = cache.registry().current_branch().unwrap().unwrap();
        assert_eq!(branch.transaction_id(), txn.id());

        context.set(None);
        assert!(cache.registry().current_branch().unwrap().is_none());
    }

    #[test]
    fn test_completed_transaction_is_rejected() {
        let cache = cache(Arc::default(), 8);
        let txn = Transaction::begin();
        txn.mark_completed();
        let result = cache.registry().branch_for(&txn);
        assert!(matches!(
            result,
            Err(KeelError::Protocol(ProtocolError::TransactionCompleted { .. }))
        ));
        assert_eq!(cache.registry().active_count().unwrap(), 0);
    }

    #[test]
    fn test_completed_history_is_bounded() {
        let cache = cache(Arc::default(), 1);
        let first = Transaction::begin();
        let second = Transaction::begin();
        for txn in [&first, &second] {
            let branch = cache.registry().branch_for(txn).unwrap();
            branch.rollback().unwrap();
            branch.complete().unwrap();
        }
        assert!(cache.registry().branch_for(&second).is_err());
        // Only the most recent completion is remembered.
        assert!(cache.registry().branch_for(&first).is_ok());
    }
}
