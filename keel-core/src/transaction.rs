//! Outer transaction handles and the participant protocol
//!
//! The cache does not run transactions. It resolves the active one through a
//! [`TransactionContext`] and implements [`TransactionParticipant`] so an
//! outer coordinator can drive it through two-phase commit.

use crate::{KeelResult, Timestamp, TransactionId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle state of one transaction branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchState {
    Started,
    Prepared,
    Committed,
    Aborted,
    Completed,
}

/// Handle to one outer transaction.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    began_at: Timestamp,
    completed: AtomicBool,
}

impl Transaction {
    pub fn begin() -> Arc<Self> {
        Arc::new(Self {
            id: TransactionId::new(),
            began_at: Utc::now(),
            completed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn began_at(&self) -> Timestamp {
        self.began_at
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Called by the coordinator once every participant has completed.
    pub fn mark_completed(&self) {
        tracing::trace!(transaction = %self.id, "Transaction completed");
        self.completed.store(true, Ordering::Release);
    }
}

/// Resolves the transaction active on the calling context.
pub trait TransactionContext: Send + Sync {
    fn current_transaction(&self) -> Option<Arc<Transaction>>;
}

/// Participant side of two-phase commit.
pub trait TransactionParticipant: Send + Sync {
    fn prepare(&self) -> KeelResult<()>;
    fn commit(&self) -> KeelResult<()>;
    fn rollback(&self) -> KeelResult<()>;
    fn complete(&self) -> KeelResult<()>;
}

thread_local! {
    static ACTIVE: RefCell<Vec<Arc<Transaction>>> = const { RefCell::new(Vec::new()) };
}

/// Thread-local transaction context. Transactions nest; the innermost wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadTransactionContext;

impl ThreadTransactionContext {
    pub fn new() -> Self {
        Self
    }

    /// Make `transaction` active on this thread until the guard drops.
    pub fn enter(transaction: Arc<Transaction>) -> TransactionGuard {
        tracing::trace!(transaction = %transaction.id(), "Entered transaction");
        ACTIVE.with(|active| active.borrow_mut().push(transaction));
        TransactionGuard {
            _not_send: PhantomData,
        }
    }
}

impl TransactionContext for ThreadTransactionContext {
    fn current_transaction(&self) -> Option<Arc<Transaction>> {
        ACTIVE.with(|active| active.borrow().last().cloned())
    }
}

/// Deactivates the entered transaction on drop.
#[must_use = "the transaction is only active while the guard is alive"]
pub struct TransactionGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| {
            active.borrow_mut().pop();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_transaction_by_default() {
        assert!(ThreadTransactionContext.current_transaction().is_none());
    }

    #[test]
    fn test_enter_and_nesting() {
        let outer = Transaction::begin();
        let inner = Transaction::begin();
        let context = ThreadTransactionContext::new();

        let _outer_guard = ThreadTransactionContext::enter(Arc::clone(&outer));
        assert_eq!(context.current_transaction().unwrap().id(), outer.id());
        {
            let _inner_guard = ThreadTransactionContext::enter(Arc::clone(&inner));
            assert_eq!(context.current_transaction().unwrap().id(), inner.id());
        }
        assert_eq!(context.current_transaction().unwrap().id(), outer.id());
    }

    #[test]
    fn test_context_is_per_thread() {
        let txn = Transaction::begin();
        let _guard = ThreadTransactionContext::enter(txn);
        let seen = std::thread::spawn(|| ThreadTransactionContext.current_transaction().is_some())
            .join()
            .unwrap();
        assert!(!seen);
    }

    #[test]
    fn test_mark_completed() {
        let txn = Transaction::begin();
        assert!(!txn.is_completed());
        txn.mark_completed();
        assert!(txn.is_completed());
    }
}
