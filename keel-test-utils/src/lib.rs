//! Keel Test Utilities
//!
//! Shared test infrastructure for the Keel workspace:
//! - Proptest generators for identities, customers, and write plans
//! - Customer fixtures with a unique `email` and a plain `region` index
//! - A minimal two-phase commit coordinator
//! - Custom assertions for Keel error variants

// Re-export the in-memory provider from its source crate
pub use keel_cache::{FailurePoint, MemoryBackingProvider};

// Re-export core types for convenience
pub use keel_cache::{
    BackingProvider, BranchRegistry, CacheStats, ConsistencyViolation, EntityCache,
    PrimaryIdentityMap, TransactionBranch,
};
pub use keel_core::{
    BranchState, CacheConfig, DataAccessError, Delta, DeltaKind, FieldValue, Identity,
    IndexDefinition, KeelError, KeelResult, KeyValue, ProtocolError, Record,
    ThreadTransactionContext, Transaction, TransactionContext, TransactionGuard,
    TransactionParticipant, Tuple, ValidationError,
};

use std::sync::Arc;

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Keel types.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    /// Generate a random Identity.
    pub fn arb_identity() -> impl Strategy<Value = Identity> {
        any::<[u8; 16]>().prop_map(|bytes| Identity::from_uuid(Uuid::from_bytes(bytes)))
    }

    pub fn arb_email() -> impl Strategy<Value = String> {
        "[a-z]{1,8}@x\\.com"
    }

    pub fn arb_region() -> impl Strategy<Value = &'static str> {
        prop_oneof![Just("eu"), Just("us"), Just("apac")]
    }

    /// Generate one customer row with an arbitrary identity.
    pub fn arb_customer() -> impl Strategy<Value = Tuple> {
        (arb_identity(), arb_email(), arb_region()).prop_map(|(identity, email, region)| {
            Tuple::new(identity)
                .with("email", email)
                .with("region", region)
        })
    }

    /// Generate customers with pairwise distinct emails.
    pub fn arb_customers(max: usize) -> impl Strategy<Value = Vec<Tuple>> {
        prop::collection::btree_map(arb_email(), arb_region(), 1..=max).prop_map(|rows| {
            rows.into_iter()
                .map(|(email, region)| fixtures::customer(&email, region))
                .collect()
        })
    }

    /// One write in a generated plan. `target` picks an existing row modulo
    /// the row count.
    #[derive(Debug, Clone)]
    pub enum CustomerOp {
        Insert { email: String, region: &'static str },
        Move { target: usize, region: &'static str },
        Rename { target: usize, email: String },
        Delete { target: usize },
    }

    pub fn arb_customer_op() -> impl Strategy<Value = CustomerOp> {
        prop_oneof![
            (arb_email(), arb_region())
                .prop_map(|(email, region)| CustomerOp::Insert { email, region }),
            (any::<usize>(), arb_region())
                .prop_map(|(target, region)| CustomerOp::Move { target, region }),
            (any::<usize>(), arb_email())
                .prop_map(|(target, email)| CustomerOp::Rename { target, email }),
            any::<usize>().prop_map(|target| CustomerOp::Delete { target }),
        ]
    }

    pub fn arb_customer_ops(max: usize) -> impl Strategy<Value = Vec<CustomerOp>> {
        prop::collection::vec(arb_customer_op(), 1..=max)
    }

    pub fn arb_valid_config() -> impl Strategy<Value = CacheConfig> {
        (1usize..10_000, 1usize..1_000, 1usize..256, any::<bool>()).prop_map(
            |(identities, entries, history, unique)| {
                CacheConfig::new()
                    .with_identity_capacity(identities)
                    .with_index_entry_capacity(entries)
                    .with_completed_history(history)
                    .with_unique_enforcement(unique)
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Customer record type used across the cache tests.

    use super::*;

    pub const CUSTOMER_CACHE: &str = "customer";

    /// Unique index on `email`.
    pub fn email_index() -> IndexDefinition {
        IndexDefinition::unique("email", ["email"])
    }

    /// Non-unique index on `region`.
    pub fn region_index() -> IndexDefinition {
        IndexDefinition::new("region", ["region"])
    }

    pub fn customer(email: &str, region: &str) -> Tuple {
        Tuple::new(Identity::new())
            .with("email", email)
            .with("region", region)
    }

    /// `original` with `field` set to `value`, as an update delta.
    pub fn change(original: &Tuple, field: &str, value: impl Into<FieldValue>) -> Delta {
        let mut updated = original.clone();
        updated.set(field, value);
        match Delta::update(original.clone(), updated) {
            Ok(delta) => delta,
            Err(err) => panic!("fixture delta rejected: {err}"),
        }
    }

    /// Customer cache with default configuration and a per-thread context.
    pub fn customer_cache() -> EntityCache {
        customer_cache_with(CacheConfig::default())
    }

    pub fn customer_cache_with(config: CacheConfig) -> EntityCache {
        match EntityCache::new(
            CUSTOMER_CACHE,
            [email_index(), region_index()],
            config,
            Arc::new(ThreadTransactionContext::new()),
        ) {
            Ok(cache) => cache,
            Err(err) => panic!("fixture cache rejected: {err}"),
        }
    }

    pub fn provider(rows: impl IntoIterator<Item = Tuple>) -> MemoryBackingProvider {
        MemoryBackingProvider::with_rows(rows)
    }

    pub fn email(value: &str) -> KeyValue {
        KeyValue::single(value)
    }

    pub fn region(value: &str) -> KeyValue {
        KeyValue::single(value)
    }

    /// Text of `field` on `record`, if any.
    pub fn text<'a>(record: &'a Record, field: &str) -> Option<&'a str> {
        record.value().get(field).and_then(FieldValue::as_text)
    }
}

// ============================================================================
// TWO-PHASE COMMIT COORDINATOR
// ============================================================================

/// Drives enlisted participants through two-phase commit, the way an outer
/// transaction manager would.
#[derive(Default)]
pub struct Coordinator {
    participants: Vec<Arc<dyn TransactionParticipant>>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enlist(&mut self, participant: Arc<dyn TransactionParticipant>) {
        self.participants.push(participant);
    }

    /// Prepare everyone, then commit and complete. Any prepare failure
    /// rolls every participant back and is returned.
    pub fn commit(&self, transaction: &Transaction) -> KeelResult<()> {
        for participant in &self.participants {
            if let Err(err) = participant.prepare() {
                tracing::debug!(transaction = %transaction.id(), error = %err, "Prepare failed");
                self.rollback(transaction)?;
                return Err(err);
            }
        }
        for participant in &self.participants {
            participant.commit()?;
        }
        self.finish(transaction)
    }

    pub fn rollback(&self, transaction: &Transaction) -> KeelResult<()> {
        for participant in &self.participants {
            participant.rollback()?;
        }
        self.finish(transaction)
    }

    fn finish(&self, transaction: &Transaction) -> KeelResult<()> {
        for participant in &self.participants {
            participant.complete()?;
        }
        transaction.mark_completed();
        Ok(())
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Keel-specific error variants and invariants.

    use super::*;

    #[track_caller]
    pub fn assert_protocol_error<T: std::fmt::Debug>(result: &KeelResult<T>) {
        match result {
            Err(KeelError::Protocol(_)) => {}
            other => panic!("Expected Protocol error, got: {:?}", other),
        }
    }

    /// Assert an illegal-state error for `operation` raised in `state`.
    #[track_caller]
    pub fn assert_illegal_state<T: std::fmt::Debug>(
        result: &KeelResult<T>,
        state: BranchState,
        operation: &str,
    ) {
        match result {
            Err(KeelError::Protocol(ProtocolError::IllegalState {
                state: s,
                operation: op,
                ..
            })) => {
                assert_eq!(*s, state, "Wrong state in IllegalState error");
                assert_eq!(*op, operation, "Wrong operation in IllegalState error");
            }
            other => panic!("Expected IllegalState({state:?}, {operation}), got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_data_access_error<T: std::fmt::Debug>(result: &KeelResult<T>) {
        match result {
            Err(KeelError::DataAccess(_)) => {}
            other => panic!("Expected DataAccess error, got: {:?}", other),
        }
    }

    /// Assert `records` hold exactly the identities of `expected`, in any order.
    #[track_caller]
    pub fn assert_identities(records: &[Record], expected: &[Identity]) {
        let mut got: Vec<Identity> = records.iter().map(|r| r.identity()).collect();
        let mut want = expected.to_vec();
        got.sort();
        want.sort();
        assert_eq!(got, want, "Record identities differ");
    }

    /// Assert every index group agrees with the identity map.
    #[track_caller]
    pub fn assert_consistent(cache: &EntityCache) {
        match cache.verify_consistency() {
            Ok(violations) => assert!(
                violations.is_empty(),
                "Index consistency violated: {:?}",
                violations
            ),
            Err(err) => panic!("Consistency audit failed: {err}"),
        }
    }
}
