//! Error types for Keel operations

use crate::{BranchState, Identity, TransactionId};
use thiserror::Error;

/// Two-phase-commit and write-path protocol violations.
///
/// These indicate a coordination bug in the caller. The cache never retries them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Illegal {operation} on branch for transaction {transaction} in state {state:?}")]
    IllegalState {
        transaction: TransactionId,
        state: BranchState,
        operation: &'static str,
    },

    #[error("Transaction required for {operation}")]
    TransactionRequired { operation: &'static str },

    #[error("Duplicate insert within transaction {transaction} for identity {identity}")]
    DuplicateInsert {
        transaction: TransactionId,
        identity: Identity,
    },

    #[error("Transaction {transaction} has already completed")]
    TransactionCompleted { transaction: TransactionId },

    #[error("Insert of identity {identity} which already has a record in the cache")]
    IdentityExists { identity: Identity },

    #[error("Record {identity} v{version} already has a pending version")]
    PendingVersionExists { identity: Identity, version: u64 },
}

/// Errors raised while reading through to, or publishing into, indexed state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DataAccessError {
    #[error("Cardinality violation on unique index {index} for key {key}: {count} records")]
    Cardinality {
        index: String,
        key: String,
        count: usize,
    },

    #[error("Unique violation on index {index} for key {key}: {incoming} conflicts with {existing}")]
    UniqueViolation {
        index: String,
        key: String,
        existing: Identity,
        incoming: Identity,
    },

    #[error("Backing fetch failed on index {index} for key {key}: {source}")]
    FetchFailed {
        index: String,
        key: String,
        #[source]
        source: Box<KeelError>,
    },

    #[error("Backing provider error: {reason}")]
    Provider { reason: String },

    #[error("Cursor close failed on index {index} for key {key}: {reason}")]
    CloseFailed {
        index: String,
        key: String,
        reason: String,
    },
}

/// Malformed write intent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Delta for {expected} carries a tuple for {got}")]
    IdentityMismatch { expected: Identity, got: Identity },

    #[error("Record {identity} is deleted within this transaction")]
    RecordDeleted { identity: Identity },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Unknown index: {name}")]
    UnknownIndex { name: String },

    #[error("Duplicate index definition: {name}")]
    DuplicateIndex { name: String },
}

/// Master error type for all Keel errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeelError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Data access error: {0}")]
    DataAccess(#[from] DataAccessError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl KeelError {
    /// True for errors that signal a coordination bug rather than a data problem.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, KeelError::Protocol(_))
    }
}

/// Result type alias for Keel operations.
pub type KeelResult<T> = Result<T, KeelError>;

// =============================================================================
// TESTS
// =============================================================================
