//! Keel Core - Entity Cache Types
//!
//! Data types and collaborator contracts shared by the Keel entity cache:
//! identities, tuples, key values, index definitions, deltas, versioned
//! records, transaction handles, configuration, and the error taxonomy.
//! This crate contains no caching logic.

pub mod config;
pub mod delta;
pub mod error;
pub mod identity;
pub mod index;
pub mod record;
pub mod transaction;
pub mod value;

pub use config::CacheConfig;
pub use delta::{Delta, DeltaKind};
pub use error::{
    ConfigError, DataAccessError, KeelError, KeelResult, ProtocolError, ValidationError,
};
pub use identity::{Identity, TransactionId};
pub use index::IndexDefinition;
pub use record::{Record, VersionedRecord};
pub use transaction::{
    BranchState, ThreadTransactionContext, Transaction, TransactionContext, TransactionGuard,
    TransactionParticipant,
};
pub use value::{FieldValue, KeyValue, Tuple};

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
