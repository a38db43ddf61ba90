//! Keel Cache - Transactional Entity Cache
//!
//! An identity-mapped cache of versioned records with incrementally
//! maintained secondary indexes. Reads outside a transaction go straight to
//! the global identity map and index groups; reads and writes inside one go
//! through that transaction's [`TransactionBranch`], which keeps its
//! uncommitted writes in branch-local overlays until the outer coordinator
//! drives it through prepare, commit or rollback, and complete.

pub mod branch;
pub mod entity_cache;
pub mod identity_map;
pub mod index;
pub mod overlay;
pub mod provider;
pub mod registry;
pub mod stats;
mod store;

pub use branch::TransactionBranch;
pub use entity_cache::{ConsistencyViolation, EntityCache, ViolationKind};
pub use identity_map::PrimaryIdentityMap;
pub use index::{EntrySnapshot, IndexEntry, IndexGroup};
pub use overlay::{IndexOverlay, OverlayEntry};
pub use provider::{BackingProvider, Cursor, FailurePoint, MemoryBackingProvider};
pub use registry::BranchRegistry;
pub use stats::CacheStats;
pub use store::Retention;
