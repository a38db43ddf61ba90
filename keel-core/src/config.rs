//! Configuration types

use crate::{ConfigError, KeelError, KeelResult};
use serde::{Deserialize, Serialize};

/// Configuration for one entity cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum live identities kept in the primary identity map.
    pub identity_capacity: usize,
    /// Maximum index entries kept per index group.
    pub index_entry_capacity: usize,
    /// How many completed transaction ids the branch registry remembers.
    pub completed_history: usize,
    /// Reject publication into a unique index entry held by another live record.
    pub enforce_unique_on_prepare: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            identity_capacity: 100_000,
            index_entry_capacity: 10_000,
            completed_history: 1_024,
            enforce_unique_on_prepare: true,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity_capacity(mut self, capacity: usize) -> Self {
        self.identity_capacity = capacity;
        self
    }

    pub fn with_index_entry_capacity(mut self, capacity: usize) -> Self {
        self.index_entry_capacity = capacity;
        self
    }

    pub fn with_completed_history(mut self, history: usize) -> Self {
        self.completed_history = history;
        self
    }

    pub fn with_unique_enforcement(mut self, enabled: bool) -> Self {
        self.enforce_unique_on_prepare = enabled;
        self
    }

    /// Validate the configuration.
    ///
    /// Every capacity must be non-zero.
    pub fn validate(&self) -> KeelResult<()> {
        let capacities = [
            ("identity_capacity", self.identity_capacity),
            ("index_entry_capacity", self.index_entry_capacity),
            ("completed_history", self.completed_history),
        ];
        for (field, value) in capacities {
            if value == 0 {
                return Err(KeelError::Config(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: format!("{} must be greater than 0", field),
                }));
            }
        }
        Ok(())
    }
}
