//! Persistence backends for policy, idle state and history
//!
//! This module provides:
//! - Storage traits over the logical schemas
//! - JSON file backends with atomic write-replace
//! - In-memory backends for tests and ephemeral managers

mod json;
mod memory;

pub use json::{atomic_write, JsonHistoryLog, JsonPolicyStore, JsonStateStore};
pub use memory::{MemoryHistoryLog, MemoryPolicyStore, MemoryStateStore};

use crate::models::{HistoryEntry, IdleState};
use crate::policy::PolicyConfig;
use anyhow::Result;

/// Storage for per-instance idle state
pub trait StateStore: Send + Sync {
    /// Load every persisted state
    fn load_all(&self) -> Result<Vec<IdleState>>;

    /// Persist one instance's state, replacing any previous version
    fn save(&self, state: &IdleState) -> Result<()>;

    /// Remove one instance's state
    fn remove(&self, instance_id: &str) -> Result<()>;
}

/// Storage for the policy document
pub trait PolicyStore: Send + Sync {
    /// Load the policy document, `None` if nothing has been saved yet
    fn load(&self) -> Result<Option<PolicyConfig>>;

    fn save(&self, config: &PolicyConfig) -> Result<()>;
}

/// Append-only storage for history entries
pub trait HistoryLog: Send + Sync {
    /// Load all entries in append order
    fn load_all(&self) -> Result<Vec<HistoryEntry>>;

    fn append(&self, entry: &HistoryEntry) -> Result<()>;
}
