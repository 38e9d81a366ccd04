//! In-memory backends

use super::{HistoryLog, PolicyStore, StateStore};
use crate::models::{HistoryEntry, IdleState};
use crate::policy::PolicyConfig;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Idle state kept in a map. `set_failing` simulates a broken disk.
#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<String, IdleState>>,
    failing: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get(&self, instance_id: &str) -> Option<IdleState> {
        self.states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance_id)
            .cloned()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("simulated storage failure");
        }
        Ok(())
    }
}

impl StateStore for MemoryStateStore {
    fn load_all(&self) -> Result<Vec<IdleState>> {
        self.check()?;
        Ok(self
            .states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    fn save(&self, state: &IdleState) -> Result<()> {
        self.check()?;
        self.states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(state.instance_id.clone(), state.clone());
        Ok(())
    }

    fn remove(&self, instance_id: &str) -> Result<()> {
        self.check()?;
        self.states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPolicyStore {
    config: RwLock<Option<PolicyConfig>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: PolicyConfig) -> Self {
        Self {
            config: RwLock::new(Some(config)),
        }
    }
}

impl PolicyStore for MemoryPolicyStore {
    fn load(&self) -> Result<Option<PolicyConfig>> {
        Ok(self.config.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, config: &PolicyConfig) -> Result<()> {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = Some(config.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryHistoryLog {
    entries: RwLock<Vec<HistoryEntry>>,
    failing: AtomicBool,
}

impl MemoryHistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl HistoryLog for MemoryHistoryLog {
    fn load_all(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.entries.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn append(&self, entry: &HistoryEntry) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("simulated history write failure");
        }
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        Ok(())
    }
}
