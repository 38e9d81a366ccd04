//! Manager configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default lifecycle call timeout
pub const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 30;

/// Default metrics aggregation window requested from the provider
pub const DEFAULT_METRICS_WINDOW_SECS: u64 = 5 * 60;

/// Configuration for a `Manager`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Upper bound for each lifecycle controller call
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,

    /// Window passed to the metrics provider for each sample
    #[serde(default = "default_metrics_window")]
    pub metrics_window_secs: u64,

    /// Maximum number of actions executed in one sweep
    #[serde(default = "default_max_actions")]
    pub max_actions_per_sweep: usize,

    /// Log actions instead of calling the lifecycle controller
    #[serde(default)]
    pub dry_run: bool,

    /// Consecutive persistence failures before they are surfaced as errors
    #[serde(default = "default_persistence_threshold")]
    pub persistence_failure_threshold: u32,
}

fn default_action_timeout() -> u64 {
    DEFAULT_ACTION_TIMEOUT_SECS
}

fn default_metrics_window() -> u64 {
    DEFAULT_METRICS_WINDOW_SECS
}

fn default_max_actions() -> usize {
    10
}

fn default_persistence_threshold() -> u32 {
    3
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            action_timeout_secs: default_action_timeout(),
            metrics_window_secs: default_metrics_window(),
            max_actions_per_sweep: default_max_actions(),
            dry_run: false,
            persistence_failure_threshold: default_persistence_threshold(),
        }
    }
}

impl ManagerConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.metrics_window_secs)
    }
}
