//! Error taxonomy for the idle lifecycle manager

use crate::models::IdleAction;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IdleError>;

#[derive(Debug, Clone, Error)]
pub enum IdleError {
    /// Metrics were unavailable or malformed; state is left untouched
    #[error("metrics unavailable for instance {instance_id}: {reason}")]
    Provider { instance_id: String, reason: String },

    /// An assignment referenced a policy that does not exist
    #[error("policy '{policy}' not found, using '{fallback}'")]
    PolicyNotFound { policy: String, fallback: String },

    #[error("invalid policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    #[error("cannot remove policy '{name}': it is the default policy")]
    ProtectedPolicy { name: String },

    /// A lifecycle call failed or timed out; the action stays pending
    #[error("{action} failed for instance {instance_id}: {reason}")]
    Execution {
        instance_id: String,
        action: IdleAction,
        reason: String,
    },

    #[error("start failed for instance {instance_id}: {reason}")]
    Start { instance_id: String, reason: String },

    #[error("failed to persist {target}: {reason}")]
    Persistence { target: String, reason: String },

    /// Persistence has failed repeatedly; memory and disk have diverged
    #[error("persistence degraded after {consecutive_failures} consecutive failures: {last_error}")]
    PersistenceDegraded {
        consecutive_failures: u32,
        last_error: String,
    },

    #[error("failed to register metrics: {0}")]
    Metrics(String),

    #[error("unknown instance {instance_id}")]
    UnknownInstance { instance_id: String },
}

impl IdleError {
    pub fn provider(instance_id: &str, err: impl std::fmt::Display) -> Self {
        IdleError::Provider {
            instance_id: instance_id.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn persistence(target: impl Into<String>, err: &anyhow::Error) -> Self {
        IdleError::Persistence {
            target: target.into(),
            reason: format!("{:#}", err),
        }
    }

    pub fn invalid_policy(name: &str, reason: impl Into<String>) -> Self {
        IdleError::InvalidPolicy {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error is safe to retry on the next polling cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IdleError::Provider { .. }
                | IdleError::Execution { .. }
                | IdleError::Start { .. }
                | IdleError::Persistence { .. }
                | IdleError::PersistenceDegraded { .. }
        )
    }
}
