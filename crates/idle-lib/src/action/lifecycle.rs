//! Collaborator interfaces for instance lifecycle and notifications

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Cloud-side control over an instance's power state
#[async_trait]
pub trait LifecycleController: Send + Sync {
    /// Hibernate the instance. `Ok(false)` means the instance does not
    /// support hibernation and nothing was done.
    async fn hibernate(&self, instance_id: &str) -> anyhow::Result<bool>;

    async fn stop(&self, instance_id: &str) -> anyhow::Result<()>;

    async fn start(&self, instance_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Delivery channel for user-facing notices (email, chat, ...)
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, instance_id: &str, message: &str, severity: Severity)
        -> anyhow::Result<()>;
}
