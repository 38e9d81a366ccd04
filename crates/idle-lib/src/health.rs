//! Health of the idle manager's moving parts
//!
//! Three components are tracked: the metrics sampler, the action executor and
//! the persistence backends. Each keeps its current status, the last problem
//! reported and when it entered that status. Repeated reports of the same
//! status only bump a counter, so `since` tells how long a problem has lasted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Sampler,
    Executor,
    Persistence,
}

impl Component {
    pub const ALL: [Component; 3] = [
        Component::Sampler,
        Component::Executor,
        Component::Persistence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Sampler => "sampler",
            Component::Executor => "executor",
            Component::Persistence => "persistence",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, but recent operations failed
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the component entered `status`
    pub since: DateTime<Utc>,
    /// Reports received while in `status`
    pub reports: u64,
}

impl ComponentHealth {
    fn entered(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            since: Utc::now(),
            reports: 1,
        }
    }
}

/// Body of the liveness endpoint
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: ComponentStatus,
    pub components: BTreeMap<Component, ComponentHealth>,
}

/// Body of the readiness endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
struct HealthTable {
    components: BTreeMap<Component, ComponentHealth>,
    ready: bool,
}

/// Health table owned by one manager. Every component starts healthy.
#[derive(Debug)]
pub struct HealthRegistry {
    table: RwLock<HealthTable>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        let components = Component::ALL
            .into_iter()
            .map(|c| (c, ComponentHealth::entered(ComponentStatus::Healthy, None)))
            .collect();
        Self {
            table: RwLock::new(HealthTable {
                components,
                ready: false,
            }),
        }
    }

    /// Record a status report. Returns true when the status changed.
    pub async fn report(
        &self,
        component: Component,
        status: ComponentStatus,
        message: Option<String>,
    ) -> bool {
        let mut table = self.table.write().await;
        let entry = table
            .components
            .entry(component)
            .or_insert_with(|| ComponentHealth::entered(ComponentStatus::Healthy, None));

        if entry.status == status {
            entry.reports += 1;
            entry.message = message;
            return false;
        }

        let previous = entry.status;
        *entry = ComponentHealth::entered(status, message);
        if status > previous {
            warn!(component = %component, from = ?previous, to = ?status, "Component health worsened");
        } else {
            info!(component = %component, from = ?previous, to = ?status, "Component health improved");
        }
        true
    }

    pub async fn set_healthy(&self, component: Component) {
        self.report(component, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, component: Component, message: impl Into<String>) {
        self.report(component, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, component: Component, message: impl Into<String>) {
        self.report(component, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    pub async fn status_of(&self, component: Component) -> ComponentStatus {
        self.table
            .read()
            .await
            .components
            .get(&component)
            .map(|h| h.status)
            .unwrap_or(ComponentStatus::Healthy)
    }

    pub async fn component(&self, component: Component) -> Option<ComponentHealth> {
        self.table.read().await.components.get(&component).cloned()
    }

    pub async fn set_ready(&self, ready: bool) {
        self.table.write().await.ready = ready;
    }

    /// Overall status is the worst component status
    pub async fn health(&self) -> HealthReport {
        let components = self.table.read().await.components.clone();
        let status = components
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthReport { status, components }
    }

    /// Ready once startup has finished and no component is unhealthy
    pub async fn readiness(&self) -> Readiness {
        let table = self.table.read().await;
        if !table.ready {
            return Readiness {
                ready: false,
                reason: Some("idle manager not yet initialized".to_string()),
            };
        }

        let failing: Vec<&str> = table
            .components
            .iter()
            .filter(|(_, h)| !h.status.is_operational())
            .map(|(c, _)| c.as_str())
            .collect();
        if failing.is_empty() {
            Readiness {
                ready: true,
                reason: None,
            }
        } else {
            Readiness {
                ready: false,
                reason: Some(format!("unhealthy: {}", failing.join(", "))),
            }
        }
    }
}
