//! Idle policies and their assignment to instances
//!
//! This module provides:
//! - Policy definitions (thresholds, idle window, action)
//! - The policy catalog with instance > domain > global-default precedence
//! - The pure idle classifier

mod catalog;
mod classifier;

pub use catalog::{MissingPolicy, PolicyCatalog};
pub use classifier::{busy_signal, classify, BusySignal};

use crate::error::{IdleError, Result};
use crate::models::IdleAction;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-metric thresholds; an absent threshold is not checked
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_kbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_kbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_pct: Option<f64>,
}

impl Thresholds {
    fn validate(&self) -> std::result::Result<(), String> {
        let pct = [("cpu_pct", self.cpu_pct), ("mem_pct", self.mem_pct), ("gpu_pct", self.gpu_pct)];
        for (name, value) in pct {
            if let Some(v) = value {
                if !v.is_finite() || !(0.0..=100.0).contains(&v) {
                    return Err(format!("{} threshold must be within 0-100, got {}", name, v));
                }
            }
        }
        let rates = [("net_kbps", self.net_kbps), ("disk_kbps", self.disk_kbps)];
        for (name, value) in rates {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(format!("{} threshold must be non-negative, got {}", name, v));
                }
            }
        }
        Ok(())
    }

    /// Overlay the thresholds set in `other` onto `self`
    fn overlay(&mut self, other: &Thresholds) {
        if other.cpu_pct.is_some() {
            self.cpu_pct = other.cpu_pct;
        }
        if other.mem_pct.is_some() {
            self.mem_pct = other.mem_pct;
        }
        if other.net_kbps.is_some() {
            self.net_kbps = other.net_kbps;
        }
        if other.disk_kbps.is_some() {
            self.disk_kbps = other.disk_kbps;
        }
        if other.gpu_pct.is_some() {
            self.gpu_pct = other.gpu_pct;
        }
    }
}

/// Named idle policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdlePolicy {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub thresholds: Thresholds,
    /// Minutes of contiguous idleness before the action is scheduled
    pub idle_minutes: u32,
    pub action: IdleAction,
    /// Send a notification before stopping or hibernating
    #[serde(default)]
    pub notify: bool,
}

impl IdlePolicy {
    pub fn idle_window(&self) -> Duration {
        Duration::minutes(i64::from(self.idle_minutes))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(IdleError::invalid_policy(&self.name, "name cannot be empty"));
        }
        if self.idle_minutes == 0 {
            return Err(IdleError::invalid_policy(
                &self.name,
                "idle_minutes must be greater than zero",
            ));
        }
        self.thresholds
            .validate()
            .map_err(|reason| IdleError::invalid_policy(&self.name, reason))
    }
}

/// Instance-specific assignment with optional field overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceOverride {
    /// Policy to use; falls back to the domain or global default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<IdleAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<bool>,
}

impl InstanceOverride {
    pub fn with_policy(name: impl Into<String>) -> Self {
        Self {
            policy: Some(name.into()),
            ..Default::default()
        }
    }

    fn apply(&self, policy: &mut IdlePolicy) {
        policy.thresholds.overlay(&self.thresholds);
        if let Some(minutes) = self.idle_minutes {
            policy.idle_minutes = minutes;
        }
        if let Some(action) = self.action {
            policy.action = action;
        }
        if let Some(notify) = self.notify {
            policy.notify = notify;
        }
    }
}

/// Persisted policy document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub default_policy: String,
    pub policies: BTreeMap<String, IdlePolicy>,
    /// Research domain -> policy name
    #[serde(default)]
    pub domain_mappings: BTreeMap<String, String>,
    /// Instance id -> override
    #[serde(default)]
    pub instance_overrides: BTreeMap<String, InstanceOverride>,
}

fn default_enabled() -> bool {
    true
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let policies = builtin_policies()
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();

        let domain_mappings = [
            ("machine-learning", "gpu"),
            ("genomics", "batch"),
            ("data-science", "standard"),
            ("climate-science", "batch"),
            ("visualization", "gpu"),
            ("neuroimaging", "gpu"),
            ("hpc", "batch"),
        ]
        .into_iter()
        .map(|(d, p)| (d.to_string(), p.to_string()))
        .collect();

        Self {
            enabled: true,
            default_policy: "standard".to_string(),
            policies,
            domain_mappings,
            instance_overrides: BTreeMap::new(),
        }
    }
}

/// Policies shipped with a fresh installation
pub fn builtin_policies() -> Vec<IdlePolicy> {
    vec![
        IdlePolicy {
            name: "standard".to_string(),
            description: "Interactive workstations".to_string(),
            thresholds: Thresholds {
                cpu_pct: Some(10.0),
                mem_pct: Some(30.0),
                net_kbps: Some(50.0),
                disk_kbps: Some(100.0),
                gpu_pct: None,
            },
            idle_minutes: 30,
            action: IdleAction::Stop,
            notify: true,
        },
        IdlePolicy {
            name: "batch".to_string(),
            description: "Long-running batch workloads".to_string(),
            thresholds: Thresholds {
                cpu_pct: Some(5.0),
                mem_pct: Some(20.0),
                net_kbps: Some(25.0),
                disk_kbps: Some(50.0),
                gpu_pct: None,
            },
            idle_minutes: 60,
            action: IdleAction::Hibernate,
            notify: true,
        },
        IdlePolicy {
            name: "gpu".to_string(),
            description: "GPU instances".to_string(),
            thresholds: Thresholds {
                cpu_pct: Some(5.0),
                mem_pct: Some(20.0),
                net_kbps: Some(50.0),
                disk_kbps: Some(100.0),
                gpu_pct: Some(3.0),
            },
            idle_minutes: 15,
            action: IdleAction::Stop,
            notify: true,
        },
        IdlePolicy {
            name: "data-intensive".to_string(),
            description: "Data processing with bursty I/O".to_string(),
            thresholds: Thresholds {
                cpu_pct: Some(8.0),
                mem_pct: Some(40.0),
                net_kbps: Some(100.0),
                disk_kbps: Some(200.0),
                gpu_pct: None,
            },
            idle_minutes: 45,
            action: IdleAction::Stop,
            notify: true,
        },
    ]
}
