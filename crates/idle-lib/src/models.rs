//! Core data models for the idle lifecycle manager

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Graduated cost-saving action, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleAction {
    Warn,
    Stop,
    Hibernate,
}

impl std::fmt::Display for IdleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdleAction::Warn => write!(f, "warn"),
            IdleAction::Stop => write!(f, "stop"),
            IdleAction::Hibernate => write!(f, "hibernate"),
        }
    }
}

impl std::str::FromStr for IdleAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "warn" | "notify" => Ok(IdleAction::Warn),
            "stop" => Ok(IdleAction::Stop),
            "hibernate" => Ok(IdleAction::Hibernate),
            other => Err(format!("unknown idle action '{}'", other)),
        }
    }
}

/// Result of executing a scheduled action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionOutcome {
    /// The requested action was performed
    Success,
    /// A substitute action was performed (stop instead of hibernate)
    Fallback,
    /// The lifecycle call failed or timed out
    Failure,
}

impl std::fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionOutcome::Success => write!(f, "success"),
            ActionOutcome::Fallback => write!(f, "fallback"),
            ActionOutcome::Failure => write!(f, "failure"),
        }
    }
}

impl std::str::FromStr for ActionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "success" => Ok(ActionOutcome::Success),
            "fallback" => Ok(ActionOutcome::Fallback),
            "failure" => Ok(ActionOutcome::Failure),
            other => Err(format!("unknown action outcome '{}'", other)),
        }
    }
}

/// Utilization snapshot for one instance, produced once per poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub timestamp: DateTime<Utc>,
    /// CPU utilization percentage (0-100)
    pub cpu_pct: f64,
    /// Memory utilization percentage (0-100)
    pub mem_pct: f64,
    /// Network throughput in kB/s
    pub net_kbps: f64,
    /// Disk throughput in kB/s
    pub disk_kbps: f64,
    /// GPU utilization percentage, when the instance has a GPU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_pct: Option<f64>,
    /// An interactive session was detected
    #[serde(default)]
    pub has_activity: bool,
}

impl UsageMetrics {
    /// Check the snapshot ranges. NaN is accepted here and treated as an
    /// unavailable reading by the classifier.
    pub fn validate(&self) -> Result<(), String> {
        fn pct(name: &str, value: f64) -> Result<(), String> {
            if value.is_nan() || (0.0..=100.0).contains(&value) {
                Ok(())
            } else {
                Err(format!("{} out of range: {}", name, value))
            }
        }
        fn non_negative(name: &str, value: f64) -> Result<(), String> {
            if value.is_nan() || (value >= 0.0 && value.is_finite()) {
                Ok(())
            } else {
                Err(format!("{} must be a non-negative rate: {}", name, value))
            }
        }

        pct("cpu_pct", self.cpu_pct)?;
        pct("mem_pct", self.mem_pct)?;
        non_negative("net_kbps", self.net_kbps)?;
        non_negative("disk_kbps", self.disk_kbps)?;
        if let Some(gpu) = self.gpu_pct {
            pct("gpu_pct", gpu)?;
        }
        Ok(())
    }
}

/// Action scheduled for the current idle episode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub action: IdleAction,
    pub execute_at: DateTime<Utc>,
}

/// Per-instance idle tracking state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleState {
    pub instance_id: String,
    pub instance_name: String,
    pub policy_name: String,
    #[serde(default)]
    pub last_metrics: Option<UsageMetrics>,
    pub is_idle: bool,
    /// Start of the current idle episode
    #[serde(default)]
    pub idle_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_action: Option<ScheduledAction>,
    /// The scheduled action already fired in this episode
    #[serde(default)]
    pub executed: bool,
    /// Timestamp of the most recent not-idle sample
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
}

impl IdleState {
    pub fn new(
        instance_id: impl Into<String>,
        instance_name: impl Into<String>,
        policy_name: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            instance_name: instance_name.into(),
            policy_name: policy_name.into(),
            last_metrics: None,
            is_idle: false,
            idle_since: None,
            scheduled_action: None,
            executed: false,
            last_activity: None,
        }
    }

    /// How long the current episode has lasted at `now`
    pub fn idle_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.idle_since.map(|since| now - since)
    }

    /// Whether the scheduled action is due and has not fired yet
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match &self.scheduled_action {
            Some(scheduled) => self.is_idle && !self.executed && now >= scheduled.execute_at,
            None => false,
        }
    }
}

/// A due action, snapshotted from an `IdleState` by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub instance_id: String,
    pub instance_name: String,
    pub policy_name: String,
    pub action: IdleAction,
    pub execute_at: DateTime<Utc>,
    pub idle_since: DateTime<Utc>,
    pub metrics: Option<UsageMetrics>,
}

/// Immutable audit record of an attempted action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub instance_id: String,
    pub instance_name: String,
    /// Action the policy asked for
    pub requested_action: IdleAction,
    /// Action actually performed (absent on failure)
    #[serde(default)]
    pub performed_action: Option<IdleAction>,
    pub requested_at: DateTime<Utc>,
    pub outcome: ActionOutcome,
    pub idle_duration_secs: i64,
    #[serde(default)]
    pub metrics: Option<UsageMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Filter for history queries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryFilter {
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Matches the performed action, or the requested one for failures
    #[serde(default)]
    pub action: Option<IdleAction>,
    #[serde(default)]
    pub outcome: Option<ActionOutcome>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn for_instance(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: Some(instance_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, entry: &HistoryEntry) -> bool {
        if let Some(ref id) = self.instance_id {
            if &entry.instance_id != id {
                return false;
            }
        }
        if let Some(action) = self.action {
            if entry.performed_action.unwrap_or(entry.requested_action) != action {
                return false;
            }
        }
        if let Some(outcome) = self.outcome {
            if entry.outcome != outcome {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.requested_at < since {
                return false;
            }
        }
        true
    }
}

/// Registration record for a tracked instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub instance_name: String,
    /// Research domain, used for domain-default policy resolution
    #[serde(default)]
    pub domain: Option<String>,
}
