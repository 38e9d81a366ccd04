//! Idle classification of a single metrics snapshot

use super::IdlePolicy;
use crate::models::UsageMetrics;
use serde::Serialize;

/// Signal that kept a sample from counting as idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusySignal {
    InteractiveSession,
    Cpu,
    Memory,
    Network,
    Disk,
    Gpu,
    /// A configured threshold had no usable reading
    MissingMetric,
}

impl std::fmt::Display for BusySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BusySignal::InteractiveSession => "interactive_session",
            BusySignal::Cpu => "cpu",
            BusySignal::Memory => "memory",
            BusySignal::Network => "network",
            BusySignal::Disk => "disk",
            BusySignal::Gpu => "gpu",
            BusySignal::MissingMetric => "missing_metric",
        };
        write!(f, "{}", s)
    }
}

/// Returns true when every configured threshold is satisfied and no
/// interactive session was seen
pub fn classify(metrics: &UsageMetrics, policy: &IdlePolicy) -> bool {
    busy_signal(metrics, policy).is_none()
}

/// First signal that marks the sample as not idle, if any
pub fn busy_signal(metrics: &UsageMetrics, policy: &IdlePolicy) -> Option<BusySignal> {
    if metrics.has_activity {
        return Some(BusySignal::InteractiveSession);
    }

    let t = &policy.thresholds;
    let checks = [
        (t.cpu_pct, Some(metrics.cpu_pct), BusySignal::Cpu),
        (t.mem_pct, Some(metrics.mem_pct), BusySignal::Memory),
        (t.net_kbps, Some(metrics.net_kbps), BusySignal::Network),
        (t.disk_kbps, Some(metrics.disk_kbps), BusySignal::Disk),
        (t.gpu_pct, metrics.gpu_pct, BusySignal::Gpu),
    ];

    for (threshold, value, signal) in checks {
        let Some(threshold) = threshold else {
            continue;
        };
        match value {
            Some(v) if v.is_nan() => return Some(BusySignal::MissingMetric),
            Some(v) if v < threshold => {}
            Some(_) => return Some(signal),
            None => return Some(BusySignal::MissingMetric),
        }
    }

    None
}
