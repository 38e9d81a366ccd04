//! Metrics sampling from the external metrics provider

use crate::error::{IdleError, Result};
use crate::models::UsageMetrics;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Source of utilization snapshots (e.g. a cloud monitoring service)
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Aggregate utilization for an instance over the trailing `window`
    async fn get_metrics(&self, instance_id: &str, window: Duration)
        -> anyhow::Result<UsageMetrics>;
}

/// Fetches one validated snapshot per instance and remembers the last one seen
pub struct MetricsSampler {
    provider: Arc<dyn MetricsProvider>,
    window: Duration,
    last_seen: DashMap<String, UsageMetrics>,
}

impl MetricsSampler {
    pub fn new(provider: Arc<dyn MetricsProvider>, window: Duration) -> Self {
        Self {
            provider,
            window,
            last_seen: DashMap::new(),
        }
    }

    /// Sample an instance. Provider failures and malformed snapshots are
    /// reported as `IdleError::Provider`.
    pub async fn sample(&self, instance_id: &str) -> Result<UsageMetrics> {
        let metrics = self
            .provider
            .get_metrics(instance_id, self.window)
            .await
            .map_err(|e| IdleError::provider(instance_id, format!("{:#}", e)))?;

        metrics
            .validate()
            .map_err(|reason| IdleError::provider(instance_id, reason))?;

        if let Some(previous) = self.last_seen.get(instance_id) {
            if metrics.timestamp < previous.timestamp {
                return Err(IdleError::provider(
                    instance_id,
                    format!(
                        "snapshot at {} is older than last seen {}",
                        metrics.timestamp, previous.timestamp
                    ),
                ));
            }
        }

        debug!(
            instance_id = %instance_id,
            cpu = metrics.cpu_pct,
            mem = metrics.mem_pct,
            activity = metrics.has_activity,
            "Sampled metrics"
        );
        self.last_seen
            .insert(instance_id.to_string(), metrics.clone());
        Ok(metrics)
    }

    pub fn last_seen(&self, instance_id: &str) -> Option<UsageMetrics> {
        self.last_seen.get(instance_id).map(|m| m.clone())
    }

    pub fn forget(&self, instance_id: &str) {
        self.last_seen.remove(instance_id);
    }
}
