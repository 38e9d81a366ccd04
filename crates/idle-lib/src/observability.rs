//! Observability for the idle lifecycle manager
//!
//! Provides:
//! - Prometheus metrics held in a registry owned by each manager
//! - Named structured log events via tracing

use crate::error::{IdleError, Result};
use crate::models::{ActionOutcome, IdleAction};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for lifecycle call latency (in seconds)
const ACTION_LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Prometheus metrics for one manager
///
/// Clones share the same underlying metrics.
#[derive(Clone)]
pub struct IdleMetrics {
    registry: Registry,
    samples_processed: IntCounter,
    provider_errors: IntCounter,
    actions_total: IntCounterVec,
    persistence_failures: IntCounter,
    idle_instances: IntGauge,
    tracked_instances: IntGauge,
    action_latency_seconds: Histogram,
}

impl IdleMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let samples_processed = IntCounter::new(
            "idle_manager_samples_processed_total",
            "Metrics samples classified",
        )
        .map_err(metrics_error)?;
        let provider_errors = IntCounter::new(
            "idle_manager_provider_errors_total",
            "Samples rejected because metrics were unavailable or malformed",
        )
        .map_err(metrics_error)?;
        let actions_total = IntCounterVec::new(
            Opts::new(
                "idle_manager_actions_total",
                "Idle actions executed by requested action and outcome",
            ),
            &["action", "outcome"],
        )
        .map_err(metrics_error)?;
        let persistence_failures = IntCounter::new(
            "idle_manager_persistence_failures_total",
            "Failed writes of state, policy or history",
        )
        .map_err(metrics_error)?;
        let idle_instances = IntGauge::new(
            "idle_manager_idle_instances",
            "Instances currently in an idle episode",
        )
        .map_err(metrics_error)?;
        let tracked_instances = IntGauge::new(
            "idle_manager_tracked_instances",
            "Instances with idle state",
        )
        .map_err(metrics_error)?;
        let action_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "idle_manager_action_latency_seconds",
                "Time spent in lifecycle calls per action",
            )
            .buckets(ACTION_LATENCY_BUCKETS.to_vec()),
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(samples_processed.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(provider_errors.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(actions_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(persistence_failures.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(idle_instances.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(tracked_instances.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(action_latency_seconds.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            samples_processed,
            provider_errors,
            actions_total,
            persistence_failures,
            idle_instances,
            tracked_instances,
            action_latency_seconds,
        })
    }

    /// Registry for exposition (e.g. a `/metrics` endpoint)
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn inc_samples_processed(&self) {
        self.samples_processed.inc();
    }

    pub fn inc_provider_errors(&self) {
        self.provider_errors.inc();
    }

    pub fn inc_persistence_failures(&self) {
        self.persistence_failures.inc();
    }

    pub fn record_action(&self, action: IdleAction, outcome: ActionOutcome, latency: Duration) {
        self.actions_total
            .with_label_values(&[&action.to_string(), &outcome.to_string()])
            .inc();
        self.action_latency_seconds.observe(latency.as_secs_f64());
    }

    pub fn set_instance_counts(&self, tracked: i64, idle: i64) {
        self.tracked_instances.set(tracked);
        self.idle_instances.set(idle);
    }
}

fn metrics_error(e: prometheus::Error) -> IdleError {
    IdleError::Metrics(e.to_string())
}

/// Structured logger for idle lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_episode_started(&self, instance_id: &str, policy: &str, action: IdleAction, execute_at: &str) {
        info!(
            event = "episode_started",
            node = %self.node_name,
            instance_id = %instance_id,
            policy = %policy,
            action = %action,
            execute_at = %execute_at,
            "Instance became idle"
        );
    }

    pub fn log_episode_ended(&self, instance_id: &str, idle_secs: i64) {
        info!(
            event = "episode_ended",
            node = %self.node_name,
            instance_id = %instance_id,
            idle_secs = idle_secs,
            "Instance is active again"
        );
    }

    pub fn log_rescheduled(&self, instance_id: &str, policy: &str, action: IdleAction) {
        info!(
            event = "action_rescheduled",
            node = %self.node_name,
            instance_id = %instance_id,
            policy = %policy,
            action = %action,
            "Policy changed during idle episode"
        );
    }

    pub fn log_action_executed(
        &self,
        instance_id: &str,
        requested: IdleAction,
        performed: IdleAction,
        outcome: ActionOutcome,
        dry_run: bool,
    ) {
        info!(
            event = "action_executed",
            node = %self.node_name,
            instance_id = %instance_id,
            requested = %requested,
            performed = %performed,
            outcome = %outcome,
            dry_run = dry_run,
            "Idle action executed"
        );
    }

    pub fn log_action_failed(&self, instance_id: &str, action: IdleAction, error: &str) {
        warn!(
            event = "action_failed",
            node = %self.node_name,
            instance_id = %instance_id,
            action = %action,
            error = %error,
            "Idle action failed, will retry next sweep"
        );
    }

    pub fn log_persistence_failed(&self, backend: &str, error: &str, consecutive: u32) {
        warn!(
            event = "persistence_failed",
            node = %self.node_name,
            backend = backend,
            error = %error,
            consecutive_failures = consecutive,
            "Failed to persist idle data"
        );
    }

    pub fn log_startup(&self, version: &str, instances: usize, policies: usize) {
        info!(
            event = "manager_started",
            node = %self.node_name,
            version = %version,
            restored_instances = instances,
            policies = policies,
            "Idle manager started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "manager_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Idle manager shutting down"
        );
    }
}
