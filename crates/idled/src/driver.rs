//! Polling loop
//!
//! Each cycle samples every registered instance in parallel (bounded by a
//! semaphore), then runs one action sweep.

use idle_lib::{IdleError, Manager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Time between cycles
    pub interval: Duration,
    /// Maximum concurrent samples
    pub worker_pool_size: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            worker_pool_size: 8,
        }
    }
}

/// Counts from one polling cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub sampled: usize,
    pub provider_errors: usize,
    /// Samples applied with a fallback policy
    pub policy_fallbacks: usize,
    pub other_errors: usize,
    pub actions: usize,
    pub action_failures: usize,
    pub deferred: usize,
}

pub struct PollingDriver {
    manager: Arc<Manager>,
    config: DriverConfig,
    limiter: Arc<Semaphore>,
}

impl PollingDriver {
    pub fn new(manager: Arc<Manager>, config: DriverConfig) -> Self {
        let limiter = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            manager,
            config,
            limiter,
        }
    }

    /// Run until the shutdown signal fires
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            workers = self.config.worker_pool_size,
            "Starting polling loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let summary = self.run_cycle().await;
                    info!(
                        sampled = summary.sampled,
                        provider_errors = summary.provider_errors,
                        actions = summary.actions,
                        action_failures = summary.action_failures,
                        deferred = summary.deferred,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Polling cycle complete"
                    );
                }
                _ = shutdown.recv() => {
                    info!("Shutting down polling loop");
                    break;
                }
            }
        }
    }

    /// One cycle: sample all registered instances, then sweep
    pub async fn run_cycle(&self) -> CycleSummary {
        let mut summary = CycleSummary::default();
        let mut tasks = JoinSet::new();

        for instance in self.manager.instances() {
            let manager = self.manager.clone();
            let limiter = self.limiter.clone();
            tasks.spawn(async move {
                let _permit = limiter.acquire_owned().await;
                let result = manager.sample_and_process(&instance.instance_id).await;
                (instance.instance_id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (instance_id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Sampling task panicked");
                    summary.other_errors += 1;
                    continue;
                }
            };

            match result {
                Ok(_) => summary.sampled += 1,
                Err(IdleError::Provider { reason, .. }) => {
                    debug!(instance_id = %instance_id, reason = %reason, "No usable sample");
                    summary.provider_errors += 1;
                }
                Err(err @ IdleError::PolicyNotFound { .. }) => {
                    warn!(instance_id = %instance_id, error = %err, "Sample applied with fallback policy");
                    summary.sampled += 1;
                    summary.policy_fallbacks += 1;
                }
                Err(err) => {
                    error!(instance_id = %instance_id, error = %err, "Failed to process sample");
                    summary.other_errors += 1;
                }
            }
        }

        let sweep = self.manager.execute_ready_actions().await;
        summary.actions = sweep.entries.len();
        summary.action_failures = sweep.failed();
        summary.deferred = sweep.deferred;
        if sweep.persistence_degraded() {
            error!("Persistence degraded; idle state on disk is stale");
        }

        summary
    }
}
