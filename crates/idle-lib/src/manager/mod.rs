//! Idle manager: the composition root
//!
//! A `Manager` owns its policy catalog, state table, history, metrics and
//! health registry. It holds no threads or timers; the daemon drives it once
//! per polling cycle through `sample_and_process` and
//! `execute_ready_actions`.

#[cfg(test)]
mod tests;

use crate::action::{ActionExecutor, LifecycleController, NotificationSink};
use crate::clock::{Clock, SystemClock};
use crate::config::ManagerConfig;
use crate::error::{IdleError, Result};
use crate::health::{Component, HealthRegistry};
use crate::history::HistoryStore;
use crate::idle::{ActionScheduler, StateTracker, Transition};
use crate::models::{
    HistoryEntry, HistoryFilter, IdleState, InstanceInfo, PendingAction, UsageMetrics,
};
use crate::observability::{IdleMetrics, StructuredLogger};
use crate::policy::{IdlePolicy, InstanceOverride, PolicyCatalog, PolicyConfig};
use crate::sampler::{MetricsProvider, MetricsSampler};
use crate::store::{
    HistoryLog, MemoryHistoryLog, MemoryPolicyStore, MemoryStateStore, PolicyStore, StateStore,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Outcome of one `execute_ready_actions` sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// History entries recorded this sweep, failures included
    pub entries: Vec<HistoryEntry>,
    /// Errors from individual actions; the sweep itself carried on
    #[serde(serialize_with = "serialize_errors")]
    pub failures: Vec<IdleError>,
    /// Due actions left for the next sweep by `max_actions_per_sweep`
    pub deferred: usize,
    /// Due actions already being executed by a concurrent sweep
    pub skipped: usize,
}

impl SweepReport {
    pub fn succeeded(&self) -> usize {
        self.entries.len().saturating_sub(self.failed())
    }

    pub fn failed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.outcome == crate::models::ActionOutcome::Failure)
            .count()
    }

    /// Whether persistence crossed the failure threshold during the sweep
    pub fn persistence_degraded(&self) -> bool {
        self.failures
            .iter()
            .any(|e| matches!(e, IdleError::PersistenceDegraded { .. }))
    }
}

fn serialize_errors<S: serde::Serializer>(
    errors: &[IdleError],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(errors.iter().map(|e| e.to_string()))
}

/// Builder for `Manager`
///
/// Stores default to in-memory backends and the clock to wall-clock time.
pub struct ManagerBuilder {
    config: ManagerConfig,
    node_name: String,
    provider: Arc<dyn MetricsProvider>,
    controller: Arc<dyn LifecycleController>,
    notifier: Arc<dyn NotificationSink>,
    state_store: Option<Arc<dyn StateStore>>,
    policy_store: Option<Arc<dyn PolicyStore>>,
    history_log: Option<Arc<dyn HistoryLog>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ManagerBuilder {
    pub fn new(
        provider: Arc<dyn MetricsProvider>,
        controller: Arc<dyn LifecycleController>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config: ManagerConfig::default(),
            node_name: "idle-manager".to_string(),
            provider,
            controller,
            notifier,
            state_store: None,
            policy_store: None,
            history_log: None,
            clock: None,
        }
    }

    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn policy_store(mut self, store: Arc<dyn PolicyStore>) -> Self {
        self.policy_store = Some(store);
        self
    }

    pub fn history_log(mut self, log: Arc<dyn HistoryLog>) -> Self {
        self.history_log = Some(log);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Load policies, state and history and assemble the manager.
    ///
    /// An invalid persisted policy document is fatal.
    pub async fn build(self) -> Result<Manager> {
        let policy_store = self
            .policy_store
            .unwrap_or_else(|| Arc::new(MemoryPolicyStore::new()));
        let state_store = self
            .state_store
            .unwrap_or_else(|| Arc::new(MemoryStateStore::new()));
        let history_log = self
            .history_log
            .unwrap_or_else(|| Arc::new(MemoryHistoryLog::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let catalog = match policy_store
            .load()
            .map_err(|e| IdleError::persistence("policies", &e))?
        {
            Some(config) => PolicyCatalog::from_config(config)?,
            None => {
                info!("No policy document found, installing built-in policies");
                let catalog = PolicyCatalog::default();
                policy_store
                    .save(catalog.config())
                    .map_err(|e| IdleError::persistence("policies", &e))?;
                catalog
            }
        };

        let tracker = StateTracker::new(state_store);
        let restored = tracker.restore()?;
        let history = HistoryStore::open(history_log)?;

        let metrics = IdleMetrics::new()?;
        let health = HealthRegistry::new();

        let logger = StructuredLogger::new(&self.node_name);
        logger.log_startup(env!("CARGO_PKG_VERSION"), restored, catalog.list().len());

        let executor = ActionExecutor::new(
            self.controller,
            self.notifier,
            self.config.action_timeout(),
            self.config.dry_run,
        );
        let sampler = MetricsSampler::new(self.provider, self.config.metrics_window());

        let manager = Manager {
            config: self.config,
            clock,
            catalog: RwLock::new(catalog),
            policy_store,
            tracker,
            sampler,
            executor,
            history,
            instances: DashMap::new(),
            persist_failures: Default::default(),
            metrics,
            health,
            logger,
        };
        manager.refresh_gauges().await;
        Ok(manager)
    }
}

/// Persistence backend a write went to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    State,
    Policy,
    History,
}

impl Backend {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        self as usize
    }

    fn as_str(self) -> &'static str {
        match self {
            Backend::State => "state",
            Backend::Policy => "policy",
            Backend::History => "history",
        }
    }
}

pub struct Manager {
    config: ManagerConfig,
    clock: Arc<dyn Clock>,
    catalog: RwLock<PolicyCatalog>,
    policy_store: Arc<dyn PolicyStore>,
    tracker: StateTracker,
    sampler: MetricsSampler,
    executor: ActionExecutor,
    history: HistoryStore,
    instances: DashMap<String, InstanceInfo>,
    /// Consecutive write failures, one counter per backend
    persist_failures: [AtomicU32; Backend::COUNT],
    metrics: IdleMetrics,
    health: HealthRegistry,
    logger: StructuredLogger,
}

impl Manager {
    pub fn builder(
        provider: Arc<dyn MetricsProvider>,
        controller: Arc<dyn LifecycleController>,
        notifier: Arc<dyn NotificationSink>,
    ) -> ManagerBuilder {
        ManagerBuilder::new(provider, controller, notifier)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn metrics(&self) -> &IdleMetrics {
        &self.metrics
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    // ---- metrics processing ----

    /// Fetch a sample from the provider and classify it.
    ///
    /// A provider failure leaves the instance's state untouched.
    pub async fn sample_and_process(&self, instance_id: &str) -> Result<IdleState> {
        let metrics = match self.sampler.sample(instance_id).await {
            Ok(metrics) => metrics,
            Err(err) => {
                self.metrics.inc_provider_errors();
                warn!(instance_id = %instance_id, error = %err, "Failed to sample metrics");
                self.health
                    .set_degraded(Component::Sampler, err.to_string())
                    .await;
                return Err(err);
            }
        };

        self.health.set_healthy(Component::Sampler).await;
        self.process_metrics(instance_id, metrics).await
    }

    /// Classify a sample and update the instance's idle episode.
    ///
    /// When the assigned policy is missing the sample is still applied using
    /// a fallback policy and `PolicyNotFound` is returned.
    pub async fn process_metrics(&self, instance_id: &str, metrics: UsageMetrics) -> Result<IdleState> {
        if let Err(reason) = metrics.validate() {
            self.metrics.inc_provider_errors();
            return Err(IdleError::provider(instance_id, reason));
        }

        let info = self.instances.get(instance_id).map(|i| i.value().clone());
        let name = info
            .as_ref()
            .map(|i| i.instance_name.clone())
            .unwrap_or_else(|| instance_id.to_string());
        let domain = info.and_then(|i| i.domain);

        let (resolved, default) = {
            let catalog = self.catalog.read().await;
            (
                catalog.resolve(instance_id, domain.as_deref()),
                catalog.default_policy().clone(),
            )
        };

        let update = match self
            .tracker
            .process(instance_id, &name, metrics, resolved, &default)
            .await
        {
            Ok(update) => update,
            Err(err) => {
                self.metrics.inc_provider_errors();
                return Err(err);
            }
        };
        self.metrics.inc_samples_processed();

        let state = &update.state;
        match update.transition {
            Transition::EpisodeStarted => {
                if let Some(ref scheduled) = state.scheduled_action {
                    self.logger.log_episode_started(
                        instance_id,
                        &state.policy_name,
                        scheduled.action,
                        &scheduled.execute_at.to_rfc3339(),
                    );
                }
            }
            Transition::Rescheduled => {
                if let Some(ref scheduled) = state.scheduled_action {
                    self.logger
                        .log_rescheduled(instance_id, &state.policy_name, scheduled.action);
                }
            }
            Transition::EpisodeEnded { idle_secs } => {
                self.logger.log_episode_ended(instance_id, idle_secs);
            }
            Transition::Unchanged => {}
        }

        self.persisted(Backend::State, update.persist_error).await?;
        if let Some(err) = update.policy_error {
            return Err(err);
        }
        Ok(update.state)
    }

    // ---- action scheduling and execution ----

    /// Due actions, longest-idle first. Empty while idle management is disabled.
    pub async fn pending_actions(&self) -> Vec<PendingAction> {
        if !self.is_enabled().await {
            return Vec::new();
        }
        ActionScheduler::new(&self.tracker)
            .pending(self.clock.now())
            .await
    }

    /// Execute due actions.
    ///
    /// A failing action does not stop the sweep; it is recorded in history
    /// with outcome `failure` and stays pending for the next sweep.
    pub async fn execute_ready_actions(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let mut pending = self.pending_actions().await;
        let cap = self.config.max_actions_per_sweep;
        if pending.len() > cap {
            report.deferred = pending.len() - cap;
            pending.truncate(cap);
            info!(deferred = report.deferred, "Action cap reached, deferring remaining actions");
        }

        for action in pending {
            let Some(_claim) = self.executor.try_claim(&action.instance_id) else {
                report.skipped += 1;
                continue;
            };
            // a concurrent sweep may have finished this action before we claimed it
            if !self.tracker.commit_execution(&action, false).await.episode_current {
                report.skipped += 1;
                continue;
            }

            let notify_first = self.effective_policy(&action.instance_id).await.notify;
            let requested_at = self.clock.now();
            let exec = self.executor.execute(&action, notify_first).await;
            self.metrics
                .record_action(action.action, exec.outcome, exec.latency);

            let entry = HistoryEntry {
                instance_id: action.instance_id.clone(),
                instance_name: action.instance_name.clone(),
                requested_action: action.action,
                performed_action: exec.performed,
                requested_at,
                outcome: exec.outcome,
                idle_duration_secs: (requested_at - action.idle_since).num_seconds(),
                metrics: action.metrics.clone(),
                error: exec.error.as_ref().map(|e| e.to_string()),
                dry_run: exec.dry_run,
            };

            match (exec.performed, exec.error) {
                (Some(performed), _) => {
                    let commit = self.tracker.commit_execution(&action, true).await;
                    if !commit.episode_current {
                        debug!(
                            instance_id = %action.instance_id,
                            "Episode ended while the action was running"
                        );
                    }
                    if let Err(err) = self.persisted(Backend::State, commit.persist_error).await {
                        report.failures.push(err);
                    }
                    self.logger.log_action_executed(
                        &action.instance_id,
                        action.action,
                        performed,
                        exec.outcome,
                        exec.dry_run,
                    );
                }
                (None, error) => {
                    let error = error.unwrap_or_else(|| IdleError::Execution {
                        instance_id: action.instance_id.clone(),
                        action: action.action,
                        reason: "no action performed".to_string(),
                    });
                    self.logger
                        .log_action_failed(&action.instance_id, action.action, &error.to_string());
                    report.failures.push(error);
                }
            }

            let appended = self.history.append(entry.clone()).err();
            if let Err(err) = self.persisted(Backend::History, appended).await {
                report.failures.push(err);
            }
            report.entries.push(entry);
        }

        if report.failed() > 0 {
            self.health
                .set_degraded(
                    Component::Executor,
                    format!("{} action(s) failed in last sweep", report.failed()),
                )
                .await;
        } else if !report.entries.is_empty() {
            self.health.set_healthy(Component::Executor).await;
        }

        self.refresh_gauges().await;
        report
    }

    /// Start an instance and end its idle episode
    pub async fn start_instance(&self, instance_id: &str) -> Result<()> {
        if !self.instances.contains_key(instance_id) && self.tracker.get(instance_id).await.is_none() {
            return Err(IdleError::UnknownInstance {
                instance_id: instance_id.to_string(),
            });
        }

        self.executor.start(instance_id).await?;
        info!(instance_id = %instance_id, "Instance started");

        match self.tracker.end_episode(instance_id, self.clock.now()).await {
            Ok(_) => self.persisted(Backend::State, None).await,
            Err(err) => self.persisted(Backend::State, Some(err)).await,
        }
    }

    // ---- policy catalog ----

    pub async fn list_profiles(&self) -> Vec<IdlePolicy> {
        self.catalog.read().await.list()
    }

    pub async fn get_profile(&self, name: &str) -> Option<IdlePolicy> {
        self.catalog.read().await.get(name).cloned()
    }

    pub async fn policy_config(&self) -> PolicyConfig {
        self.catalog.read().await.config().clone()
    }

    pub async fn upsert_profile(&self, policy: IdlePolicy) -> Result<()> {
        self.mutate_catalog(|catalog| catalog.upsert(policy)).await
    }

    pub async fn remove_profile(&self, name: &str) -> Result<IdlePolicy> {
        self.mutate_catalog(|catalog| catalog.remove(name)).await
    }

    pub async fn set_default_profile(&self, name: &str) -> Result<()> {
        self.mutate_catalog(|catalog| catalog.set_default(name)).await
    }

    pub async fn set_domain_mapping(&self, domain: &str, policy: &str) -> Result<()> {
        self.mutate_catalog(|catalog| catalog.set_domain_mapping(domain, policy))
            .await
    }

    pub async fn remove_domain_mapping(&self, domain: &str) -> Result<Option<String>> {
        self.mutate_catalog(|catalog| Ok(catalog.remove_domain_mapping(domain)))
            .await
    }

    /// Assign a named policy to an instance; applied from its next sample
    pub async fn set_instance_policy(&self, instance_id: &str, policy: &str) -> Result<()> {
        self.mutate_catalog(|catalog| catalog.set_instance_policy(instance_id, policy))
            .await
    }

    pub async fn set_instance_override(&self, instance_id: &str, over: InstanceOverride) -> Result<()> {
        self.mutate_catalog(|catalog| catalog.set_instance_override(instance_id, over))
            .await
    }

    pub async fn clear_instance_policy(&self, instance_id: &str) -> Result<Option<InstanceOverride>> {
        self.mutate_catalog(|catalog| Ok(catalog.clear_instance_override(instance_id)))
            .await
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.mutate_catalog(|catalog| {
            catalog.set_enabled(enabled);
            Ok(())
        })
        .await?;
        info!(enabled = enabled, "Idle management toggled");
        Ok(())
    }

    pub async fn is_enabled(&self) -> bool {
        self.catalog.read().await.is_enabled()
    }

    /// Policy currently in effect for an instance, falling back to the default
    pub async fn effective_policy(&self, instance_id: &str) -> IdlePolicy {
        let domain = self
            .instances
            .get(instance_id)
            .and_then(|i| i.domain.clone());
        let catalog = self.catalog.read().await;
        catalog
            .resolve(instance_id, domain.as_deref())
            .unwrap_or_else(|_| catalog.default_policy().clone())
    }

    async fn mutate_catalog<T>(
        &self,
        change: impl FnOnce(&mut PolicyCatalog) -> Result<T>,
    ) -> Result<T> {
        let mut catalog = self.catalog.write().await;
        let value = change(&mut catalog)?;
        let saved = self
            .policy_store
            .save(catalog.config())
            .err()
            .map(|e| IdleError::persistence("policies", &e));
        drop(catalog);

        self.persisted(Backend::Policy, saved).await?;
        Ok(value)
    }

    // ---- instances and state ----

    /// Record an instance's name and research domain
    pub fn register_instance(&self, info: InstanceInfo) {
        debug!(instance_id = %info.instance_id, domain = ?info.domain, "Registered instance");
        self.instances.insert(info.instance_id.clone(), info);
    }

    /// Forget an instance, including its persisted state
    pub async fn deregister_instance(&self, instance_id: &str) -> Result<Option<IdleState>> {
        self.instances.remove(instance_id);
        self.sampler.forget(instance_id);
        match self.tracker.remove(instance_id).await {
            Ok(state) => {
                self.persisted(Backend::State, None).await?;
                Ok(state)
            }
            Err(err) => {
                self.persisted(Backend::State, Some(err)).await?;
                Ok(None)
            }
        }
    }

    /// Registered instances, ordered by id
    pub fn instances(&self) -> Vec<InstanceInfo> {
        let mut list: Vec<InstanceInfo> = self.instances.iter().map(|i| i.value().clone()).collect();
        list.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        list
    }

    pub async fn get_instance_state(&self, instance_id: &str) -> Result<IdleState> {
        self.tracker
            .get(instance_id)
            .await
            .ok_or_else(|| IdleError::UnknownInstance {
                instance_id: instance_id.to_string(),
            })
    }

    pub async fn list_states(&self) -> Vec<IdleState> {
        self.tracker.list().await
    }

    pub fn history(&self, filter: &HistoryFilter) -> Vec<HistoryEntry> {
        self.history.query(filter)
    }

    pub fn shutdown(&self, reason: &str) {
        self.logger.log_shutdown(reason);
    }

    // ---- internals ----

    /// Account for the result of a write to `backend`.
    ///
    /// Failures are counted per backend, so a healthy backend cannot mask one
    /// that keeps failing. Single failures are logged and counted; reaching
    /// the threshold on one backend yields `PersistenceDegraded`.
    async fn persisted(&self, backend: Backend, error: Option<IdleError>) -> Result<()> {
        let counter = &self.persist_failures[backend.index()];
        let threshold = self.config.persistence_failure_threshold.max(1);

        let Some(error) = error else {
            if counter.swap(0, Ordering::SeqCst) > 0 {
                info!(backend = backend.as_str(), "Persistence recovered");
                if self.worst_persist_failures() == 0 {
                    self.health.set_healthy(Component::Persistence).await;
                }
            }
            return Ok(());
        };

        let consecutive = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let message = error.to_string();
        self.metrics.inc_persistence_failures();
        self.logger
            .log_persistence_failed(backend.as_str(), &message, consecutive);

        if consecutive >= threshold {
            self.health
                .set_unhealthy(Component::Persistence, message.clone())
                .await;
            return Err(IdleError::PersistenceDegraded {
                consecutive_failures: consecutive,
                last_error: message,
            });
        }

        // another backend past the threshold keeps the component unhealthy
        if self.worst_persist_failures() < threshold {
            self.health
                .set_degraded(Component::Persistence, message)
                .await;
        }
        Ok(())
    }

    fn worst_persist_failures(&self) -> u32 {
        self.persist_failures
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .max()
            .unwrap_or(0)
    }

    async fn refresh_gauges(&self) {
        let states = self.tracker.list().await;
        let idle = states.iter().filter(|s| s.is_idle).count();
        self.metrics
            .set_instance_counts(states.len() as i64, idle as i64);
    }
}
