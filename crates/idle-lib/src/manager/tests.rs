//! Scenario tests for the manager, driven by a manual clock

use super::*;
use crate::action::Severity;
use crate::clock::ManualClock;
use crate::health::ComponentStatus;
use crate::models::{ActionOutcome, IdleAction};
use crate::policy::Thresholds;
use crate::store::{JsonHistoryLog, JsonPolicyStore, JsonStateStore};
use async_trait::async_trait;
use chrono::{Duration, TimeZone};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;
use tempfile::TempDir;

#[derive(Default)]
struct MockProvider {
    queued: Mutex<HashMap<String, VecDeque<anyhow::Result<UsageMetrics>>>>,
}

impl MockProvider {
    fn push(&self, instance_id: &str, result: anyhow::Result<UsageMetrics>) {
        self.queued
            .lock()
            .unwrap()
            .entry(instance_id.to_string())
            .or_default()
            .push_back(result);
    }
}

#[async_trait]
impl MetricsProvider for MockProvider {
    async fn get_metrics(
        &self,
        instance_id: &str,
        _window: std::time::Duration,
    ) -> anyhow::Result<UsageMetrics> {
        self.queued
            .lock()
            .unwrap()
            .get_mut(instance_id)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Err(anyhow::anyhow!("no datapoints")))
    }
}

#[derive(Default)]
struct MockController {
    calls: Mutex<Vec<String>>,
    hibernate_supported: bool,
    failing: AtomicBool,
    delay_ms: u64,
}

impl MockController {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl LifecycleController for MockController {
    async fn hibernate(&self, instance_id: &str) -> anyhow::Result<bool> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("hibernate:{}", instance_id));
        Ok(self.hibernate_supported)
    }

    async fn stop(&self, instance_id: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("stop:{}", instance_id));
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("UnauthorizedOperation");
        }
        Ok(())
    }

    async fn start(&self, instance_id: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("start:{}", instance_id));
        Ok(())
    }
}

#[derive(Default)]
struct MockNotifier {
    sent: Mutex<Vec<(String, Severity)>>,
}

#[async_trait]
impl NotificationSink for MockNotifier {
    async fn notify(&self, instance_id: &str, _message: &str, severity: Severity) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((instance_id.to_string(), severity));
        Ok(())
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap()
}

fn sample(minute: i64, cpu: f64) -> UsageMetrics {
    UsageMetrics {
        timestamp: t0() + Duration::minutes(minute),
        cpu_pct: cpu,
        mem_pct: 12.0,
        net_kbps: 3.0,
        disk_kbps: 1.0,
        gpu_pct: None,
        has_activity: false,
    }
}

/// cpu < 10% for 5 minutes, then `action`
fn quick_policy(name: &str, action: IdleAction) -> IdlePolicy {
    IdlePolicy {
        name: name.to_string(),
        description: "test policy".to_string(),
        thresholds: Thresholds {
            cpu_pct: Some(10.0),
            ..Default::default()
        },
        idle_minutes: 5,
        action,
        notify: false,
    }
}

struct Harness {
    manager: Manager,
    clock: Arc<ManualClock>,
    provider: Arc<MockProvider>,
    controller: Arc<MockController>,
    notifier: Arc<MockNotifier>,
}

impl Harness {
    async fn new(controller: MockController, config: ManagerConfig) -> Self {
        Self::with_stores(controller, config, |b| b).await
    }

    async fn with_stores(
        controller: MockController,
        config: ManagerConfig,
        stores: impl FnOnce(ManagerBuilder) -> ManagerBuilder,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let provider = Arc::new(MockProvider::default());
        let controller = Arc::new(controller);
        let notifier = Arc::new(MockNotifier::default());

        let builder = Manager::builder(provider.clone(), controller.clone(), notifier.clone())
            .config(config)
            .node_name("test-node")
            .clock(clock.clone());
        let manager = stores(builder).build().await.unwrap();

        manager
            .upsert_profile(quick_policy("quick", IdleAction::Stop))
            .await
            .unwrap();
        manager.set_default_profile("quick").await.unwrap();

        Self {
            manager,
            clock,
            provider,
            controller,
            notifier,
        }
    }

    /// Feed a sample with the clock set to its timestamp
    async fn feed(&self, id: &str, metrics: UsageMetrics) -> Result<IdleState> {
        self.clock.set(metrics.timestamp);
        self.manager.process_metrics(id, metrics).await
    }
}

async fn harness() -> Harness {
    Harness::new(MockController::default(), ManagerConfig::default()).await
}

#[tokio::test]
async fn test_activity_always_busy() {
    let h = harness().await;

    for minute in 0..20 {
        let metrics = UsageMetrics {
            has_activity: true,
            ..sample(minute, 0.0)
        };
        let state = h.feed("i-1", metrics).await.unwrap();
        assert!(!state.is_idle);
    }

    assert!(h.manager.execute_ready_actions().await.entries.is_empty());
    assert!(h.manager.history(&HistoryFilter::default()).is_empty());
}

#[tokio::test]
async fn test_action_due_only_after_idle_window() {
    let h = harness().await;

    for minute in 0..5 {
        h.feed("i-1", sample(minute, 2.0)).await.unwrap();
        assert!(
            h.manager.pending_actions().await.is_empty(),
            "nothing due after sample at minute {}",
            minute
        );
    }

    h.feed("i-1", sample(5, 2.0)).await.unwrap();
    let pending = h.manager.pending_actions().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action, IdleAction::Stop);
    assert_eq!(pending[0].idle_since, t0());
}

#[tokio::test]
async fn test_busy_sample_resets_episode() {
    let h = harness().await;

    h.feed("i-1", sample(0, 2.0)).await.unwrap();
    h.feed("i-1", sample(1, 2.0)).await.unwrap();
    let state = h.feed("i-1", sample(2, 50.0)).await.unwrap();
    assert!(state.idle_since.is_none());

    for minute in 3..8 {
        h.feed("i-1", sample(minute, 2.0)).await.unwrap();
        assert!(h.manager.pending_actions().await.is_empty());
    }
    let state = h.feed("i-1", sample(8, 2.0)).await.unwrap();
    assert_eq!(state.idle_since, Some(t0() + Duration::minutes(3)));
    assert_eq!(h.manager.pending_actions().await.len(), 1);
}

#[tokio::test]
async fn test_action_fires_once_per_episode() {
    let h = harness().await;
    for minute in 0..=5 {
        h.feed("i-1", sample(minute, 1.0)).await.unwrap();
    }

    let first = h.manager.execute_ready_actions().await;
    assert_eq!(first.entries.len(), 1);
    assert_eq!(first.entries[0].outcome, ActionOutcome::Success);
    assert_eq!(first.entries[0].idle_duration_secs, 300);

    let second = h.manager.execute_ready_actions().await;
    assert!(second.entries.is_empty());
    assert_eq!(h.controller.count("stop:"), 1);

    // still idle, same episode: no new action
    h.feed("i-1", sample(6, 1.0)).await.unwrap();
    assert!(h.manager.execute_ready_actions().await.entries.is_empty());

    // new episode fires again
    h.feed("i-1", sample(7, 90.0)).await.unwrap();
    for minute in 8..=13 {
        h.feed("i-1", sample(minute, 1.0)).await.unwrap();
    }
    assert_eq!(h.manager.execute_ready_actions().await.entries.len(), 1);
    assert_eq!(h.controller.count("stop:"), 2);
}

#[tokio::test]
async fn test_concurrent_sweeps_fire_once() {
    let h = Harness::new(
        MockController {
            delay_ms: 50,
            ..Default::default()
        },
        ManagerConfig::default(),
    )
    .await;
    for minute in 0..=5 {
        h.feed("i-1", sample(minute, 1.0)).await.unwrap();
    }

    let (a, b) = tokio::join!(
        h.manager.execute_ready_actions(),
        h.manager.execute_ready_actions()
    );
    assert_eq!(a.entries.len() + b.entries.len(), 1);
    assert_eq!(a.skipped + b.skipped, 1);
    assert_eq!(h.controller.count("stop:"), 1);
}

#[tokio::test]
async fn test_reload_continues_classification() {
    let dir = TempDir::new().unwrap();
    let stores = |dir: &std::path::Path| {
        let dir = dir.to_path_buf();
        move |b: ManagerBuilder| {
            b.state_store(Arc::new(JsonStateStore::new(dir.join("state"))))
                .policy_store(Arc::new(JsonPolicyStore::new(dir.join("policies.json"))))
                .history_log(Arc::new(JsonHistoryLog::new(dir.join("history.jsonl"))))
        }
    };

    let before = Harness::with_stores(
        MockController::default(),
        ManagerConfig::default(),
        stores(dir.path()),
    )
    .await;
    for minute in 0..3 {
        before.feed("i-1", sample(minute, 1.0)).await.unwrap();
    }
    drop(before);

    let after = Harness::with_stores(
        MockController::default(),
        ManagerConfig::default(),
        stores(dir.path()),
    )
    .await;
    let restored = after.manager.get_instance_state("i-1").await.unwrap();
    assert_eq!(restored.idle_since, Some(t0()));

    let reference = harness().await;
    for minute in 0..6 {
        reference.feed("i-1", sample(minute, 1.0)).await.unwrap();
    }
    for minute in 3..6 {
        after.feed("i-1", sample(minute, 1.0)).await.unwrap();
    }

    let continued = after.manager.get_instance_state("i-1").await.unwrap();
    let expected = reference.manager.get_instance_state("i-1").await.unwrap();
    assert_eq!(continued.idle_since, expected.idle_since);
    assert_eq!(continued.scheduled_action, expected.scheduled_action);
    assert_eq!(continued.executed, expected.executed);
    assert_eq!(after.manager.pending_actions().await.len(), 1);
}

#[tokio::test]
async fn test_hibernate_unsupported_falls_back_to_stop() {
    let h = harness().await;
    h.manager
        .upsert_profile(quick_policy("sleepy", IdleAction::Hibernate))
        .await
        .unwrap();
    h.manager.set_instance_policy("i-1", "sleepy").await.unwrap();

    for minute in 0..=5 {
        h.feed("i-1", sample(minute, 1.0)).await.unwrap();
    }
    let report = h.manager.execute_ready_actions().await;

    assert_eq!(report.entries.len(), 1);
    let entry = &report.entries[0];
    assert_eq!(entry.outcome, ActionOutcome::Fallback);
    assert_eq!(entry.requested_action, IdleAction::Hibernate);
    assert_eq!(entry.performed_action, Some(IdleAction::Stop));
    assert_eq!(h.controller.calls(), vec!["hibernate:i-1", "stop:i-1"]);

    let by_action = h.manager.history(&HistoryFilter {
        action: Some(IdleAction::Stop),
        ..Default::default()
    });
    assert_eq!(by_action.len(), 1);
}

#[tokio::test]
async fn test_provider_error_leaves_state_unchanged() {
    let h = harness().await;
    h.provider.push("i-1", Ok(sample(0, 1.0)));
    h.provider
        .push("i-1", Err(anyhow::anyhow!("monitoring API unavailable")));

    let before = h.manager.sample_and_process("i-1").await.unwrap();
    let err = h.manager.sample_and_process("i-1").await.unwrap_err();

    assert!(matches!(err, IdleError::Provider { .. }));
    assert_eq!(h.manager.get_instance_state("i-1").await.unwrap(), before);
    assert_eq!(
        h.manager.health().status_of(Component::Sampler).await,
        ComponentStatus::Degraded
    );
}

#[tokio::test]
async fn test_failed_action_recorded_and_retried() {
    let h = harness().await;
    h.controller.failing.store(true, Ordering::SeqCst);
    for minute in 0..=5 {
        h.feed("i-1", sample(minute, 1.0)).await.unwrap();
    }

    let report = h.manager.execute_ready_actions().await;
    assert_eq!(report.failed(), 1);
    assert!(matches!(report.failures[0], IdleError::Execution { .. }));
    assert_eq!(report.entries[0].outcome, ActionOutcome::Failure);
    assert!(report.entries[0].error.is_some());
    assert!(!h.manager.get_instance_state("i-1").await.unwrap().executed);

    h.controller.failing.store(false, Ordering::SeqCst);
    let retry = h.manager.execute_ready_actions().await;
    assert_eq!(retry.succeeded(), 1);
    assert_eq!(h.manager.history(&HistoryFilter::for_instance("i-1")).len(), 2);
}

#[tokio::test]
async fn test_sweep_continues_past_failures() {
    let h = harness().await;
    h.manager
        .upsert_profile(quick_policy("notice", IdleAction::Warn))
        .await
        .unwrap();
    h.manager.set_instance_policy("i-warn", "notice").await.unwrap();
    h.controller.failing.store(true, Ordering::SeqCst);

    for minute in 0..=5 {
        h.feed("i-stop", sample(minute, 1.0)).await.unwrap();
        h.feed("i-warn", sample(minute, 1.0)).await.unwrap();
    }

    let report = h.manager.execute_ready_actions().await;
    assert_eq!(report.entries.len(), 2);
    assert_eq!(report.failed(), 1);
    assert!(h.manager.get_instance_state("i-warn").await.unwrap().executed);
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_max_actions_per_sweep_defers_rest() {
    let config = ManagerConfig {
        max_actions_per_sweep: 2,
        ..Default::default()
    };
    let h = Harness::new(MockController::default(), config).await;

    for (offset, id) in ["i-a", "i-b", "i-c"].iter().enumerate() {
        for minute in 0..=5 {
            h.feed(id, sample(minute + offset as i64, 1.0)).await.unwrap();
        }
    }
    h.clock.set(t0() + Duration::minutes(30));

    let first = h.manager.execute_ready_actions().await;
    assert_eq!(first.entries.len(), 2);
    assert_eq!(first.deferred, 1);
    let ids: Vec<_> = first.entries.iter().map(|e| e.instance_id.as_str()).collect();
    assert_eq!(ids, vec!["i-a", "i-b"]);

    let second = h.manager.execute_ready_actions().await;
    assert_eq!(second.entries.len(), 1);
    assert_eq!(second.entries[0].instance_id, "i-c");
}

#[tokio::test]
async fn test_dry_run_records_without_calls() {
    let config = ManagerConfig {
        dry_run: true,
        ..Default::default()
    };
    let h = Harness::new(MockController::default(), config).await;
    for minute in 0..=5 {
        h.feed("i-1", sample(minute, 1.0)).await.unwrap();
    }

    let report = h.manager.execute_ready_actions().await;
    assert_eq!(report.entries.len(), 1);
    assert!(report.entries[0].dry_run);
    assert!(h.controller.calls().is_empty());
    assert!(h.manager.get_instance_state("i-1").await.unwrap().executed);
}

#[tokio::test]
async fn test_disabled_manager_still_classifies() {
    let h = harness().await;
    h.manager.set_enabled(false).await.unwrap();

    for minute in 0..=5 {
        h.feed("i-1", sample(minute, 1.0)).await.unwrap();
    }
    assert!(h.manager.get_instance_state("i-1").await.unwrap().is_idle);
    assert!(h.manager.pending_actions().await.is_empty());
    assert!(h.manager.execute_ready_actions().await.entries.is_empty());

    h.manager.set_enabled(true).await.unwrap();
    assert_eq!(h.manager.pending_actions().await.len(), 1);
}

#[tokio::test]
async fn test_missing_policy_falls_back_and_reports() {
    let h = harness().await;
    h.manager
        .upsert_profile(quick_policy("temporary", IdleAction::Hibernate))
        .await
        .unwrap();
    h.manager.set_instance_policy("i-1", "temporary").await.unwrap();
    h.feed("i-1", sample(0, 1.0)).await.unwrap();

    h.manager.remove_profile("temporary").await.unwrap();
    let err = h.feed("i-1", sample(1, 1.0)).await.unwrap_err();
    assert!(matches!(err, IdleError::PolicyNotFound { .. }));

    // sample applied with last-known-good policy
    let state = h.manager.get_instance_state("i-1").await.unwrap();
    assert_eq!(state.last_metrics.unwrap().timestamp, sample(1, 1.0).timestamp);
    assert_eq!(state.policy_name, "temporary");
}

#[tokio::test]
async fn test_domain_mapping_resolution() {
    let h = harness().await;
    h.manager
        .upsert_profile(IdlePolicy {
            idle_minutes: 15,
            ..quick_policy("lab", IdleAction::Hibernate)
        })
        .await
        .unwrap();
    h.manager.set_domain_mapping("genomics", "lab").await.unwrap();
    h.manager.register_instance(InstanceInfo {
        instance_id: "i-1".to_string(),
        instance_name: "sequencer".to_string(),
        domain: Some("genomics".to_string()),
    });

    let state = h.feed("i-1", sample(0, 1.0)).await.unwrap();
    assert_eq!(state.policy_name, "lab");
    assert_eq!(state.instance_name, "sequencer");
    assert_eq!(
        state.scheduled_action.unwrap().execute_at,
        t0() + Duration::minutes(15)
    );
}

#[tokio::test]
async fn test_policy_change_mid_episode_reschedules() {
    let h = harness().await;
    h.manager
        .upsert_profile(IdlePolicy {
            idle_minutes: 2,
            ..quick_policy("nudge", IdleAction::Warn)
        })
        .await
        .unwrap();
    h.manager.set_instance_policy("i-1", "nudge").await.unwrap();

    for minute in 0..=2 {
        h.feed("i-1", sample(minute, 1.0)).await.unwrap();
    }
    let report = h.manager.execute_ready_actions().await;
    assert_eq!(report.entries[0].requested_action, IdleAction::Warn);

    // escalate to stop: the stop must still fire in this episode
    h.manager.set_instance_policy("i-1", "quick").await.unwrap();
    let state = h.feed("i-1", sample(3, 1.0)).await.unwrap();
    assert!(!state.executed);
    assert_eq!(state.idle_since, Some(t0()));
    assert!(h.manager.pending_actions().await.is_empty());

    h.feed("i-1", sample(5, 1.0)).await.unwrap();
    let report = h.manager.execute_ready_actions().await;
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].performed_action, Some(IdleAction::Stop));
}

#[tokio::test]
async fn test_notify_before_stop() {
    let h = harness().await;
    h.manager
        .upsert_profile(IdlePolicy {
            notify: true,
            ..quick_policy("quick", IdleAction::Stop)
        })
        .await
        .unwrap();

    for minute in 0..=5 {
        h.feed("i-1", sample(minute, 1.0)).await.unwrap();
    }
    h.manager.execute_ready_actions().await;

    let sent = h.notifier.sent.lock().unwrap().clone();
    assert_eq!(sent, vec![("i-1".to_string(), Severity::Critical)]);
    assert_eq!(h.controller.count("stop:"), 1);
}

#[tokio::test]
async fn test_persistence_degrades_after_threshold() {
    let state_store = Arc::new(MemoryStateStore::new());
    let store = state_store.clone();
    let h = Harness::with_stores(MockController::default(), ManagerConfig::default(), move |b| {
        b.state_store(store)
    })
    .await;

    state_store.set_failing(true);
    assert!(h.feed("i-1", sample(0, 1.0)).await.is_ok());
    assert!(h.feed("i-1", sample(1, 1.0)).await.is_ok());
    assert_eq!(
        h.manager.health().status_of(Component::Persistence).await,
        ComponentStatus::Degraded
    );

    let err = h.feed("i-1", sample(2, 1.0)).await.unwrap_err();
    assert!(matches!(
        err,
        IdleError::PersistenceDegraded {
            consecutive_failures: 3,
            ..
        }
    ));
    // memory state is kept
    assert!(h.manager.get_instance_state("i-1").await.unwrap().is_idle);

    state_store.set_failing(false);
    h.feed("i-1", sample(3, 1.0)).await.unwrap();
    assert_eq!(
        h.manager.health().status_of(Component::Persistence).await,
        ComponentStatus::Healthy
    );
    assert_eq!(state_store.get("i-1").unwrap().last_metrics.unwrap().timestamp, sample(3, 1.0).timestamp);
}

#[tokio::test]
async fn test_history_failures_not_masked_by_state_writes() {
    let history_log = Arc::new(MemoryHistoryLog::new());
    let log = history_log.clone();
    let controller = MockController {
        failing: AtomicBool::new(true),
        ..Default::default()
    };
    let h = Harness::with_stores(controller, ManagerConfig::default(), move |b| {
        b.history_log(log)
    })
    .await;
    history_log.set_failing(true);

    // every feed writes state successfully; every sweep fails its history append
    let mut reports = Vec::new();
    for minute in 0..=7 {
        h.feed("i-1", sample(minute, 1.0)).await.unwrap();
        reports.push(h.manager.execute_ready_actions().await);
    }

    assert!(reports[5].entries.len() == 1 && !reports[5].persistence_degraded());
    assert!(!reports[6].persistence_degraded());
    assert!(reports[7].persistence_degraded());
    assert_eq!(
        h.manager.health().status_of(Component::Persistence).await,
        ComponentStatus::Unhealthy
    );

    // a successful state write leaves the history backend unhealthy
    h.feed("i-1", sample(8, 1.0)).await.unwrap();
    assert_eq!(
        h.manager.health().status_of(Component::Persistence).await,
        ComponentStatus::Unhealthy
    );

    history_log.set_failing(false);
    let report = h.manager.execute_ready_actions().await;
    assert!(!report.persistence_degraded());
    assert_eq!(
        h.manager.health().status_of(Component::Persistence).await,
        ComponentStatus::Healthy
    );
}

/// Controller whose stop call takes ten minutes of manual-clock time
struct SlowController {
    clock: Arc<ManualClock>,
}

#[async_trait]
impl LifecycleController for SlowController {
    async fn hibernate(&self, _instance_id: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn stop(&self, _instance_id: &str) -> anyhow::Result<()> {
        self.clock.advance(Duration::minutes(10));
        Ok(())
    }

    async fn start(&self, _instance_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_history_timestamp_taken_before_lifecycle_call() {
    let clock = Arc::new(ManualClock::new(t0()));
    let manager = Manager::builder(
        Arc::new(MockProvider::default()),
        Arc::new(SlowController {
            clock: clock.clone(),
        }),
        Arc::new(MockNotifier::default()),
    )
    .clock(clock.clone())
    .build()
    .await
    .unwrap();
    manager
        .upsert_profile(quick_policy("quick", IdleAction::Stop))
        .await
        .unwrap();
    manager.set_default_profile("quick").await.unwrap();

    for minute in 0..=5 {
        clock.set(sample(minute, 1.0).timestamp);
        manager.process_metrics("i-1", sample(minute, 1.0)).await.unwrap();
    }

    let report = manager.execute_ready_actions().await;
    assert_eq!(report.entries.len(), 1);
    let entry = &report.entries[0];
    assert_eq!(entry.requested_at, t0() + Duration::minutes(5));
    assert_eq!(entry.idle_duration_secs, 300);
}

#[tokio::test]
async fn test_start_instance_ends_episode() {
    let h = harness().await;
    for minute in 0..3 {
        h.feed("i-1", sample(minute, 1.0)).await.unwrap();
    }

    h.manager.start_instance("i-1").await.unwrap();
    let state = h.manager.get_instance_state("i-1").await.unwrap();
    assert!(!state.is_idle);
    assert!(state.idle_since.is_none());
    assert_eq!(h.controller.calls(), vec!["start:i-1"]);

    assert!(matches!(
        h.manager.start_instance("i-unknown").await,
        Err(IdleError::UnknownInstance { .. })
    ));
}

#[tokio::test]
async fn test_deregister_removes_state() {
    let h = harness().await;
    h.manager.register_instance(InstanceInfo {
        instance_id: "i-1".to_string(),
        instance_name: "box".to_string(),
        domain: None,
    });
    h.feed("i-1", sample(0, 1.0)).await.unwrap();

    let removed = h.manager.deregister_instance("i-1").await.unwrap();
    assert!(removed.is_some());
    assert!(h.manager.instances().is_empty());
    assert!(matches!(
        h.manager.get_instance_state("i-1").await,
        Err(IdleError::UnknownInstance { .. })
    ));
}

#[tokio::test]
async fn test_default_profile_is_protected() {
    let h = harness().await;
    assert!(matches!(
        h.manager.remove_profile("quick").await,
        Err(IdleError::ProtectedPolicy { .. })
    ));

    let invalid = IdlePolicy {
        idle_minutes: 0,
        ..quick_policy("broken", IdleAction::Stop)
    };
    assert!(matches!(
        h.manager.upsert_profile(invalid).await,
        Err(IdleError::InvalidPolicy { .. })
    ));
    assert!(h.manager.get_profile("broken").await.is_none());
}

#[tokio::test]
async fn test_invalid_persisted_policies_are_fatal() {
    let mut config = PolicyConfig::default();
    config.default_policy = "missing".to_string();

    let result = Manager::builder(
        Arc::new(MockProvider::default()),
        Arc::new(MockController::default()),
        Arc::new(MockNotifier::default()),
    )
    .policy_store(Arc::new(MemoryPolicyStore::with_config(config)))
    .build()
    .await;

    assert!(matches!(result, Err(IdleError::InvalidPolicy { .. })));
}
