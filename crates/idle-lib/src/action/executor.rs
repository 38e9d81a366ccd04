//! Executes due idle actions against the lifecycle controller

use super::lifecycle::{LifecycleController, NotificationSink, Severity};
use crate::error::{IdleError, Result};
use crate::models::{ActionOutcome, IdleAction, PendingAction};
use dashmap::DashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{info, warn};

/// What happened when a pending action was executed
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub requested: IdleAction,
    /// Action actually performed; `None` on failure
    pub performed: Option<IdleAction>,
    pub outcome: ActionOutcome,
    pub error: Option<IdleError>,
    pub dry_run: bool,
    pub latency: Duration,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.outcome != ActionOutcome::Failure
    }
}

/// Claim on an instance held while its action runs
pub struct InFlightGuard<'a> {
    set: &'a DashSet<String>,
    instance_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.instance_id);
    }
}

pub struct ActionExecutor {
    controller: Arc<dyn LifecycleController>,
    notifier: Arc<dyn NotificationSink>,
    timeout: Duration,
    dry_run: bool,
    in_flight: DashSet<String>,
}

impl ActionExecutor {
    pub fn new(
        controller: Arc<dyn LifecycleController>,
        notifier: Arc<dyn NotificationSink>,
        timeout: Duration,
        dry_run: bool,
    ) -> Self {
        Self {
            controller,
            notifier,
            timeout,
            dry_run,
            in_flight: DashSet::new(),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Claim an instance for execution; `None` if another sweep holds it
    pub fn try_claim(&self, instance_id: &str) -> Option<InFlightGuard<'_>> {
        if !self.in_flight.insert(instance_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            instance_id: instance_id.to_string(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Perform `pending.action`. `notify_first` sends a warning before a
    /// stop or hibernate.
    pub async fn execute(&self, pending: &PendingAction, notify_first: bool) -> ExecutionReport {
        let started = Instant::now();
        let id = pending.instance_id.as_str();

        if self.dry_run {
            info!(
                instance_id = %id,
                action = %pending.action,
                "Dry run: skipping lifecycle call"
            );
            return ExecutionReport {
                requested: pending.action,
                performed: Some(pending.action),
                outcome: ActionOutcome::Success,
                error: None,
                dry_run: true,
                latency: started.elapsed(),
            };
        }

        let result = match pending.action {
            IdleAction::Warn => {
                let message = format!(
                    "Instance {} has been idle since {} and may be stopped",
                    pending.instance_name, pending.idle_since
                );
                self.send_notice(id, &message, Severity::Warning).await;
                Ok((IdleAction::Warn, ActionOutcome::Success))
            }
            IdleAction::Stop => {
                if notify_first {
                    self.announce(pending, IdleAction::Stop).await;
                }
                self.bounded(self.controller.stop(id))
                    .await
                    .map(|()| (IdleAction::Stop, ActionOutcome::Success))
            }
            IdleAction::Hibernate => {
                if notify_first {
                    self.announce(pending, IdleAction::Hibernate).await;
                }
                self.hibernate_or_stop(id).await
            }
        };

        let latency = started.elapsed();
        match result {
            Ok((performed, outcome)) => ExecutionReport {
                requested: pending.action,
                performed: Some(performed),
                outcome,
                error: None,
                dry_run: false,
                latency,
            },
            Err(reason) => ExecutionReport {
                requested: pending.action,
                performed: None,
                outcome: ActionOutcome::Failure,
                error: Some(IdleError::Execution {
                    instance_id: id.to_string(),
                    action: pending.action,
                    reason,
                }),
                dry_run: false,
                latency,
            },
        }
    }

    async fn hibernate_or_stop(
        &self,
        id: &str,
    ) -> std::result::Result<(IdleAction, ActionOutcome), String> {
        if self.bounded(self.controller.hibernate(id)).await? {
            return Ok((IdleAction::Hibernate, ActionOutcome::Success));
        }

        info!(instance_id = %id, "Hibernation unsupported, stopping instead");
        self.bounded(self.controller.stop(id))
            .await
            .map(|()| (IdleAction::Stop, ActionOutcome::Fallback))
    }

    /// Resume an instance via the controller
    pub async fn start(&self, instance_id: &str) -> Result<()> {
        self.bounded(self.controller.start(instance_id))
            .await
            .map_err(|reason| IdleError::Start {
                instance_id: instance_id.to_string(),
                reason,
            })
    }

    async fn announce(&self, pending: &PendingAction, action: IdleAction) {
        let message = format!(
            "Instance {} has been idle since {}; {} in progress",
            pending.instance_name,
            pending.idle_since,
            match action {
                IdleAction::Hibernate => "hibernation",
                _ => "shutdown",
            }
        );
        self.send_notice(&pending.instance_id, &message, Severity::Critical)
            .await;
    }

    async fn send_notice(&self, instance_id: &str, message: &str, severity: Severity) {
        if let Err(reason) = self
            .bounded(self.notifier.notify(instance_id, message, severity))
            .await
        {
            warn!(instance_id = %instance_id, error = %reason, "Notification failed");
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> std::result::Result<T, String> {
        match timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!("timed out after {}s", self.timeout.as_secs_f64())),
        }
    }
}
