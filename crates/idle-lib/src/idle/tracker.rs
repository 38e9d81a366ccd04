//! Per-instance idle state tracking
//!
//! Each instance's state lives behind its own async mutex so that
//! classification and action commits for one instance are serialized while
//! different instances proceed independently.

use crate::error::{IdleError, Result};
use crate::models::{IdleState, PendingAction, ScheduledAction, UsageMetrics};
use crate::policy::{classify, IdlePolicy, MissingPolicy};
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// State plus the policy that produced its current schedule
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) state: IdleState,
    /// Last successfully resolved policy; not persisted
    pub(crate) active_policy: Option<IdlePolicy>,
}

/// Episode transition caused by a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    EpisodeStarted,
    /// Policy changed mid-episode and the action was rescheduled
    Rescheduled,
    EpisodeEnded { idle_secs: i64 },
}

/// Result of processing one sample
#[derive(Debug, Clone)]
pub struct TrackerUpdate {
    pub state: IdleState,
    pub transition: Transition,
    /// Set when the assigned policy was missing and a fallback was used
    pub policy_error: Option<IdleError>,
    /// Set when the updated state could not be written
    pub persist_error: Option<IdleError>,
}

/// Result of committing an executed action
#[derive(Debug, Clone)]
pub struct CommitResult {
    /// The episode the action was scheduled for is still running
    pub episode_current: bool,
    pub persist_error: Option<IdleError>,
}

pub struct StateTracker {
    slots: DashMap<String, Arc<Mutex<Slot>>>,
    store: Arc<dyn StateStore>,
}

impl StateTracker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            slots: DashMap::new(),
            store,
        }
    }

    /// Reload persisted state; returns the number of instances restored
    pub fn restore(&self) -> Result<usize> {
        let states = self
            .store
            .load_all()
            .map_err(|e| IdleError::persistence("idle state", &e))?;

        let count = states.len();
        for state in states {
            self.slots.insert(
                state.instance_id.clone(),
                Arc::new(Mutex::new(Slot {
                    state,
                    active_policy: None,
                })),
            );
        }
        Ok(count)
    }

    fn slot_or_insert(&self, instance_id: &str, instance_name: &str, policy: &str) -> Arc<Mutex<Slot>> {
        self.slots
            .entry(instance_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Slot {
                    state: IdleState::new(instance_id, instance_name, policy),
                    active_policy: None,
                }))
            })
            .value()
            .clone()
    }

    fn slot(&self, instance_id: &str) -> Option<Arc<Mutex<Slot>>> {
        self.slots.get(instance_id).map(|s| s.value().clone())
    }

    pub(crate) fn all_slots(&self) -> Vec<Arc<Mutex<Slot>>> {
        self.slots.iter().map(|s| s.value().clone()).collect()
    }

    /// Classify a sample and update the instance's episode.
    ///
    /// `resolved` is the catalog's answer for this instance; when it is a
    /// missing policy the last-known-good policy (or `default`) is used and
    /// the lookup failure is reported in the update.
    pub async fn process(
        &self,
        instance_id: &str,
        instance_name: &str,
        metrics: UsageMetrics,
        resolved: std::result::Result<IdlePolicy, MissingPolicy>,
        default: &IdlePolicy,
    ) -> Result<TrackerUpdate> {
        let initial_policy = match &resolved {
            Ok(p) => p.name.clone(),
            Err(_) => default.name.clone(),
        };
        let slot = self.slot_or_insert(instance_id, instance_name, &initial_policy);
        let mut slot = slot.lock().await;

        if let Some(ref last) = slot.state.last_metrics {
            if metrics.timestamp < last.timestamp {
                return Err(IdleError::provider(
                    instance_id,
                    format!(
                        "out-of-order sample at {} (last sample {})",
                        metrics.timestamp, last.timestamp
                    ),
                ));
            }
        }

        let (policy, policy_error) = match resolved {
            Ok(policy) => (policy, None),
            Err(missing) => {
                let fallback = slot
                    .active_policy
                    .clone()
                    .unwrap_or_else(|| default.clone());
                warn!(
                    instance_id = %instance_id,
                    requested = %missing.requested,
                    fallback = %fallback.name,
                    "Assigned policy not found, using fallback"
                );
                let err = IdleError::PolicyNotFound {
                    policy: missing.requested,
                    fallback: fallback.name.clone(),
                };
                (fallback, Some(err))
            }
        };

        let policy_changed = match &slot.active_policy {
            Some(previous) => previous != &policy,
            None => slot.state.policy_name != policy.name,
        };

        let idle = classify(&metrics, &policy);
        let timestamp = metrics.timestamp;
        let state = &mut slot.state;
        let mut transition = Transition::Unchanged;

        state.instance_name = instance_name.to_string();
        state.last_metrics = Some(metrics);
        state.is_idle = idle;

        if idle {
            match state.idle_since {
                None => {
                    state.idle_since = Some(timestamp);
                    state.executed = false;
                    state.scheduled_action = Some(ScheduledAction {
                        action: policy.action,
                        execute_at: timestamp + policy.idle_window(),
                    });
                    transition = Transition::EpisodeStarted;
                }
                Some(since) if policy_changed => {
                    let previous = state.scheduled_action.as_ref().map(|s| s.action);
                    state.scheduled_action = Some(ScheduledAction {
                        action: policy.action,
                        execute_at: since + policy.idle_window(),
                    });
                    // an escalated action may still fire after a lesser one did
                    if state.executed && previous.map_or(true, |a| policy.action > a) {
                        state.executed = false;
                    }
                    transition = Transition::Rescheduled;
                }
                Some(_) => {}
            }
        } else {
            if let Some(since) = state.idle_since.take() {
                transition = Transition::EpisodeEnded {
                    idle_secs: (timestamp - since).num_seconds(),
                };
            }
            state.scheduled_action = None;
            state.executed = false;
            state.last_activity = Some(timestamp);
        }

        state.policy_name = policy.name.clone();
        let snapshot = state.clone();
        slot.active_policy = Some(policy);

        let persist_error = self.persist(&snapshot);

        debug!(
            instance_id = %instance_id,
            idle = snapshot.is_idle,
            transition = ?transition,
            "Processed metrics sample"
        );

        Ok(TrackerUpdate {
            state: snapshot,
            transition,
            policy_error,
            persist_error,
        })
    }

    /// Mark a pending action as executed if its episode is still running
    pub async fn commit_execution(&self, pending: &PendingAction, mark_executed: bool) -> CommitResult {
        let Some(slot) = self.slot(&pending.instance_id) else {
            return CommitResult {
                episode_current: false,
                persist_error: None,
            };
        };
        let mut slot = slot.lock().await;
        let state = &mut slot.state;

        let episode_current =
            state.is_idle && state.idle_since == Some(pending.idle_since) && !state.executed;

        if !(episode_current && mark_executed) {
            return CommitResult {
                episode_current,
                persist_error: None,
            };
        }

        state.executed = true;
        let snapshot = state.clone();
        CommitResult {
            episode_current,
            persist_error: self.persist(&snapshot),
        }
    }

    /// End any running episode, e.g. after the instance was started manually
    pub async fn end_episode(&self, instance_id: &str, at: DateTime<Utc>) -> Result<Option<IdleState>> {
        let Some(slot) = self.slot(instance_id) else {
            return Ok(None);
        };
        let mut slot = slot.lock().await;
        let state = &mut slot.state;

        state.is_idle = false;
        state.idle_since = None;
        state.scheduled_action = None;
        state.executed = false;
        state.last_activity = Some(at);

        let snapshot = state.clone();
        match self.persist(&snapshot) {
            Some(err) => Err(err),
            None => Ok(Some(snapshot)),
        }
    }

    pub async fn get(&self, instance_id: &str) -> Option<IdleState> {
        let slot = self.slot(instance_id)?;
        let slot = slot.lock().await;
        Some(slot.state.clone())
    }

    pub async fn list(&self) -> Vec<IdleState> {
        let mut states = Vec::with_capacity(self.slots.len());
        for slot in self.all_slots() {
            states.push(slot.lock().await.state.clone());
        }
        states.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        states
    }

    /// Drop an instance's state from memory and storage
    pub async fn remove(&self, instance_id: &str) -> Result<Option<IdleState>> {
        let removed = match self.slots.remove(instance_id) {
            Some((_, slot)) => Some(slot.lock().await.state.clone()),
            None => None,
        };
        self.store
            .remove(instance_id)
            .map_err(|e| IdleError::persistence("idle state", &e))?;
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn persist(&self, state: &IdleState) -> Option<IdleError> {
        self.store
            .save(state)
            .err()
            .map(|e| IdleError::persistence(format!("idle state for {}", state.instance_id), &e))
    }
}
