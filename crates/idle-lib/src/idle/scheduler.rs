//! Due-action selection

use super::tracker::StateTracker;
use crate::models::PendingAction;
use chrono::{DateTime, Utc};

/// Read-only view over tracked states that yields due actions
pub struct ActionScheduler<'a> {
    tracker: &'a StateTracker,
}

impl<'a> ActionScheduler<'a> {
    pub fn new(tracker: &'a StateTracker) -> Self {
        Self { tracker }
    }

    /// Actions due at `now`, longest-idle first
    pub async fn pending(&self, now: DateTime<Utc>) -> Vec<PendingAction> {
        let mut due = Vec::new();

        for slot in self.tracker.all_slots() {
            let slot = slot.lock().await;
            let state = &slot.state;
            if !state.is_due(now) {
                continue;
            }
            let (Some(scheduled), Some(idle_since)) = (&state.scheduled_action, state.idle_since)
            else {
                continue;
            };

            due.push(PendingAction {
                instance_id: state.instance_id.clone(),
                instance_name: state.instance_name.clone(),
                policy_name: state.policy_name.clone(),
                action: scheduled.action,
                execute_at: scheduled.execute_at,
                idle_since,
                metrics: state.last_metrics.clone(),
            });
        }

        due.sort_by(|a, b| {
            a.idle_since
                .cmp(&b.idle_since)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        due
    }
}
