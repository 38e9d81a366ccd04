//! Append-only audit trail of executed idle actions

use crate::error::{IdleError, Result};
use crate::models::{HistoryEntry, HistoryFilter};
use crate::store::HistoryLog;
use std::sync::{Arc, RwLock};
use tracing::info;

/// History store: an in-memory index over a persistent append-only log
pub struct HistoryStore {
    entries: RwLock<Vec<HistoryEntry>>,
    log: Arc<dyn HistoryLog>,
}

impl HistoryStore {
    /// Open the store, loading existing entries from the log
    pub fn open(log: Arc<dyn HistoryLog>) -> Result<Self> {
        let entries = log
            .load_all()
            .map_err(|e| IdleError::persistence("history", &e))?;

        Ok(Self {
            entries: RwLock::new(entries),
            log,
        })
    }

    /// Record an entry. The in-memory copy is kept even when the log write fails.
    pub fn append(&self, entry: HistoryEntry) -> Result<()> {
        info!(
            event = "idle_action",
            instance_id = %entry.instance_id,
            instance_name = %entry.instance_name,
            requested = %entry.requested_action,
            performed = ?entry.performed_action,
            outcome = %entry.outcome,
            idle_secs = entry.idle_duration_secs,
            dry_run = entry.dry_run,
            "Idle action recorded"
        );

        let written = self.log.append(&entry);
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);

        written.map_err(|e| IdleError::persistence("history", &e))
    }

    /// Entries matching `filter`, newest first
    pub fn query(&self, filter: &HistoryFilter) -> Vec<HistoryEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());

        let mut matched: Vec<HistoryEntry> = entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();

        // stable sort keeps append order for equal timestamps, reversed below
        matched.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        matched.reverse();

        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionOutcome, IdleAction};
    use crate::store::{JsonHistoryLog, MemoryHistoryLog};
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn entry(id: &str, minute: i64, outcome: ActionOutcome) -> HistoryEntry {
        HistoryEntry {
            instance_id: id.to_string(),
            instance_name: id.to_string(),
            requested_action: IdleAction::Stop,
            performed_action: (outcome != ActionOutcome::Failure).then_some(IdleAction::Stop),
            requested_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + Duration::minutes(minute),
            outcome,
            idle_duration_secs: 60,
            metrics: None,
            error: None,
            dry_run: false,
        }
    }

    #[test]
    fn test_query_newest_first_with_limit() {
        let store = HistoryStore::open(Arc::new(MemoryHistoryLog::new())).unwrap();
        store.append(entry("i-1", 1, ActionOutcome::Success)).unwrap();
        store.append(entry("i-2", 3, ActionOutcome::Failure)).unwrap();
        store.append(entry("i-1", 2, ActionOutcome::Success)).unwrap();

        let all = store.query(&HistoryFilter::default());
        let minutes: Vec<_> = all.iter().map(|e| e.requested_at.timestamp()).collect();
        assert!(minutes.windows(2).all(|w| w[0] >= w[1]));

        let limited = store.query(&HistoryFilter {
            limit: Some(1),
            ..HistoryFilter::for_instance("i-1")
        });
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].requested_at, entry("i-1", 2, ActionOutcome::Success).requested_at);
    }

    #[test]
    fn test_failed_log_write_keeps_memory_copy() {
        let log = Arc::new(MemoryHistoryLog::new());
        let store = HistoryStore::open(log.clone()).unwrap();

        log.set_failing(true);
        let result = store.append(entry("i-1", 1, ActionOutcome::Success));
        assert!(matches!(result, Err(IdleError::Persistence { .. })));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_history_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");

        {
            let store = HistoryStore::open(Arc::new(JsonHistoryLog::new(&path))).unwrap();
            store.append(entry("i-1", 1, ActionOutcome::Success)).unwrap();
            store.append(entry("i-1", 2, ActionOutcome::Fallback)).unwrap();
        }

        let reopened = HistoryStore::open(Arc::new(JsonHistoryLog::new(&path))).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(
            reopened.query(&HistoryFilter::default())[0].outcome,
            ActionOutcome::Fallback
        );
    }
}
