use anyhow::Result;
use async_trait::async_trait;
use snapshot::{ChangeEvent, SnapshotSet};
use storage::{CycleRecord, Store};

use crate::cycle::{CycleOutcome, CycleResult};

/// Durable home of each target's baseline plus the cycle journal.
///
/// Only `load_baseline` and `commit_baseline` are load-bearing; the journal
/// methods are best-effort and default to doing nothing.
#[async_trait]
pub trait BaselineStore: Send + Sync {
    async fn load_baseline(&self, target: &str) -> Result<Option<SnapshotSet>>;

    /// Must replace the baseline atomically.
    async fn commit_baseline(&self, target: &str, snapshot: &SnapshotSet) -> Result<()>;

    async fn record_cycle(&self, _outcome: &CycleOutcome) -> Result<()> {
        Ok(())
    }

    async fn record_events(&self, _target: &str, _events: &[ChangeEvent]) -> Result<()> {
        Ok(())
    }

    async fn record_incident(&self, _target: &str, _kind: &str, _message: &str) -> Result<()> {
        Ok(())
    }
}

/// SQLite-backed store scoped to one process run.
#[derive(Clone)]
pub struct RunStore {
    store: Store,
    run_id: String,
}

impl RunStore {
    pub fn new(store: Store, run_id: impl Into<String>) -> Self {
        Self {
            store,
            run_id: run_id.into(),
        }
    }
}

#[async_trait]
impl BaselineStore for RunStore {
    async fn load_baseline(&self, target: &str) -> Result<Option<SnapshotSet>> {
        self.store.load_baseline(target).await
    }

    async fn commit_baseline(&self, target: &str, snapshot: &SnapshotSet) -> Result<()> {
        self.store.commit_baseline(target, snapshot).await
    }

    async fn record_cycle(&self, outcome: &CycleOutcome) -> Result<()> {
        let mut record = CycleRecord {
            target_id: &outcome.target,
            outcome: outcome.label(),
            attempts: outcome.attempts,
            ..CycleRecord::default()
        };
        match &outcome.result {
            CycleResult::Completed {
                added,
                removed,
                changed,
                ..
            } => {
                record.added = *added;
                record.removed = *removed;
                record.changed = *changed;
            }
            CycleResult::Failed { reason, .. } => record.detail = Some(reason.as_str()),
            CycleResult::Skipped => {}
        }
        self.store.record_cycle(&self.run_id, &record).await
    }

    async fn record_events(&self, target: &str, events: &[ChangeEvent]) -> Result<()> {
        for event in events {
            let payload = serde_json::to_string(event)?;
            self.store
                .log_change_event(&self.run_id, target, event.kind().as_str(), event.id(), &payload)
                .await?;
        }
        Ok(())
    }

    async fn record_incident(&self, target: &str, kind: &str, message: &str) -> Result<()> {
        let message = format!("[{target}] {message}");
        self.store
            .log_incident(&self.run_id, "warning", kind, &message)
            .await
    }
}
