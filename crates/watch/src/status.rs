use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use admin_ipc::TargetStatus;
use chrono::Utc;

use crate::cycle::{CycleOutcome, CycleResult};
use crate::gate::WatchGate;

/// Latest known state of every target, shared with the admin socket.
#[derive(Clone, Default)]
pub struct StatusRegistry {
    targets: Arc<RwLock<BTreeMap<String, TargetStatus>>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str, url: &str, baseline_items: Option<usize>) {
        if let Ok(mut targets) = self.targets.write() {
            targets.insert(
                id.to_string(),
                TargetStatus {
                    id: id.to_string(),
                    url: url.to_string(),
                    baseline_items,
                    ..TargetStatus::default()
                },
            );
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.targets
            .read()
            .map(|targets| targets.contains_key(id))
            .unwrap_or(false)
    }

    pub fn record(&self, outcome: &CycleOutcome, baseline_items: Option<usize>) {
        let Ok(mut targets) = self.targets.write() else {
            return;
        };
        let Some(status) = targets.get_mut(&outcome.target) else {
            return;
        };
        let now = Utc::now().to_rfc3339();
        match &outcome.result {
            CycleResult::Skipped => {}
            CycleResult::Completed { .. } => {
                status.consecutive_failures = 0;
                status.last_success_at = Some(now.clone());
                status.last_cycle_at = Some(now);
            }
            CycleResult::Failed { .. } => {
                status.consecutive_failures += 1;
                status.last_cycle_at = Some(now);
            }
        }
        status.last_outcome = Some(outcome.label().to_string());
        status.baseline_items = baseline_items;
    }

    /// Current statuses with pause flags taken from `gate`.
    pub fn snapshot(&self, gate: &WatchGate) -> Vec<TargetStatus> {
        self.targets
            .read()
            .map(|targets| {
                targets
                    .values()
                    .cloned()
                    .map(|mut status| {
                        status.paused = gate.is_paused(&status.id);
                        status
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
