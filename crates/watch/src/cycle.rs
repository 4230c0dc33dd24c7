use std::fmt;
use std::sync::Arc;

use extractor::Extractor;
use fetcher::{FetchError, FetchFailure, PageRequest};
use metrics::MetricsHandle;
use notify::{ChangeReport, Message, Notifier};
use snapshot::{plan_events, ChangeEvent, ChangeKind, SnapshotSet};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, TargetConfig};
use crate::source::PageSource;
use crate::status::StatusRegistry;
use crate::store::BaselineStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fetching,
    Extracting,
    Diffing,
    Notifying,
    Persisting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Fetching => "fetching",
            Phase::Extracting => "extracting",
            Phase::Diffing => "diffing",
            Phase::Notifying => "notifying",
            Phase::Persisting => "persisting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    TransientFetch,
    TerminalFetch,
    ExtractionEmpty,
    Persistence,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientFetch => "transient_fetch",
            FailureKind::TerminalFetch => "terminal_fetch",
            FailureKind::ExtractionEmpty => "extraction_empty",
            FailureKind::Persistence => "persistence",
        }
    }

    fn needs_operator(&self) -> bool {
        !matches!(self, FailureKind::TransientFetch)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleResult {
    Completed {
        items: usize,
        added: usize,
        removed: usize,
        changed: usize,
        /// `None` when there was nothing worth sending.
        notified: Option<bool>,
        events: Vec<ChangeEvent>,
    },
    Failed {
        phase: Phase,
        kind: FailureKind,
        reason: String,
    },
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub target: String,
    pub attempts: u32,
    pub result: CycleResult,
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match &self.result {
            CycleResult::Completed { .. } => "completed",
            CycleResult::Failed { kind, .. } => kind.as_str(),
            CycleResult::Skipped => "skipped",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result, CycleResult::Completed { .. })
    }
}

/// Conditions that stop a target's loop instead of ending one cycle.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("target `{target}`: {source}")]
    SessionsExhausted {
        target: String,
        #[source]
        source: FetchFailure,
    },
    #[error("target `{target}`: browser session pool closed")]
    PoolClosed { target: String },
}

/// Runs fetch → extract → diff → notify → persist cycles for one target.
pub struct TargetWatcher {
    config: TargetConfig,
    request: PageRequest,
    extractor: Extractor,
    source: Arc<dyn PageSource>,
    store: Arc<dyn BaselineStore>,
    notifier: Arc<dyn Notifier>,
    status: StatusRegistry,
    metrics: Option<MetricsHandle>,
    baseline: Option<SnapshotSet>,
    phase: Phase,
    alerted: Option<FailureKind>,
}

impl TargetWatcher {
    pub fn new(
        config: TargetConfig,
        source: Arc<dyn PageSource>,
        store: Arc<dyn BaselineStore>,
        notifier: Arc<dyn Notifier>,
        status: StatusRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let extractor = config.extractor()?;
        status.register(&config.id, &config.url, None);
        Ok(Self {
            request: config.page_request(),
            config,
            extractor,
            source,
            store,
            notifier,
            status,
            metrics: None,
            baseline: None,
            phase: Phase::Idle,
            alerted: None,
        })
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    pub fn baseline(&self) -> Option<&SnapshotSet> {
        self.baseline.as_ref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Reads the committed baseline; a storage error here is fatal for startup.
    pub async fn load_baseline(&mut self) -> anyhow::Result<()> {
        self.baseline = self.store.load_baseline(&self.config.id).await?;
        let items = self.baseline.as_ref().map(SnapshotSet::len);
        self.status.register(&self.config.id, &self.config.url, items);
        if let (Some(metrics), Some(items)) = (&self.metrics, items) {
            metrics.set_baseline_items(&self.config.id, items);
        }
        info!(target_id = %self.config.id, baseline_items = ?items, "baseline loaded");
        Ok(())
    }

    fn enter(&mut self, phase: Phase) {
        debug!(target_id = %self.config.id, from = %self.phase, to = %phase, "phase");
        self.phase = phase;
    }

    /// One full cycle. Every phase failure becomes a [`CycleOutcome`]; only
    /// resource exhaustion escapes as an error.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, WatchError> {
        self.enter(Phase::Fetching);
        let fetched = match self.source.fetch(&self.request, &self.config.retry).await {
            Ok(fetched) => fetched,
            Err(failure) => {
                self.record_attempts(failure.attempts);
                let target = self.config.id.clone();
                match failure.error {
                    FetchError::SessionsExhausted { .. } => {
                        self.enter(Phase::Idle);
                        return Err(WatchError::SessionsExhausted {
                            target,
                            source: failure,
                        });
                    }
                    FetchError::PoolClosed => {
                        self.enter(Phase::Idle);
                        return Err(WatchError::PoolClosed { target });
                    }
                    _ => {}
                }
                let kind = if failure.error.is_transient() {
                    FailureKind::TransientFetch
                } else {
                    FailureKind::TerminalFetch
                };
                return Ok(self
                    .fail(kind, failure.attempts, failure.error.to_string())
                    .await);
            }
        };
        let attempts = fetched.attempts;
        self.record_attempts(attempts);

        self.enter(Phase::Extracting);
        let current = match self.extractor.extract(&fetched.page) {
            Ok(current) => current,
            Err(err) => {
                return Ok(self
                    .fail(FailureKind::ExtractionEmpty, attempts, err.to_string())
                    .await)
            }
        };

        self.enter(Phase::Diffing);
        let first_run = self.baseline.is_none();
        let events = plan_events(self.baseline.as_ref(), &current, self.config.first_run);

        self.enter(Phase::Notifying);
        let notified = self.notify(&current, &events).await;
        if !events.is_empty() {
            if let Err(err) = self.store.record_events(&self.config.id, &events).await {
                warn!(target_id = %self.config.id, error = ?err, "failed to journal change events");
            }
        }

        self.enter(Phase::Persisting);
        if let Err(err) = self.store.commit_baseline(&self.config.id, &current).await {
            return Ok(self
                .fail(FailureKind::Persistence, attempts, format!("{err:#}"))
                .await);
        }

        let count = |kinds: &[ChangeKind]| events.iter().filter(|e| kinds.contains(&e.kind())).count();
        let outcome = CycleOutcome {
            target: self.config.id.clone(),
            attempts,
            result: CycleResult::Completed {
                items: current.len(),
                added: count(&[ChangeKind::Added]),
                removed: count(&[ChangeKind::Removed]),
                changed: count(&[ChangeKind::PriceChanged, ChangeKind::AvailabilityChanged]),
                notified,
                events: events.clone(),
            },
        };
        if first_run {
            info!(target_id = %self.config.id, items = current.len(), policy = ?self.config.first_run, "baseline established");
        }
        self.baseline = Some(current);
        self.alerted = None;
        if let Some(metrics) = &self.metrics {
            for event in &events {
                metrics.record_change_event(&self.config.id, event.kind().as_str());
            }
        }
        Ok(self.finish(outcome).await)
    }

    /// Sends the worthy subset of `events`. Delivery failure never blocks persisting.
    async fn notify(&self, current: &SnapshotSet, events: &[ChangeEvent]) -> Option<bool> {
        let worthy: Vec<ChangeEvent> = self
            .config
            .notify_on
            .select(events)
            .into_iter()
            .cloned()
            .collect();
        if worthy.is_empty() {
            return None;
        }
        let message = Message::Changes(ChangeReport {
            target: self.config.id.clone(),
            url: self.config.url.clone(),
            item_count: current.len(),
            events: worthy,
        });
        match self.notifier.send(&message).await {
            Ok(()) => Some(true),
            Err(err) => {
                warn!(target_id = %self.config.id, error = %err, "notification delivery failed");
                Some(false)
            }
        }
    }

    async fn fail(&mut self, kind: FailureKind, attempts: u32, reason: String) -> CycleOutcome {
        let phase = self.phase;
        if kind.needs_operator() && self.alerted != Some(kind) {
            self.alert(kind, &reason).await;
            self.alerted = Some(kind);
        }
        let outcome = CycleOutcome {
            target: self.config.id.clone(),
            attempts,
            result: CycleResult::Failed {
                phase,
                kind,
                reason,
            },
        };
        self.finish(outcome).await
    }

    async fn alert(&self, kind: FailureKind, reason: &str) {
        if let Err(err) = self
            .store
            .record_incident(&self.config.id, kind.as_str(), reason)
            .await
        {
            warn!(target_id = %self.config.id, error = ?err, "failed to record incident");
        }
        let message = Message::Alert {
            target: self.config.id.clone(),
            url: self.config.url.clone(),
            reason: format!("{}: {reason}", kind.as_str()),
        };
        if let Err(err) = self.notifier.send(&message).await {
            warn!(target_id = %self.config.id, error = %err, "operator alert delivery failed");
        }
    }

    async fn finish(&mut self, outcome: CycleOutcome) -> CycleOutcome {
        self.enter(Phase::Idle);
        log_outcome(&outcome);
        let baseline_items = self.baseline.as_ref().map(SnapshotSet::len);
        self.status.record(&outcome, baseline_items);
        if let Some(metrics) = &self.metrics {
            metrics.record_cycle(&self.config.id, outcome.label());
            if let Some(items) = baseline_items {
                metrics.set_baseline_items(&self.config.id, items);
            }
        }
        if let Err(err) = self.store.record_cycle(&outcome).await {
            warn!(target_id = %self.config.id, error = ?err, "failed to journal cycle");
        }
        outcome
    }

    fn record_attempts(&self, attempts: u32) {
        if let Some(metrics) = &self.metrics {
            metrics.record_fetch_attempts(&self.config.id, attempts);
        }
    }

    pub(crate) fn skipped(&self) -> CycleOutcome {
        let outcome = CycleOutcome {
            target: self.config.id.clone(),
            attempts: 0,
            result: CycleResult::Skipped,
        };
        self.status
            .record(&outcome, self.baseline.as_ref().map(SnapshotSet::len));
        outcome
    }
}

fn log_outcome(outcome: &CycleOutcome) {
    match &outcome.result {
        CycleResult::Completed {
            items,
            added,
            removed,
            changed,
            notified,
            ..
        } => info!(
            target_id = %outcome.target,
            attempts = outcome.attempts,
            outcome = outcome.label(),
            items,
            added,
            removed,
            changed,
            notified = ?notified,
            "cycle completed"
        ),
        CycleResult::Failed {
            phase,
            kind,
            reason,
        } => warn!(
            target_id = %outcome.target,
            attempts = outcome.attempts,
            outcome = outcome.label(),
            phase = %phase,
            kind = kind.as_str(),
            reason = %reason,
            "cycle failed"
        ),
        CycleResult::Skipped => debug!(target_id = %outcome.target, "cycle skipped while paused"),
    }
}
