use std::future::Future;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::cycle::{TargetWatcher, WatchError};
use crate::gate::WatchGate;
use crate::shutdown::{Shutdown, ShutdownTrigger};

impl TargetWatcher {
    /// Cycles until shutdown. Pausing skips cycles but keeps the cadence.
    pub async fn run(mut self, mut shutdown: Shutdown, gate: WatchGate) -> Result<(), WatchError> {
        info!(target_id = %self.id(), url = %self.config().url, "target loop started");
        while !shutdown.is_triggered() {
            if gate.is_paused(self.id()) {
                self.skipped();
            } else {
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    result = self.run_cycle() => match result {
                        Ok(_) => {}
                        Err(WatchError::PoolClosed { .. }) => {
                            info!(target_id = %self.id(), "session pool closed; stopping");
                            break;
                        }
                        Err(err) => return Err(err),
                    },
                }
            }
            let delay = self.config().schedule.next_delay();
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(target_id = %self.id(), "target loop stopped");
        Ok(())
    }
}

/// Runs every watcher to completion. A fatal watcher error triggers shutdown for
/// the rest; after shutdown, tasks get `grace` to finish before being aborted.
pub async fn supervise(
    watchers: Vec<TargetWatcher>,
    gate: WatchGate,
    trigger: &ShutdownTrigger,
    shutdown: Shutdown,
    grace: Duration,
) -> Result<(), WatchError> {
    let loops = watchers
        .into_iter()
        .map(|watcher| watcher.run(shutdown.clone(), gate.clone()))
        .collect::<Vec<_>>();
    supervise_tasks(loops, trigger, shutdown, grace).await
}

/// Supervision for arbitrary target loops; see [`supervise`].
pub async fn supervise_tasks<F>(
    loops: impl IntoIterator<Item = F>,
    trigger: &ShutdownTrigger,
    shutdown: Shutdown,
    grace: Duration,
) -> Result<(), WatchError>
where
    F: Future<Output = Result<(), WatchError>> + Send + 'static,
{
    let mut tasks = JoinSet::new();
    for task in loops {
        tasks.spawn(task);
    }

    let mut fatal: Option<WatchError> = None;
    let mut stop = shutdown.clone();
    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(err))) => {
                    error!(error = %err, "target loop failed; shutting down");
                    fatal = Some(err);
                    trigger.trigger();
                    break;
                }
                Some(Err(err)) => error!(error = %err, "target task panicked"),
            },
            _ = stop.wait() => break,
        }
    }

    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Err(err)) => {
                    error!(error = %err, "target loop failed during shutdown");
                    fatal.get_or_insert(err);
                }
                Err(err) if !err.is_cancelled() => error!(error = %err, "target task panicked"),
                _ => {}
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(grace_secs = grace.as_secs_f64(), remaining = tasks.len(), "grace period elapsed; aborting target loops");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    match fatal {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
