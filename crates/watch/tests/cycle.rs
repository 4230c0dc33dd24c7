use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use fetcher::{FetchError, FetchFailure, Fetched, PageRequest, RetryPolicy};
use notify::{Message, NotifyError, Notifier};
use snapshot::{ChangeEvent, ChangeKind, FirstRunPolicy, Price, RawPage, SnapshotSet};
use watch::{
    shutdown_channel, supervise, BaselineStore, CycleOutcome, CycleResult, FailureKind, PageSource,
    Phase, Schedule, StatusRegistry, TargetConfig, TargetWatcher, WatchError, WatchGate,
};

const URL: &str = "https://shop.example/c/new-in";

fn listing(items: &[(&str, &str, &str)]) -> String {
    let cards: String = items
        .iter()
        .map(|(slug, title, price)| {
            format!(
                r#"<a href="/p/{slug}"><div class="item-title">{title}</div><span class="price">{price}</span></a>"#
            )
        })
        .collect();
    format!("<html><body><div class=\"grid\">{cards}</div></body></html>")
}

enum Step {
    Page(String),
    Fail(u32, FetchError),
}

/// Replays scripted fetch results; when the script runs out it either hangs or
/// reports a closed pool.
#[derive(Default)]
struct FakeSource {
    steps: Mutex<VecDeque<Step>>,
    hang_when_empty: bool,
    calls: AtomicUsize,
}

impl FakeSource {
    fn page(self, html: String) -> Self {
        self.steps.lock().unwrap().push_back(Step::Page(html));
        self
    }

    fn fail(self, attempts: u32, error: FetchError) -> Self {
        self.steps.lock().unwrap().push_back(Step::Fail(attempts, error));
        self
    }

    fn hanging(mut self) -> Self {
        self.hang_when_empty = true;
        self
    }
}

#[async_trait]
impl PageSource for FakeSource {
    async fn fetch(&self, request: &PageRequest, _policy: &RetryPolicy) -> Result<Fetched, FetchFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Page(html)) => Ok(Fetched {
                page: RawPage {
                    url: request.url.clone(),
                    html,
                    fetched_at: Utc::now(),
                },
                attempts: 1,
            }),
            Some(Step::Fail(attempts, error)) => Err(FetchFailure { attempts, error }),
            None if self.hang_when_empty => std::future::pending().await,
            None => Err(FetchFailure {
                attempts: 1,
                error: FetchError::PoolClosed,
            }),
        }
    }
}

#[derive(Default)]
struct MemoryStore {
    baselines: Mutex<HashMap<String, SnapshotSet>>,
    commits: AtomicUsize,
    failing_commits: AtomicUsize,
    cycles: Mutex<Vec<String>>,
    incidents: Mutex<Vec<String>>,
    events: Mutex<Vec<ChangeEvent>>,
}

impl MemoryStore {
    fn baseline(&self, target: &str) -> Option<SnapshotSet> {
        self.baselines.lock().unwrap().get(target).cloned()
    }
}

#[async_trait]
impl BaselineStore for MemoryStore {
    async fn load_baseline(&self, target: &str) -> Result<Option<SnapshotSet>> {
        Ok(self.baseline(target))
    }

    async fn commit_baseline(&self, target: &str, snapshot: &SnapshotSet) -> Result<()> {
        let remaining = self.failing_commits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_commits.store(remaining - 1, Ordering::SeqCst);
            bail!("disk full");
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.baselines
            .lock()
            .unwrap()
            .insert(target.to_string(), snapshot.clone());
        Ok(())
    }

    async fn record_cycle(&self, outcome: &CycleOutcome) -> Result<()> {
        self.cycles.lock().unwrap().push(outcome.label().to_string());
        Ok(())
    }

    async fn record_events(&self, _target: &str, events: &[ChangeEvent]) -> Result<()> {
        self.events.lock().unwrap().extend_from_slice(events);
        Ok(())
    }

    async fn record_incident(&self, _target: &str, kind: &str, _message: &str) -> Result<()> {
        self.incidents.lock().unwrap().push(kind.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Message>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    fn changes(&self) -> Vec<Vec<ChangeEvent>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|message| match message {
                Message::Changes(report) => Some(report.events.clone()),
                _ => None,
            })
            .collect()
    }

    fn alerts(&self) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|message| matches!(message, Message::Alert { .. }))
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &Message) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Rejected {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

struct Harness {
    source: Arc<FakeSource>,
    store: Arc<MemoryStore>,
    notifier: Arc<RecordingNotifier>,
    status: StatusRegistry,
}

fn instant_config() -> TargetConfig {
    let mut config = TargetConfig::new("new-in", URL);
    config.schedule = Schedule {
        interval_secs: 0,
        jitter_min_secs: 0,
        jitter_max_secs: 0,
        floor_secs: 0,
    };
    config
}

async fn harnessed(config: TargetConfig, source: FakeSource) -> (TargetWatcher, Harness) {
    let harness = Harness {
        source: Arc::new(source),
        store: Arc::new(MemoryStore::default()),
        notifier: Arc::new(RecordingNotifier::default()),
        status: StatusRegistry::new(),
    };
    let mut watcher = TargetWatcher::new(
        config,
        harness.source.clone(),
        harness.store.clone(),
        harness.notifier.clone(),
        harness.status.clone(),
    )
    .expect("valid config");
    watcher.load_baseline().await.expect("baseline loads");
    (watcher, harness)
}

fn price_of(set: &SnapshotSet, id: &str) -> Option<Price> {
    set.get(id).and_then(|item| item.price.clone())
}

#[tokio::test]
async fn price_change_and_new_item_are_reported() {
    let source = FakeSource::default()
        .page(listing(&[("a", "Item A", "$10.00")]))
        .page(listing(&[("a", "Item A", "$12.50"), ("b", "Item B", "$5.00")]));
    let (mut watcher, h) = harnessed(instant_config(), source).await;

    watcher.run_cycle().await.unwrap();
    let outcome = watcher.run_cycle().await.unwrap();

    match outcome.result {
        CycleResult::Completed {
            items,
            added,
            removed,
            changed,
            notified,
            ..
        } => {
            assert_eq!((items, added, removed, changed), (2, 1, 0, 1));
            assert_eq!(notified, Some(true));
        }
        other => panic!("unexpected result {other:?}"),
    }

    let changes = h.notifier.changes();
    assert_eq!(changes.len(), 1);
    match &changes[0][..] {
        [ChangeEvent::PriceChanged { id, old, new }, ChangeEvent::Added { item }] => {
            assert_eq!(id, "/p/a");
            assert_eq!(old, &Some(Price::new(1_000, Some("USD"))));
            assert_eq!(new, &Some(Price::new(1_250, Some("USD"))));
            assert_eq!(item.id, "/p/b");
            assert_eq!(item.price, Some(Price::new(500, Some("USD"))));
        }
        other => panic!("unexpected events {other:?}"),
    }

    let stored = h.store.baseline("new-in").expect("baseline committed");
    assert_eq!(price_of(&stored, "/p/a"), Some(Price::new(1_250, Some("USD"))));
    assert!(stored.contains("/p/b"));
    assert_eq!(h.store.events.lock().unwrap().len(), 2);
    assert_eq!(watcher.phase(), Phase::Idle);
}

#[tokio::test]
async fn first_run_is_silent_by_default() {
    let source = FakeSource::default().page(listing(&[("a", "Item A", "$10.00")]));
    let (mut watcher, h) = harnessed(instant_config(), source).await;

    let outcome = watcher.run_cycle().await.unwrap();

    assert!(matches!(
        outcome.result,
        CycleResult::Completed { items: 1, added: 0, notified: None, .. }
    ));
    assert!(h.notifier.sent.lock().unwrap().is_empty());
    let stored = h.store.baseline("new-in").expect("baseline established");
    assert_eq!(price_of(&stored, "/p/a"), Some(Price::new(1_000, Some("USD"))));
    assert_eq!(watcher.baseline().map(SnapshotSet::len), Some(1));
}

#[tokio::test]
async fn first_run_can_announce_every_item() {
    let mut config = instant_config();
    config.first_run = FirstRunPolicy::EmitAdded;
    let source = FakeSource::default().page(listing(&[("a", "Item A", "$10.00"), ("b", "Item B", "$3.00")]));
    let (mut watcher, h) = harnessed(config, source).await;

    watcher.run_cycle().await.unwrap();

    let changes = h.notifier.changes();
    assert_eq!(changes.len(), 1);
    assert!(changes[0].iter().all(|event| event.kind() == ChangeKind::Added));
    assert_eq!(changes[0].len(), 2);
}

#[tokio::test]
async fn empty_page_leaves_baseline_untouched_and_alerts_once() {
    let source = FakeSource::default()
        .page(listing(&[("a", "Item A", "$10.00")]))
        .page("<html><body><p>Nothing here</p></body></html>".into())
        .page("<html><body><p>Nothing here</p></body></html>".into());
    let (mut watcher, h) = harnessed(instant_config(), source).await;
    watcher.run_cycle().await.unwrap();
    let before = h.store.baseline("new-in").expect("baseline");

    for _ in 0..2 {
        let outcome = watcher.run_cycle().await.unwrap();
        assert!(matches!(
            outcome.result,
            CycleResult::Failed {
                phase: Phase::Extracting,
                kind: FailureKind::ExtractionEmpty,
                ..
            }
        ));
    }

    assert_eq!(h.store.commits.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.baseline("new-in"), Some(before));
    assert_eq!(h.notifier.alerts(), 1);
    assert_eq!(*h.store.incidents.lock().unwrap(), vec!["extraction_empty"]);
    assert_eq!(
        *h.store.cycles.lock().unwrap(),
        vec!["completed", "extraction_empty", "extraction_empty"]
    );
}

#[tokio::test]
async fn failed_commit_replays_the_same_diff_next_cycle() {
    let changed = listing(&[("a", "Item A", "$12.50")]);
    let source = FakeSource::default()
        .page(listing(&[("a", "Item A", "$10.00")]))
        .page(changed.clone())
        .page(changed);
    let (mut watcher, h) = harnessed(instant_config(), source).await;
    watcher.run_cycle().await.unwrap();

    h.store.failing_commits.store(1, Ordering::SeqCst);
    let failed = watcher.run_cycle().await.unwrap();
    assert!(matches!(
        failed.result,
        CycleResult::Failed {
            phase: Phase::Persisting,
            kind: FailureKind::Persistence,
            ..
        }
    ));
    let in_memory = watcher.baseline().expect("baseline kept");
    assert_eq!(price_of(in_memory, "/p/a"), Some(Price::new(1_000, Some("USD"))));

    let retried = watcher.run_cycle().await.unwrap();
    assert!(matches!(retried.result, CycleResult::Completed { changed: 1, .. }));

    let changes = h.notifier.changes();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0], changes[1]);
    let stored = h.store.baseline("new-in").expect("baseline");
    assert_eq!(price_of(&stored, "/p/a"), Some(Price::new(1_250, Some("USD"))));
}

#[tokio::test]
async fn delivery_failure_still_commits() {
    let source = FakeSource::default()
        .page(listing(&[("a", "Item A", "$10.00")]))
        .page(listing(&[("a", "Item A", "$10.00"), ("b", "Item B", "$2.00")]));
    let (mut watcher, h) = harnessed(instant_config(), source).await;
    watcher.run_cycle().await.unwrap();

    h.notifier.failing.store(true, Ordering::SeqCst);
    let outcome = watcher.run_cycle().await.unwrap();

    assert!(matches!(
        outcome.result,
        CycleResult::Completed { added: 1, notified: Some(false), .. }
    ));
    assert!(h.store.baseline("new-in").expect("baseline").contains("/p/b"));
}

#[tokio::test]
async fn transient_fetch_failure_ends_cycle_quietly() {
    let source = FakeSource::default().fail(
        3,
        FetchError::Timeout {
            url: URL.into(),
            after: Duration::from_secs(60),
        },
    );
    let (mut watcher, h) = harnessed(instant_config(), source).await;

    let outcome = watcher.run_cycle().await.unwrap();

    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.label(), "transient_fetch");
    assert_eq!(h.notifier.alerts(), 0);
    assert_eq!(h.store.commits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn block_page_alerts_operator() {
    let source = FakeSource::default().fail(
        1,
        FetchError::Blocked {
            url: URL.into(),
            marker: "captcha".into(),
        },
    );
    let (mut watcher, h) = harnessed(instant_config(), source).await;

    let outcome = watcher.run_cycle().await.unwrap();

    assert!(matches!(
        outcome.result,
        CycleResult::Failed {
            phase: Phase::Fetching,
            kind: FailureKind::TerminalFetch,
            ..
        }
    ));
    assert_eq!(h.notifier.alerts(), 1);
    let status = h.status.snapshot(&WatchGate::new());
    assert_eq!(status[0].consecutive_failures, 1);
    assert_eq!(status[0].last_outcome.as_deref(), Some("terminal_fetch"));
}

#[tokio::test]
async fn exhausted_sessions_are_fatal() {
    let source = FakeSource::default().fail(
        3,
        FetchError::SessionsExhausted {
            attempts: 3,
            reason: "connection refused".into(),
        },
    );
    let (mut watcher, _h) = harnessed(instant_config(), source).await;

    let err = watcher.run_cycle().await.unwrap_err();
    assert!(matches!(err, WatchError::SessionsExhausted { .. }));
}

#[tokio::test]
async fn closed_pool_stops_the_loop_cleanly() {
    let source = FakeSource::default().page(listing(&[("a", "Item A", "$10.00")]));
    let (watcher, h) = harnessed(instant_config(), source).await;
    let (_trigger, shutdown) = shutdown_channel();

    tokio::time::timeout(Duration::from_secs(5), watcher.run(shutdown, WatchGate::new()))
        .await
        .expect("loop ends")
        .expect("clean stop");
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn shutdown_interrupts_an_inflight_fetch() {
    let (watcher, _h) = harnessed(instant_config(), FakeSource::default().hanging()).await;
    let (trigger, shutdown) = shutdown_channel();

    let task = tokio::spawn(watcher.run(shutdown, WatchGate::new()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.trigger();

    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("loop stops promptly")
        .expect("task joins")
        .expect("clean stop");
}

#[tokio::test]
async fn paused_target_skips_cycles_and_wakes_from_sleep_on_shutdown() {
    let mut config = instant_config();
    config.schedule.floor_secs = 30;
    let (watcher, h) = harnessed(config, FakeSource::default().hanging()).await;
    let gate = WatchGate::new();
    gate.pause(Some("new-in"));
    let (trigger, shutdown) = shutdown_channel();

    let task = tokio::spawn(watcher.run(shutdown, gate));
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.trigger();

    tokio::time::timeout(Duration::from_millis(200), task)
        .await
        .expect("inter-cycle sleep interrupted")
        .expect("task joins")
        .expect("clean stop");
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 0);
    let status = h.status.snapshot(&WatchGate::new());
    assert_eq!(status[0].last_outcome.as_deref(), Some("skipped"));
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn loops_ignoring_shutdown_are_aborted_after_grace() {
    let dropped = Arc::new(AtomicBool::new(false));
    let guard = SetOnDrop(dropped.clone());
    let stubborn = async move {
        let _guard = guard;
        std::future::pending::<()>().await;
        Ok::<(), WatchError>(())
    };
    let (trigger, shutdown) = shutdown_channel();
    let trigger = Arc::new(trigger);
    let later = trigger.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        later.trigger();
    });

    let started = std::time::Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        watch::supervise_tasks([stubborn], &trigger, shutdown, Duration::from_millis(100)),
    )
    .await
    .expect("supervisor gives up after grace");

    assert!(result.is_ok());
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(dropped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn fatal_target_brings_down_the_others() {
    let mut doomed_config = instant_config();
    doomed_config.id = "doomed".into();
    let (doomed, _h1) = harnessed(
        doomed_config,
        FakeSource::default().fail(
            2,
            FetchError::SessionsExhausted {
                attempts: 2,
                reason: "webdriver down".into(),
            },
        ),
    )
    .await;
    let (idle, _h2) = harnessed(instant_config(), FakeSource::default().hanging()).await;
    let (trigger, shutdown) = shutdown_channel();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        supervise(
            vec![doomed, idle],
            WatchGate::new(),
            &trigger,
            shutdown.clone(),
            Duration::from_secs(1),
        ),
    )
    .await
    .expect("supervisor returns");

    assert!(matches!(result, Err(WatchError::SessionsExhausted { ref target, .. }) if target == "doomed"));
    assert!(shutdown.is_triggered());
}
