use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use admin_ipc::{run_server, DEFAULT_SOCKET_PATH};
use anyhow::Context;
use clap::{Parser, ValueEnum};
use fetcher::{
    Fetcher, SessionFactory, SessionPool, WebDriverFactory, DEFAULT_USER_AGENT, DEFAULT_WEBDRIVER_URL,
};
use metrics::MetricsHandle;
use notify::{from_credentials, Message};
use storage::init_sqlite;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task;
use tracing::{error, info, warn};
use tracing_subscriber::filter::FromEnvError;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use watch::{
    admin_handler, load_targets, shutdown_channel, supervise, validate_targets, BaselineStore,
    ConfigError, PageSource, RunStore, StatusRegistry, TargetConfig, TargetWatcher, WatchGate,
    DEFAULT_TARGET_URL,
};

/// How targets share headless browser sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SessionSharing {
    /// One pool of `--pool-size` sessions for every target.
    Shared,
    /// A dedicated single-session pool per target.
    PerTarget,
}

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, env = "SQLITE_PATH", default_value = "sqlite://watch.db")]
    db_path: String,

    #[arg(long, env = "ADMIN_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    admin_socket: String,

    #[arg(long, env = "METRICS_ADDR", default_value = "127.0.0.1:9109")]
    metrics_addr: SocketAddr,

    #[arg(long, env = "WEBDRIVER_URL", default_value = DEFAULT_WEBDRIVER_URL)]
    webdriver_url: String,

    /// User agent the headless browser presents.
    #[arg(long, env = "BROWSER_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    user_agent: String,

    /// JSON array of target configs; overrides `--url`.
    #[arg(long, env = "TARGETS_FILE")]
    targets_file: Option<PathBuf>,

    #[arg(long, env = "WATCH_URL", default_value = DEFAULT_TARGET_URL)]
    url: String,

    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    telegram_bot_token: Option<String>,

    #[arg(long, env = "TELEGRAM_CHAT_ID")]
    telegram_chat_id: Option<String>,

    #[arg(long, env = "SESSION_SHARING", value_enum, default_value_t = SessionSharing::Shared)]
    session_sharing: SessionSharing,

    #[arg(long, env = "BROWSER_POOL_SIZE", default_value_t = 1)]
    pool_size: usize,

    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    shutdown_grace_secs: u64,
}

fn log_startup(args: &Args, run_id: &str, targets: &[TargetConfig]) {
    info!(path = %args.db_path, "sqlite path configured");
    info!(socket = %args.admin_socket, "admin socket bind planned");
    info!(addr = %args.metrics_addr, "metrics bind planned");
    info!(url = %args.webdriver_url, sharing = ?args.session_sharing, pool_size = args.pool_size, "webdriver configured");
    for target in targets {
        info!(target_id = %target.id, url = %target.url, first_run = ?target.first_run, "target configured");
    }
    info!(%run_id, "run initialized");
}

fn resolve_targets(args: &Args) -> Result<Vec<TargetConfig>, ConfigError> {
    match &args.targets_file {
        Some(path) => load_targets(path),
        None => {
            let targets = vec![TargetConfig::new("default", args.url.clone())];
            validate_targets(&targets)?;
            Ok(targets)
        }
    }
}

fn browser_factory(args: &Args) -> WebDriverFactory {
    WebDriverFactory::new(args.webdriver_url.clone()).with_user_agent(args.user_agent.clone())
}

/// One page source per target, plus the pools backing them for shutdown.
fn build_sources(
    factory: Arc<dyn SessionFactory>,
    targets: &[TargetConfig],
    sharing: SessionSharing,
    pool_size: usize,
) -> (Vec<Arc<SessionPool>>, Vec<Arc<dyn PageSource>>) {
    match sharing {
        SessionSharing::Shared => {
            let pool = SessionPool::new(factory, pool_size.max(1));
            let fetcher: Arc<dyn PageSource> = Arc::new(Fetcher::new(pool.clone()));
            (vec![pool], targets.iter().map(|_| fetcher.clone()).collect())
        }
        SessionSharing::PerTarget => targets
            .iter()
            .map(|_| {
                let pool = SessionPool::new(factory.clone(), 1);
                let fetcher: Arc<dyn PageSource> = Arc::new(Fetcher::new(pool.clone()));
                (pool, fetcher)
            })
            .unzip(),
    }
}

/// `RUST_LOG` when it is set and valid, otherwise INFO and above.
fn log_filter(from_env: Result<EnvFilter, FromEnvError>) -> EnvFilter {
    from_env.unwrap_or_else(|_| EnvFilter::new("info"))
}

async fn wait_for_signal() -> anyhow::Result<&'static str> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(EnvFilter::try_from_default_env()))
        .init();

    let args = Args::parse();
    let targets = resolve_targets(&args).context("invalid target configuration")?;
    info!(
        sqlite = %args.db_path,
        targets = targets.len(),
        "booting watchd"
    );

    let run_id = Uuid::new_v4().to_string();
    let store = init_sqlite(&args.db_path)
        .await
        .context("failed to initialize baseline storage")?;
    store.insert_run(&run_id, None).await?;
    log_startup(&args, &run_id, &targets);

    let missing_tables = store.validate_required_tables().await?;
    if !missing_tables.is_empty() {
        warn!(tables = ?missing_tables, "sqlite missing required tables");
        if let Err(err) = store
            .log_incident(
                &run_id,
                "warning",
                "db_schema_missing",
                &format!("sqlite missing required tables: {}", missing_tables.join(", ")),
            )
            .await
        {
            warn!(error = ?err, "failed to log missing schema incident");
        }
    }

    let metrics = MetricsHandle::new()?;
    let notifier = from_credentials(
        args.telegram_bot_token.as_deref(),
        args.telegram_chat_id.as_deref(),
    )?;
    let factory: Arc<dyn SessionFactory> = Arc::new(browser_factory(&args));
    let (pools, sources) = build_sources(factory, &targets, args.session_sharing, args.pool_size);
    let baselines: Arc<dyn BaselineStore> = Arc::new(RunStore::new(store.clone(), run_id.clone()));
    let status = StatusRegistry::new();
    let gate = WatchGate::new();

    let urls: Vec<String> = targets.iter().map(|t| t.url.clone()).collect();
    let mut watchers = Vec::with_capacity(targets.len());
    for (config, source) in targets.into_iter().zip(sources) {
        let mut watcher = TargetWatcher::new(
            config,
            source,
            baselines.clone(),
            notifier.clone(),
            status.clone(),
        )?
        .with_metrics(metrics.clone());
        watcher.load_baseline().await?;
        watchers.push(watcher);
    }

    let socket_path = args.admin_socket.clone();
    let handler = admin_handler(run_id.clone(), gate.clone(), status.clone());
    task::spawn(async move {
        if let Err(err) = run_server(&socket_path, handler).await {
            error!(error = ?err, "admin ipc server failed");
        }
    });

    let metrics_addr = args.metrics_addr;
    let metrics_task = metrics.clone();
    task::spawn(async move {
        if let Err(err) = metrics_task.serve(metrics_addr).await {
            error!(error = ?err, "metrics server error");
        }
    });

    if let Err(err) = notifier.send(&Message::Started { urls }).await {
        warn!(error = %err, "failed to announce startup");
    }
    info!(
        run_id = %run_id,
        admin_socket = %args.admin_socket,
        metrics_addr = %args.metrics_addr,
        "ready"
    );

    let (trigger, shutdown) = shutdown_channel();
    let trigger = Arc::new(trigger);
    let signal_trigger = trigger.clone();
    task::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => info!(signal = name, "shutdown requested"),
            Err(err) => error!(error = ?err, "signal handler failed; shutting down"),
        }
        signal_trigger.trigger();
    });

    let grace = Duration::from_secs(args.shutdown_grace_secs);
    let result = supervise(watchers, gate, &trigger, shutdown, grace).await;
    for pool in &pools {
        pool.shutdown().await;
    }

    if let Err(err) = &result {
        if let Err(log_err) = store
            .log_incident(&run_id, "error", "fatal", &err.to_string())
            .await
        {
            warn!(error = ?log_err, "failed to record fatal incident");
        }
    }
    result?;
    info!(run_id = %run_id, "stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tracing::Level;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct VecWriter(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for VecWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for VecWriter {
        type Writer = VecWriter;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn factory() -> Arc<dyn SessionFactory> {
        Arc::new(WebDriverFactory::new(DEFAULT_WEBDRIVER_URL))
    }

    #[test]
    fn startup_logs_include_configuration() {
        let args = Args::parse_from([
            "watchd",
            "--db-path",
            "sqlite:///tmp/watch-test.db",
            "--admin-socket",
            "/tmp/watch-test.sock",
            "--metrics-addr",
            "127.0.0.1:9000",
            "--url",
            "https://shop.example/c/new-in",
        ]);
        let targets = resolve_targets(&args).expect("fallback target");
        let run_id = Uuid::nil().to_string();
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = VecWriter(buffer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_writer(writer)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            log_startup(&args, &run_id, &targets);
        });

        let output =
            String::from_utf8(buffer.lock().unwrap().clone()).expect("log output should be utf8");
        assert!(output.contains("sqlite path configured"));
        assert!(output.contains("admin socket bind planned"));
        assert!(output.contains("metrics bind planned"));
        assert!(output.contains("webdriver configured"));
        assert!(output.contains("target configured"));
        assert!(output.contains("run initialized"));
        assert!(output.contains(&args.db_path));
        assert!(output.contains(&args.admin_socket));
        assert!(output.contains(&args.metrics_addr.to_string()));
        assert!(output.contains("https://shop.example/c/new-in"));
        assert!(output.contains(&run_id));
    }

    #[test]
    fn info_is_logged_without_rust_log() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(log_filter(EnvFilter::try_from_env(
                "WATCHD_TEST_LOG_FILTER_NEVER_SET",
            )))
            .with_writer(VecWriter(buffer.clone()))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            info!(target_id = "default", "cycle completed");
            warn!(target_id = "default", "cycle failed");
            tracing::debug!("phase");
        });

        let output =
            String::from_utf8(buffer.lock().unwrap().clone()).expect("log output should be utf8");
        assert!(output.contains("cycle completed"));
        assert!(output.contains("cycle failed"));
        assert!(!output.contains("phase"));
    }

    #[test]
    fn explicit_filter_overrides_the_default() {
        let filter = log_filter(Ok(EnvFilter::new("warn")));
        assert_eq!(
            filter.max_level_hint(),
            Some(tracing_subscriber::filter::LevelFilter::WARN)
        );
    }

    #[test]
    fn defaults_match_the_single_target_watcher() {
        let args = Args::parse_from(["watchd"]);
        assert_eq!(args.db_path, "sqlite://watch.db");
        assert_eq!(args.url, DEFAULT_TARGET_URL);
        assert_eq!(args.session_sharing, SessionSharing::Shared);
        assert_eq!(args.pool_size, 1);

        let targets = resolve_targets(&args).expect("default target is valid");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].url, DEFAULT_TARGET_URL);
    }

    #[test]
    fn targets_file_overrides_url() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("targets.json");
        std::fs::write(
            &path,
            r#"[{"id": "a", "url": "https://shop.example/a"}, {"id": "b", "url": "https://shop.example/b"}]"#,
        )
        .expect("write targets");
        let args = Args::parse_from([
            "watchd",
            "--targets-file",
            path.to_str().expect("utf8 path"),
        ]);

        let ids: Vec<String> = resolve_targets(&args)
            .expect("valid file")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn rejects_invalid_fallback_url() {
        let args = Args::parse_from(["watchd", "--url", "ftp://shop.example"]);
        assert!(matches!(resolve_targets(&args), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn session_sharing_controls_pool_layout() {
        let targets = vec![
            TargetConfig::new("a", "https://shop.example/a"),
            TargetConfig::new("b", "https://shop.example/b"),
        ];

        let (pools, sources) = build_sources(factory(), &targets, SessionSharing::Shared, 3);
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].size(), 3);
        assert_eq!(sources.len(), 2);

        let (pools, sources) = build_sources(factory(), &targets, SessionSharing::PerTarget, 3);
        assert_eq!(pools.len(), 2);
        assert!(pools.iter().all(|pool| pool.size() == 1));
        assert_eq!(sources.len(), 2);
    }

    #[test]
    fn user_agent_reaches_the_browser_factory() {
        let args = Args::parse_from(["watchd", "--user-agent", "watch-test/1.0"]);
        assert_eq!(browser_factory(&args).user_agent(), "watch-test/1.0");

        let defaults = Args::parse_from(["watchd"]);
        assert_eq!(browser_factory(&defaults).user_agent(), DEFAULT_USER_AGENT);
    }

    #[test]
    fn parses_per_target_sharing() {
        let args = Args::parse_from(["watchd", "--session-sharing", "per-target", "--pool-size", "4"]);
        assert_eq!(args.session_sharing, SessionSharing::PerTarget);
        assert_eq!(args.pool_size, 4);
    }
}
