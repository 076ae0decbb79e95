//! kdsync Daemon - background synchronization service
//!
//! Runs every configured sync session:
//! - one watcher and one scheduler per session
//! - periodic remote polling and debounced local triggers
//! - activity logging and notification summaries
//! - an immediate cycle of every session on SIGUSR1
//! - graceful shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! The CLI and the daemon share the metadata store. Sessions added or
//! removed through the CLI are picked up on the next session refresh,
//! together with changed resource and large-folder settings. Pause and
//! resume take effect at the next cycle, which rereads the session row.
//! Shutdown is driven by a `CancellationToken` whose children stop the
//! schedulers.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kdsync_activity::{ActivityAggregator, ActivityLogger, FanOutSink, TracingSink};
use kdsync_cache::{DatabasePool, SqliteStateRepository};
use kdsync_core::config::{Config, LogFormat, LoggingConfig};
use kdsync_core::domain::{SessionId, SyncSession};
use kdsync_core::ports::{IEventSink, IStateRepository, SystemClock};
use kdsync_sync::{
    DirectoryRemoteDrive, EngineDeps, LocalFileSystem, ResourceCeiling, SchedulerHandle,
    SessionScheduler, SessionWatcher, SyncService,
};

/// Overrides the configuration file location
const CONFIG_ENV: &str = "KDSYNC_CONFIG";

const SESSION_REFRESH: Duration = Duration::from_secs(15);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// A session with a live scheduler
struct RunningSession {
    task: JoinHandle<()>,
    stop: CancellationToken,
    trigger: SchedulerHandle,
    _watcher: Option<SessionWatcher>,
}

/// Owns the engine and the per-session schedulers
struct Daemon {
    config: Config,
    service: Arc<SyncService>,
    shutdown: CancellationToken,
    running: HashMap<SessionId, RunningSession>,
    background: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Opens the store and the remote drive and wires the engine
    async fn new(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let db_path = config.database_path();
        let pool = DatabasePool::new(&db_path)
            .await
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;
        info!(path = %db_path.display(), "Metadata store opened");
        let repository: Arc<dyn IStateRepository> =
            Arc::new(SqliteStateRepository::new(pool.pool().clone()));

        let remote = DirectoryRemoteDrive::open(&config.remote.base_dir)
            .await
            .context("Failed to open remote drive")?;

        let mut background = Vec::new();
        let mut sink = FanOutSink::new().with(Arc::new(TracingSink));
        if config.notifications.record_activity {
            let (logger, writer) = ActivityLogger::spawn(Arc::clone(&repository));
            sink = sink.with(Arc::new(logger));
            background.push(writer);
        }
        if config.notifications.enabled {
            let aggregator = Arc::new(ActivityAggregator::new());
            sink = sink.with(Arc::clone(&aggregator) as Arc<dyn IEventSink>);
            background.push(spawn_notifier(
                aggregator,
                Duration::from_millis(config.notifications.flush_interval_ms),
                shutdown.clone(),
            ));
        }

        let deps = EngineDeps {
            repository,
            fs: Arc::new(LocalFileSystem::new()),
            remote: Arc::new(remote),
            events: Arc::new(sink),
            clock: Arc::new(SystemClock),
            ceiling: Arc::new(ResourceCeiling::from_config(&config.resources)),
            hydrator: None,
        };
        let service = Arc::new(SyncService::new(&config, deps));

        Ok(Self {
            config,
            service,
            shutdown,
            running: HashMap::new(),
            background,
        })
    }

    /// Runs until the shutdown token fires
    async fn run(mut self) -> Result<()> {
        let sessions = self
            .service
            .start()
            .await
            .context("Failed to load sessions")?;
        info!(count = sessions.len(), "Sessions loaded");
        for session in &sessions {
            self.spawn_session(session);
        }

        let mut refresh = tokio::time::interval(SESSION_REFRESH);
        refresh.tick().await;
        let mut requests = sync_requests();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = next_sync_request(&mut requests) => {
                    info!("Sync requested for all sessions");
                    self.sync_all();
                }
                _ = refresh.tick() => {
                    if let Err(e) = self.refresh_sessions().await {
                        warn!(error = %e, "Session refresh failed");
                    }
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Starts schedulers for new sessions and forgets finished ones
    ///
    /// Also reapplies runtime settings stored by the CLI.
    async fn refresh_sessions(&mut self) -> Result<()> {
        let sessions = self.service.attach().await?;

        self.running.retain(|id, running| {
            let alive = !running.task.is_finished() && sessions.iter().any(|s| s.id() == id);
            if !alive {
                info!(session_id = %id, "Session scheduler retired");
                running.stop.cancel();
            }
            alive
        });
        for session in &sessions {
            if !self.running.contains_key(session.id()) {
                self.spawn_session(session);
            }
        }
        Ok(())
    }

    fn spawn_session(&mut self, session: &SyncSession) {
        let root = session.local_root().as_path().to_path_buf();
        let (watcher, changes) = match SessionWatcher::start(&root) {
            Ok((watcher, changes)) => (Some(watcher), changes),
            Err(e) => {
                // polling still picks changes up
                warn!(session_id = %session.id(), root = %root.display(), error = %e, "Watcher unavailable");
                let (_, changes) = mpsc::channel(1);
                (None, changes)
            }
        };

        let (scheduler, trigger) =
            SessionScheduler::new(Arc::clone(&self.service), *session.id(), &self.config.sync);
        let stop = self.shutdown.child_token();
        let task = tokio::spawn(scheduler.run(changes, stop.clone()));
        info!(session_id = %session.id(), name = session.name(), "Session scheduler started");

        self.running.insert(
            *session.id(),
            RunningSession {
                task,
                stop,
                trigger,
                _watcher: watcher,
            },
        );
    }

    /// Asks every session for an immediate cycle
    fn sync_all(&self) {
        for running in self.running.values() {
            running.trigger.request_sync();
        }
    }

    /// Cancels in-flight cycles and waits for the schedulers
    async fn stop(self) {
        for (id, running) in &self.running {
            running.stop.cancel();
            if let Some(token) = self.service.session_token(id) {
                token.cancel();
            }
        }

        let tasks: Vec<JoinHandle<()>> = self.running.into_values().map(|r| r.task).collect();
        let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
            for task in tasks {
                if let Err(e) = task.await {
                    error!(error = %e, "Scheduler task panicked");
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!("Schedulers did not stop in time");
        }

        // the activity writer drains once the engine is gone
        drop(self.service);
        for task in self.background {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Background task did not finish in time");
            }
        }
        info!("All sessions stopped");
    }
}

/// Logs aggregated activity messages as they are flushed
fn spawn_notifier(
    aggregator: Arc<ActivityAggregator>,
    window: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::channel(64);
    tokio::spawn(aggregator.run(window, tx, shutdown));
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            info!(
                target: "kdsync::activity",
                session_id = %message.session_id,
                kind = message.kind.as_str(),
                count = message.count,
                "{}",
                message.text
            );
        }
    })
}

/// Configuration file location: `$KDSYNC_CONFIG` or the platform default
fn config_path(env: Option<OsString>) -> PathBuf {
    env.filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path)
}

/// Loads and validates the configuration
///
/// A missing file means defaults; an unreadable or invalid one is fatal.
fn load_config(path: &std::path::Path) -> Result<Config> {
    let config = if path.exists() {
        Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?
    } else {
        Config::default()
    };

    let errors = config.validate();
    if !errors.is_empty() {
        let details: Vec<String> = errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        anyhow::bail!("Invalid configuration: {}", details.join("; "));
    }
    Ok(config)
}

/// `RUST_LOG` wins over the configured level
fn env_filter(logging: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = env_filter(logging);
    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
    }
}

/// SIGUSR1 asks every session for an immediate cycle
#[cfg(unix)]
type SyncRequests = Option<tokio::signal::unix::Signal>;
#[cfg(not(unix))]
type SyncRequests = ();

#[cfg(unix)]
fn sync_requests() -> SyncRequests {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1()) {
        Ok(signal) => Some(signal),
        Err(e) => {
            warn!(error = %e, "Failed to install SIGUSR1 handler");
            None
        }
    }
}

#[cfg(not(unix))]
fn sync_requests() -> SyncRequests {}

#[cfg(unix)]
async fn next_sync_request(requests: &mut SyncRequests) {
    match requests {
        Some(signal) => {
            if signal.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn next_sync_request(_requests: &mut SyncRequests) {
    std::future::pending::<()>().await
}

/// Waits for SIGTERM or SIGINT and cancels `token`
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }

    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path(std::env::var_os(CONFIG_ENV));
    let config = load_config(&path)?;
    init_tracing(&config.logging);
    info!(config_path = %path.display(), "kdsync daemon starting (kdsyncd)");

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let daemon = Daemon::new(config, shutdown).await?;
    let result = daemon.run().await;

    match &result {
        Ok(()) => info!("kdsync daemon shut down gracefully"),
        Err(e) => error!(error = %e, "kdsync daemon exiting with error"),
    }
    result
}
