//! Shared command setup
//!
//! Every command that touches sessions opens the engine the same way the
//! daemon does: configuration, metadata store, remote drive, then a
//! [`SyncService`] attached to the stored sessions. Attaching loads
//! sessions and stored settings without the daemon's startup work
//! (blacklist release, resumed hydration queues).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use kdsync_activity::{ActivityLogger, FanOutSink, TracingSink};
use kdsync_cache::{DatabasePool, SqliteStateRepository};
use kdsync_core::config::Config;
use kdsync_core::domain::{SessionId, SyncSession, UniqueId};
use kdsync_core::ports::{IStateRepository, SystemClock};
use kdsync_sync::{DirectoryRemoteDrive, EngineDeps, LocalFileSystem, ResourceCeiling, SyncService};

use crate::output::{get_formatter, OutputFormat, OutputFormatter};

/// Overrides the configuration file location, same as for the daemon
pub const CONFIG_ENV: &str = "KDSYNC_CONFIG";

/// Global options every command receives
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub format: OutputFormat,
    pub config_path: PathBuf,
}

impl CommandContext {
    pub fn new(format: OutputFormat, config_arg: Option<&str>) -> Self {
        Self {
            format,
            config_path: resolve_config_path(config_arg, std::env::var_os(CONFIG_ENV)),
        }
    }

    pub fn formatter(&self) -> Box<dyn OutputFormatter> {
        get_formatter(self.format)
    }

    /// Loads the configuration; a missing file means defaults
    pub fn load_config(&self) -> Result<Config> {
        if !self.config_path.exists() {
            debug!(path = %self.config_path.display(), "No configuration file, using defaults");
            return Ok(Config::default());
        }
        Config::load(&self.config_path)
            .with_context(|| format!("Failed to load {}", self.config_path.display()))
    }

    /// Loads and validates the configuration, then opens the engine
    pub async fn open_engine(&self) -> Result<Engine> {
        let config = self.load_config()?;
        let errors = config.validate();
        if !errors.is_empty() {
            let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
            anyhow::bail!(
                "Invalid configuration ({}): {}",
                self.config_path.display(),
                details.join("; ")
            );
        }
        Engine::open(config).await
    }
}

/// `--config` wins over the environment, which wins over the default path
fn resolve_config_path(arg: Option<&str>, env: Option<OsString>) -> PathBuf {
    arg.map(PathBuf::from)
        .or_else(|| env.filter(|v| !v.is_empty()).map(PathBuf::from))
        .unwrap_or_else(Config::default_path)
}

/// An engine attached to the stored sessions
pub struct Engine {
    pub config: Config,
    pub service: SyncService,
    pub repository: Arc<dyn IStateRepository>,
    writer: Option<JoinHandle<()>>,
}

impl Engine {
    /// Wires the engine over the configured store and drive
    pub async fn open(config: Config) -> Result<Self> {
        let db_path = config.database_path();
        let pool = DatabasePool::new(&db_path)
            .await
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;
        let repository: Arc<dyn IStateRepository> =
            Arc::new(SqliteStateRepository::new(pool.pool().clone()));
        let remote = DirectoryRemoteDrive::open(&config.remote.base_dir)
            .await
            .context("Failed to open remote drive")?;

        let mut sink = FanOutSink::new().with(Arc::new(TracingSink));
        let mut writer = None;
        if config.notifications.record_activity {
            let (logger, handle) = ActivityLogger::spawn(Arc::clone(&repository));
            sink = sink.with(Arc::new(logger));
            writer = Some(handle);
        }

        let deps = EngineDeps {
            repository: Arc::clone(&repository),
            fs: Arc::new(LocalFileSystem::new()),
            remote: Arc::new(remote),
            events: Arc::new(sink),
            clock: Arc::new(SystemClock),
            ceiling: Arc::new(ResourceCeiling::from_config(&config.resources)),
            hydrator: None,
        };
        let service = SyncService::new(&config, deps);
        service.attach().await.context("Failed to load sessions")?;

        Ok(Self {
            config,
            service,
            repository,
            writer,
        })
    }

    /// Finds a session by id or by name
    pub async fn find_session(&self, reference: &str) -> Result<SyncSession> {
        let sessions = self.service.list_sessions().await?;
        if let Ok(id) = SessionId::from_str(reference) {
            if let Some(session) = sessions.iter().find(|s| *s.id() == id) {
                return Ok(session.clone());
            }
        }

        let mut named = sessions.into_iter().filter(|s| s.name() == reference);
        match (named.next(), named.next()) {
            (Some(session), None) => Ok(session),
            (Some(_), Some(_)) => {
                anyhow::bail!("Several sessions are named '{reference}', use the session id")
            }
            (None, _) => anyhow::bail!("No session matches '{reference}'"),
        }
    }

    /// Resolves an optional session filter
    pub async fn session_filter(&self, reference: Option<&str>) -> Result<Option<SessionId>> {
        match reference {
            Some(reference) => Ok(Some(*self.find_session(reference).await?.id())),
            None => Ok(None),
        }
    }

    /// Resolves an item id, or a local path inside one of the sessions
    pub async fn resolve_item_id(&self, reference: &str) -> Result<UniqueId> {
        if let Ok(id) = UniqueId::from_str(reference) {
            return Ok(id);
        }

        let path = Path::new(reference);
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .context("Cannot resolve a relative path")?
                .join(path)
        };
        for session in self.service.list_sessions().await? {
            let Ok(relative) = session.local_root().relativize(&absolute) else {
                continue;
            };
            return match self
                .repository
                .get_item_by_path(session.id(), &relative)
                .await?
            {
                Some(item) => Ok(*item.id()),
                None => anyhow::bail!(
                    "{} is not known to session '{}' yet",
                    relative,
                    session.name()
                ),
            };
        }
        anyhow::bail!("{} is not inside any session", absolute.display())
    }

    /// Flushes the activity log; call before exiting
    pub async fn close(self) {
        let Engine { service, writer, .. } = self;
        // the writer drains once every logger clone is gone
        drop(service);
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!(error = %e, "Activity writer failed");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tempfile::TempDir;

    /// Engine over a scratch store and drive
    pub struct Scratch {
        pub dir: TempDir,
        pub engine: Engine,
    }

    impl Scratch {
        pub async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = Config::default();
            config.sync.database_path = Some(dir.path().join("state").join("kdsync.db"));
            config.remote.base_dir = dir.path().join("drive");
            let engine = Engine::open(config).await.unwrap();
            Self { dir, engine }
        }

        /// Creates a local folder under the scratch dir
        pub fn folder(&self, name: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::create_dir_all(&path).unwrap();
            path
        }
    }
}
