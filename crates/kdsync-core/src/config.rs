//! Configuration module for kdsync.
//!
//! Typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder for programmatic use.
//! Every section is optional in the file; missing keys take their defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::ConflictPolicy;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for kdsync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub resources: ResourcesConfig,
    pub conflicts: ConflictsConfig,
    pub blacklist: BlacklistConfig,
    pub platform: PlatformConfig,
    pub exclusions: ExclusionsConfig,
    pub litesync: LiteSyncConfig,
    pub remote: RemoteConfig,
    pub notifications: NotificationsConfig,
    pub logging: LoggingConfig,
}

/// Reconciliation cycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Milliseconds of quiet after a local change before a cycle starts.
    pub debounce_delay_ms: u64,
    /// Seconds between remote change-feed polls.
    pub remote_poll_interval_secs: u64,
    /// Consecutive transient failures before an item is blacklisted.
    pub max_item_retries: u32,
    /// First backoff delay for remote calls, doubled on each retry.
    pub retry_base_delay_ms: u64,
    /// Attempts per remote call before giving up for this cycle.
    pub retry_max_attempts: u32,
    /// Largest file uploaded, in MiB (0 = unlimited).
    pub max_upload_size_mb: u64,
    /// Remote folders above this size wait for confirmation (0 = never).
    pub large_folder_threshold_mb: u64,
    /// Metadata store location; defaults to the data directory.
    pub database_path: Option<PathBuf>,
}

/// Resource ceiling applied to the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Actions running at the same time per session.
    pub max_concurrent_actions: u32,
    /// Transfer bandwidth in KiB/s (0 = unlimited).
    pub bandwidth_limit_kbps: u64,
}

/// Which side wins an edit-edit conflict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditEditWinner {
    #[default]
    Remote,
    Local,
}

/// A glob rule overriding the default conflict policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRule {
    /// Glob matched against the session-relative path.
    pub pattern: String,
    pub policy: ConflictPolicy,
}

/// Conflict resolution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictsConfig {
    pub edit_edit_winner: EditEditWinner,
    /// When false every conflict waits for a manual decision.
    pub auto_resolve: bool,
    /// First match wins.
    pub rules: Vec<ConflictRule>,
}

/// Blacklist retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    /// Seconds before a temporary entry is retried.
    pub retry_interval_secs: u64,
    /// Release every temporary entry when the daemon starts.
    pub clear_temporary_on_startup: bool,
}

/// Operating system whose naming rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetOs {
    Linux,
    Macos,
    Windows,
}

impl TargetOs {
    /// The OS this binary runs on
    pub fn host() -> Self {
        if cfg!(target_os = "windows") {
            TargetOs::Windows
        } else if cfg!(target_os = "macos") {
            TargetOs::Macos
        } else {
            TargetOs::Linux
        }
    }

    pub fn default_max_path_length(&self) -> usize {
        match self {
            TargetOs::Windows => 260,
            TargetOs::Linux | TargetOs::Macos => 4096,
        }
    }

    pub fn default_case_insensitive(&self) -> bool {
        !matches!(self, TargetOs::Linux)
    }
}

impl Default for TargetOs {
    fn default() -> Self {
        Self::host()
    }
}

/// Platform naming constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub target_os: TargetOs,
    /// Longest name component, in bytes.
    pub max_name_length: usize,
    /// Longest full path; defaults by OS.
    pub max_path_length: Option<usize>,
    /// Case-insensitive filesystem; defaults by OS.
    pub case_insensitive: Option<bool>,
}

impl PlatformConfig {
    pub fn effective_max_path_length(&self) -> usize {
        self.max_path_length
            .unwrap_or_else(|| self.target_os.default_max_path_length())
    }

    pub fn effective_case_insensitive(&self) -> bool {
        self.case_insensitive
            .unwrap_or_else(|| self.target_os.default_case_insensitive())
    }
}

/// User exclusion templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusionsConfig {
    /// Globs matched against each path component.
    pub templates: Vec<String>,
    /// Templates reported as `custom-template-exclusion` instead of silently skipped.
    pub warn_templates: Vec<String>,
}

/// Lite Sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiteSyncConfig {
    /// Concurrent hydrations.
    pub hydration_concurrency: u32,
}

/// Remote drive adapter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Directory backing the remote drive.
    pub base_dir: PathBuf,
}

/// Activity notification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub enabled: bool,
    /// How long item events are grouped before a summary is produced.
    pub flush_interval_ms: u64,
    /// Keep every event in the store's activity log.
    pub record_activity: bool,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    pub format: LogFormat,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/kdsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("kdsync")
            .join("config.yaml")
    }

    /// Directory for the metadata store and other state.
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("kdsync")
    }

    /// Metadata store path, honouring `sync.database_path`.
    pub fn database_path(&self) -> PathBuf {
        self.sync
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("kdsync.db"))
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_delay_ms: 500,
            remote_poll_interval_secs: 60,
            max_item_retries: 3,
            retry_base_delay_ms: 1000,
            retry_max_attempts: 5,
            max_upload_size_mb: 0,
            large_folder_threshold_mb: 500,
            database_path: None,
        }
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            max_concurrent_actions: 4,
            bandwidth_limit_kbps: 0,
        }
    }
}

impl Default for ConflictsConfig {
    fn default() -> Self {
        Self {
            edit_edit_winner: EditEditWinner::Remote,
            auto_resolve: true,
            rules: Vec::new(),
        }
    }
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 3600,
            clear_temporary_on_startup: true,
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            target_os: TargetOs::host(),
            max_name_length: 255,
            max_path_length: None,
            case_insensitive: None,
        }
    }
}

/// Built-in exclusion templates (editor backups, lock files, OS metadata,
/// partial downloads).
pub const DEFAULT_EXCLUSION_TEMPLATES: &[&str] = &[
    "*~",
    "~$*",
    ".~lock.*",
    "~*.tmp",
    "*.~*",
    ".DS_Store",
    "._*",
    ".Trashes",
    ".Spotlight-V100",
    ".fseventsd",
    "Thumbs.db",
    "desktop.ini",
    "*.part",
    "*.filepart",
    "*.crdownload",
    "*.download",
    ".Trash-*",
    ".directory",
    "*.swp",
    "*.lnk",
];

impl Default for ExclusionsConfig {
    fn default() -> Self {
        Self {
            templates: DEFAULT_EXCLUSION_TEMPLATES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            warn_templates: Vec::new(),
        }
    }
}

impl Default for LiteSyncConfig {
    fn default() -> Self {
        Self {
            hydration_concurrency: 4,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_dir: Config::data_dir().join("remote"),
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_ms: 2000,
            record_activity: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.debounce_delay_ms"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError {
            field: field.into(),
            message: "must be greater than 0".into(),
        });
    }
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- sync ---
        positive(
            &mut errors,
            "sync.remote_poll_interval_secs",
            self.sync.remote_poll_interval_secs,
        );
        positive(
            &mut errors,
            "sync.max_item_retries",
            u64::from(self.sync.max_item_retries),
        );
        positive(
            &mut errors,
            "sync.retry_max_attempts",
            u64::from(self.sync.retry_max_attempts),
        );

        // --- resources ---
        if self.resources.max_concurrent_actions == 0 || self.resources.max_concurrent_actions > 64
        {
            errors.push(ValidationError {
                field: "resources.max_concurrent_actions".into(),
                message: "must be in range 1..=64".into(),
            });
        }

        // --- conflicts ---
        for (idx, rule) in self.conflicts.rules.iter().enumerate() {
            if let Err(e) = glob::Pattern::new(&rule.pattern) {
                errors.push(ValidationError {
                    field: format!("conflicts.rules[{idx}].pattern"),
                    message: format!("invalid glob '{}': {e}", rule.pattern),
                });
            }
        }

        // --- blacklist ---
        positive(
            &mut errors,
            "blacklist.retry_interval_secs",
            self.blacklist.retry_interval_secs,
        );

        // --- notifications ---
        if self.notifications.enabled {
            positive(
                &mut errors,
                "notifications.flush_interval_ms",
                self.notifications.flush_interval_ms,
            );
        }

        // --- platform ---
        if self.platform.max_name_length == 0 {
            errors.push(ValidationError {
                field: "platform.max_name_length".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.platform.effective_max_path_length() < self.platform.max_name_length {
            errors.push(ValidationError {
                field: "platform.max_path_length".into(),
                message: format!(
                    "max_path_length ({}) must not be below max_name_length ({})",
                    self.platform.effective_max_path_length(),
                    self.platform.max_name_length
                ),
            });
        }

        // --- exclusions ---
        for (idx, template) in self
            .exclusions
            .templates
            .iter()
            .chain(self.exclusions.warn_templates.iter())
            .enumerate()
        {
            if let Err(e) = glob::Pattern::new(template) {
                errors.push(ValidationError {
                    field: format!("exclusions.templates[{idx}]"),
                    message: format!("invalid glob '{template}': {e}"),
                });
            }
        }

        // --- litesync ---
        if self.litesync.hydration_concurrency == 0 || self.litesync.hydration_concurrency > 32 {
            errors.push(ValidationError {
                field: "litesync.hydration_concurrency".into(),
                message: "must be in range 1..=32".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use kdsync_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .max_concurrent_actions(8)
///     .blacklist_retry_interval_secs(600)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn debounce_delay_ms(mut self, ms: u64) -> Self {
        self.config.sync.debounce_delay_ms = ms;
        self
    }

    pub fn remote_poll_interval_secs(mut self, secs: u64) -> Self {
        self.config.sync.remote_poll_interval_secs = secs;
        self
    }

    pub fn max_item_retries(mut self, n: u32) -> Self {
        self.config.sync.max_item_retries = n;
        self
    }

    pub fn retry_policy(mut self, base_delay_ms: u64, max_attempts: u32) -> Self {
        self.config.sync.retry_base_delay_ms = base_delay_ms;
        self.config.sync.retry_max_attempts = max_attempts;
        self
    }

    pub fn max_upload_size_mb(mut self, mb: u64) -> Self {
        self.config.sync.max_upload_size_mb = mb;
        self
    }

    pub fn large_folder_threshold_mb(mut self, mb: u64) -> Self {
        self.config.sync.large_folder_threshold_mb = mb;
        self
    }

    pub fn database_path(mut self, path: PathBuf) -> Self {
        self.config.sync.database_path = Some(path);
        self
    }

    // --- resources ---

    pub fn max_concurrent_actions(mut self, n: u32) -> Self {
        self.config.resources.max_concurrent_actions = n;
        self
    }

    pub fn bandwidth_limit_kbps(mut self, kbps: u64) -> Self {
        self.config.resources.bandwidth_limit_kbps = kbps;
        self
    }

    // --- conflicts ---

    pub fn edit_edit_winner(mut self, winner: EditEditWinner) -> Self {
        self.config.conflicts.edit_edit_winner = winner;
        self
    }

    pub fn auto_resolve(mut self, enabled: bool) -> Self {
        self.config.conflicts.auto_resolve = enabled;
        self
    }

    pub fn conflict_rule(mut self, pattern: impl Into<String>, policy: ConflictPolicy) -> Self {
        self.config.conflicts.rules.push(ConflictRule {
            pattern: pattern.into(),
            policy,
        });
        self
    }

    // --- blacklist ---

    pub fn blacklist_retry_interval_secs(mut self, secs: u64) -> Self {
        self.config.blacklist.retry_interval_secs = secs;
        self
    }

    pub fn clear_temporary_on_startup(mut self, enabled: bool) -> Self {
        self.config.blacklist.clear_temporary_on_startup = enabled;
        self
    }

    // --- platform ---

    pub fn target_os(mut self, os: TargetOs) -> Self {
        self.config.platform.target_os = os;
        self
    }

    pub fn max_name_length(mut self, n: usize) -> Self {
        self.config.platform.max_name_length = n;
        self
    }

    pub fn max_path_length(mut self, n: usize) -> Self {
        self.config.platform.max_path_length = Some(n);
        self
    }

    pub fn case_insensitive(mut self, enabled: bool) -> Self {
        self.config.platform.case_insensitive = Some(enabled);
        self
    }

    // --- exclusions ---

    pub fn exclusion_templates(mut self, templates: Vec<String>) -> Self {
        self.config.exclusions.templates = templates;
        self
    }

    pub fn warn_template(mut self, template: impl Into<String>) -> Self {
        self.config.exclusions.warn_templates.push(template.into());
        self
    }

    // --- litesync ---

    pub fn hydration_concurrency(mut self, n: u32) -> Self {
        self.config.litesync.hydration_concurrency = n;
        self
    }

    // --- remote ---

    pub fn remote_base_dir(mut self, dir: PathBuf) -> Self {
        self.config.remote.base_dir = dir;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: LogFormat) -> Self {
        self.config.logging.format = format;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
