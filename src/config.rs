//! Configuration management for the restic exporter.
//!
//! Supports loading configuration from:
//! - TOML configuration files
//! - Environment variables (with `RESTIC_EXPORTER_` prefix)
//! - The legacy `RESTIC_REPOSITORY` / `RESTIC_PASSWORD_FILE` pair for a
//!   single repository

use crate::error::{ExporterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Mode passed to `restic stats --mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatsMode {
    /// Deduplicated size of the blobs actually stored
    RawData,
    /// Size of the files a restore would produce
    RestoreSize,
}

impl StatsMode {
    /// Value used on the command line and in the `mode` label.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatsMode::RawData => "raw-data",
            StatsMode::RestoreSize => "restore-size",
        }
    }
}

/// What the repository-level stats command looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsScope {
    /// Every snapshot in the repository
    Repository,
    /// Only the most recent snapshot
    Latest,
}

/// How collections are triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    /// A background timer collects every repository on its interval
    Interval,
    /// Scrapes nudge the scheduler, which collects repositories that are due
    Lazy,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// One restic repository to monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Identifier used as the `repository` label value
    pub id: String,

    /// Repository location as understood by `restic -r`
    pub location: String,

    /// Path of the file holding the repository password
    pub password_file: String,

    /// Run `restic check` (expensive)
    #[serde(default)]
    pub check: bool,

    /// Run `restic stats` for the repository
    #[serde(default = "default_true")]
    pub stats: bool,

    /// Query repository locks
    #[serde(default = "default_true")]
    pub locks: bool,

    /// Compute restore-size stats of the latest snapshot of every group
    #[serde(default = "default_true")]
    pub snapshot_stats: bool,

    #[serde(default = "default_stats_mode")]
    pub stats_mode: StatsMode,

    #[serde(default = "default_stats_scope")]
    pub stats_scope: StatsScope,

    /// Per-repository collection interval override in seconds
    #[serde(default)]
    pub interval_seconds: Option<u64>,
}

impl RepositoryConfig {
    /// Repository with every option at its default.
    pub fn new(id: impl Into<String>, location: impl Into<String>, password_file: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            location: location.into(),
            password_file: password_file.into(),
            check: false,
            stats: default_true(),
            locks: default_true(),
            snapshot_stats: default_true(),
            stats_mode: default_stats_mode(),
            stats_scope: default_stats_scope(),
            interval_seconds: None,
        }
    }

    /// Effective collection interval, falling back to the global one.
    pub fn interval(&self, global: Duration) -> Duration {
        self.interval_seconds.map(Duration::from_secs).unwrap_or(global)
    }
}

/// Options shared by every restic invocation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResticConfig {
    /// Path or name of the restic binary
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Timeout for snapshots, stats and locks commands in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Timeout for `restic check` in seconds
    #[serde(default = "default_check_timeout")]
    pub check_timeout_seconds: u64,

    /// Default collection interval in seconds
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    #[serde(default = "default_schedule")]
    pub schedule: ScheduleMode,

    /// Pass `--insecure-tls` to restic
    #[serde(default)]
    pub insecure_tls: bool,

    /// Expose snapshot paths as a label
    #[serde(default)]
    pub include_paths: bool,

    /// Consecutive lock-held runs after which `restic_lock_escalated` is raised
    #[serde(default)]
    pub lock_escalation_threshold: Option<u32>,
}

impl ResticConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_seconds)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

impl Default for ResticConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            timeout_seconds: default_timeout(),
            check_timeout_seconds: default_check_timeout(),
            interval_seconds: default_interval(),
            schedule: default_schedule(),
            insecure_tls: false,
            include_paths: false,
            lock_escalation_threshold: None,
        }
    }
}

/// Exporter specific settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExporterConfig {
    /// Address to listen on for metrics endpoint
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Main configuration structure for the restic exporter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub exporter: ExporterConfig,

    #[serde(default)]
    pub restic: ResticConfig,

    /// Repositories in configuration order
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

fn default_true() -> bool {
    true
}

fn default_stats_mode() -> StatsMode {
    StatsMode::RawData
}

fn default_stats_scope() -> StatsScope {
    StatsScope::Repository
}

fn default_binary() -> String {
    "restic".to_string()
}

fn default_timeout() -> u64 {
    300
}

fn default_check_timeout() -> u64 {
    3600
}

fn default_interval() -> u64 {
    60
}

fn default_schedule() -> ScheduleMode {
    ScheduleMode::Interval
}

fn default_listen_address() -> String {
    "0.0.0.0:8001".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn config_error(message: impl Into<String>) -> ExporterError {
    ExporterError::Config(config::ConfigError::Message(message.into()))
}

impl Settings {
    /// Load configuration from a file and environment variables.
    ///
    /// # Arguments
    ///
    /// * `config_path` - Optional path to configuration file
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use restic_exporter::config::Settings;
    ///
    /// let settings = Settings::load(Some("config/default.toml")).unwrap();
    /// ```
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        Self::load_with_env(config_path, Self::environment())
    }

    /// `RESTIC_EXPORTER_<SECTION>__<KEY>`; the prefix is joined with a
    /// single underscore, nested keys with two.
    fn environment() -> config::Environment {
        config::Environment::with_prefix("RESTIC_EXPORTER")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn load_with_env(config_path: Option<&str>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(config_error(format!("configuration file {} not found", path)));
            }
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(env);

        let config = builder.build()?;
        let settings: Settings = config.try_deserialize()?;

        let settings = settings.with_legacy_repository(
            std::env::var("RESTIC_REPOSITORY").ok(),
            std::env::var("RESTIC_PASSWORD_FILE").ok(),
        );

        settings.validate()?;
        Ok(settings)
    }

    /// Synthesize a `default` repository from the legacy environment pair
    /// when no repositories were configured.
    pub fn with_legacy_repository(
        mut self,
        location: Option<String>,
        password_file: Option<String>,
    ) -> Self {
        if self.repositories.is_empty() {
            if let (Some(location), Some(password_file)) = (location, password_file) {
                self.repositories
                    .push(RepositoryConfig::new("default", location, password_file));
            }
        }
        self
    }

    /// Validate configuration settings.
    pub fn validate(&self) -> Result<()> {
        if self.repositories.is_empty() {
            return Err(config_error(
                "at least one repository must be configured (or RESTIC_REPOSITORY and RESTIC_PASSWORD_FILE set)",
            ));
        }

        if self.restic.binary.is_empty() {
            return Err(config_error("restic binary cannot be empty"));
        }
        if self.restic.timeout_seconds == 0 || self.restic.check_timeout_seconds == 0 {
            return Err(config_error("restic timeouts must be greater than zero"));
        }
        if self.restic.interval_seconds == 0 {
            return Err(config_error("restic interval_seconds must be greater than zero"));
        }
        if self.restic.lock_escalation_threshold == Some(0) {
            return Err(config_error("lock_escalation_threshold must be at least 1"));
        }

        let mut seen = HashSet::new();
        for (index, repo) in self.repositories.iter().enumerate() {
            if repo.id.is_empty() {
                return Err(config_error(format!("repository #{} has an empty id", index)));
            }
            if !repo
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            {
                return Err(config_error(format!(
                    "repository id '{}' may only contain [A-Za-z0-9_.-]",
                    repo.id
                )));
            }
            if !seen.insert(repo.id.as_str()) {
                return Err(config_error(format!("duplicate repository id '{}'", repo.id)));
            }
            if repo.location.is_empty() {
                return Err(config_error(format!(
                    "repository '{}' has an empty location",
                    repo.id
                )));
            }
            if repo.password_file.is_empty() {
                return Err(config_error(format!(
                    "repository '{}' has an empty password_file",
                    repo.id
                )));
            }
            if repo.interval_seconds == Some(0) {
                return Err(config_error(format!(
                    "repository '{}' interval_seconds must be greater than zero",
                    repo.id
                )));
            }
        }

        Ok(())
    }
}
