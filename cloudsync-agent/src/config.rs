//! Configuration management for the sync agent.
//!
//! Loads configuration from a TOML file, then applies environment variable
//! overrides (a `.env` file in the working directory is honoured).

use crate::utils::errors::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub store: StoreConfig,

    pub provider: ProviderConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Directories to keep mirrored
    #[serde(default)]
    pub backups: Vec<BackupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Single-line output without targets
    #[serde(default)]
    pub compact: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database holding backups and file records
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Maximum pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

/// Object store provider, selected once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Mirror objects into a local directory (one subdirectory per container)
    Local { root: PathBuf },

    /// REST object API: `PUT/DELETE {endpoint}/{container}/{key}`
    Http {
        endpoint: String,
        #[serde(default)]
        token: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deepest directory level the sweep descends into
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Concurrent filesystem checks per engine
    #[serde(default = "default_scan_workers")]
    pub scan_workers: usize,

    /// Concurrent remote operations
    #[serde(default = "default_upload_workers")]
    pub upload_workers: usize,

    /// Timeout applied to each remote attempt
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// Attempts per task before it is reported failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between attempts (multiplied by the attempt number)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Pause after each batch of watch notifications
    #[serde(default = "default_watch_pause_ms")]
    pub watch_pause_ms: u64,

    /// How long shutdown waits for in-flight work
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Backup name, also used for the remote container
    pub name: String,

    /// Absolute root directory
    #[serde(alias = "root_directory")]
    pub root: PathBuf,
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("cloudsync.db")
}

fn default_pool_size() -> u32 {
    4
}

fn default_max_depth() -> usize {
    10_000
}

fn default_scan_workers() -> usize {
    16
}

fn default_upload_workers() -> usize {
    5
}

fn default_operation_timeout_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_watch_pause_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            compact: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            pool_size: default_pool_size(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            scan_workers: default_scan_workers(),
            upload_workers: default_upload_workers(),
            operation_timeout_secs: default_operation_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            watch_pause_ms: default_watch_pause_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl EngineConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn watch_pause(&self) -> Duration {
        Duration::from_millis(self.watch_pause_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CLOUDSYNC_*` environment overrides, reading `.env` first if present
    pub fn apply_env_overrides(&mut self) {
        let _ = dotenvy::dotenv();

        if let Ok(path) = std::env::var("CLOUDSYNC_DB_PATH") {
            self.store.db_path = PathBuf::from(path);
        }
        if let Ok(level) = std::env::var("CLOUDSYNC_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(workers) = std::env::var("CLOUDSYNC_UPLOAD_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.engine.upload_workers = workers;
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for backup in &self.backups {
            if backup.name.trim().is_empty() {
                return Err(SyncError::Config("backup name must not be empty".into()));
            }
            if !backup.root.is_absolute() {
                return Err(SyncError::Config(format!(
                    "backup '{}' root must be absolute: {}",
                    backup.name,
                    backup.root.display()
                )));
            }
            if !seen.insert((backup.name.as_str(), backup.root.as_path())) {
                return Err(SyncError::Config(format!(
                    "backup '{}' at {} is configured twice",
                    backup.name,
                    backup.root.display()
                )));
            }
        }

        if self.engine.upload_workers == 0 || self.engine.scan_workers == 0 {
            return Err(SyncError::Config("worker counts must be at least 1".into()));
        }
        if self.engine.max_attempts == 0 {
            return Err(SyncError::Config("max_attempts must be at least 1".into()));
        }

        Ok(())
    }
}
