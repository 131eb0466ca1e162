//! Configuration for the backup driver.
//!
//! Loads configuration from a TOML file; every section has defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Multipliers applied to the base pause, indexed by attempt number.
pub const RETRY_BACKOFF: &[u64] = &[1, 2, 3, 5, 10, 20, 40, 100, 100, 100, 100, 200, 200];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory where the copy service leaves `exportSnapshot-*` staging output
    #[serde(default = "default_staging_root")]
    pub staging_root: PathBuf,

    #[serde(default)]
    pub procedure: ProcedureConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureConfig {
    /// Time budget for a distributed procedure to report completion
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Divides `max_wait_ms` to bound a single pause
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,

    /// Base pause between status checks
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,

    /// Backoff multipliers
    #[serde(default = "default_backoff")]
    pub backoff: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_staging_root() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn default_max_wait_ms() -> u64 {
    5 * 60 * 1000
}

fn default_num_retries() -> u32 {
    35
}

fn default_pause_ms() -> u64 {
    100
}

fn default_backoff() -> Vec<u64> {
    RETRY_BACKOFF.to_vec()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProcedureConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: default_max_wait_ms(),
            num_retries: default_num_retries(),
            pause_ms: default_pause_ms(),
            backoff: default_backoff(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            staging_root: default_staging_root(),
            procedure: ProcedureConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl ProcedureConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn base_pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

impl BackupConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BackupConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
