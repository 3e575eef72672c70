//! Engine configuration
//!
//! Loaded from a TOML file; every field has a default so a missing file or a
//! partial one both work.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
}

/// Accrual and leaderboard tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of ranked entries kept in the leaderboard cache
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Minimum value drift (gold) before a cached entry at an unchanged rank is rewritten
    #[serde(default = "default_significant_change")]
    pub significant_change_threshold: f64,

    /// Maximum spendable balance
    #[serde(default = "default_balance_cap")]
    pub balance_cap: f64,

    /// Leaderboard rebuild interval in seconds
    #[serde(default = "default_rebuild_interval")]
    pub rebuild_interval_secs: u64,

    /// Checkpoints closer together than this are skipped unless forced
    #[serde(default = "default_checkpoint_debounce")]
    pub checkpoint_debounce_secs: u64,

    /// Balance backups older than this many days are removed by cleanup
    #[serde(default = "default_backup_retention")]
    pub backup_retention_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            significant_change_threshold: default_significant_change(),
            balance_cap: default_balance_cap(),
            rebuild_interval_secs: default_rebuild_interval(),
            checkpoint_debounce_secs: default_checkpoint_debounce(),
            backup_retention_days: default_backup_retention(),
        }
    }
}

impl EngineConfig {
    pub fn rebuild_interval(&self) -> Duration {
        Duration::from_secs(self.rebuild_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the SQLite database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Ownership oracle base URL; without one every principal reads as unverified
    #[serde(default)]
    pub url: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_oracle_timeout")]
    pub timeout_secs: u64,
}

// Defaults
fn default_top_n() -> usize { 100 }
fn default_significant_change() -> f64 { 100.0 }
fn default_balance_cap() -> f64 { 50_000.0 }
fn default_rebuild_interval() -> u64 { 15 * 60 }
fn default_checkpoint_debounce() -> u64 { 30 }
fn default_backup_retention() -> u32 { 30 }
fn default_data_dir() -> PathBuf { PathBuf::from("./data") }
fn default_http_port() -> u16 { 8090 }
fn default_oracle_timeout() -> u64 { 10 }

impl Config {
    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.top_n == 0 {
            return Err(EngineError::Config("engine.top_n must be at least 1".to_string()));
        }
        if !(engine.balance_cap > 0.0) {
            return Err(EngineError::Config("engine.balance_cap must be positive".to_string()));
        }
        if !(engine.significant_change_threshold > 0.0) {
            return Err(EngineError::Config(
                "engine.significant_change_threshold must be positive".to_string(),
            ));
        }
        if engine.rebuild_interval_secs == 0 {
            return Err(EngineError::Config(
                "engine.rebuild_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
