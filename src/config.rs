//! Server configuration.
//!
//! Configuration is loaded from a YAML file with five sections: `server`,
//! `storage`, `aof`, `rdb` and `log`. Every field has a default, so a
//! partial file (or no file at all) yields a working configuration.
//! Durations are expressed in whole seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(String),
    #[error("parse config: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub aof: AofConfig,
    pub rdb: RdbConfig,
    pub log: LogConfig,
}

impl Config {
    /// Loads configuration from `path`, or returns the defaults when no
    /// path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            None => Ok(Self::default()),
            Some(path) => Self::from_file(path),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Advisory read deadline in seconds; a point operation that already
    /// holds its shard lock runs to completion.
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub shutdown_timeout: u64,
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 6380,
            read_timeout: 5,
            write_timeout: 5,
            shutdown_timeout: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub shard_count: usize,
    pub max_key_size: usize,
    pub max_value_size: usize,
    pub max_memory: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            shard_count: 256,
            max_key_size: 256,
            max_value_size: 1024 * 1024,
            max_memory: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AofConfig {
    pub enabled: bool,
    pub file_path: String,
    pub rewrite_threshold: u64,
}

impl Default for AofConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file_path: "./data/appendonly.aof".to_string(),
            rewrite_threshold: 64 * 1024 * 1024,
        }
    }
}

/// One auto-snapshot trigger: at least `changes` writes within the trailing
/// `seconds` window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SaveRule {
    pub seconds: u64,
    pub changes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RdbConfig {
    pub enabled: bool,
    pub file_path: String,
    pub save_rules: Vec<SaveRule>,
}

impl Default for RdbConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file_path: "./data/dump.rdb".to_string(),
            save_rules: vec![
                SaveRule { seconds: 900, changes: 1 },
                SaveRule { seconds: 300, changes: 10 },
                SaveRule { seconds: 60, changes: 10000 },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// One of `debug`, `info`, `warn`, `error`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
