use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no data directory available on this platform")]
    NoDataDir,
}

/// Process-wide settings, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub data_dir: Option<PathBuf>,
    /// Transfer concurrency for tasks that don't set their own.
    pub default_transfers: Option<usize>,
    /// Drop successful jobs that moved nothing.
    pub auto_delete_empty_jobs: bool,
    pub stats_interval_ms: u64,
    pub log_flush_timeout_secs: u64,
    pub bus_buffer: usize,
    pub remotes: HashMap<String, RemoteConfig>,
}

/// A named remote. Remotes are reached through a mounted base directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    pub path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            default_transfers: None,
            auto_delete_empty_jobs: false,
            stats_interval_ms: 1000,
            log_flush_timeout_secs: 10,
            bus_buffer: 16,
            remotes: HashMap::new(),
        }
    }
}

impl Config {
    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read { path: path.to_path_buf(), source });
            }
        };
        toml::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Default config location: `<config dir>/kip-sync/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kip-sync")
            .join("config.toml")
    }

    pub fn resolve_data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|d| d.join("kip-sync"))
                .ok_or(ConfigError::NoDataDir),
        }
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }

    pub fn log_flush_timeout(&self) -> Duration {
        Duration::from_secs(self.log_flush_timeout_secs.max(1))
    }
}
