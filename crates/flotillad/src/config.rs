//! flotillad.toml configuration.
//!
//! ```toml
//! [store]
//! data_dir = "/var/lib/flotilla"
//!
//! [controller]
//! workers = 4
//! resync_interval_secs = 300
//!
//! [log]
//! format = "json"
//! ```
//!
//! Every key is optional. Command-line flags override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flotilla_runtime::ControllerConfig;

pub const DEFAULT_DATA_DIR: &str = "/var/lib/flotilla";
pub const DEFAULT_LOG_FILTER: &str = "info,flotillad=debug,flotilla=debug";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub store: StoreConfig,
    pub controller: ControllerSection,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// Keep everything in memory; nothing survives a restart.
    pub in_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            in_memory: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    pub workers: usize,
    pub resync_interval_secs: u64,
    pub max_backoff_secs: u64,
    pub autoscale_interval_secs: u64,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval_secs: 300,
            max_backoff_secs: 60,
            autoscale_interval_secs: 30,
        }
    }
}

impl ControllerSection {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers.max(1),
            max_backoff: Duration::from_secs(self.max_backoff_secs.max(1)),
            ..ControllerConfig::default()
        }
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }

    pub fn autoscale_interval(&self) -> Duration {
        Duration::from_secs(self.autoscale_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl LogConfig {
    pub fn filter(&self) -> &str {
        self.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub data_dir: Option<PathBuf>,
    pub in_memory: bool,
    pub workers: Option<usize>,
    pub resync_secs: Option<u64>,
    pub json_logs: bool,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Read `path` if it exists, defaults otherwise.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) if path.exists() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn apply(mut self, overrides: &Overrides) -> Self {
        if let Some(dir) = &overrides.data_dir {
            self.store.data_dir = dir.clone();
        }
        if overrides.in_memory {
            self.store.in_memory = true;
        }
        if let Some(workers) = overrides.workers {
            self.controller.workers = workers;
        }
        if let Some(secs) = overrides.resync_secs {
            self.controller.resync_interval_secs = secs;
        }
        if overrides.json_logs {
            self.log.format = LogFormat::Json;
        }
        self
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
