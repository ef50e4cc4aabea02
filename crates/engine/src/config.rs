//! Manager configuration (spec §6). Mirrors the teacher's
//! `GlobalConfig::load`/`load_from`/`save` shape: TOML on disk, sane
//! defaults when the file is missing or a field is absent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// `~/.config/leasemgr/leasemgr.toml` (or `$LEASEMGR_CONFIG`).
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("LEASEMGR_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|d| d.join("leasemgr").join("leasemgr.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    /// Plugin names to load, one per supported resource type.
    pub plugins: Vec<String>,
    /// Minutes prior to lease end at which `before_end_lease` fires.
    /// 0 disables the event.
    pub minutes_before_end_lease: u32,
    /// How many 10s windows an `InvalidStatus` failure gets retried
    /// before the event is marked ERROR.
    pub event_max_retries: u32,
    /// Event engine tick interval, in seconds.
    pub event_interval_secs: u64,
    /// How many ticks an IN_PROGRESS event may sit unattended before
    /// startup recovery reverts it to UNDONE.
    pub recovery_stale_ticks: u32,
    /// Monitor health-poll interval, in seconds (runs on its own timer,
    /// independent of the event tick — spec §5).
    pub monitor_interval_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            plugins: vec!["dummy.vm.plugin".to_string()],
            minutes_before_end_lease: 60,
            event_max_retries: 1,
            event_interval_secs: 10,
            recovery_stale_ticks: 3,
            monitor_interval_secs: 60,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ManagerConfig {
    /// Load from the default path, falling back to defaults if the file
    /// doesn't exist or fails to parse.
    pub fn load() -> Self {
        default_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn event_interval(&self) -> Duration {
        Duration::from_secs(self.event_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    /// How long after `time` an `InvalidStatus` failure may still be
    /// retried before the event is marked ERROR (spec §4.3 step 5).
    pub fn retry_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.event_max_retries) * 10)
    }
}
