//! Rig configuration
//!
//! Loaded once at startup from `psu_bench.toml` in the working directory (or
//! an explicit path) and handed to the gateway constructors and the runtime.
//! A missing file, or any missing field, falls back to the defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use super::{poller::DEFAULT_POLL_INTERVAL, sequencer::SequencerConfig};
use crate::protocol::{link::SerialConfig, pins::DEFAULT_ALERT};

pub const CONFIG_FILE_NAME: &str = "psu_bench.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    #[serde(flatten)]
    pub serial: SerialConfig,
    /// Buzzer pulse length at the end of a run.
    pub alert_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig {
                timeout_ms: 5000,
                ..SerialConfig::new("/dev/ttyACM0", 9600)
            },
            alert_ms: DEFAULT_ALERT.as_millis() as u64,
        }
    }
}

impl RelayConfig {
    pub fn alert(&self) -> Duration {
        Duration::from_millis(self.alert_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub settle_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_ms: 1000,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl TimingConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub instrument: SerialConfig,
    pub relay: RelayConfig,
    /// Directory searched for test definitions given by relative path.
    pub test_files_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub timing: TimingConfig,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            instrument: SerialConfig::new("/dev/ttyUSB0", 115_200),
            relay: RelayConfig::default(),
            test_files_dir: PathBuf::new(),
            reports_dir: PathBuf::from("reports"),
            timing: TimingConfig::default(),
        }
    }
}

impl RigConfig {
    /// `psu_bench.toml` in the current working directory.
    pub fn default_path() -> Result<PathBuf> {
        let dir = std::env::current_dir().context("Failed to get current working directory")?;
        Ok(dir.join(CONFIG_FILE_NAME))
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No rig config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        log::info!("Loaded rig config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).context("Failed to serialize rig config")?;
        fs::write(path, text)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        log::info!("Saved rig config to {}", path.display());
        Ok(())
    }

    /// Resolve a definition path, falling back to `test_files_dir` for
    /// relative paths that do not exist as given.
    pub fn definition_path(&self, path: &Path) -> PathBuf {
        if path.is_relative() && !path.exists() && !self.test_files_dir.as_os_str().is_empty() {
            return self.test_files_dir.join(path);
        }
        path.to_path_buf()
    }

    pub fn sequencer_config(&self) -> SequencerConfig {
        SequencerConfig {
            settle: self.timing.settle(),
            reports_dir: Some(self.reports_dir.clone()),
        }
    }
}
