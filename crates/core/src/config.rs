use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Tool locations and tunables for the write pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub diskutil_path: PathBuf,
    pub hdiutil_path: PathBuf,
    pub wimlib_imagex_path: PathBuf,
    pub monitor_interval_ms: u64,
    pub fat32_split_part_mib: u64,
    pub volume_root: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            diskutil_path: PathBuf::from("/usr/sbin/diskutil"),
            hdiutil_path: PathBuf::from("/usr/bin/hdiutil"),
            wimlib_imagex_path: PathBuf::from("wimlib-imagex"),
            monitor_interval_ms: 1000,
            fat32_split_part_mib: 3800,
            volume_root: PathBuf::from("/Volumes"),
        }
    }
}

impl PipelineConfig {
    /// Defaults, then the JSON file (if any), then `WINSTICK_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = lookup("WINSTICK_DISKUTIL") {
            self.diskutil_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("WINSTICK_HDIUTIL") {
            self.hdiutil_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("WINSTICK_WIMLIB_IMAGEX") {
            self.wimlib_imagex_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("WINSTICK_MONITOR_INTERVAL_MS") {
            self.monitor_interval_ms = value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .ok_or(ConfigError::InvalidEnv {
                    key: "WINSTICK_MONITOR_INTERVAL_MS",
                    value,
                })?;
        }
        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    pub fn fat32_split_part_bytes(&self) -> u64 {
        self.fat32_split_part_mib.saturating_mul(1024 * 1024)
    }
}
