// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User configuration, stored as JSON under the platform config directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::download::{NetworkPathState, SchedulerConfig, DEFAULT_MAX_CONCURRENT};

const APP_DIR: &str = "tapedeck";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where completed downloads and the record file live
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Maximum simultaneous downloads (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Allow downloads over metered connections (default: true)
    #[serde(default = "default_allow_cellular")]
    pub allow_cellular: bool,
    /// Free space to leave on the storage volume
    #[serde(default)]
    pub min_free_space_bytes: u64,
    /// Minimum gap between transport progress callbacks
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// URL probed for reachability; without one the network is assumed up
    #[serde(default)]
    pub probe_url: Option<Url>,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Treat the connection as metered
    #[serde(default)]
    pub metered: bool,
}

fn default_storage_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("downloads")
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_allow_cellular() -> bool {
    true
}

fn default_progress_interval_ms() -> u64 {
    100
}

fn default_probe_interval_secs() -> u64 {
    15
}

fn default_probe_timeout_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            max_concurrent: default_max_concurrent(),
            allow_cellular: default_allow_cellular(),
            min_free_space_bytes: 0,
            progress_interval_ms: default_progress_interval_ms(),
            network: NetworkConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_url: None,
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            metered: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            bail!("max_concurrent must be at least 1");
        }
        if self.network.probe_interval_secs == 0 {
            bail!("network.probe_interval_secs must be at least 1");
        }
        Ok(())
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.max_concurrent,
            cellular_allowed: self.allow_cellular,
            min_free_space: self.min_free_space_bytes,
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Path state assumed before the first probe result.
    pub fn initial_path(&self) -> NetworkPathState {
        NetworkPathState {
            reachable: true,
            metered: self.network.metered,
        }
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Could not find config directory")?
        .join(APP_DIR);
    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }
    Ok(config_dir)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE))
}

pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

/// Load from an explicit path. A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let config: Config = if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?
    } else {
        Config::default()
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = load_config_from(&temp.path().join("config.json")).unwrap();
        assert_eq!(config.max_concurrent, 3);
        assert!(config.allow_cellular);
        assert_eq!(config.progress_interval(), Duration::from_millis(100));
        assert!(config.network.probe_url.is_none());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(
            &path,
            r#"{"max_concurrent": 5, "network": {"probe_url": "https://probe.example/", "metered": true}}"#,
        )
        .unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.network.probe_interval_secs, 15);
        assert_eq!(config.initial_path(), NetworkPathState::METERED);
        assert_eq!(config.scheduler().max_concurrent, 5);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, r#"{"max_concurrent": 0}"#).unwrap();
        assert!(load_config_from(&path).is_err());
    }
}
