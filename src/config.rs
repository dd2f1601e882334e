// SPDX-License-Identifier: GPL-3.0-only

//! User configuration
//!
//! Stored as JSON in `$XDG_CONFIG_HOME/camera-hal/config.json`, or wherever
//! `CAMERA_HAL_CONFIG` points. A missing file yields the defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{isp, timing};
use crate::errors::{HalError, HalResult};
use crate::sim::{SimDeviceConfig, SimKind};

/// Environment variable overriding the configuration file location
pub const CONFIG_ENV: &str = "CAMERA_HAL_CONFIG";

const CONFIG_DIR: &str = "camera-hal";
const CONFIG_FILE: &str = "config.json";

/// ISP pipeline settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IspSettings {
    /// Size of the internal parameter buffer pool
    pub param_buffers: u32,
    /// Size of the internal statistics buffer pool
    pub stat_buffers: u32,
    /// Hardware revision reported to the algorithm module
    pub hw_revision: u32,
}

impl Default for IspSettings {
    fn default() -> Self {
        Self {
            param_buffers: isp::DEFAULT_PARAM_BUFFERS,
            stat_buffers: isp::DEFAULT_STAT_BUFFERS,
            hw_revision: isp::HW_REVISION_V10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log filter used when `RUST_LOG` is not set
    pub log_filter: String,
    /// Pipeline backends to try, by name; empty enables all
    pub pipelines: Vec<String>,
    /// Simulated media devices added at startup
    pub simulated_devices: Vec<SimDeviceConfig>,
    pub isp: IspSettings,
    /// How long synchronous algorithm calls may take
    pub ipa_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: "warn".to_string(),
            pipelines: Vec::new(),
            simulated_devices: vec![
                SimDeviceConfig::new(SimKind::Vimc, "vimc.0"),
                SimDeviceConfig::new(SimKind::Rkisp1, "rkisp1.0"),
            ],
            isp: IspSettings::default(),
            ipa_timeout_ms: timing::IPA_CALL_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Location of the configuration file
    pub fn path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load from the default location, falling back to defaults
    pub fn load() -> HalResult<Self> {
        match Self::path() {
            Some(path) => Self::load_from(&path),
            None => {
                debug!("No configuration directory, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> HalResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Configuration file missing, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .map_err(|e| HalError::Settings(format!("{}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| HalError::Settings(format!("{}: {}", path.display(), e)))?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Write to the default location
    pub fn save(&self) -> HalResult<()> {
        let path = Self::path()
            .ok_or_else(|| HalError::Settings("no configuration directory".into()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> HalResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| HalError::Settings(format!("{}: {}", parent.display(), e)))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(|e| HalError::Settings(format!("{}: {}", path.display(), e)))?;
        info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Whether a backend may match devices
    pub fn pipeline_enabled(&self, name: &str) -> bool {
        self.pipelines.is_empty() || self.pipelines.iter().any(|p| p == name)
    }

    pub fn ipa_timeout(&self) -> Duration {
        Duration::from_millis(self.ipa_timeout_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = serde_json::from_str(r#"{"pipelines":["vimc"]}"#).unwrap();
        assert_eq!(config.pipelines, vec!["vimc"]);
        assert_eq!(config.isp, IspSettings::default());
        assert_eq!(config.log_filter, "warn");
    }

    #[test]
    fn test_pipeline_filter() {
        let mut config = Config::default();
        assert!(config.pipeline_enabled("rkisp1"));
        config.pipelines = vec!["vimc".into()];
        assert!(config.pipeline_enabled("vimc"));
        assert!(!config.pipeline_enabled("rkisp1"));
    }
}
