//! Application configuration, loaded from JSON. Every field has a default,
//! so a partial file only overrides what it names.

use crate::calibration::CalibrationPolicy;
use crate::error::ConfigError;
use crate::fret_tracker::TrackerConfig;
use crate::overlay::OverlayConfig;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub tracker: TrackerConfig,
    pub overlay: OverlayConfig,
    pub calibration: CalibrationPolicy,
    /// Scale root, e.g. "A"
    pub root: String,
    pub scale: String,
    /// Where the calibrated filter chain is persisted
    pub chain_file: PathBuf,
    /// Search the extended filter set during calibration
    pub extended_filters: bool,
    pub fps: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            overlay: OverlayConfig::default(),
            calibration: CalibrationPolicy::default(),
            root: "C".to_string(),
            scale: "major".to_string(),
            chain_file: PathBuf::from("filter_chain.json"),
            extended_filters: false,
            fps: 10,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&data)?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!("Config saved to {:?}", path);
        Ok(())
    }
}
