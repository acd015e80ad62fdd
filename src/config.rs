use std::{
    fs,
    path::{Path, PathBuf},
};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::GpioError;
use crate::pin::{Direction, Edge};
use crate::storage::SYSFS_GPIO_PATH;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PinConfig {
    pub kernel_id: u32,
    /// Directory created by the export, `gpio<kernel_id>` unless the vendor
    /// names it differently.
    #[serde(default)]
    pub pin_base: Option<String>,
    pub direction: Direction,
    #[serde(default)]
    pub active_low: bool,
    #[serde(default)]
    pub edge: Edge,
}

impl PinConfig {
    pub fn pin_base(&self) -> String {
        self.pin_base
            .clone()
            .unwrap_or_else(|| format!("gpio{}", self.kernel_id))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    pub gpios: FxHashMap<String, PinConfig>, // keyed by pin name
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
}

fn default_base_path() -> PathBuf {
    PathBuf::from(SYSFS_GPIO_PATH)
}

fn default_broadcast_capacity() -> usize {
    64
}

fn default_event_history_capacity() -> usize {
    32
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GpioError> {
        if self.broadcast_capacity == 0 {
            return Err(GpioError::Config(
                "broadcast_capacity must be greater than zero".into(),
            ));
        }

        let mut seen = FxHashMap::default();
        for (name, pin) in &self.gpios {
            if let Some(other) = seen.insert(pin.kernel_id, name) {
                return Err(GpioError::Config(format!(
                    "Pins {other} and {name} share kernel id {}",
                    pin.kernel_id
                )));
            }
        }
        Ok(())
    }
}
