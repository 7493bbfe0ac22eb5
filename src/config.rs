//! Application settings
//!
//! All settings live in one TOML file, by default
//! `<config dir>/gcadapter/settings.toml`:
//!
//! ```toml
//! log_level = "info"
//! event_channel_capacity = 256
//!
//! [bridge]
//! stick_deadzone = 0.0
//!
//! [poller]
//! poll_interval_ms = 50
//!
//! [simulation]
//! tick_hz = 100
//! state_delivery = "inline"
//! ```
//!
//! Missing keys fall back to their defaults, and a missing file yields the
//! default settings.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn, Level};

use crate::bridge::BridgeSettings;
use crate::controller::clamp_deadzone;
use crate::driver::SimulationSettings;
use crate::poller::PollerSettings;

const CONFIG_DIR: &str = "gcadapter";
const CONFIG_FILE: &str = "settings.toml";

// Config errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Maximum log level: trace, debug, info, warn or error
    pub log_level: String,

    /// Capacity of the controller event channel handed to observers
    pub event_channel_capacity: usize,

    pub bridge: BridgeSettings,
    pub poller: PollerSettings,
    pub simulation: SimulationSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            event_channel_capacity: 256,
            bridge: BridgeSettings::default(),
            poller: PollerSettings::default(),
            simulation: SimulationSettings::default(),
        }
    }
}

impl AppConfig {
    /// Default location of the settings file, if the platform has a config
    /// directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Reads and validates settings from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading settings from {}", path.display());
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: AppConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()
    }

    /// Reads settings from `path`, or from the default location when `path`
    /// is `None`. A missing file yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => {
                warn!("No config directory available, using default settings");
                return Ok(Self::default());
            }
        };

        if !path.exists() {
            info!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let config = Self::load(&path)?;
        info!("Loaded settings from {}", path.display());
        Ok(config)
    }

    /// Writes these settings to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Checks ranges, clamping the deadzone into `[0, 0.99]`.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        self.log_level()?;

        if self.poller.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poller.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.simulation.tick_hz == 0 {
            return Err(ConfigError::Invalid(
                "simulation.tick_hz must be at least 1".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_channel_capacity must be at least 1".to_string(),
            ));
        }

        let deadzone = self.bridge.stick_deadzone;
        let clamped = clamp_deadzone(deadzone);
        if clamped != deadzone {
            warn!(
                "bridge.stick_deadzone {} out of range, using {}",
                deadzone, clamped
            );
            self.bridge.stick_deadzone = clamped;
        }

        Ok(self)
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        self.log_level
            .parse::<Level>()
            .map_err(|_| ConfigError::Invalid(format!("unknown log level '{}'", self.log_level)))
    }
}
