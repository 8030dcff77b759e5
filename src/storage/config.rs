//! Application configuration.
//!
//! Loaded from `config.toml` in the platform data directory, or from an
//! explicit path. Missing files and missing sections fall back to defaults.

use crate::sensors::csc::{PayloadLayout, CSC_SERVICE_UUID};
use crate::sensors::manager::SessionConfig;
use crate::sensors::retry::RetryPolicy;
use crate::sensors::transport::DeviceFilter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application version
    pub version: String,
    /// Data directory path
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Sensor settings
    pub sensors: SensorSettings,
    /// Connect retry settings
    pub retry: RetrySettings,
    /// Simulated sensor settings
    pub simulation: SimulationSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: PathBuf::new(),
            sensors: SensorSettings::default(),
            retry: RetrySettings::default(),
            simulation: SimulationSettings::default(),
        }
    }
}

impl AppConfig {
    /// Session configuration derived from these settings.
    ///
    /// Recovery after a dropped link always uses
    /// [`RetryPolicy::session_recovery`].
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            filter: DeviceFilter {
                service: CSC_SERVICE_UUID,
                name_prefix: self.sensors.device_name_prefix.clone(),
            },
            layout: self.sensors.payload_layout,
            connect_policy: self.retry.policy(),
            recovery_policy: RetryPolicy::session_recovery(),
        }
    }
}

/// Sensor-related settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Only pick devices whose name starts with this
    pub device_name_prefix: Option<String>,
    /// Discovery timeout in seconds
    pub scan_timeout_secs: u32,
    /// Where crank data sits in the measurement payload
    pub payload_layout: PayloadLayout,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            device_name_prefix: None,
            scan_timeout_secs: 30,
            payload_layout: PayloadLayout::Standard,
        }
    }
}

impl SensorSettings {
    /// Discovery timeout as a duration.
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs as u64)
    }
}

/// Retry settings for a user-requested connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt
    pub max_attempts: u32,
    /// Wait before the first retry in seconds, doubled each retry
    pub initial_delay_secs: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_secs: 2,
        }
    }
}

impl RetrySettings {
    /// Retry policy for these settings.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_secs(self.initial_delay_secs as u64),
        )
    }
}

/// Simulated sensor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// Simulated cadence in RPM
    pub target_rpm: f64,
    /// Notification interval in milliseconds
    pub interval_ms: u64,
    /// Drop the link once after this many notifications
    pub drop_after: Option<u32>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            target_rpm: 90.0,
            interval_ms: 1000,
            drop_after: None,
        }
    }
}

impl SimulationSettings {
    /// Notification interval as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Get the application data directory.
pub fn get_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "rustcadence", "RustCadence")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the configuration file path.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("config.toml")
}

/// Load application configuration from the default location.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&get_config_path())
}

/// Load application configuration from a file.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("No config at {}, using defaults", path.display());
        return Ok(AppConfig {
            data_dir: get_data_dir(),
            ..Default::default()
        });
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

    let mut config: AppConfig =
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.data_dir = get_data_dir();

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Save application configuration to a file.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
    }

    let content =
        toml::to_string_pretty(config).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

    Ok(())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),
}
