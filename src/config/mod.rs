//! Configuration for the feeder hub
//!
//! Loaded from a YAML file. Every section has full defaults so the daemon
//! can start without a file; the `extruders.mapping` subtree is the only
//! part ever written back (see the mapping store).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub can: CanConfig,
    pub klipper: KlipperConfig,
    pub extruders: ExtrudersConfig,
    pub filament_runout: FilamentRunoutConfig,
    pub logging: LoggingConfig,
    pub rfid: RfidConfig,
    pub spoolman: SpoolmanConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    /// SocketCAN interface name
    pub interface: String,
    /// Bus bitrate; informational, the interface is brought up externally
    pub bitrate: u32,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            interface: "can1".to_string(),
            bitrate: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KlipperConfig {
    /// Moonraker base URL (http://…)
    pub url: String,
    /// Periodic status re-query interval in seconds
    pub update_interval: f64,
}

impl KlipperConfig {
    /// WebSocket endpoint derived from the HTTP base URL
    pub fn websocket_url(&self) -> String {
        let base = self
            .url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/websocket", base.trim_end_matches('/'))
    }
}

impl Default for KlipperConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:7125".to_string(),
            update_interval: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtrudersConfig {
    pub count: u8,
    /// Default active extruder before the first toolhead update
    pub active: u8,
    /// extruder index → cabinet tube index
    pub mapping: BTreeMap<u8, u8>,
}

impl Default for ExtrudersConfig {
    fn default() -> Self {
        Self {
            count: 2,
            active: 0,
            mapping: BTreeMap::from([(0, 0), (1, 1)]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilamentRunoutConfig {
    pub enabled: bool,
    pub sensors: Vec<SensorConfig>,
}

impl Default for FilamentRunoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sensors: vec![
                SensorConfig {
                    name: "Filament_Sensor0".to_string(),
                    extruder: 0,
                },
                SensorConfig {
                    name: "Filament_Sensor1".to_string(),
                    extruder: 1,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Klipper sensor name (`filament_switch_sensor <name>`)
    pub name: String,
    pub extruder: u8,
}

impl SensorConfig {
    /// Full Klipper object name for subscription/query
    pub fn object_name(&self) -> String {
        format!("filament_switch_sensor {}", self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_dir: PathBuf,
    /// Informational size cap carried for operators; rotation is daily
    pub max_file_size: u64,
    pub backup_count: u32,
    pub max_age_days: u32,
    pub console_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            log_dir: PathBuf::from("/home/mingda/printer_data/logs"),
            max_file_size: 10 * 1024 * 1024,
            backup_count: 5,
            max_age_days: 30,
            console_output: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RfidConfig {
    pub enabled: bool,
    /// Where decoded records are archived as JSON; disabled when unset
    pub data_dir: Option<PathBuf>,
    pub auto_set_temperature: bool,
}

impl Default for RfidConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: None,
            auto_set_temperature: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolmanConfig {
    pub enabled: bool,
    pub url: String,
    pub auto_sync_rfid: bool,
    pub retry_count: u32,
    pub retry_interval: f64,
}

impl Default for SpoolmanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:7912".to_string(),
            auto_sync_rfid: true,
            retry_count: 3,
            retry_interval: 5.0,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string (useful for testing)
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde can express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.extruders.count == 0 || self.extruders.count > 2 {
            return Err(ConfigError::Invalid(format!(
                "extruders.count must be 1 or 2, got {}",
                self.extruders.count
            )));
        }
        if self.extruders.active >= self.extruders.count {
            return Err(ConfigError::Invalid(format!(
                "extruders.active {} out of range for count {}",
                self.extruders.active, self.extruders.count
            )));
        }
        for (&extruder, &tube) in &self.extruders.mapping {
            if extruder >= 2 || tube >= 2 {
                return Err(ConfigError::Invalid(format!(
                    "extruders.mapping entry {extruder}:{tube} out of range"
                )));
            }
        }
        for sensor in &self.filament_runout.sensors {
            if sensor.extruder >= 2 {
                return Err(ConfigError::Invalid(format!(
                    "sensor {} bound to extruder {} (must be 0 or 1)",
                    sensor.name, sensor.extruder
                )));
            }
        }
        Ok(())
    }

    /// Sensor entry for an extruder index, if one is configured
    pub fn sensor_for_extruder(&self, extruder: u8) -> Option<&SensorConfig> {
        self.filament_runout
            .sensors
            .iter()
            .find(|sensor| sensor.extruder == extruder)
    }
}
