//! # Configuration Management Module
//!
//! Persistent settings stored in a platform-appropriate location.
//! Handles loading, saving, and providing defaults for every section.
//!
//! ## Sections
//! - `device`: which peripheral to look for and how long to wait for it
//! - `retry`: supervisor backoff policy
//! - `buffer`: ring buffer capacity
//! - `recording`: output directory and worker cadence
//! - `source`: real BLE hardware or the synthetic mock source
//!
//! Every section falls back to its defaults, so a partial file loads.
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/sense-stream/config.toml
//! - Linux: ~/.config/sense-stream/config.toml
//! - Windows: %APPDATA%\sense-stream\config.toml

use crate::device_scanner::{MatchCriteria, DEFAULT_DEVICE_NAME, NUS_SERVICE_UUID, NUS_TX_CHAR_UUID};
use crate::error::ConfigError;
use crate::recorder::RecorderSettings;
use crate::supervisor::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "sense-stream";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub retry: RetryConfig,
    pub buffer: BufferConfig,
    pub recording: RecordingConfig,
    pub source: SourceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub service_uuid: String,
    pub notify_uuid: String,
    /// Connect to this address only, skipping name/service matching
    pub address: Option<String>,
    pub scan_timeout_secs: f64,
    pub connect_timeout_secs: f64,
    /// Quiet period after which the link is probed. Unset means wait forever.
    pub idle_timeout_secs: Option<f64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_DEVICE_NAME.to_string(),
            service_uuid: NUS_SERVICE_UUID.to_string(),
            notify_uuid: NUS_TX_CHAR_UUID.to_string(),
            address: None,
            scan_timeout_secs: 10.0,
            connect_timeout_secs: 10.0,
            idle_timeout_secs: Some(5.0),
        }
    }
}

impl DeviceConfig {
    pub fn criteria(&self) -> MatchCriteria {
        MatchCriteria {
            name: self.name.clone(),
            service_id: self.service_uuid.clone(),
            address: self.address.clone(),
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        secs(self.scan_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_secs: f64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_secs: policy.initial_delay.as_secs_f64(),
            multiplier: policy.multiplier,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: secs(self.initial_delay_secs),
            multiplier: if self.multiplier >= 1.0 { self.multiplier } else { 1.0 },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: crate::buffer::DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Defaults to the platform data directory
    pub root_dir: Option<PathBuf>,
    pub flush_rows: usize,
    pub poll_interval_ms: u64,
    pub stop_timeout_secs: f64,
    pub record_on_start: bool,
    pub prefix: Option<String>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            flush_rows: 100,
            poll_interval_ms: 20,
            stop_timeout_secs: 5.0,
            record_on_start: false,
            prefix: None,
        }
    }
}

impl RecordingConfig {
    pub fn root_dir(&self) -> PathBuf {
        self.root_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
                .join("recordings")
        })
    }

    pub fn settings(&self) -> RecorderSettings {
        RecorderSettings {
            root_dir: self.root_dir(),
            flush_rows: self.flush_rows.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            stop_timeout: secs(self.stop_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Ble,
    Mock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub mock_rate_hz: f64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Ble,
            mock_rate_hz: 25.0,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load config from file, or create default if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config = toml::from_str(&contents).map_err(ConfigError::ParseFailed)?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config at {}, writing defaults", path.display());
                let config = Self::default();
                config.save_to(path)?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string).map_err(ConfigError::WriteFailed)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.device.name, "XIAO Sense IMU");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_secs, 3.0);
        assert_eq!(config.retry.multiplier, 1.5);
        assert_eq!(config.buffer.capacity, 1000);
        assert_eq!(config.recording.flush_rows, 100);
        assert_eq!(config.recording.poll_interval_ms, 20);
        assert_eq!(config.source.kind, SourceKind::Ble);
    }

    #[test]
    fn test_partial_file_uses_section_defaults() {
        let toml_str = r#"
            [device]
            address = "AA:BB:CC:DD:EE:FF"

            [source]
            kind = "mock"
        "#;

        let config: Config = toml::from_str(toml_str).expect("Failed to deserialize");
        assert_eq!(config.device.address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(config.device.notify_uuid, NUS_TX_CHAR_UUID);
        assert_eq!(config.source.kind, SourceKind::Mock);
        assert_eq!(config.source.mock_rate_hz, 25.0);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.recording.record_on_start = true;

        let toml_str = toml::to_string(&config).expect("Failed to serialize");
        assert!(toml_str.contains("[recording]"));
        assert!(toml_str.contains("record_on_start = true"));
        assert!(toml_str.contains("kind = \"ble\""));
    }

    #[test]
    fn test_load_creates_default_then_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let created = Config::load_from(&path).expect("Failed to load config");
        assert_eq!(created, Config::default());
        assert!(path.exists());

        let mut changed = created;
        changed.device.idle_timeout_secs = Some(2.5);
        changed.recording.prefix = Some("walk".into());
        changed.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded, changed);
    }

    #[test]
    fn test_invalid_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[buffer]\ncapacity = \"lots\"").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::ParseFailed(_))));
    }

    #[test]
    fn test_derived_settings() {
        let mut config = Config::default();
        config.retry.multiplier = 0.5;
        config.retry.max_attempts = 0;
        let policy = config.retry.policy();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.multiplier, 1.0);

        config.recording.root_dir = Some(PathBuf::from("/data/rec"));
        let settings = config.recording.settings();
        assert_eq!(settings.root_dir, PathBuf::from("/data/rec"));
        assert_eq!(settings.poll_interval, Duration::from_millis(20));
        assert_eq!(settings.stop_timeout, Duration::from_secs(5));

        assert_eq!(config.device.idle_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.device.criteria().name, DEFAULT_DEVICE_NAME);
    }
}
