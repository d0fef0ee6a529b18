//! # Configuration Management Module
//!
//! TOML configuration for the gateway, organized into three sections:
//!
//! - [`SerialConfig`] - device port, baud rate and protocol version tag
//! - [`ManagementConfig`] - management server URL and HTTP timing
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshspy::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     config.validate()?;
//!     println!("Serial Port: {}", config.serial.port);
//!
//!     Config::create_default("config.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! proto_version = "latest"
//!
//! [management]
//! url = "http://localhost:8080"
//! timeout_seconds = 5
//! probe_interval_seconds = 300
//!
//! [logging]
//! level = "info"
//! file = "meshspy.log"
//! ```
//!
//! Every section and key may be omitted; missing values take their defaults. Command line
//! flags override file values.

use crate::decoder::framing::ProtoVersion;
use crate::mgmtapi::ClientSettings;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub management: ManagementConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// `""`, `"latest"` or `"2.1"`.
    pub proto_version: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            proto_version: "latest".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    /// Base URL of the management server. Empty disables relaying.
    pub url: String,
    pub timeout_seconds: u64,
    pub probe_interval_seconds: u64,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_seconds: 5,
            probe_interval_seconds: 300,
        }
    }
}

impl ManagementConfig {
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            timeout: Duration::from_secs(self.timeout_seconds),
            probe_interval: Duration::from_secs(self.probe_interval_seconds),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshspy.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Check values that would otherwise only fail once the gateway is running.
    pub fn validate(&self) -> Result<()> {
        self.proto_version()?;
        if self.serial.baud_rate == 0 {
            return Err(anyhow!("serial.baud_rate must be greater than zero"));
        }
        if self.management.timeout_seconds == 0 {
            return Err(anyhow!("management.timeout_seconds must be greater than zero"));
        }
        if self.management.probe_interval_seconds == 0 {
            return Err(anyhow!(
                "management.probe_interval_seconds must be greater than zero"
            ));
        }
        Ok(())
    }

    pub fn proto_version(&self) -> Result<ProtoVersion> {
        self.serial
            .proto_version
            .parse::<ProtoVersion>()
            .map_err(|e| anyhow!("Invalid serial.proto_version: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.serial.baud_rate, 115200);
        assert!(config.management.url.is_empty());
        assert_eq!(
            config.management.client_settings().probe_interval,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[serial]\nport = \"/dev/ttyACM0\"\n").unwrap();
        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.management.timeout_seconds, 5);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.serial.proto_version = "1.0".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.serial.baud_rate = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.management.timeout_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_proto_version_tags() {
        let mut config = Config::default();
        config.serial.proto_version = "2.1".to_string();
        assert_eq!(config.proto_version().unwrap(), ProtoVersion::V2_1);
        config.serial.proto_version = String::new();
        assert_eq!(config.proto_version().unwrap(), ProtoVersion::Latest);
    }

    #[tokio::test]
    async fn test_create_default_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.serial.port, "/dev/ttyUSB0");
        assert_eq!(loaded.logging.file.as_deref(), Some("meshspy.log"));
        assert!(loaded.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = Config::load(path.to_str().unwrap()).await.unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
