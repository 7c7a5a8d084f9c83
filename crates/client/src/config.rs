//! Configuration for the SPI client.
//!
//! This module provides TOML-based configuration loading.
//! The default configuration path is `~/.config/spi-client/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use spi_protocol::ReceiptOptions;
use thiserror::Error;

use crate::connection::ws_url;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("pos_id must be at most {max} characters, got {len}")]
    PosIdTooLong { len: usize, max: usize },

    #[error("pos_id may only contain ASCII letters and digits, got {0}")]
    InvalidPosId(String),

    #[error("eftpos_address must be host[:port] without a scheme, got {0}")]
    InvalidEftposAddress(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Longest POS id a terminal accepts.
pub const MAX_POS_ID_LENGTH: usize = 16;

/// Main configuration structure for the SPI client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Identity of this POS and where its terminal lives.
    pub pos: PosConfig,

    /// Receipt handling requested on every transaction.
    pub receipt: ReceiptConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PosConfig {
    /// Name this POS pairs under. Shown on the terminal.
    pub pos_id: String,
    /// Terminal `host[:port]`, without a scheme.
    pub eftpos_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ReceiptConfig {
    /// Let the terminal ask whether to print a customer copy.
    pub prompt_for_customer_copy: bool,
    /// Handle signature checks on the terminal instead of the POS.
    pub signature_flow_on_eftpos: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spi-client")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SPI_POS_ID: Override the POS id
    /// - SPI_EFTPOS_ADDRESS: Override the terminal address
    /// - SPI_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(pos_id) = std::env::var("SPI_POS_ID") {
            if !pos_id.is_empty() {
                tracing::info!("Overriding pos_id from environment: {}", pos_id);
                self.pos.pos_id = pos_id;
            }
        }

        if let Ok(address) = std::env::var("SPI_EFTPOS_ADDRESS") {
            if !address.is_empty() {
                tracing::info!("Overriding eftpos_address from environment: {}", address);
                self.pos.eftpos_address = address;
            }
        }

        if let Ok(level) = std::env::var("SPI_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.logging.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Empty pos id and address are accepted; pairing refuses to start
    /// until both are set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pos_id = &self.pos.pos_id;
        if pos_id.len() > MAX_POS_ID_LENGTH {
            return Err(ConfigError::PosIdTooLong {
                len: pos_id.len(),
                max: MAX_POS_ID_LENGTH,
            });
        }
        if !pos_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::InvalidPosId(pos_id.clone()));
        }

        let address = &self.pos.eftpos_address;
        if !address.is_empty() && (address.contains("://") || ws_url(address).is_err()) {
            return Err(ConfigError::InvalidEftposAddress(address.clone()));
        }

        let level = self.logging.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.log_level.clone()));
        }

        Ok(())
    }

    /// Receipt options to attach to outgoing transaction requests.
    pub fn receipt_options(&self) -> ReceiptOptions {
        ReceiptOptions {
            prompt_for_customer_copy: self.receipt.prompt_for_customer_copy,
            signature_flow_on_eftpos: self.receipt.signature_flow_on_eftpos,
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();
    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        std::env::remove_var("SPI_POS_ID");
        std::env::remove_var("SPI_EFTPOS_ADDRESS");
        std::env::remove_var("SPI_LOG_LEVEL");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.pos.pos_id.is_empty());
        assert!(config.pos.eftpos_address.is_empty());
        assert!(!config.receipt.prompt_for_customer_copy);
        assert!(!config.receipt.signature_flow_on_eftpos);
        assert_eq!(config.logging.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[pos]
pos_id = "KIOSK1"
eftpos_address = "192.168.1.20"

[receipt]
prompt_for_customer_copy = true
signature_flow_on_eftpos = true

[logging]
log_level = "debug"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.pos.pos_id, "KIOSK1");
        assert_eq!(config.pos.eftpos_address, "192.168.1.20");
        assert_eq!(config.logging.log_level, "debug");

        let options = config.receipt_options();
        assert!(options.prompt_for_customer_copy);
        assert!(options.signature_flow_on_eftpos);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_to_toml_roundtrip() {
        let mut original = Config::default();
        original.pos.pos_id = "POS9".to_string();
        original.receipt.signature_flow_on_eftpos = true;

        let toml = original.to_toml().unwrap();
        assert_eq!(Config::from_toml(&toml).unwrap(), original);
    }

    #[test]
    fn test_validate_pos_id() {
        let mut config = Config::default();
        config.pos.pos_id = "A".repeat(MAX_POS_ID_LENGTH);
        assert!(config.validate().is_ok());

        config.pos.pos_id = "A".repeat(MAX_POS_ID_LENGTH + 1);
        assert_eq!(
            config.validate(),
            Err(ConfigError::PosIdTooLong { len: 17, max: 16 })
        );

        config.pos.pos_id = "till-1".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPosId("till-1".to_string()))
        );
    }

    #[test]
    fn test_validate_eftpos_address() {
        let mut config = Config::default();
        config.pos.eftpos_address = "10.0.0.7:8080".to_string();
        assert!(config.validate().is_ok());

        config.pos.eftpos_address = "ws://10.0.0.7".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidEftposAddress("ws://10.0.0.7".to_string()))
        );

        config.pos.eftpos_address = "not a host".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEftposAddress(_))
        ));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.logging.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "[pos]\npos_id = \"BAR2\"\n").unwrap();

        let config = Config::load(&config_path).unwrap();
        assert_eq!(config.pos.pos_id, "BAR2");
        assert_eq!(config.logging.log_level, "info");
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_helpful_error_messages() {
        let err = Config::from_toml("[logging]\nlog_level = 123\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("Invalid TOML"));
        assert!(err.contains("at position"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("spi-client"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("SPI_POS_ID", "ENV1");
        std::env::set_var("SPI_EFTPOS_ADDRESS", "10.1.1.1");
        std::env::set_var("SPI_LOG_LEVEL", "trace");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.pos.pos_id, "ENV1");
        assert_eq!(config.pos.eftpos_address, "10.1.1.1");
        assert_eq!(config.logging.log_level, "trace");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("SPI_POS_ID", "");

        let mut config = Config::default();
        config.pos.pos_id = "FILE1".to_string();
        config.apply_env_overrides();

        assert_eq!(config.pos.pos_id, "FILE1");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();

        let mut config = Config::default();
        config.logging.log_level = "warn".to_string();
        config.apply_env_overrides();

        assert_eq!(config.logging.log_level, "warn");
    }
}
