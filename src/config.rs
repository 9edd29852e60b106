//! Configuration loading from TOML
//!
//! # Configuration File Format
//!
//! ```toml
//! [port]
//! device = "/dev/ttyS1"
//! poll_interval_ms = 2
//!
//! [daemon]
//! sample_interval_ms = 1000
//! ```
//!
//! The `[port]` section describes the serial link the engine attaches to;
//! `[daemon]` only affects the `uartsensed` binary.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Minimum reader poll interval (hot loop guard)
const MIN_POLL_INTERVAL_MS: u64 = 1;
/// Maximum reader poll interval before keep-alive windows get starved
const MAX_POLL_INTERVAL_MS: u64 = 20;

/// Serial link configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    /// Serial port the sensor is attached to
    ///
    /// **Format**: Device path (e.g., "/dev/ttyS1", "COM4")
    /// **Required**: Yes
    ///
    /// The engine always opens the port at 2400 baud; the sensor's own
    /// handshake raises the speed afterwards.
    pub device: String,

    /// Reader thread poll interval
    ///
    /// **Units**: Milliseconds
    /// **Valid range**: 1-20ms
    /// **Default**: 2
    ///
    /// Must stay well under the 100ms keep-alive window so DATA frames are
    /// seen in the window they arrive in.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    2
}

/// Daemon behaviour (uartsensed only)
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// How often the daemon logs the current sample values
    ///
    /// **Units**: Milliseconds
    /// **Default**: 1000
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

fn default_sample_interval_ms() -> u64 {
    1000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: PortConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Validation
    ///
    /// - `device` must not be empty
    /// - `poll_interval_ms` must be between 1 and 20ms
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self> {
        let config: Config = basic_toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        if config.port.device.is_empty() {
            return Err(Error::Config(
                "[port] device must not be empty".to_string(),
            ));
        }

        let interval = config.port.poll_interval_ms;
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&interval) {
            return Err(Error::Config(format!(
                "poll_interval_ms must be between {}ms and {}ms (got {}ms). \
                Slower polling starves the keep-alive window.",
                MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS, interval
            )));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"
            [port]
            device = "/dev/ttyS1"
            poll_interval_ms = 5

            [daemon]
            sample_interval_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.port.device, "/dev/ttyS1");
        assert_eq!(config.port.poll_interval_ms, 5);
        assert_eq!(config.daemon.sample_interval_ms, 250);
    }

    #[test]
    fn test_defaults_apply() {
        let config = Config::parse(
            r#"
            [port]
            device = "/dev/ttyS1"
            "#,
        )
        .unwrap();
        assert_eq!(config.port.poll_interval_ms, 2);
        assert_eq!(config.daemon.sample_interval_ms, 1000);
    }

    #[test]
    fn test_poll_interval_out_of_range_rejected() {
        let result = Config::parse(
            r#"
            [port]
            device = "/dev/ttyS1"
            poll_interval_ms = 50
            "#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_device_rejected() {
        let result = Config::parse(
            r#"
            [port]
            device = ""
            "#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
