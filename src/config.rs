//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! ```text
//! purpose:
//!     defines the schema for `host.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - SerialConfig: Which port the ground-station receiver is on ("-" = stdin).
//!     - ServerConfig: Where viewers connect and how much we buffer per viewer.
//!     - SinkConfig: Whether and where decoded readings are logged to CSV.
//!     - DecoderConfig: Packet envelope prefixes and validation strictness.
//!     - LoggingConfig: Default tracing level, echo of decoded readings.
//! ```
//!
//! ==============================================================================

use crate::decoder::{DecodePolicy, DEFAULT_PREFIXES};
use crate::registry::DEFAULT_QUEUE_CAPACITY;
use crate::sink::{DEFAULT_CLOSE_TIMEOUT, DEFAULT_SINK_BUFFER};
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// overrides `serial.port` when set
pub const SERIAL_PORT_ENV: &str = "GROUNDSTATION_SERIAL_PORT";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HostConfig {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
}

impl SerialConfig {
    pub fn is_stdin(&self) -> bool {
        self.port == "-"
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self { port: "/dev/ttyACM0".to_string(), baud_rate: 9600 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// dashboard files served at `/`
    pub static_dir: PathBuf,
    /// frames buffered per viewer before it is dropped as too slow
    pub subscriber_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            static_dir: PathBuf::from("public"),
            subscriber_queue: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SinkConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    pub file_prefix: String,
    pub buffer: usize,
    /// seconds to wait for the log to drain at shutdown
    pub close_timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("data"),
            file_prefix: "sensor_data".to_string(),
            buffer: DEFAULT_SINK_BUFFER,
            close_timeout_secs: DEFAULT_CLOSE_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DecoderConfig {
    pub prefixes: Vec<String>,
    #[serde(flatten)]
    pub policy: DecodePolicy,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            prefixes: DEFAULT_PREFIXES.iter().map(|p| p.to_string()).collect(),
            policy: DecodePolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: HostConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Resolve the config file: an explicit path must load, otherwise the
    /// first existing default location is used, otherwise defaults.
    ///
    /// Runs before logging is initialised, so it reports where the config
    /// came from instead of logging it.
    pub fn discover(explicit: Option<PathBuf>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            let config = Self::load(&path)?;
            return Ok((config, Some(path)));
        }

        let paths = [
            PathBuf::from("config").join("host.toml"),
            PathBuf::from("..").join("config").join("host.toml"),
        ];
        for path in paths {
            if path.exists() {
                let config = Self::load(&path)?;
                return Ok((config, Some(path)));
            }
        }
        Ok((Self::default(), None))
    }

    /// apply environment overrides
    pub fn with_env(mut self) -> Self {
        if let Ok(port) = std::env::var(SERIAL_PORT_ENV) {
            if !port.is_empty() {
                self.serial.port = port;
            }
        }
        self
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        tracing::info!("┌─────────────────────────────────────────┐");
        tracing::info!("│        GROUND STATION CONFIGURATION     │");
        tracing::info!("├─────────────────────────────────────────┤");
        tracing::info!("│ Serial: {} @ {} baud", self.serial.port, self.serial.baud_rate);
        tracing::info!("│ Viewers: ws://{}/ws", self.server.bind);
        if self.sink.enabled {
            tracing::info!("│ Reading log: {}", self.sink.directory.display());
        } else {
            tracing::info!("│ Reading log: disabled");
        }
        tracing::info!("│ Log Level: {}", self.logging.level);
        tracing::info!("└─────────────────────────────────────────┘");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = HostConfig::parse("").unwrap();
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.server.bind, "0.0.0.0:3000");
        assert!(config.sink.enabled);
        assert_eq!(config.decoder.prefixes.len(), DEFAULT_PREFIXES.len());
        assert!(!config.decoder.policy.reject_non_numeric);
    }

    #[test]
    fn test_full_file() {
        let config = HostConfig::parse(
            r#"
            [serial]
            port = "/dev/cu.usbmodem2"
            baud_rate = 115200

            [server]
            bind = "127.0.0.1:8080"
            subscriber_queue = 8

            [sink]
            enabled = false
            close_timeout_secs = 2

            [decoder]
            prefixes = ["Received packet:"]
            reject_field_count_mismatch = true

            [logging]
            level = "debug"
            show_sensor_data = false
            "#,
        )
        .unwrap();
        assert_eq!(config.serial.port, "/dev/cu.usbmodem2");
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.server.subscriber_queue, 8);
        assert_eq!(config.server.static_dir, PathBuf::from("public"));
        assert!(!config.sink.enabled);
        assert_eq!(config.sink.file_prefix, "sensor_data");
        assert_eq!(config.sink.close_timeout_secs, 2);
        assert_eq!(config.decoder.prefixes, vec!["Received packet:"]);
        assert!(config.decoder.policy.reject_field_count_mismatch);
        assert!(!config.decoder.policy.reject_non_numeric);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_stdin_port() {
        let config = HostConfig::parse("[serial]\nport = \"-\"\nbaud_rate = 9600\n").unwrap();
        assert!(config.serial.is_stdin());
    }

    #[test]
    fn test_discover_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");
        std::fs::write(&path, "[serial]\nbaud_rate = 115200\n").unwrap();
        let (config, source) = HostConfig::discover(Some(path.clone())).unwrap();
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(source, Some(path));

        assert!(HostConfig::discover(Some(dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_bad_toml_is_error() {
        assert!(HostConfig::parse("[serial\nport = 1").is_err());
    }
}
