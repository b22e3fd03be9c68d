//! Application configuration.
//!
//! Configuration is loaded from the first file that exists:
//! - `$MQTTBUZZ_CONFIG`
//! - `config.json`
//! - `mqttbuzz.toml`
//! - `~/.config/mqttbuzz/mqttbuzz.toml`
//!
//! Files ending in `.json` are parsed as JSON, everything else as TOML.

use anyhow::{Context, Result};
use mqttbuzz_core::endpoint::DEFAULT_MAX_MESSAGE_LENGTH;
use mqttbuzz_core::{resolve_endpoints, EndpointRecord, ResolvedEndpoints, SessionSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "MQTTBUZZ_CONFIG";

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Broker endpoints.
    #[serde(default)]
    pub mqtt_servers: Vec<EndpointRecord>,

    /// Global sound switch, and the default for endpoints that don't say.
    #[serde(default = "default_true")]
    pub sounds_enabled: bool,

    /// Forwarded messages are truncated to this many characters.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,

    /// Session timing.
    #[serde(default)]
    pub session: SessionConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Session timing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bound on a single connection attempt, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// MQTT keep-alive interval, in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Bound on waiting for a session to stop, in milliseconds.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Exporter port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_max_message_length() -> usize {
    DEFAULT_MAX_MESSAGE_LENGTH
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_keep_alive() -> u64 {
    60
}

fn default_stop_timeout() -> u64 {
    5_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt_servers: Vec::new(),
            sounds_enabled: true,
            max_message_length: default_max_message_length(),
            session: SessionConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            keep_alive_secs: default_keep_alive(),
            stop_timeout_ms: default_stop_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Find the configuration file to use, if any.
    #[must_use]
    pub fn locate() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(shellexpand::tilde(&path).as_ref()));
        }

        let config_paths = [
            "config.json",
            "mqttbuzz.toml",
            "~/.config/mqttbuzz/mqttbuzz.toml",
        ];

        config_paths
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Load configuration from `path`, or defaults when there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config: Config = if is_json {
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        };

        Ok(config)
    }

    /// Validate the endpoint records.
    #[must_use]
    pub fn endpoints(&self) -> ResolvedEndpoints {
        resolve_endpoints(&self.mqtt_servers, self.sounds_enabled)
    }

    /// Session settings for the connection manager.
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings::new()
            .with_connect_timeout(Duration::from_secs(self.session.connect_timeout_secs))
            .with_keep_alive(Duration::from_secs(self.session.keep_alive_secs))
            .with_stop_timeout(Duration::from_millis(self.session.stop_timeout_ms))
            .with_max_message_length(self.max_message_length)
    }
}
