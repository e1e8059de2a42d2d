//! Configuration management for the Tether agent.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/tether/config.toml`.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("channel_port must be non-zero")]
    InvalidChannelPort,

    #[error("discovery_port must be non-zero")]
    InvalidDiscoveryPort,

    #[error("discovery_group must be a multicast IPv4 address, got {0}")]
    InvalidDiscoveryGroup(String),

    #[error("service_path must start with '/', got {0}")]
    InvalidServicePath(String),

    #[error("base_delay_ms must be between 1 and max_delay_ms ({1}), got {0}")]
    InvalidReconnectDelay(u64, u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Tether agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General agent configuration.
    pub agent: AgentConfig,

    /// Network-related configuration.
    pub network: NetworkConfig,

    /// Reconnection backoff configuration.
    pub reconnect: ReconnectConfig,
}

/// General agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory for storing agent data (pairing state, identity).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Human-readable name advertised to peers.
    pub device_name: String,
}

/// Network configuration for discovery and the sync channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port the sync channel connects to on the peer.
    pub channel_port: u16,

    /// WebSocket path of the sync channel endpoint.
    pub service_path: String,

    /// Multicast group used for LAN discovery.
    pub discovery_group: Ipv4Addr,

    /// UDP port used for LAN discovery.
    pub discovery_port: u16,
}

/// Reconnection backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Base delay before the first reconnect attempt, in milliseconds.
    pub base_delay_ms: u64,

    /// Upper bound on the reconnect delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            device_name: default_device_name(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            channel_port: 8765,
            service_path: "/tether".to_string(),
            discovery_group: Ipv4Addr::new(224, 0, 0, 167),
            discovery_port: 53318,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 60_000,
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
}

/// Returns a device name derived from the local hostname.
fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "tether-agent".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TETHER_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TETHER_DEVICE_NAME: Override the advertised device name
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TETHER_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.agent.log_level = level;
            }
        }

        if let Ok(name) = std::env::var("TETHER_DEVICE_NAME") {
            if !name.is_empty() {
                tracing::info!("Overriding device_name from environment: {}", name);
                self.agent.device_name = name;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.channel_port == 0 {
            return Err(ConfigError::InvalidChannelPort);
        }

        if self.network.discovery_port == 0 {
            return Err(ConfigError::InvalidDiscoveryPort);
        }

        if !self.network.discovery_group.is_multicast() {
            return Err(ConfigError::InvalidDiscoveryGroup(
                self.network.discovery_group.to_string(),
            ));
        }

        if !self.network.service_path.starts_with('/') {
            return Err(ConfigError::InvalidServicePath(
                self.network.service_path.clone(),
            ));
        }

        if self.reconnect.base_delay_ms == 0
            || self.reconnect.base_delay_ms > self.reconnect.max_delay_ms
        {
            return Err(ConfigError::InvalidReconnectDelay(
                self.reconnect.base_delay_ms,
                self.reconnect.max_delay_ms,
            ));
        }

        let level = self.agent.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.agent.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
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

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
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
