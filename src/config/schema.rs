//! Configuration schema definitions.
//!
//! This module defines the structure of the configuration file using serde.
//! All configuration sections are defined here with appropriate defaults.

use super::error::{ConfigError, ConfigResult};
use crate::device::DeviceSelector;
use crate::port::{DataBits, FlowControl, Parity, PortConfiguration, StopBits};
use crate::validator::IdentityRule;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Discovery sources and debounce policy
    pub discovery: DiscoveryConfig,
    /// Identification rules for the validation probe
    pub validation: ValidationConfig,
    /// Line settings and timeouts for transport sessions
    pub transport: TransportConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Reject values that would stall discovery or make ports unusable.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.discovery.selectors.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::validation(
                "discovery.selectors",
                "at least one selector is required",
            ));
        }
        if self.discovery.dispose_grace_ms == 0 {
            return Err(ConfigError::validation(
                "discovery.dispose_grace_ms",
                "grace window must be positive",
            ));
        }
        if self.discovery.poll_interval_ms == 0 {
            return Err(ConfigError::validation(
                "discovery.poll_interval_ms",
                "poll interval must be positive",
            ));
        }
        if self.transport.baud_rate == 0 {
            return Err(ConfigError::validation(
                "transport.baud_rate",
                "baud rate must be positive",
            ));
        }
        Ok(())
    }
}

/// Discovery configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// One discovery source is created per selector
    pub selectors: Vec<String>,
    /// Platform enumeration interval in milliseconds
    pub poll_interval_ms: u64,
    /// How long a removed device stays known before it is disposed
    pub dispose_grace_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            selectors: vec!["usb".to_string()],
            poll_interval_ms: 1000,
            dispose_grace_ms: 2500,
        }
    }
}

impl DiscoveryConfig {
    /// Non-empty selectors, in configuration order, each listed once
    pub fn selectors(&self) -> Vec<DeviceSelector> {
        let mut seen = HashSet::new();
        self.selectors
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty() && seen.insert(*s))
            .map(DeviceSelector::new)
            .collect()
    }

    /// Get the poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get the dispose grace window as Duration
    pub fn dispose_grace(&self) -> Duration {
        Duration::from_millis(self.dispose_grace_ms)
    }
}

/// Validation configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Display names accepted verbatim
    pub known_names: Vec<String>,
    /// Substrings accepted inside a serial-number token
    pub product_tags: Vec<String>,
    /// Upper bound for one open + identify probe
    pub probe_timeout_ms: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            known_names: vec!["STM32 STLink".to_string()],
            product_tags: vec!["NANO_".to_string()],
            probe_timeout_ms: 1000,
        }
    }
}

impl ValidationConfig {
    /// Build the identification rule table, names first.
    pub fn rules(&self) -> Vec<IdentityRule> {
        self.known_names
            .iter()
            .map(|name| IdentityRule::display_name(name.as_str()))
            .chain(
                self.product_tags
                    .iter()
                    .map(|tag| IdentityRule::serial_tag(tag.as_str())),
            )
            .collect()
    }

    /// Get the probe timeout as Duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Transport configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    /// Timeout used by callers that do not supply one, in milliseconds
    pub default_timeout_ms: u64,
    /// Upper bound for opening a transport session, in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            default_timeout_ms: 1000,
            connect_timeout_ms: 2000,
        }
    }
}

impl TransportConfig {
    /// Line settings handed to the port opener
    pub fn port_configuration(&self) -> PortConfiguration {
        PortConfiguration {
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            flow_control: self.flow_control,
            parity: self.parity,
            stop_bits: self.stop_bits,
            timeout: self.default_timeout(),
        }
    }

    /// Get the default I/O timeout as Duration
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Get the connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Log format: "json", "pretty", "compact"
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Pretty format with colors
    #[default]
    Pretty,
    /// Compact format
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}
