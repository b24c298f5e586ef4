//! Configuration module for serial-discovery.
//!
//! This module provides TOML-based configuration with environment variable overrides.
//!
//! # Configuration Resolution
//!
//! Configuration is loaded from the following locations (in order of priority):
//!
//! 1. `SERIAL_DISCOVERY_CONFIG` environment variable (explicit path)
//! 2. `./serial-discovery.toml` (current directory)
//! 3. `~/.config/serial-discovery/config.toml` (XDG on Linux/macOS)
//! 4. `%APPDATA%\serial-discovery\config.toml` (Windows)
//! 5. Built-in defaults (no file required)
//!
//! # Environment Overrides
//!
//! Scalar values and lists can be overridden via environment variables.
//! The pattern is: `SERIAL_DISCOVERY_<SECTION>_<KEY>`; lists are
//! comma-separated.
//!
//! Examples:
//! - `SERIAL_DISCOVERY_DISCOVERY_SELECTORS=usb,name:/dev/ttyS`
//! - `SERIAL_DISCOVERY_DISCOVERY_DISPOSE_GRACE_MS=4000`
//! - `SERIAL_DISCOVERY_TRANSPORT_BAUD_RATE=921600`
//!
//! # Example
//!
//! ```rust,ignore
//! use serial_discovery::config::ConfigLoader;
//!
//! let loader = ConfigLoader::load()?;
//! let config = loader.config();
//! println!("Grace window: {:?}", config.discovery.dispose_grace());
//! ```

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    get_default_config_dir, get_default_config_path, resolve_config_path, ConfigLoader,
};
pub use schema::{
    Config, DiscoveryConfig, LogFormat, LoggingConfig, TransportConfig, ValidationConfig,
};
