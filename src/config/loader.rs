//! Configuration loader with file resolution and environment override support.

use super::error::{ConfigError, ConfigResult};
use super::schema::Config;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "SERIAL_DISCOVERY";

/// Config file name inside the application config directory
const CONFIG_FILE_NAME: &str = "config.toml";

/// Config file name looked up in the current directory
const LOCAL_CONFIG_FILE_NAME: &str = "serial-discovery.toml";

/// Application directory name under the platform config directory
const APP_DIR_NAME: &str = "serial-discovery";

/// Environment variable for explicit config path
const CONFIG_PATH_ENV: &str = "SERIAL_DISCOVERY_CONFIG";

/// Configuration loader with resolution and override logic.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Resolved config file path (if any)
    pub config_path: Option<PathBuf>,
    /// The loaded configuration
    pub config: Config,
}

impl ConfigLoader {
    /// Load configuration using standard resolution order.
    ///
    /// Resolution priority (highest to lowest):
    /// 1. `SERIAL_DISCOVERY_CONFIG` environment variable (explicit path)
    /// 2. `./serial-discovery.toml` (current directory)
    /// 3. `~/.config/serial-discovery/config.toml` (XDG on Linux/macOS)
    /// 4. `%APPDATA%\serial-discovery\config.toml` (Windows)
    /// 5. Built-in defaults (no file required)
    ///
    /// Environment variables override file values; the result is validated.
    pub fn load() -> ConfigResult<Self> {
        let config_path = resolve_config_path();

        let mut config = if let Some(ref path) = config_path {
            load_from_file(path)?
        } else {
            Config::default()
        };

        apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }
        let mut config = load_from_file(&path)?;
        apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(Self {
            config_path: Some(path),
            config,
        })
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a mutable reference to the configuration.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Consume the loader and return the configuration.
    pub fn into_config(self) -> Config {
        self.config
    }
}

/// Resolve the configuration file path using standard locations.
pub fn resolve_config_path() -> Option<PathBuf> {
    // 1. Explicit environment variable
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. Current directory
    let cwd_config = PathBuf::from(LOCAL_CONFIG_FILE_NAME);
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    // 3. XDG config directory (Linux/macOS) or APPDATA (Windows)
    get_default_config_path().filter(|path| path.exists())
}

/// Get the platform-specific config directory.
fn get_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}

/// Load configuration from a file.
fn load_from_file(path: &Path) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&content).map_err(ConfigError::ParseError)
}

fn env_key(suffix: &str) -> String {
    format!("{}_{}", ENV_PREFIX, suffix)
}

/// Read and parse one override, if present.
fn env_value<T: FromStr>(suffix: &str, what: &str) -> ConfigResult<Option<T>> {
    let key = env_key(suffix);
    match std::env::var(&key) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::env_parse(key, format!("Invalid {}", what))),
        Err(_) => Ok(None),
    }
}

/// Read a comma-separated list override, if present.
fn env_list(suffix: &str) -> Option<Vec<String>> {
    std::env::var(env_key(suffix)).ok().map(|val| {
        val.split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    })
}

/// Apply environment variable overrides to the configuration.
///
/// Environment variables follow the pattern: `SERIAL_DISCOVERY_<SECTION>_<KEY>`.
fn apply_env_overrides(config: &mut Config) -> ConfigResult<()> {
    // Discovery overrides
    if let Some(selectors) = env_list("DISCOVERY_SELECTORS") {
        config.discovery.selectors = selectors;
    }
    if let Some(ms) = env_value("DISCOVERY_POLL_INTERVAL_MS", "poll interval")? {
        config.discovery.poll_interval_ms = ms;
    }
    if let Some(ms) = env_value("DISCOVERY_DISPOSE_GRACE_MS", "grace window")? {
        config.discovery.dispose_grace_ms = ms;
    }

    // Validation overrides
    if let Some(names) = env_list("VALIDATION_KNOWN_NAMES") {
        config.validation.known_names = names;
    }
    if let Some(tags) = env_list("VALIDATION_PRODUCT_TAGS") {
        config.validation.product_tags = tags;
    }
    if let Some(ms) = env_value("VALIDATION_PROBE_TIMEOUT_MS", "probe timeout")? {
        config.validation.probe_timeout_ms = ms;
    }

    // Transport overrides
    if let Some(baud) = env_value("TRANSPORT_BAUD_RATE", "baud rate")? {
        config.transport.baud_rate = baud;
    }
    if let Some(ms) = env_value("TRANSPORT_DEFAULT_TIMEOUT_MS", "timeout")? {
        config.transport.default_timeout_ms = ms;
    }
    if let Some(ms) = env_value("TRANSPORT_CONNECT_TIMEOUT_MS", "connect timeout")? {
        config.transport.connect_timeout_ms = ms;
    }

    // Logging overrides
    if let Ok(val) = std::env::var(env_key("LOGGING_LEVEL")) {
        config.logging.level = val;
    }
    if let Some(format) = env_value("LOGGING_FORMAT", "log format")? {
        config.logging.format = format;
    }

    Ok(())
}

/// Get the default config directory for creating new config files.
pub fn get_default_config_dir() -> Option<PathBuf> {
    get_config_dir().map(|d| d.join(APP_DIR_NAME))
}

/// Get the default config file path for creating new config files.
pub fn get_default_config_path() -> Option<PathBuf> {
    get_default_config_dir().map(|d| d.join(CONFIG_FILE_NAME))
}
