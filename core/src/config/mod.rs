//! Configuration management
//!
//! Unified configuration for gatelink, loaded from
//! `<config_dir>/gatelink/config.toml`.

pub mod store;

pub use store::{
    CircuitBreakerSettings, Config, DedupSettings, ExecutionSettings, GatewaySettings,
    RateLimitSettings, ResilienceSettings, RetrySettings,
};

use std::path::PathBuf;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error occurred while reading/writing config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    /// TOML serialization error
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Find the configuration file in standard locations
pub fn find_config_file() -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        let path = cwd.join("gatelink.toml");
        if path.exists() {
            return Some(path);
        }
    }

    if let Some(dir) = get_config_dir() {
        let path = dir.join("config.toml");
        if path.exists() {
            return Some(path);
        }
    }

    None
}

/// Get the configuration directory path
pub fn get_config_dir() -> Option<PathBuf> {
    use dirs::config_dir;
    use home::home_dir;

    if let Some(dir) = config_dir() {
        return Some(dir.join("gatelink"));
    }

    if let Some(home) = home_dir() {
        return Some(home.join(".config").join("gatelink"));
    }

    None
}
