//! Configuration management for MultiZap

mod manager;
pub mod serde_utils;

pub use manager::{BackoffConfig, ManagerConfig, SevereReason};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("multizap")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Get the default directory for persisted tenant credentials
pub fn default_credentials_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("multizap")
        .join("sessions")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

/// Load and validate the session manager configuration.
///
/// Falls back to defaults when the file does not exist.
pub fn load_manager_config(path: &Path) -> Result<ManagerConfig, ConfigError> {
    let config = match load_config::<ManagerConfig>(path) {
        Ok(config) => config,
        Err(ConfigError::NotFound(_)) => ManagerConfig::default(),
        Err(e) => return Err(e),
    };
    config.validate()?;
    Ok(config)
}
