//! Configuration management for devbus

mod manager;
pub mod serde_utils;
mod session;

pub use manager::ManagerConfig;
pub use session::{RetransmitConfig, SessionConfig};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devbus")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    tracing::debug!("Loaded config from {}", path.display());
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let result = load_config::<ManagerConfig>(&path);
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = ManagerConfig::default();
        config.session.window_depth = 32;
        config.max_id_attempts = 10;
        save_config(&path, &config).unwrap();

        let loaded: ManagerConfig = load_config(&path).unwrap();
        assert_eq!(loaded.session.window_depth, 32);
        assert_eq!(loaded.max_id_attempts, 10);
        assert_eq!(loaded.shutdown_timeout, config.shutdown_timeout);
    }

    #[test]
    fn test_default_path_ends_with_devbus() {
        let path = default_config_path();
        assert!(path.ends_with("devbus/config.toml"));
    }
}
