//! Config command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::output::{print_error, print_info, print_success};
use devbus_core::config;
use devbus_core::ManagerConfig;

fn resolve(config_path: Option<&PathBuf>) -> PathBuf {
    config_path
        .cloned()
        .unwrap_or_else(config::default_config_path)
}

/// Load the manager configuration
///
/// An explicit path must exist. Without one the default location is tried
/// and built-in defaults are used when nothing is there.
pub fn load_manager_config(config_path: Option<&PathBuf>) -> Result<ManagerConfig> {
    let path = resolve(config_path);
    let config = if path.exists() {
        config::load_config::<ManagerConfig>(&path)
            .with_context(|| format!("Failed to load config file: {:?}", path))?
    } else if config_path.is_some() {
        anyhow::bail!("Config file not found: {:?}", path);
    } else {
        tracing::debug!("No config at {:?}, using defaults", path);
        ManagerConfig::default()
    };

    config
        .validate()
        .with_context(|| format!("Invalid configuration in {:?}", path))?;
    Ok(config)
}

/// Show the effective configuration as TOML
pub fn config_show(config_path: Option<&PathBuf>) -> Result<()> {
    let path = resolve(config_path);
    let config = load_manager_config(config_path)?;

    if path.exists() {
        print_info(&format!("Configuration file: {:?}", path));
    } else {
        print_info("No configuration file; showing defaults");
        print_info("Run 'devbus config init' to create one");
    }
    println!();
    println!("{}", render(&config)?);

    Ok(())
}

/// Write the default configuration
pub fn config_init(config_path: Option<&PathBuf>, force: bool) -> Result<()> {
    let path = resolve(config_path);

    if path.exists() && !force {
        print_error(&format!("Config file already exists: {:?}", path));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    write_default(&path)?;
    print_success(&format!("Created configuration file: {:?}", path));
    Ok(())
}

/// Print the configuration file location
pub fn config_path(config_path: Option<&PathBuf>) -> Result<()> {
    println!("{}", resolve(config_path).display());
    Ok(())
}

fn write_default(path: &Path) -> Result<()> {
    config::save_config(path, &ManagerConfig::default())
        .with_context(|| format!("Failed to write config file: {:?}", path))
}

fn render(config: &ManagerConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to render configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devbus").join("config.toml");

        config_init(Some(&path), false).unwrap();
        assert!(path.exists());

        let config = load_manager_config(Some(&path)).unwrap();
        assert_eq!(config.max_id_attempts, ManagerConfig::default().max_id_attempts);
    }

    #[test]
    fn test_init_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_id_attempts = 7\n").unwrap();

        config_init(Some(&path), false).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "max_id_attempts = 7\n");

        let config = load_manager_config(Some(&path)).unwrap();
        assert_eq!(config.max_id_attempts, 7);
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(load_manager_config(Some(&path)).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_id_attempts = 0\n").unwrap();
        assert!(load_manager_config(Some(&path)).is_err());
    }
}
