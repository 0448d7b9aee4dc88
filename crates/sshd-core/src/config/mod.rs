//! Configuration management for git-sshd

mod server;
pub mod serde_utils;

pub use server::{DispatchMode, ServerConfig, DEFAULT_PORT};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("git-sshd")
}

/// Get the default data directory (host keys live below it)
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("git-sshd")
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
    tracing::debug!("Loaded configuration from {:?}", path);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = load_config::<ServerConfig>(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(p) if p == missing));
    }

    #[test]
    fn test_serialized_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = ServerConfig::default();
        config.port = 2022;
        config.max_processes = Some(8);
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let loaded: ServerConfig = load_config(&path).unwrap();
        assert_eq!(loaded.port, 2022);
        assert_eq!(loaded.max_processes, Some(8));
        assert_eq!(loaded.dispatch, DispatchMode::Direct);
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(matches!(
            load_config::<ServerConfig>(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
