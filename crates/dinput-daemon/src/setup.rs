//! Config loading and default locations.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::Config;
use crate::error::DaemonError;

/// Load configuration from the given path, or the default location.
pub fn load_config(path: Option<&str>) -> Result<Config, DaemonError> {
    let config_path = match path {
        Some(p) => PathBuf::from(p),
        None => default_config_path(),
    };
    load_config_from(&config_path)
}

/// Load configuration from `path`, falling back to defaults when it is missing.
pub fn load_config_from(path: &Path) -> Result<Config, DaemonError> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::Config(format!("failed to read config: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| DaemonError::Config(format!("failed to parse config: {e}")))?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    } else {
        info!(path = %path.display(), "no config file found, using defaults");
        Ok(Config::default())
    }
}

/// Get the default config directory path.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("dinput")
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.hub.event_buffer_size, 512);
    }

    #[test]
    fn file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[daemon]\nnetwork_id = \"bench\"\n").unwrap();
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.daemon.network_id, "bench");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[hub\nposition = ").unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
    }

    #[test]
    fn default_path_is_under_dinput() {
        assert!(default_config_path().ends_with("dinput/config.toml"));
    }
}
