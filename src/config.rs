//! Engine Configuration
//!
//! Settings shared by the CLI and embedders, read from a YAML file:
//!
//! ```yaml
//! database: data/flowcore.db
//! templates_dir: templates
//! handler_timeout_secs: 30
//! actor: flowcore
//! ```
//!
//! Every field is optional; a missing file yields the defaults.

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the configuration file location.
pub const CONFIG_ENV: &str = "FLOWCORE_CONFIG";

/// Lazily-resolved path to the configuration file.
pub static CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    // Priority 1: Explicit override
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            info!("Using config from {}: {}", CONFIG_ENV, path);
            return PathBuf::from(path);
        }
    }

    // Priority 2: Current working directory
    let cwd_path = PathBuf::from("flowcore.yaml");
    debug!("Using CWD config: {}", cwd_path.display());
    cwd_path
});

/// Runtime settings for the engine and its stores.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database file
    pub database: PathBuf,

    /// Directory of template documents
    pub templates_dir: PathBuf,

    /// Upper bound for one handler invocation
    pub handler_timeout_secs: u64,

    /// Name recorded in history rows and notifications for engine-driven steps
    pub actor: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("flowcore.db"),
            templates_dir: PathBuf::from("templates"),
            handler_timeout_secs: 30,
            actor: "flowcore".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs.max(1))
    }

    /// Loads the configuration at `path`, or the defaults if the file does not exist.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<dyn Error>> {
        let path = path.as_ref();

        if !path.exists() {
            debug!("No config at {}; using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config '{}': {}", path.display(), e))?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| format!("Invalid config '{}': {}", path.display(), e))?;

        info!("Loaded config from {}", path.display());
        Ok(config)
    }
}

/// Loads the configuration from [`CONFIG_PATH`].
pub fn load_config() -> Result<EngineConfig, Box<dyn Error>> {
    EngineConfig::load_from(&*CONFIG_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let config = EngineConfig::load_from(temp_dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.handler_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("flowcore.yaml");
        fs::write(&path, "database: /var/lib/flow.db\nhandler_timeout_secs: 5\n").unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.database, PathBuf::from("/var/lib/flow.db"));
        assert_eq!(config.handler_timeout(), Duration::from_secs(5));
        assert_eq!(config.actor, "flowcore");
    }

    #[test]
    fn test_invalid_file_is_error() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("flowcore.yaml");
        fs::write(&path, "handler_timeout_secs: soon\n").unwrap();

        let err = EngineConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid config"));
    }

    #[test]
    fn test_zero_timeout_is_clamped() {
        let config = EngineConfig {
            handler_timeout_secs: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.handler_timeout(), Duration::from_secs(1));
    }
}
