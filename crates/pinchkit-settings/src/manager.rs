//! Settings file location and lifecycle
//!
//! The default file lives at `<config_dir>/pinchkit/config.toml` as
//! resolved by `dirs`; an explicit path (e.g. from `--config`) overrides it.

use crate::config::Config;
use crate::error::{SettingsError, SettingsResult};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "pinchkit";
const CONFIG_FILE: &str = "config.toml";

/// Loads, holds and saves the console configuration
#[derive(Debug, Clone)]
pub struct SettingsManager {
    config: Config,
    path: PathBuf,
}

impl SettingsManager {
    /// Directory holding the settings file
    pub fn config_dir() -> SettingsResult<PathBuf> {
        dirs::config_dir()
            .or_else(dirs::home_dir)
            .map(|dir| dir.join(APP_DIR))
            .ok_or_else(|| {
                SettingsError::ConfigDirectory("no configuration or home directory".to_string())
            })
    }

    /// Default settings file path
    pub fn config_file_path() -> SettingsResult<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Create the settings directory if needed
    pub fn ensure_config_dir() -> SettingsResult<PathBuf> {
        let dir = Self::config_dir()?;
        std::fs::create_dir_all(&dir)
            .map_err(|e| SettingsError::ConfigDirectory(format!("{}: {}", dir.display(), e)))?;
        Ok(dir)
    }

    /// Load a configuration file
    pub fn load_from_file(path: &Path) -> SettingsResult<Config> {
        Config::load_from_file(path)
            .map_err(|e| SettingsError::LoadError(format!("{}: {}", path.display(), e)))
    }

    /// Open the settings
    ///
    /// An explicit path must exist and be valid. The default path is
    /// optional: a missing file yields defaults, and an unreadable one is
    /// reported and replaced by defaults.
    pub fn open(explicit: Option<PathBuf>) -> SettingsResult<Self> {
        if let Some(path) = explicit {
            let config = Self::load_from_file(&path)?;
            tracing::info!("Loaded settings from {}", path.display());
            return Ok(Self { config, path });
        }

        let path = Self::config_file_path()?;
        Ok(Self::at_default(path))
    }

    fn at_default(path: PathBuf) -> Self {
        let config = if path.exists() {
            match Self::load_from_file(&path) {
                Ok(config) => {
                    tracing::info!("Loaded settings from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("{}; using defaults", e);
                    Config::default()
                }
            }
        } else {
            tracing::debug!("No settings at {}; using defaults", path.display());
            Config::default()
        };
        Self { config, path }
    }

    /// Hold an in-memory configuration bound to `path`
    pub fn with_config(config: Config, path: PathBuf) -> Self {
        Self { config, path }
    }

    /// Write the configuration to its file, creating the directory
    pub fn save(&self) -> SettingsResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.config
            .save_to_file(&self.path)
            .map_err(|e| SettingsError::SaveError(format!("{}: {}", self.path.display(), e)))?;
        tracing::info!("Saved settings to {}", self.path.display());
        Ok(())
    }

    /// Current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mutable configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Settings file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the configuration
    pub fn into_config(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_path_layout() {
        if let Ok(path) = SettingsManager::config_file_path() {
            assert!(path.ends_with("pinchkit/config.toml"));
        }
    }

    #[test]
    fn test_missing_default_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SettingsManager::at_default(dir.path().join("config.toml"));
        assert_eq!(manager.config(), &Config::default());
    }

    #[test]
    fn test_corrupt_default_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "connection = [not toml").unwrap();

        let manager = SettingsManager::at_default(path);
        assert_eq!(manager.config(), &Config::default());
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let result = SettingsManager::open(Some(dir.path().join("absent.toml")));
        assert!(matches!(result, Err(SettingsError::LoadError(_))));
    }
}
