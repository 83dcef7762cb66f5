//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::bridge::BridgeConfig;
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Name of the project configuration file
pub const PROJECT_CONFIG_FILE: &str = "ferrule.toml";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.ferrule/config.toml) - lowest priority
/// 2. Project config (./ferrule.toml) - overrides global
/// 3. Environment variables (FERRULE_*) - highest priority
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Effective configuration
    pub config: BridgeConfig,

    /// Directory where ferrule.toml was found
    pub project_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Create a loader that reads the global config from `path` instead of the home directory
    pub fn with_global_path(path: impl Into<PathBuf>) -> Self {
        Self {
            global_config_path: Some(path.into()),
        }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find ferrule.toml, merges it over the
    /// global config if one exists, then applies environment overrides.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<LoadedConfig> {
        let (project_root, project_config) = self.find_project_config(start_dir)?;

        let mut config = self.load_global_config().unwrap_or_default();
        if let Some(project_config) = project_config {
            config.merge(&project_config);
        }

        let config = self.apply_env_overrides(config)?;
        config.validate()?;

        Ok(LoadedConfig {
            config,
            project_root,
        })
    }

    /// Load configuration from a specific project config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<LoadedConfig> {
        let project_config = BridgeConfig::load_from_file(config_path)?;

        let mut config = self.load_global_config().unwrap_or_default();
        config.merge(&project_config);
        let config = self.apply_env_overrides(config)?;
        config.validate()?;

        Ok(LoadedConfig {
            config,
            project_root: config_path.parent().map(|p| p.to_path_buf()),
        })
    }

    /// Find project configuration by walking up directory tree
    fn find_project_config(
        &self,
        start_dir: &Path,
    ) -> ConfigResult<(Option<PathBuf>, Option<BridgeConfig>)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(PROJECT_CONFIG_FILE);

            if config_path.exists() {
                let config = BridgeConfig::load_from_file(&config_path)?;
                return Ok((Some(current), Some(config)));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, None)),
            }
        }
    }

    /// Load global configuration from ~/.ferrule/config.toml
    fn load_global_config(&mut self) -> ConfigResult<BridgeConfig> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => {
                let path = Self::global_config_dir()?.join("config.toml");
                self.global_config_path = Some(path.clone());
                path
            }
        };

        // Global config is optional - if it doesn't exist, return default
        if !path.exists() {
            return Ok(BridgeConfig::default());
        }

        BridgeConfig::load_from_file(&path)
    }

    /// Apply environment variable overrides
    ///
    /// Recognised variables: FERRULE_TRACEBACK_HEADROOM, FERRULE_CLASSIFY_HEADROOM,
    /// FERRULE_MAX_STACK, FERRULE_MAX_CALL_DEPTH, FERRULE_MEMORY_LIMIT.
    fn apply_env_overrides(&self, mut config: BridgeConfig) -> ConfigResult<BridgeConfig> {
        if let Some(n) = env_value("FERRULE_TRACEBACK_HEADROOM")? {
            config.bridge.traceback_headroom = Some(n);
        }
        if let Some(n) = env_value("FERRULE_CLASSIFY_HEADROOM")? {
            config.bridge.classify_headroom = Some(n);
        }
        if let Some(n) = env_value("FERRULE_MAX_STACK")? {
            config.runtime.max_stack = Some(n);
        }
        if let Some(n) = env_value("FERRULE_MAX_CALL_DEPTH")? {
            config.runtime.max_call_depth = Some(n);
        }
        if let Some(n) = env_value("FERRULE_MEMORY_LIMIT")? {
            config.runtime.memory_limit = Some(n);
        }
        Ok(config)
    }

    /// Get the global configuration directory (~/.ferrule)
    pub fn global_config_dir() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".ferrule"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn env_value<T: FromStr>(name: &str) -> ConfigResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                field: name.to_string(),
                reason: format!("'{}': {}", raw, e),
            }),
        Err(_) => Ok(None),
    }
}
