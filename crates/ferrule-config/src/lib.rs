//! Ferrule Configuration System
//!
//! Provides the tuning knobs of the bridge and the runtime it drives:
//! - Project configuration (ferrule.toml)
//! - Global user configuration (~/.ferrule/config.toml)
//! - Environment overrides (FERRULE_*)
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Global config (~/.ferrule/config.toml)
//! 3. Project config (ferrule.toml, found by walking up from a directory)
//! 4. Environment variables (FERRULE_*)
//!
//! # Example
//!
//! ```no_run
//! use ferrule_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let loaded = loader.load_from_directory(Path::new(".")).unwrap();
//! println!("traceback headroom: {}", loaded.config.traceback_headroom());
//! ```

pub mod bridge;
pub mod loader;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Re-export main types
pub use bridge::{BridgeConfig, BridgeSection, RuntimeSection};
pub use loader::{ConfigLoader, LoadedConfig};
