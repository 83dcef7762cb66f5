//! Bridge Configuration (ferrule.toml)
//!
//! Every field is optional; accessors fall back to the built-in defaults.
//!
//! ```toml
//! [bridge]
//! traceback_headroom = 11
//! classify_headroom = 2
//!
//! [runtime]
//! max_stack = 1000000
//! max_call_depth = 200
//! memory_limit = 67108864
//! ```

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Free slots the error classifier needs before inspecting a payload.
pub const DEFAULT_CLASSIFY_HEADROOM: u32 = 2;
/// Free slots needed before building a traceback.
pub const DEFAULT_TRACEBACK_HEADROOM: u32 = 11;
pub const DEFAULT_MAX_STACK: usize = 1_000_000;
pub const DEFAULT_MAX_CALL_DEPTH: usize = 200;

/// Smallest stack a runtime can be configured with.
pub const MIN_STACK_LIMIT: usize = 20;

/// Largest accepted headroom value. Keeps the sum of both headrooms
/// representable as a C `int`.
pub const MAX_HEADROOM: u32 = 1 << 30;

/// Configuration from ferrule.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Error handling settings
    #[serde(default)]
    pub bridge: BridgeSection,

    /// Runtime limits
    #[serde(default)]
    pub runtime: RuntimeSection,
}

/// Error handling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct BridgeSection {
    /// Free stack slots required to attach a traceback (default: 11)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback_headroom: Option<u32>,

    /// Free stack slots required to classify an error payload (default: 2)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classify_headroom: Option<u32>,
}

/// Runtime limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSection {
    /// Maximum number of stack slots (default: 1000000)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_stack: Option<usize>,

    /// Maximum depth of nested calls (default: 200)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_call_depth: Option<usize>,

    /// Memory limit in bytes (default: unlimited)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<usize>,
}

impl BridgeConfig {
    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(n) = self.bridge.classify_headroom {
            if !(DEFAULT_CLASSIFY_HEADROOM..=MAX_HEADROOM).contains(&n) {
                return Err(invalid(
                    "bridge.classify_headroom",
                    format!(
                        "must be between {} and {}, got {}",
                        DEFAULT_CLASSIFY_HEADROOM, MAX_HEADROOM, n
                    ),
                ));
            }
        }

        if let Some(n) = self.bridge.traceback_headroom {
            if n == 0 {
                return Err(invalid(
                    "bridge.traceback_headroom",
                    "must leave room for the traceback string".to_string(),
                ));
            }
            if n > MAX_HEADROOM {
                return Err(invalid(
                    "bridge.traceback_headroom",
                    format!("must be at most {}, got {}", MAX_HEADROOM, n),
                ));
            }
        }

        if let Some(n) = self.runtime.max_stack {
            if !(MIN_STACK_LIMIT..=DEFAULT_MAX_STACK).contains(&n) {
                return Err(invalid(
                    "runtime.max_stack",
                    format!(
                        "must be between {} and {}, got {}",
                        MIN_STACK_LIMIT, DEFAULT_MAX_STACK, n
                    ),
                ));
            }
        }

        if self.runtime.max_call_depth == Some(0) {
            return Err(invalid(
                "runtime.max_call_depth",
                "must be greater than zero".to_string(),
            ));
        }

        if self.runtime.memory_limit == Some(0) {
            return Err(invalid(
                "runtime.memory_limit",
                "must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Merge another config into this one
    /// Other config takes precedence for non-None values
    pub fn merge(&mut self, other: &BridgeConfig) {
        let bridge = &other.bridge;
        if bridge.traceback_headroom.is_some() {
            self.bridge.traceback_headroom = bridge.traceback_headroom;
        }
        if bridge.classify_headroom.is_some() {
            self.bridge.classify_headroom = bridge.classify_headroom;
        }

        let runtime = &other.runtime;
        if runtime.max_stack.is_some() {
            self.runtime.max_stack = runtime.max_stack;
        }
        if runtime.max_call_depth.is_some() {
            self.runtime.max_call_depth = runtime.max_call_depth;
        }
        if runtime.memory_limit.is_some() {
            self.runtime.memory_limit = runtime.memory_limit;
        }
    }

    pub fn traceback_headroom(&self) -> u32 {
        self.bridge
            .traceback_headroom
            .unwrap_or(DEFAULT_TRACEBACK_HEADROOM)
    }

    pub fn classify_headroom(&self) -> u32 {
        self.bridge
            .classify_headroom
            .unwrap_or(DEFAULT_CLASSIFY_HEADROOM)
    }

    pub fn max_stack(&self) -> usize {
        self.runtime.max_stack.unwrap_or(DEFAULT_MAX_STACK)
    }

    pub fn max_call_depth(&self) -> usize {
        self.runtime.max_call_depth.unwrap_or(DEFAULT_MAX_CALL_DEPTH)
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.runtime.memory_limit
    }
}

fn invalid(field: &str, reason: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.traceback_headroom(), 11);
        assert_eq!(config.classify_headroom(), 2);
        assert_eq!(config.max_stack(), 1_000_000);
        assert_eq!(config.max_call_depth(), 200);
        assert_eq!(config.memory_limit(), None);
    }

    #[test]
    fn test_parse_sections() {
        let config: BridgeConfig = toml::from_str(
            r#"
[bridge]
traceback_headroom = 16

[runtime]
max_stack = 5000
"#,
        )
        .unwrap();
        assert_eq!(config.traceback_headroom(), 16);
        assert_eq!(config.classify_headroom(), 2);
        assert_eq!(config.max_stack(), 5000);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<BridgeConfig, _> = toml::from_str("[bridge]\nheadroom = 3\n");
        assert!(result.is_err());
    }

    #[rstest]
    #[case(Some(1), None)]
    #[case(Some(MAX_HEADROOM + 1), None)]
    #[case(None, Some(0))]
    #[case(None, Some(u32::MAX))]
    fn test_headroom_out_of_range(#[case] classify: Option<u32>, #[case] traceback: Option<u32>) {
        let mut config = BridgeConfig::default();
        config.bridge.classify_headroom = classify;
        config.bridge.traceback_headroom = traceback;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_headroom_upper_bound_accepted() {
        let mut config = BridgeConfig::default();
        config.bridge.classify_headroom = Some(MAX_HEADROOM);
        config.bridge.traceback_headroom = Some(MAX_HEADROOM);
        config.validate().unwrap();
    }

    #[test]
    fn test_merge_prefers_other() {
        let mut base = BridgeConfig::default();
        base.runtime.max_stack = Some(100);
        base.runtime.max_call_depth = Some(50);

        let mut other = BridgeConfig::default();
        other.runtime.max_stack = Some(200);

        base.merge(&other);
        assert_eq!(base.max_stack(), 200);
        assert_eq!(base.max_call_depth(), 50);
    }
}
