//! Configuration loading from `~/.courier/config.toml` with defaults.

use crate::error::{CourierError, CourierResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Scope stamped on envelopes when none is configured.
pub const DEFAULT_SCOPE: &str = "frame-courier";

/// Per-context protocol configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// Binds envelopes to one protocol instance. Envelopes carrying any
    /// other scope are dropped on receipt.
    pub scope: String,
    /// Prefer dedicated channels when the transport offers them.
    pub use_channels: bool,
    /// Prefix for identifiers the root generates for unnamed frames.
    pub frame_id_prefix: String,
    /// Number of recent negotiation deliveries remembered for duplicate
    /// suppression.
    pub dedup_capacity: usize,
    /// Default log filter for the CLI when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            scope: DEFAULT_SCOPE.to_string(),
            use_channels: true,
            frame_id_prefix: "frame-".to_string(),
            dedup_capacity: 512,
            log_level: "info".to_string(),
        }
    }
}

impl CourierConfig {
    /// Check the values the protocol cannot run without.
    pub fn validate(&self) -> CourierResult<()> {
        if self.scope.trim().is_empty() {
            return Err(CourierError::Config("scope must not be empty".into()));
        }
        if self.frame_id_prefix.is_empty() {
            return Err(CourierError::Config(
                "frame_id_prefix must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> CourierResult<String> {
        toml::to_string_pretty(self).map_err(|e| CourierError::Serialization(e.to_string()))
    }
}

/// Default location of the configuration file.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".courier")
        .join("config.toml")
}

/// Load configuration from a TOML file, with defaults.
///
/// A missing, unreadable or invalid file is not an error: a warning is
/// logged and the defaults are returned.
pub fn load_config(path: Option<&Path>) -> CourierConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return CourierConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return CourierConfig::default();
        }
    };

    match toml::from_str::<CourierConfig>(&contents) {
        Ok(config) => match config.validate() {
            Ok(()) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Invalid config, using defaults"
                );
                CourierConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            CourierConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = CourierConfig::default();
        assert_eq!(config.scope, DEFAULT_SCOPE);
        assert!(config.use_channels);
        assert_eq!(config.frame_id_prefix, "frame-");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml")));
        assert_eq!(config, CourierConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let file = write_config("scope = \"dashboard\"\nuse_channels = false\n");
        let config = load_config(Some(file.path()));
        assert_eq!(config.scope, "dashboard");
        assert!(!config.use_channels);
        assert_eq!(config.dedup_capacity, 512);
    }

    #[test]
    fn test_invalid_toml_falls_back() {
        let file = write_config("scope = [not toml");
        let config = load_config(Some(file.path()));
        assert_eq!(config, CourierConfig::default());
    }

    #[test]
    fn test_empty_scope_rejected() {
        let file = write_config("scope = \"  \"\n");
        assert_eq!(load_config(Some(file.path())).scope, DEFAULT_SCOPE);

        let config = CourierConfig {
            scope: String::new(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CourierError::Config(_))));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = CourierConfig {
            frame_id_prefix: "widget-".to_string(),
            ..Default::default()
        };
        let text = config.to_toml().unwrap();
        let parsed: CourierConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
