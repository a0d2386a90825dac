//! TOML-based configuration for outline-sync.
//!
//! Every section is optional; a missing file section falls back to its
//! defaults so an empty file is a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

/// Marker inserted between two conflicting contents.
pub const DEFAULT_CONFLICT_MARKER: &str = "\n=====CONFLICT=====\n";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Document store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Conflict resolution settings.
    #[serde(default)]
    pub conflict: ConflictConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding the store file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("outline-sync"))
        .unwrap_or_else(|| PathBuf::from("outline-sync"))
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Document store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store file name inside `daemon.data_dir` (default `outline.db`).
    #[serde(default = "default_file_name")]
    pub file_name: String,

    /// Buffered change events per subscriber before it starts lagging.
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
}

fn default_file_name() -> String {
    "outline.db".into()
}
fn default_feed_capacity() -> usize {
    crate::store::DEFAULT_FEED_CAPACITY
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            file_name: default_file_name(),
            feed_capacity: default_feed_capacity(),
        }
    }
}

// ---------------------------------------------------------------------------
// Conflict resolution
// ---------------------------------------------------------------------------

/// Conflict resolution configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictConfig {
    /// Text placed between conflicting contents.
    #[serde(default = "default_marker")]
    pub marker: String,

    /// Treat two identical revisions in a conflict set as a failed
    /// resolution instead of dropping the duplicate.
    #[serde(default)]
    pub strict_identical: bool,
}

fn default_marker() -> String {
    DEFAULT_CONFLICT_MARKER.into()
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            marker: default_marker(),
            strict_identical: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.file_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "store.file_name".into(),
                detail: "store file name must not be empty".into(),
            });
        }
        if self.store.feed_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store.feed_capacity".into(),
                detail: "feed capacity must be > 0".into(),
            });
        }
        if self.conflict.marker.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "conflict.marker".into(),
                detail: "conflict marker must not be empty".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Full path of the store file.
    pub fn store_path(&self) -> PathBuf {
        self.daemon.data_dir.join(&self.store.file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[daemon]
log_level = "debug"
data_dir = "/tmp/outline-sync"

[store]
file_name = "cards.db"
feed_capacity = 64

[conflict]
marker = "\n<<<>>>\n"
strict_identical = true
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.store.feed_capacity, 64);
        assert_eq!(config.conflict.marker, "\n<<<>>>\n");
        assert!(config.conflict.strict_identical);
        assert_eq!(
            config.store_path(),
            PathBuf::from("/tmp/outline-sync/cards.db")
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_and_validate(&path).expect("load failed");
        assert_eq!(config.store.file_name, "cards.db");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.store.file_name, "outline.db");
        assert_eq!(config.conflict.marker, DEFAULT_CONFLICT_MARKER);
        assert!(!config.conflict.strict_identical);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = AppConfig::default();
        config.store.feed_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "store.feed_capacity"
        ));
    }

    #[test]
    fn test_validate_rejects_empty_marker() {
        let mut config = AppConfig::default();
        config.conflict.marker = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "conflict.marker"
        ));
    }
}
