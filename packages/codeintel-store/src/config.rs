//! Store configuration (versioned YAML)
//!
//! ```yaml
//! version: 1
//! database:
//!   url: postgres://codeintel@localhost/codeintel
//!   max_connections: 20
//! janitor:
//!   interval_secs: 3600
//!   min_time_since_last_check_secs: 86400
//!   commit_batch_size: 100
//! monikers:
//!   definition_dumps_limit: 10
//! lifecycle:
//!   max_failures: 3
//! ```
//!
//! Every section is optional and falls back to its defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Missing version field in YAML
    #[error("Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    /// Unsupported version
    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    /// A field failed validation
    #[error("Invalid value for '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    fn validation(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/codeintel".to_string(),
            max_connections: 20,
            min_connections: 2,
            acquire_timeout_secs: 5,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

/// Staleness janitor cadence and batch size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JanitorConfig {
    pub interval_secs: u64,
    /// Commits checked more recently than this are skipped
    pub min_time_since_last_check_secs: u64,
    /// Maximum number of commits re-checked per cycle
    pub commit_batch_size: usize,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            min_time_since_last_check_secs: 24 * 3600,
            commit_batch_size: 100,
        }
    }
}

impl JanitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn min_time_since_last_check(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_time_since_last_check_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonikerConfig {
    /// Cap on canonical dumps returned for a definitions request
    pub definition_dumps_limit: usize,
    /// Rows fetched per round trip by paged reference scanners
    pub reference_scan_batch: usize,
}

impl Default for MonikerConfig {
    fn default() -> Self {
        Self {
            definition_dumps_limit: 10,
            reference_scan_batch: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleConfig {
    /// Processing failures tolerated before an upload becomes `failed`
    pub max_failures: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { max_failures: 3 }
    }
}

/// Validated store configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database: DatabaseConfig,
    pub janitor: JanitorConfig,
    pub monikers: MonikerConfig,
    pub lifecycle: LifecycleConfig,
}

/// YAML schema v1
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoreConfigExportV1 {
    version: Option<u32>,
    #[serde(default)]
    database: DatabaseConfig,
    #[serde(default)]
    janitor: JanitorConfig,
    #[serde(default)]
    monikers: MonikerConfig,
    #[serde(default)]
    lifecycle: LifecycleConfig,
}

impl StoreConfig {
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let export: StoreConfigExportV1 = serde_yaml::from_str(content)?;

        let version = export.version.ok_or(ConfigError::MissingVersion)?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        let config = Self {
            database: export.database,
            janitor: export.janitor,
            monikers: export.monikers,
            lifecycle: export.lifecycle,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        let export = StoreConfigExportV1 {
            version: Some(1),
            database: self.database.clone(),
            janitor: self.janitor.clone(),
            monikers: self.monikers.clone(),
            lifecycle: self.lifecycle.clone(),
        };
        Ok(serde_yaml::to_string(&export)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::validation("database.url", "must not be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::validation("database.max_connections", "must be at least 1"));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::validation(
                "database.min_connections",
                format!("exceeds max_connections ({})", self.database.max_connections),
            ));
        }
        if self.janitor.interval_secs == 0 {
            return Err(ConfigError::validation("janitor.interval_secs", "must be positive"));
        }
        if self.janitor.commit_batch_size == 0 {
            return Err(ConfigError::validation("janitor.commit_batch_size", "must be positive"));
        }
        if self.monikers.definition_dumps_limit == 0 {
            return Err(ConfigError::validation(
                "monikers.definition_dumps_limit",
                "must be positive",
            ));
        }
        if self.monikers.reference_scan_batch == 0 {
            return Err(ConfigError::validation("monikers.reference_scan_batch", "must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = StoreConfig::from_yaml_str("version: 1\n").unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.janitor.commit_batch_size, 100);
        assert_eq!(config.lifecycle.max_failures, 3);
    }

    #[test]
    fn test_yaml_file_loading() {
        let yaml_content = r#"
version: 1
database:
  url: postgres://codeintel@db/codeintel
  max_connections: 8
janitor:
  interval_secs: 60
  min_time_since_last_check_secs: 7200
  commit_batch_size: 25
monikers:
  definition_dumps_limit: 5
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = StoreConfig::from_yaml_file(temp_file.path()).unwrap();
        assert_eq!(config.database.url, "postgres://codeintel@db/codeintel");
        assert_eq!(config.database.max_connections, 8);
        assert_eq!(config.database.min_connections, 2);
        assert_eq!(config.janitor.interval(), Duration::from_secs(60));
        assert_eq!(
            config.janitor.min_time_since_last_check(),
            chrono::Duration::hours(2)
        );
        assert_eq!(config.monikers.definition_dumps_limit, 5);
        assert_eq!(config.monikers.reference_scan_batch, 100);
    }

    #[test]
    fn test_yaml_missing_version() {
        let result = StoreConfig::from_yaml_str("janitor:\n  interval_secs: 10\n");
        assert!(matches!(result, Err(ConfigError::MissingVersion)));
    }

    #[test]
    fn test_yaml_unsupported_version() {
        let result = StoreConfig::from_yaml_str("version: 2\n");
        assert!(matches!(
            result,
            Err(ConfigError::UnsupportedVersion { found: 2, .. })
        ));
    }

    #[test]
    fn test_yaml_unknown_field_rejected() {
        let result = StoreConfig::from_yaml_str("version: 1\njanitor:\n  batch: 3\n");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let result = StoreConfig::from_yaml_str("version: 1\njanitor:\n  commit_batch_size: 0\n");
        match result {
            Err(ConfigError::Validation { field, .. }) => {
                assert_eq!(field, "janitor.commit_batch_size")
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_min_connections_above_max_rejected() {
        let yaml = "version: 1\ndatabase:\n  max_connections: 2\n  min_connections: 5\n";
        assert!(matches!(
            StoreConfig::from_yaml_str(yaml),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = StoreConfig::default();
        config.lifecycle.max_failures = 7;
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("version: 1"));
        assert_eq!(StoreConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let result = StoreConfig::from_yaml_file("/nonexistent/codeintel.yaml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
