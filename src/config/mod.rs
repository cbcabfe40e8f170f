//! Configuration management.
//!
//! Settings come from, in increasing precedence: built-in defaults, a TOML
//! config file, and `DORMSOUP_*` environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `DORMSOUP_DATA_DIR` | `data_dir` |
//! | `DORMSOUP_INDEX_PATH` | `index.primary_path` |
//! | `DORMSOUP_INDEX_BACKUP_PATH` | `index.backup_path` |
//! | `DORMSOUP_EMBEDDING_DIMENSIONS` | `index.dimensions` |
//! | `DORMSOUP_FLUSH_INTERVAL_SECS` | `index.flush_interval_secs` |
//! | `DORMSOUP_DEDUP_NEIGHBORS` | `dedup.neighbors` |
//! | `DORMSOUP_DEDUP_ENABLED` | `dedup.enabled` |
//! | `DORMSOUP_STORE_PATH` | `store.sqlite_path` |
//! | `DORMSOUP_LOG_FORMAT` | `logging.format` |
//! | `DORMSOUP_LOG` | `logging.filter` |

use crate::embedding::DEFAULT_DIMENSIONS;
use crate::services::deduplication::{DEFAULT_NEIGHBORS, DeduplicationConfig, SnapshotPaths};
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for dormsoup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DormsoupConfig {
    /// Directory holding the index snapshot and the event database.
    pub data_dir: PathBuf,
    /// Similarity index settings.
    pub index: IndexSettings,
    /// Deduplication settings.
    pub dedup: DedupSettings,
    /// Event store settings.
    pub store: StoreSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

/// Similarity index settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSettings {
    /// Snapshot path. Defaults to `<data_dir>/embeddings.json`.
    pub primary_path: Option<PathBuf>,
    /// Backup path. Defaults to `<primary>.bak`.
    pub backup_path: Option<PathBuf>,
    /// Embedding dimension.
    pub dimensions: usize,
    /// Seconds between periodic flushes.
    pub flush_interval_secs: u64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            primary_path: None,
            backup_path: None,
            dimensions: DEFAULT_DIMENSIONS,
            flush_interval_secs: 60,
        }
    }
}

/// Deduplication settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupSettings {
    /// Nearest titles examined per candidate.
    pub neighbors: usize,
    /// When false every candidate is inserted.
    pub enabled: bool,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            neighbors: DEFAULT_NEIGHBORS,
            enabled: true,
        }
    }
}

/// Event store settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSettings {
    /// `SQLite` path, or `:memory:`. Defaults to `<data_dir>/events.db`.
    pub sqlite_path: Option<PathBuf>,
}

/// Logging settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingSettings {
    /// `pretty` or `json`.
    pub format: Option<String>,
    /// `EnvFilter` directive, e.g. `dormsoup=debug`.
    pub filter: Option<String>,
    /// Append logs to this file instead of stderr.
    pub file: Option<PathBuf>,
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Data directory.
    pub data_dir: Option<String>,
    /// Index section.
    pub index: Option<ConfigFileIndex>,
    /// Dedup section.
    pub dedup: Option<ConfigFileDedup>,
    /// Store section.
    pub store: Option<ConfigFileStore>,
    /// Logging section.
    pub logging: Option<ConfigFileLogging>,
}

/// Index section in config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileIndex {
    /// Snapshot path.
    pub primary_path: Option<String>,
    /// Backup path.
    pub backup_path: Option<String>,
    /// Embedding dimension.
    pub dimensions: Option<usize>,
    /// Flush interval.
    pub flush_interval_secs: Option<u64>,
}

/// Dedup section in config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileDedup {
    /// Neighbor count.
    pub neighbors: Option<usize>,
    /// Enabled flag.
    pub enabled: Option<bool>,
}

/// Store section in config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileStore {
    /// `SQLite` path.
    pub sqlite_path: Option<String>,
}

/// Logging section in config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileLogging {
    /// Output format.
    pub format: Option<String>,
    /// Filter directive.
    pub filter: Option<String>,
    /// Log file.
    pub file: Option<String>,
}

impl Default for DormsoupConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".dormsoup"),
            index: IndexSettings::default(),
            dedup: DedupSettings::default(),
            store: StoreSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl DormsoupConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| Error::operation("read_config_file", e))?;
        Self::parse_toml(&contents)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid config file.
    pub fn parse_toml(contents: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| Error::operation("parse_config_file", e))?;
        Ok(Self::from_config_file(file))
    }

    /// Loads configuration from the default location.
    ///
    /// Checks `<config dir>/dormsoup/config.toml`, then
    /// `~/.config/dormsoup/config.toml`. Returns defaults if neither exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load_default() -> Result<Self> {
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Ok(Self::default());
        };

        let candidates = [
            base_dirs.config_dir().join("dormsoup").join("config.toml"),
            base_dirs
                .home_dir()
                .join(".config")
                .join("dormsoup")
                .join("config.toml"),
        ];
        for path in candidates {
            if path.exists() {
                tracing::debug!(path = %path.display(), "Loading config file");
                return Self::load_from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Converts a `ConfigFile` to `DormsoupConfig`.
    fn from_config_file(file: ConfigFile) -> Self {
        let mut config = Self::default();

        if let Some(data_dir) = file.data_dir {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Some(index) = file.index {
            config.index.primary_path = index.primary_path.map(PathBuf::from);
            config.index.backup_path = index.backup_path.map(PathBuf::from);
            if let Some(v) = index.dimensions {
                config.index.dimensions = v;
            }
            if let Some(v) = index.flush_interval_secs {
                config.index.flush_interval_secs = v;
            }
        }
        if let Some(dedup) = file.dedup {
            if let Some(v) = dedup.neighbors {
                config.dedup.neighbors = v;
            }
            if let Some(v) = dedup.enabled {
                config.dedup.enabled = v;
            }
        }
        if let Some(store) = file.store {
            config.store.sqlite_path = store.sqlite_path.map(PathBuf::from);
        }
        if let Some(logging) = file.logging {
            config.logging.format = logging.format;
            config.logging.filter = logging.filter;
            config.logging.file = logging.file.map(PathBuf::from);
        }

        config
    }

    /// Applies `DORMSOUP_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a set variable cannot be parsed.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, keyed by environment variable name.
    ///
    /// # Errors
    ///
    /// Returns an error if a present value cannot be parsed.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("DORMSOUP_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("DORMSOUP_INDEX_PATH") {
            self.index.primary_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("DORMSOUP_INDEX_BACKUP_PATH") {
            self.index.backup_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("DORMSOUP_EMBEDDING_DIMENSIONS") {
            self.index.dimensions = parse_var("DORMSOUP_EMBEDDING_DIMENSIONS", &v)?;
        }
        if let Some(v) = lookup("DORMSOUP_FLUSH_INTERVAL_SECS") {
            self.index.flush_interval_secs = parse_var("DORMSOUP_FLUSH_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("DORMSOUP_DEDUP_NEIGHBORS") {
            self.dedup.neighbors = parse_var("DORMSOUP_DEDUP_NEIGHBORS", &v)?;
        }
        if let Some(v) = lookup("DORMSOUP_DEDUP_ENABLED") {
            self.dedup.enabled = v.to_lowercase() != "false" && v != "0";
        }
        if let Some(v) = lookup("DORMSOUP_STORE_PATH") {
            self.store.sqlite_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("DORMSOUP_LOG_FORMAT") {
            self.logging.format = Some(v);
        }
        if let Some(v) = lookup("DORMSOUP_LOG") {
            self.logging.filter = Some(v);
        }
        Ok(self)
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Resolved snapshot paths.
    #[must_use]
    pub fn snapshot_paths(&self) -> SnapshotPaths {
        let primary = self
            .index
            .primary_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("embeddings.json"));
        match &self.index.backup_path {
            Some(backup) => SnapshotPaths {
                primary,
                backup: backup.clone(),
            },
            None => SnapshotPaths::with_default_backup(primary),
        }
    }

    /// Resolved event store path.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.store
            .sqlite_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("events.db"))
    }

    /// Interval between periodic index flushes.
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.index.flush_interval_secs)
    }

    /// Deduplication engine configuration.
    #[must_use]
    pub const fn dedup_config(&self) -> DeduplicationConfig {
        DeduplicationConfig {
            enabled: self.dedup.enabled,
            neighbors: self.dedup.neighbors,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::InvalidInput(format!("{key}={value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_resolve_under_data_dir() {
        let config = DormsoupConfig::default().with_data_dir("/var/lib/dormsoup");
        let paths = config.snapshot_paths();
        assert_eq!(paths.primary, PathBuf::from("/var/lib/dormsoup/embeddings.json"));
        assert_eq!(paths.backup, PathBuf::from("/var/lib/dormsoup/embeddings.json.bak"));
        assert_eq!(config.store_path(), PathBuf::from("/var/lib/dormsoup/events.db"));
        assert_eq!(config.flush_interval(), Duration::from_secs(60));
        assert_eq!(config.dedup_config(), DeduplicationConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/srv/dormsoup"

[index]
primary_path = "/srv/index.json"
dimensions = 8

[dedup]
neighbors = 5
enabled = false

[store]
sqlite_path = ":memory:"

[logging]
format = "json"
"#,
        )
        .unwrap();

        let config = DormsoupConfig::load_from_file(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/dormsoup"));
        assert_eq!(config.snapshot_paths().backup, PathBuf::from("/srv/index.json.bak"));
        assert_eq!(config.index.dimensions, 8);
        assert_eq!(config.dedup.neighbors, 5);
        assert!(!config.dedup.enabled);
        assert_eq!(config.store_path(), PathBuf::from(":memory:"));
        assert_eq!(config.logging.format.as_deref(), Some("json"));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(DormsoupConfig::parse_toml("[dedup]\nthreshold = 0.9\n").is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DORMSOUP_DATA_DIR", "/tmp/ds"),
            ("DORMSOUP_DEDUP_NEIGHBORS", "7"),
            ("DORMSOUP_DEDUP_ENABLED", "0"),
            ("DORMSOUP_INDEX_BACKUP_PATH", "/tmp/old.json"),
            ("DORMSOUP_LOG", "dormsoup=trace"),
        ]
        .into_iter()
        .collect();

        let config = DormsoupConfig::default()
            .with_overrides(|k| vars.get(k).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/ds"));
        assert_eq!(config.dedup.neighbors, 7);
        assert!(!config.dedup.enabled);
        assert_eq!(config.snapshot_paths().backup, PathBuf::from("/tmp/old.json"));
        assert_eq!(config.logging.filter.as_deref(), Some("dormsoup=trace"));
    }

    #[test]
    fn test_bad_override_is_error() {
        let result = DormsoupConfig::default().with_overrides(|k| {
            (k == "DORMSOUP_EMBEDDING_DIMENSIONS").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
