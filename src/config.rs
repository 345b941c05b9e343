//! Synchronization configuration
//!
//! The configuration is a JSON file describing the remote source, the store
//! layout, the data keys with their restrictions, the monitored location and
//! the refresh schedule. It is validated once, before anything is built from
//! it.
//!
//! Default location: `~/.config/stalesync/config.json` on Linux (XDG
//! equivalent elsewhere).

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::TableLayout;
use crate::data::fetch::DEFAULT_TIMEOUT_SECS;
use crate::data::{is_identifier, KeyError, KeySet, NormalizeError, Restriction};
use crate::location::{LocationContext, ValidationError};

/// Application name used for config/data directory paths
const APP_NAME: &str = "stalesync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Database file name
const DATABASE_FILE: &str = "stalesync.db";

/// Default interval between scheduled cycles
const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Errors raised while loading or validating the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Could not determine the {0} directory")]
    NoProjectDir(&'static str),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Invalid config: {0}")]
    Key(#[from] KeyError),

    #[error("Invalid config: {0}")]
    Location(#[from] ValidationError),

    #[error("Invalid config: {0}")]
    Restriction(#[from] NormalizeError),
}

/// Remote API settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// URL with `{latitude}` and `{longitude}` placeholders
    pub url_template: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub base_table: String,
    /// One table per key (`<base>_<key>`) instead of one shared table
    #[serde(default)]
    pub key_as_table: bool,
    /// Database file; defaults to the platform data directory
    #[serde(default)]
    pub database: Option<PathBuf>,
    /// Create tables and columns on demand
    #[serde(default = "default_true")]
    pub auto_provision: bool,
}

/// The monitored location and its staleness threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationConfig {
    pub latitude: f64,
    pub longitude: f64,
    pub ttl_minutes: f64,
}

/// Scheduled refresh settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_interval_secs() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub source: SourceConfig,
    pub storage: StorageConfig,
    /// Data keys, in order; the first drives the staleness check
    pub keys: Vec<String>,
    #[serde(default)]
    pub restrictions: IndexMap<String, Restriction>,
    pub location: LocationConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl SyncConfig {
    /// Loads and validates the config file at `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Parses and validates a JSON config document
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Default config file path for this platform
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = project_dirs()?;
        Ok(dirs.config_dir().join(CONFIG_FILE))
    }

    /// The configured database path, or the platform default
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.database {
            Some(path) => Ok(path.clone()),
            None => Ok(project_dirs()?.data_dir().join(DATABASE_FILE)),
        }
    }

    /// The ingestion timestamp column shared by every table
    pub fn date_column(&self) -> String {
        format!("{}_date", self.storage.base_table)
    }

    pub fn key_set(&self) -> Result<KeySet, ConfigError> {
        Ok(KeySet::new(self.keys.iter().cloned())?)
    }

    pub fn layout(&self) -> Result<TableLayout, ConfigError> {
        TableLayout::new(&self.storage.base_table, self.storage.key_as_table)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn location_context(&self) -> Result<LocationContext, ConfigError> {
        Ok(LocationContext::new(
            self.location.latitude,
            self.location.longitude,
            self.location.ttl_minutes,
        )?)
    }

    /// Checks every constraint the rest of the crate relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.url_template.trim().is_empty() {
            return Err(ConfigError::Invalid("source.url_template is empty".into()));
        }
        if self.source.timeout_secs == 0 {
            return Err(ConfigError::Invalid("source.timeout_secs must be > 0".into()));
        }
        if !is_identifier(&self.storage.base_table) {
            return Err(ConfigError::Invalid(format!(
                "storage.base_table '{}' must use ASCII letters, digits and '_'",
                self.storage.base_table
            )));
        }
        if self.schedule.interval_secs == 0 {
            return Err(ConfigError::Invalid("schedule.interval_secs must be > 0".into()));
        }

        let keys = self.key_set()?;
        self.location_context()?;

        let date_column = self.date_column();
        for (key, restriction) in &self.restrictions {
            if !keys.contains(key) {
                return Err(KeyError::UnknownKey(key.clone()).into());
            }
            restriction.check_projection(key, &date_column)?;
        }
        Ok(())
    }
}

fn project_dirs() -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("", "", APP_NAME).ok_or(ConfigError::NoProjectDir("home"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Comparison, Condition};
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "source": {
            "url_template": "https://api.open-meteo.com/v1/forecast?latitude={latitude}&longitude={longitude}&hourly=temperature_2m"
        },
        "storage": { "base_table": "weather", "key_as_table": true },
        "keys": ["hourly", "daily"],
        "restrictions": {
            "hourly": {
                "filter": [{ "column": "temperature_2m", "op": ">", "value": 0 }],
                "columns": ["time", "temperature_2m", "latitude", "longitude", "weather_date"]
            }
        },
        "location": { "latitude": 49.28, "longitude": -123.12, "ttl_minutes": 10 }
    }"#;

    #[test]
    fn test_parse_sample_with_defaults() {
        let config = SyncConfig::from_json(SAMPLE).unwrap();

        assert_eq!(config.source.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.schedule.interval_secs, DEFAULT_INTERVAL_SECS);
        assert!(config.storage.auto_provision);
        assert!(config.storage.database.is_none());
        assert_eq!(config.date_column(), "weather_date");
        assert_eq!(
            config.restrictions["hourly"].filter,
            vec![Condition::new("temperature_2m", Comparison::Gt, 0i64)]
        );
    }

    #[test]
    fn test_derived_parts() {
        let config = SyncConfig::from_json(SAMPLE).unwrap();

        let keys = config.key_set().unwrap();
        assert_eq!(keys.canonical().as_str(), "hourly");
        let layout = config.layout().unwrap();
        assert!(layout.key_as_table());
        let ctx = config.location_context().unwrap();
        assert_eq!(ctx.ttl_minutes(), 10.0);
    }

    #[test]
    fn test_restriction_for_unknown_key_is_rejected() {
        let mut config: SyncConfig = serde_json::from_str(SAMPLE).unwrap();
        config
            .restrictions
            .insert("weekly".into(), Restriction::default());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Key(KeyError::UnknownKey(_)))
        ));
    }

    #[test]
    fn test_projection_must_keep_mandatory_columns() {
        let mut config: SyncConfig = serde_json::from_str(SAMPLE).unwrap();
        config.restrictions["hourly"].columns = Some(vec!["time".into(), "latitude".into()]);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Restriction(NormalizeError::ProjectionDropsColumn { .. })
        ));
        assert!(err.to_string().contains("longitude"));
    }

    #[test]
    fn test_invalid_base_table_and_keys() {
        let mut config: SyncConfig = serde_json::from_str(SAMPLE).unwrap();
        config.storage.base_table = "weather data".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config: SyncConfig = serde_json::from_str(SAMPLE).unwrap();
        config.keys = vec!["hourly".into(), "hourly".into()];
        config.restrictions.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Key(KeyError::DuplicateKey(_)))
        ));
    }

    #[test]
    fn test_invalid_location_is_rejected() {
        let mut config: SyncConfig = serde_json::from_str(SAMPLE).unwrap();
        config.location.ttl_minutes = -1.0;
        assert!(matches!(config.validate(), Err(ConfigError::Location(_))));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.keys, vec!["hourly", "daily"]);
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = SyncConfig::load(Path::new("/nonexistent/stalesync.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/stalesync.json"));
    }

    #[test]
    fn test_explicit_database_path_wins() {
        let mut config: SyncConfig = serde_json::from_str(SAMPLE).unwrap();
        config.storage.database = Some(PathBuf::from("/tmp/x.db"));
        assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/x.db"));
    }
}
