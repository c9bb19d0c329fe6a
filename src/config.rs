use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::storage::data::{DataType, SeriesPath};

/// Error type for configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Estimated memtable bytes at which the working memtable is flushed
    pub memtable_flush_bytes: u64,
    /// Initial capacity of a newly allocated TVList
    pub tvlist_initial_capacity: usize,
    /// Maximum number of TVLists handed out at once
    pub max_tvlists: usize,
    /// Sources per series above which a query spills through external sort
    pub external_sort_threshold: usize,
    /// Sources merged into one spill file
    pub external_sort_group_size: usize,
    /// Payload width of TEXT values in spill records
    pub max_text_spill_bytes: usize,
    /// Directory for query spill files
    pub spill_dir: PathBuf,
    /// Directory for sealed chunk files
    pub data_dir: PathBuf,
    /// Prometheus listener, if metrics should be exported
    pub metrics_addr: Option<SocketAddr>,
    /// Series registered at startup, keyed by `device.measurement`
    pub series: BTreeMap<String, DataType>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memtable_flush_bytes: 64 * 1024 * 1024, // 64MB
            tvlist_initial_capacity: 32,
            max_tvlists: 100_000,
            external_sort_threshold: 8,
            external_sort_group_size: 4,
            max_text_spill_bytes: 256,
            spill_dir: PathBuf::from("data/spill"),
            data_dir: PathBuf::from("data/chunks"),
            metrics_addr: Some(SocketAddr::from(([127, 0, 0, 1], 9090))),
            series: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Loads a JSON configuration file. Missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tvlists == 0 {
            return Err(ConfigError::Invalid("max_tvlists must be positive".into()));
        }
        if self.external_sort_group_size < 2 {
            return Err(ConfigError::Invalid(
                "external_sort_group_size must be at least 2".into(),
            ));
        }
        self.series_paths().map(|_| ())
    }

    /// The configured series, with their paths parsed
    pub fn series_paths(&self) -> Result<Vec<(SeriesPath, DataType)>, ConfigError> {
        self.series
            .iter()
            .map(|(path, data_type)| {
                SeriesPath::parse(path)
                    .map(|path| (path, *data_type))
                    .map_err(|e| ConfigError::Invalid(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_config_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("engine.json");
        fs::write(
            &path,
            r#"{
                "memtable_flush_bytes": 1024,
                "spill_dir": "/tmp/spill",
                "metrics_addr": null,
                "series": {"d1.temperature": "DOUBLE", "d1.status": "TEXT"}
            }"#,
        )
        .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.memtable_flush_bytes, 1024);
        assert_eq!(config.spill_dir, PathBuf::from("/tmp/spill"));
        assert_eq!(config.metrics_addr, None);
        assert_eq!(config.max_text_spill_bytes, 256);
        assert_eq!(
            config.series_paths().unwrap(),
            vec![
                (SeriesPath::new("d1", "status"), DataType::Text),
                (SeriesPath::new("d1", "temperature"), DataType::Double),
            ]
        );
    }

    #[test]
    fn test_invalid_config() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("engine.json");

        fs::write(&path, "{not json").unwrap();
        assert!(matches!(EngineConfig::from_file(&path), Err(ConfigError::Json(_))));

        fs::write(&path, r#"{"external_sort_group_size": 1}"#).unwrap();
        assert!(matches!(EngineConfig::from_file(&path), Err(ConfigError::Invalid(_))));

        fs::write(&path, r#"{"series": {"nodot": "INT32"}}"#).unwrap();
        assert!(matches!(EngineConfig::from_file(&path), Err(ConfigError::Invalid(_))));

        assert!(matches!(
            EngineConfig::from_file(temp_dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
