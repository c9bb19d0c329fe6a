use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::info;

use crate::storage::data::{DataType, SeriesPath};

/// Error type for schema lookups
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Path not found: {0}")]
    PathNotFound(SeriesPath),
    #[error("Series {path} already registered as {existing}")]
    AlreadyRegistered {
        path: SeriesPath,
        existing: DataType,
    },
}

/// Resolves the value kind of a series
pub trait SchemaCatalog: Send + Sync {
    fn resolve_series_type(&self, path: &SeriesPath) -> Result<DataType, SchemaError>;
}

/// In-process catalog backed by a map
#[derive(Debug, Default)]
pub struct MemorySchemaCatalog {
    series: RwLock<HashMap<SeriesPath, DataType>>,
}

impl MemorySchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a series. Re-registering with the same type is accepted.
    pub fn register(&self, path: SeriesPath, data_type: DataType) -> Result<(), SchemaError> {
        let mut series = self.series.write().unwrap_or_else(PoisonError::into_inner);
        match series.get(&path) {
            Some(&existing) if existing != data_type => {
                Err(SchemaError::AlreadyRegistered { path, existing })
            }
            Some(_) => Ok(()),
            None => {
                info!("Registered series: path={}, type={}", path, data_type);
                series.insert(path, data_type);
                Ok(())
            }
        }
    }

    /// All registered series, ordered by path
    pub fn all_series(&self) -> Vec<(SeriesPath, DataType)> {
        let series = self.series.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = series.iter().map(|(p, t)| (p.clone(), *t)).collect();
        all.sort();
        all
    }
}

impl SchemaCatalog for MemorySchemaCatalog {
    fn resolve_series_type(&self, path: &SeriesPath) -> Result<DataType, SchemaError> {
        self.series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .copied()
            .ok_or_else(|| SchemaError::PathNotFound(path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let catalog = MemorySchemaCatalog::new();
        let path = SeriesPath::new("root.sg.d1", "s1");
        catalog.register(path.clone(), DataType::Float).unwrap();
        catalog.register(path.clone(), DataType::Float).unwrap();

        assert_eq!(catalog.resolve_series_type(&path).unwrap(), DataType::Float);
        assert!(matches!(
            catalog.register(path.clone(), DataType::Int32),
            Err(SchemaError::AlreadyRegistered {
                existing: DataType::Float,
                ..
            })
        ));
        assert_eq!(catalog.all_series().len(), 1);
    }

    #[test]
    fn test_unknown_path() {
        let catalog = MemorySchemaCatalog::new();
        let result = catalog.resolve_series_type(&SeriesPath::new("d1", "s9"));
        assert!(matches!(result, Err(SchemaError::PathNotFound(_))));
    }
}
