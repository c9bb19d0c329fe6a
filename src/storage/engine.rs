use std::fs;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::metrics;
use crate::query::context::QueryResourceManager;
use crate::query::filter::TimeFilter;
use crate::query::merge::PriorityMergeReader;
use crate::query::reader::{PointReader, ReaderByTimestamp, SeriesReaderByTimestamp, TimeFilteredReader};
use crate::query::{QueryError, QueryResult};
use crate::storage::data::{DataType, SeriesPath, Value};
use crate::storage::flush::{FlushError, FlushManager, FlushStats};
use crate::storage::memtable::{MemTable, MemTableError, TvListAllocator};
use crate::storage::schema::{SchemaCatalog, SchemaError};
use crate::storage::sealed::{ChunkStore, SealedChunkError, SealedChunkStore};

/// Error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Series not found: {0}")]
    SeriesNotFound(SeriesPath),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("MemTable error: {0}")]
    MemTable(#[from] MemTableError),
    #[error("Schema error: {0}")]
    Schema(SchemaError),
    #[error("Sealed chunk error: {0}")]
    SealedChunk(#[from] SealedChunkError),
    #[error("Flush error: {0}")]
    Flush(#[from] FlushError),
}

impl From<SchemaError> for EngineError {
    fn from(e: SchemaError) -> Self {
        match e {
            SchemaError::PathNotFound(path) => EngineError::SeriesNotFound(path),
            other => EngineError::Schema(other),
        }
    }
}

/// One row arriving from the ingestion path
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRow {
    pub device: String,
    pub timestamp: i64,
    pub measurements: Vec<String>,
    pub values: Vec<Value>,
}

/// The point sources of one series, each with its merge priority
pub struct SeriesSources {
    pub data_type: DataType,
    pub readers: Vec<(Box<dyn PointReader>, u32)>,
}

impl SeriesSources {
    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Merges every source into one reader
    pub fn into_merge(self) -> QueryResult<PriorityMergeReader> {
        let mut merge = PriorityMergeReader::new();
        for (reader, priority) in self.readers {
            merge.add_reader(reader, priority)?;
        }
        Ok(merge)
    }
}

/// Process-wide storage context: the write buffers, the sealed data and the
/// shared resources queries draw on
pub struct StorageEngine {
    config: EngineConfig,
    allocator: Arc<TvListAllocator>,
    schema: Arc<dyn SchemaCatalog>,
    working: RwLock<Arc<MemTable>>,
    /// Memtables detached from writes and not yet sealed, oldest first
    flushing: RwLock<Vec<Arc<MemTable>>>,
    store: Arc<SealedChunkStore>,
    flusher: FlushManager,
    resources: Arc<QueryResourceManager>,
    next_version: AtomicU64,
    flush_lock: Mutex<()>,
}

impl StorageEngine {
    pub fn open(config: EngineConfig, schema: Arc<dyn SchemaCatalog>) -> Result<Self, EngineError> {
        fs::create_dir_all(&config.spill_dir)?;
        let store = Arc::new(SealedChunkStore::open(&config.data_dir)?);
        let allocator = Arc::new(TvListAllocator::new(
            config.tvlist_initial_capacity,
            config.max_tvlists,
        ));

        let first_version = store.max_version().map_or(1, |v| v + 1);
        let working = Arc::new(MemTable::new(first_version, Arc::clone(&allocator)));
        info!(
            "Opened storage engine: data_dir={}, spill_dir={}, memtable_version={}",
            config.data_dir.display(),
            config.spill_dir.display(),
            first_version
        );

        Ok(Self {
            flusher: FlushManager::new(Arc::clone(&store)),
            config,
            allocator,
            schema,
            working: RwLock::new(working),
            flushing: RwLock::new(Vec::new()),
            store,
            resources: Arc::new(QueryResourceManager::new()),
            next_version: AtomicU64::new(first_version + 1),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<TvListAllocator> {
        &self.allocator
    }

    pub fn store(&self) -> &Arc<SealedChunkStore> {
        &self.store
    }

    pub fn resources(&self) -> &Arc<QueryResourceManager> {
        &self.resources
    }

    pub fn resolve_series_type(&self, path: &SeriesPath) -> Result<DataType, SchemaError> {
        self.schema.resolve_series_type(path)
    }

    fn working(&self) -> Arc<MemTable> {
        Arc::clone(&self.working.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Estimated bytes held by the working memtable
    pub fn working_mem_size(&self) -> u64 {
        self.working().mem_size()
    }

    /// Writes one row. Every measurement must be known to the schema catalog
    /// and every value must match its declared type.
    pub fn insert(&self, row: InsertRow) -> Result<(), EngineError> {
        let mut types = Vec::with_capacity(row.measurements.len());
        for (measurement, value) in row.measurements.iter().zip(&row.values) {
            let path = SeriesPath::new(row.device.as_str(), measurement.as_str());
            let data_type = self.schema.resolve_series_type(&path)?;
            if value.data_type() != data_type {
                return Err(MemTableError::SchemaMismatch {
                    path,
                    expected: data_type,
                    actual: value.data_type(),
                }
                .into());
            }
            types.push(data_type);
        }

        let mem_size = {
            // held across the insert so a concurrent flush cannot release the target
            let working = self.working.read().unwrap_or_else(PoisonError::into_inner);
            working.insert(
                &row.device,
                &row.measurements,
                &types,
                row.timestamp,
                row.values,
            )?;
            working.mem_size()
        };

        if mem_size >= self.config.memtable_flush_bytes {
            debug!(
                "Working MemTable reached {} bytes, flushing",
                mem_size
            );
            self.flush()?;
        }
        Ok(())
    }

    /// Deletes every point of `path` at or before `timestamp`, in buffered
    /// and sealed data alike
    pub fn delete(&self, path: &SeriesPath, timestamp: i64) -> Result<(), EngineError> {
        self.schema.resolve_series_type(path)?;
        let _flush = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.store.delete(path, timestamp)?;
        self.working()
            .delete(path.device(), path.measurement(), timestamp);
        for memtable in self.flushing.read().unwrap_or_else(PoisonError::into_inner).iter() {
            memtable.delete(path.device(), path.measurement(), timestamp);
        }
        info!("Deleted series data: series={}, up_to={}", path, timestamp);
        Ok(())
    }

    /// Detaches the working memtable and seals it, together with any memtable
    /// an earlier failed flush left behind. Returns the stats of the flushes
    /// that ran.
    pub fn flush(&self) -> Result<Vec<FlushStats>, EngineError> {
        let _flush = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);

        {
            let mut working = self.working.write().unwrap_or_else(PoisonError::into_inner);
            if !working.is_empty() {
                let version = self.next_version.fetch_add(1, Ordering::SeqCst);
                let fresh = Arc::new(MemTable::new(version, Arc::clone(&self.allocator)));
                let detached = std::mem::replace(&mut *working, fresh);
                self.flushing
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(detached);
            }
        }

        let pending: Vec<Arc<MemTable>> = self
            .flushing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut stats = Vec::with_capacity(pending.len());
        for memtable in pending {
            stats.push(self.flusher.flush(&memtable)?);
            self.flushing
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|m| m.version() != memtable.version());
        }
        metrics::update_memtable_bytes(self.working_mem_size());
        Ok(stats)
    }

    /// Every series holding buffered or sealed data, ordered by path
    pub fn known_series(&self) -> Vec<(SeriesPath, DataType)> {
        let mut series = self.store.series();
        for memtable in self.memtables() {
            series.extend(memtable.series());
        }
        series.sort();
        series.dedup();
        series
    }

    /// Flushing memtables followed by the working one, in ascending version
    fn memtables(&self) -> Vec<Arc<MemTable>> {
        let working = self.working.read().unwrap_or_else(PoisonError::into_inner);
        let mut memtables = self
            .flushing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        memtables.push(Arc::clone(&working));
        memtables
    }

    /// Opens every source of `path` for a query.
    ///
    /// Sealed data enters at priority 0 and memtables follow in version order,
    /// so newer writes win. Memtables are snapshotted before the store is
    /// opened: a memtable released by a concurrent flush is skipped because
    /// its chunk is already visible to the store.
    pub fn open_series_sources(
        &self,
        path: &SeriesPath,
        filter: Option<&TimeFilter>,
    ) -> QueryResult<SeriesSources> {
        let data_type = self.resolve_series_type(path).map_err(|e| match e {
            SchemaError::PathNotFound(path) => QueryError::SeriesNotFound(path),
            other => QueryError::Schema(other),
        })?;

        let mut snapshots = Vec::new();
        for memtable in self.memtables() {
            match memtable.query(path.device(), path.measurement(), data_type) {
                Ok(Some(chunk)) => snapshots.push(chunk),
                Ok(None) | Err(MemTableError::Released(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut readers: Vec<(Box<dyn PointReader>, u32)> = Vec::new();
        if let Some(sealed) = self.store.open_point_reader(path, filter)? {
            readers.push((sealed, 0));
        }
        for (index, chunk) in snapshots.into_iter().enumerate() {
            let reader = chunk.into_reader();
            let reader: Box<dyn PointReader> = match filter {
                Some(filter) => Box::new(TimeFilteredReader::new(reader, filter.clone())),
                None => Box::new(reader),
            };
            readers.push((reader, index as u32 + 1));
        }
        debug!("Opened series sources: series={}, sources={}", path, readers.len());
        Ok(SeriesSources { data_type, readers })
    }

    /// Opens a by-timestamp reader over all data of `path`
    pub fn open_reader_by_timestamp(&self, path: &SeriesPath) -> QueryResult<Box<dyn ReaderByTimestamp>> {
        let sources = self.open_series_sources(path, None)?;
        let only_sealed = sources.len() == 1 && sources.readers[0].1 == 0;
        if only_sealed {
            let mut sources = sources;
            for (mut reader, _) in sources.readers.drain(..) {
                reader.close()?;
            }
            if let Some(reader) = self.store.open_point_reader_by_timestamp(path)? {
                return Ok(reader);
            }
            return Ok(Box::new(SeriesReaderByTimestamp::new(PriorityMergeReader::new())));
        }
        Ok(Box::new(SeriesReaderByTimestamp::new(sources.into_merge()?)))
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        for memtable in self.memtables() {
            if !memtable.is_empty() {
                info!(
                    "Discarding unflushed MemTable: version={}, points={}",
                    memtable.version(),
                    memtable.size()
                );
            }
            memtable.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::reader::drain;
    use crate::storage::data::TimeValuePair;
    use crate::storage::schema::MemorySchemaCatalog;
    use tempfile::{tempdir, TempDir};

    fn engine(flush_bytes: u64) -> (TempDir, Arc<MemorySchemaCatalog>, StorageEngine) {
        let temp_dir = tempdir().unwrap();
        let config = EngineConfig {
            memtable_flush_bytes: flush_bytes,
            spill_dir: temp_dir.path().join("spill"),
            data_dir: temp_dir.path().join("chunks"),
            metrics_addr: None,
            ..EngineConfig::default()
        };
        let schema = Arc::new(MemorySchemaCatalog::new());
        schema.register(SeriesPath::new("d1", "s1"), DataType::Int64).unwrap();
        schema.register(SeriesPath::new("d1", "s2"), DataType::Text).unwrap();
        let engine = StorageEngine::open(config, schema.clone()).unwrap();
        (temp_dir, schema, engine)
    }

    fn row(timestamp: i64, value: i64) -> InsertRow {
        InsertRow {
            device: "d1".into(),
            timestamp,
            measurements: vec!["s1".into()],
            values: vec![Value::Int64(value)],
        }
    }

    fn read(engine: &StorageEngine, path: &SeriesPath) -> Vec<(i64, i64)> {
        let mut merge = engine.open_series_sources(path, None).unwrap().into_merge().unwrap();
        drain(&mut merge)
            .into_iter()
            .map(|p| match p.value() {
                Value::Int64(v) => (p.timestamp(), *v),
                other => panic!("unexpected value {other}"),
            })
            .collect()
    }

    #[test]
    fn test_insert_validates_schema() {
        let (_dir, _schema, engine) = engine(u64::MAX);
        let unknown = InsertRow {
            device: "d9".into(),
            timestamp: 1,
            measurements: vec!["s1".into()],
            values: vec![Value::Int64(1)],
        };
        assert!(matches!(engine.insert(unknown), Err(EngineError::SeriesNotFound(_))));

        let wrong_kind = InsertRow {
            values: vec![Value::Int32(1)],
            ..row(1, 1)
        };
        assert!(matches!(
            engine.insert(wrong_kind),
            Err(EngineError::MemTable(MemTableError::SchemaMismatch { .. }))
        ));
    }

    #[test]
    fn test_newer_data_wins_across_flushes() {
        let (_dir, _schema, engine) = engine(u64::MAX);
        let path = SeriesPath::new("d1", "s1");
        engine.insert(row(1, 10)).unwrap();
        engine.insert(row(2, 20)).unwrap();
        assert_eq!(engine.flush().unwrap().len(), 1);

        engine.insert(row(2, 21)).unwrap();
        engine.insert(row(3, 30)).unwrap();
        engine.flush().unwrap();

        engine.insert(row(3, 31)).unwrap();
        assert_eq!(engine.store().chunk_count(), 2);
        assert_eq!(read(&engine, &path), vec![(1, 10), (2, 21), (3, 31)]);
    }

    #[test]
    fn test_auto_flush_on_threshold() {
        let (_dir, _schema, engine) = engine(64);
        for ts in 0..10 {
            engine.insert(row(ts, ts)).unwrap();
        }
        assert!(engine.store().chunk_count() >= 1);
        assert!(engine.working_mem_size() < 64);
        assert_eq!(read(&engine, &SeriesPath::new("d1", "s1")).len(), 10);
    }

    #[test]
    fn test_delete_reaches_all_layers() {
        let (_dir, _schema, engine) = engine(u64::MAX);
        let path = SeriesPath::new("d1", "s1");
        engine.insert(row(1, 1)).unwrap();
        engine.insert(row(2, 2)).unwrap();
        engine.flush().unwrap();
        engine.insert(row(3, 3)).unwrap();
        engine.insert(row(4, 4)).unwrap();

        engine.delete(&path, 3).unwrap();
        assert_eq!(read(&engine, &path), vec![(4, 4)]);

        // the memtable that recorded the deletion keeps hiding rewrites below it
        engine.insert(row(1, 100)).unwrap();
        assert_eq!(read(&engine, &path), vec![(4, 4)]);

        // a fresh memtable does not
        engine.flush().unwrap();
        engine.insert(row(2, 200)).unwrap();
        assert_eq!(read(&engine, &path), vec![(2, 200), (4, 4)]);

        assert!(matches!(
            engine.delete(&SeriesPath::new("d1", "nope"), 1),
            Err(EngineError::SeriesNotFound(_))
        ));
    }

    #[test]
    fn test_reopen_keeps_sealed_data() {
        let temp_dir = tempdir().unwrap();
        let config = EngineConfig {
            spill_dir: temp_dir.path().join("spill"),
            data_dir: temp_dir.path().join("chunks"),
            ..EngineConfig::default()
        };
        let schema = Arc::new(MemorySchemaCatalog::new());
        schema.register(SeriesPath::new("d1", "s1"), DataType::Int64).unwrap();
        {
            let engine = StorageEngine::open(config.clone(), schema.clone()).unwrap();
            engine.insert(row(5, 5)).unwrap();
            engine.flush().unwrap();
        }
        let engine = StorageEngine::open(config, schema).unwrap();
        assert_eq!(read(&engine, &SeriesPath::new("d1", "s1")), vec![(5, 5)]);
        engine.insert(row(5, 6)).unwrap();
        engine.flush().unwrap();
        assert_eq!(engine.store().chunk_count(), 2);
        assert_eq!(read(&engine, &SeriesPath::new("d1", "s1")), vec![(5, 6)]);
    }

    #[test]
    fn test_sealed_deletion_survives_reopen() {
        let temp_dir = tempdir().unwrap();
        let config = EngineConfig {
            spill_dir: temp_dir.path().join("spill"),
            data_dir: temp_dir.path().join("chunks"),
            ..EngineConfig::default()
        };
        let schema = Arc::new(MemorySchemaCatalog::new());
        let path = SeriesPath::new("d1", "s1");
        schema.register(path.clone(), DataType::Int64).unwrap();
        {
            let engine = StorageEngine::open(config.clone(), schema.clone()).unwrap();
            engine.insert(row(1, 1)).unwrap();
            engine.insert(row(2, 2)).unwrap();
            engine.flush().unwrap();
            engine.delete(&path, 1).unwrap();
            assert_eq!(read(&engine, &path), vec![(2, 2)]);
        }
        let engine = StorageEngine::open(config, schema).unwrap();
        assert_eq!(read(&engine, &path), vec![(2, 2)]);
    }

    #[test]
    fn test_reader_by_timestamp() {
        let (_dir, _schema, engine) = engine(u64::MAX);
        let path = SeriesPath::new("d1", "s1");
        engine.insert(row(1, 1)).unwrap();
        engine.insert(row(5, 5)).unwrap();
        engine.flush().unwrap();

        let mut sealed_only = engine.open_reader_by_timestamp(&path).unwrap();
        assert_eq!(sealed_only.value_at(5).unwrap(), Some(Value::Int64(5)));

        engine.insert(row(3, 3)).unwrap();
        let mut mixed = engine.open_reader_by_timestamp(&path).unwrap();
        assert_eq!(mixed.value_at(1).unwrap(), Some(Value::Int64(1)));
        assert_eq!(mixed.value_at(2).unwrap(), None);
        assert_eq!(mixed.value_at(3).unwrap(), Some(Value::Int64(3)));
        mixed.close().unwrap();

        let mut empty = engine
            .open_reader_by_timestamp(&SeriesPath::new("d1", "s2"))
            .unwrap();
        assert_eq!(empty.value_at(1).unwrap(), None);
    }

    #[test]
    fn test_known_series() {
        let (_dir, _schema, engine) = engine(u64::MAX);
        engine.insert(row(1, 1)).unwrap();
        engine.flush().unwrap();
        engine
            .insert(InsertRow {
                device: "d1".into(),
                timestamp: 1,
                measurements: vec!["s1".into(), "s2".into()],
                values: vec![Value::Int64(2), Value::Text("x".into())],
            })
            .unwrap();
        assert_eq!(
            engine.known_series(),
            vec![
                (SeriesPath::new("d1", "s1"), DataType::Int64),
                (SeriesPath::new("d1", "s2"), DataType::Text),
            ]
        );
        let points: Vec<TimeValuePair> = {
            let mut merge = engine
                .open_series_sources(&SeriesPath::new("d1", "s2"), None)
                .unwrap()
                .into_merge()
                .unwrap();
            drain(&mut merge)
        };
        assert_eq!(points, vec![TimeValuePair::new(1, Value::Text("x".into()))]);
    }
}
