use std::fs;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::metrics;
use crate::storage::memtable::{MemTable, MemTableError};
use crate::storage::sealed::{SealedChunk, SealedChunkError, SealedChunkStore};

/// Error type for flush operations
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error("Sealed chunk error: {0}")]
    SealedChunk(#[from] SealedChunkError),
    #[error("MemTable error: {0}")]
    MemTable(#[from] MemTableError),
}

/// Outcome of one flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    pub version: u64,
    pub series: usize,
    pub points: usize,
}

/// Seals memtables into chunk files
pub struct FlushManager {
    store: Arc<SealedChunkStore>,
}

impl FlushManager {
    pub fn new(store: Arc<SealedChunkStore>) -> Self {
        Self { store }
    }

    /// Writes the live contents of `memtable` to a new chunk carrying the
    /// memtable's version, publishes the chunk, then releases the memtable.
    ///
    /// On failure the partial chunk file is removed and the memtable is left
    /// untouched, so its data stays readable.
    pub fn flush(&self, memtable: &MemTable) -> Result<FlushStats, FlushError> {
        let started = Instant::now();
        let version = memtable.version();
        let series = memtable.series();
        if series.is_empty() {
            memtable.release();
            return Ok(FlushStats {
                version,
                series: 0,
                points: 0,
            });
        }

        let path = self.store.chunk_path(version);
        let mut chunk = SealedChunk::create(&path, version)?;
        let written = (|| -> Result<(usize, usize), FlushError> {
            let (mut written_series, mut points) = (0, 0);
            for (series_path, data_type) in &series {
                let Some(snapshot) =
                    memtable.query(series_path.device(), series_path.measurement(), *data_type)?
                else {
                    continue;
                };
                let live: Vec<_> = snapshot.iter().collect();
                if live.is_empty() {
                    continue;
                }
                chunk.write_series(series_path, *data_type, &live)?;
                written_series += 1;
                points += live.len();
            }
            chunk.sync()?;
            Ok((written_series, points))
        })();

        let (written_series, points) = match written {
            Ok(counts) => counts,
            Err(e) => {
                drop(chunk);
                if let Err(remove) = fs::remove_file(&path) {
                    warn!("Failed to remove partial chunk {}: {}", path.display(), remove);
                }
                return Err(e);
            }
        };

        self.store.add_chunk(chunk);
        memtable.release();

        metrics::record_flush(points as u64, started.elapsed().as_secs_f64() * 1000.0);
        info!(
            "Flushed MemTable: version={}, series={}, points={}, path={}",
            version,
            written_series,
            points,
            path.display()
        );
        Ok(FlushStats {
            version,
            series: written_series,
            points,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::reader::drain;
    use crate::storage::data::{DataType, SeriesPath, TimeValuePair, Value};
    use crate::storage::memtable::TvListAllocator;
    use crate::storage::sealed::ChunkStore;
    use tempfile::tempdir;

    #[test]
    fn test_flush_writes_live_points() {
        let temp_dir = tempdir().unwrap();
        let store = Arc::new(SealedChunkStore::open(temp_dir.path()).unwrap());
        let allocator = Arc::new(TvListAllocator::new(8, 16));
        let memtable = MemTable::new(5, Arc::clone(&allocator));

        memtable.write("d1", "s1", DataType::Int32, 3, Value::Int32(3)).unwrap();
        memtable.write("d1", "s1", DataType::Int32, 1, Value::Int32(1)).unwrap();
        memtable.write("d1", "s1", DataType::Int32, 1, Value::Int32(10)).unwrap();
        memtable.write("d1", "s2", DataType::Boolean, 1, Value::Boolean(true)).unwrap();
        memtable.delete("d1", "s2", 1);

        let stats = FlushManager::new(Arc::clone(&store)).flush(&memtable).unwrap();
        assert_eq!(
            stats,
            FlushStats {
                version: 5,
                series: 1,
                points: 2
            }
        );
        assert!(memtable.is_released());
        assert_eq!(allocator.outstanding(), 0);
        assert_eq!(store.max_version(), Some(5));

        let series = SeriesPath::new("d1", "s1");
        let mut reader = store.open_point_reader(&series, None).unwrap().unwrap();
        assert_eq!(
            drain(&mut reader),
            vec![
                TimeValuePair::new(1, Value::Int32(10)),
                TimeValuePair::new(3, Value::Int32(3)),
            ]
        );
        assert!(store
            .open_point_reader(&SeriesPath::new("d1", "s2"), None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_flush_empty_memtable() {
        let temp_dir = tempdir().unwrap();
        let store = Arc::new(SealedChunkStore::open(temp_dir.path()).unwrap());
        let memtable = MemTable::new(1, Arc::new(TvListAllocator::new(8, 16)));

        let stats = FlushManager::new(Arc::clone(&store)).flush(&memtable).unwrap();
        assert_eq!(stats.points, 0);
        assert_eq!(store.chunk_count(), 0);
        assert!(memtable.is_released());
    }

    #[test]
    fn test_failed_flush_keeps_memtable() {
        let temp_dir = tempdir().unwrap();
        let store = Arc::new(SealedChunkStore::open(temp_dir.path()).unwrap());
        let memtable = MemTable::new(2, Arc::new(TvListAllocator::new(8, 16)));
        memtable.write("d1", "s1", DataType::Int64, 1, Value::Int64(1)).unwrap();

        // a chunk file for this version already exists
        fs::write(store.chunk_path(2), b"taken").unwrap();
        assert!(FlushManager::new(Arc::clone(&store)).flush(&memtable).is_err());
        assert!(!memtable.is_released());
        assert!(memtable.contains("d1", "s1"));
    }
}
