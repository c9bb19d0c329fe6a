//! In-memory write buffer.
//!
//! A [`MemTable`] maps every (device, measurement) pair it has seen to one
//! [`TvList`] drawn from the engine's [`TvListAllocator`], and keeps the range
//! deletions recorded against it. Readers never scan the live buffers: they
//! take a [`SnapshotChunk`] copy under the lock and read that instead.

pub mod allocator;
pub mod chunk;
pub mod modification;
pub mod tvlist;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::storage::data::{DataType, SeriesPath, Value};

pub use allocator::TvListAllocator;
pub use chunk::{SnapshotChunk, SnapshotReader};
pub use modification::{Deletion, ModificationLog};
pub use tvlist::TvList;

/// Error type for MemTable operations
#[derive(Debug, Error)]
pub enum MemTableError {
    #[error("Series {path} holds {expected} values, got {actual}")]
    SchemaMismatch {
        path: SeriesPath,
        expected: DataType,
        actual: DataType,
    },
    #[error("No {data_type} buffer available: {limit} buffers already in use")]
    ResourceExhausted { data_type: DataType, limit: usize },
    #[error("Row has {measurements} measurements, {types} types and {values} values")]
    LengthMismatch {
        measurements: usize,
        types: usize,
        values: usize,
    },
    #[error("MemTable {0} has been released")]
    Released(u64),
}

#[derive(Debug, Default)]
struct MemTableState {
    /// device -> measurement -> buffer
    series: HashMap<String, HashMap<String, TvList>>,
    modifications: ModificationLog,
    released: bool,
}

impl MemTableState {
    fn list(&self, device: &str, measurement: &str) -> Option<&TvList> {
        self.series.get(device)?.get(measurement)
    }
}

/// The write buffer of one storage interval
#[derive(Debug)]
pub struct MemTable {
    version: u64,
    allocator: Arc<TvListAllocator>,
    state: RwLock<MemTableState>,
    /// Estimated bytes of every row inserted so far
    mem_size: AtomicU64,
}

impl MemTable {
    /// Creates an empty MemTable. `version` orders it against sibling
    /// memtables: a higher version holds more recent writes.
    pub fn new(version: u64, allocator: Arc<TvListAllocator>) -> Self {
        Self {
            version,
            allocator,
            state: RwLock::new(MemTableState::default()),
            mem_size: AtomicU64::new(0),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Writes one row across several measurements of `device`.
    ///
    /// Every column is validated before anything is written, so a rejected
    /// row leaves the MemTable untouched.
    pub fn insert(
        &self,
        device: &str,
        measurements: &[String],
        types: &[DataType],
        timestamp: i64,
        values: Vec<Value>,
    ) -> Result<(), MemTableError> {
        if measurements.len() != types.len() || types.len() != values.len() {
            return Err(MemTableError::LengthMismatch {
                measurements: measurements.len(),
                types: types.len(),
                values: values.len(),
            });
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.released {
            return Err(MemTableError::Released(self.version));
        }

        // A measurement repeated within the row is held to its first declared type
        let mut row_types: HashMap<&str, DataType> = HashMap::with_capacity(measurements.len());
        for ((measurement, &declared), value) in measurements.iter().zip(types).zip(&values) {
            let existing = state.list(device, measurement).map(TvList::data_type);
            let expected = existing
                .or_else(|| row_types.get(measurement.as_str()).copied())
                .unwrap_or(declared);
            row_types.entry(measurement.as_str()).or_insert(expected);
            for actual in [declared, value.data_type()] {
                if actual != expected {
                    return Err(MemTableError::SchemaMismatch {
                        path: SeriesPath::new(device, measurement.as_str()),
                        expected,
                        actual,
                    });
                }
            }
        }

        // Allocate every missing buffer up front; hand them back if the pool runs dry
        let mut fresh: Vec<(&String, TvList)> = Vec::new();
        for (measurement, &data_type) in measurements.iter().zip(types) {
            let missing = state.list(device, measurement).is_none()
                && !fresh.iter().any(|(m, _)| *m == measurement);
            if !missing {
                continue;
            }
            match self.allocator.allocate(data_type) {
                Ok(list) => fresh.push((measurement, list)),
                Err(e) => {
                    for (_, list) in fresh {
                        self.allocator.release(list);
                    }
                    return Err(e);
                }
            }
        }
        let columns = state.series.entry(device.to_string()).or_default();
        for (measurement, list) in fresh {
            columns.insert(measurement.clone(), list);
        }

        let mut row_size = std::mem::size_of::<i64>();
        for (measurement, value) in measurements.iter().zip(values) {
            row_size += value.mem_size();
            if let Some(list) = columns.get_mut(measurement) {
                Self::write_column(list, device, measurement, timestamp, value)?;
            }
        }

        let total = self.mem_size.fetch_add(row_size as u64, Ordering::Relaxed) + row_size as u64;
        metrics::record_insert(measurements.len() as u64);
        metrics::update_memtable_bytes(total);
        debug!(
            "Inserted row into MemTable: device={}, timestamp={}, columns={}, mem_size={}",
            device,
            timestamp,
            measurements.len(),
            total
        );
        Ok(())
    }

    /// Writes a single point
    pub fn write(
        &self,
        device: &str,
        measurement: &str,
        data_type: DataType,
        timestamp: i64,
        value: Value,
    ) -> Result<(), MemTableError> {
        self.insert(
            device,
            &[measurement.to_string()],
            &[data_type],
            timestamp,
            vec![value],
        )
    }

    fn write_column(
        list: &mut TvList,
        device: &str,
        measurement: &str,
        timestamp: i64,
        value: Value,
    ) -> Result<(), MemTableError> {
        list.append(timestamp, value)
            .map_err(|rejected| MemTableError::SchemaMismatch {
                path: SeriesPath::new(device, measurement),
                expected: list.data_type(),
                actual: rejected.data_type(),
            })
    }

    /// Deletes every point of the series at or before `timestamp`
    pub fn delete(&self, device: &str, measurement: &str, timestamp: i64) {
        let path = SeriesPath::new(device, measurement);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.modifications.record(Deletion::new(path.clone(), timestamp));
        debug!(
            "Recorded deletion: series={}, up_to={}, memtable={}",
            path, timestamp, self.version
        );
    }

    /// Invalidates the points currently stored at exactly `timestamp`.
    /// Returns how many buffered entries were marked.
    pub fn delete_point(&self, device: &str, measurement: &str, timestamp: i64) -> usize {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state
            .series
            .get_mut(device)
            .and_then(|columns| columns.get_mut(measurement))
            .map_or(0, |list| list.delete(timestamp))
    }

    /// Takes a read snapshot of one series, or `None` if the series was never
    /// written to this MemTable.
    ///
    /// The lock is held only while copying the buffer and reading the
    /// deletion boundary; sorting happens on the private copy.
    pub fn query(
        &self,
        device: &str,
        measurement: &str,
        data_type: DataType,
    ) -> Result<Option<SnapshotChunk>, MemTableError> {
        let path = SeriesPath::new(device, measurement);
        let (list, deleted_up_to) = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if state.released {
                return Err(MemTableError::Released(self.version));
            }
            let Some(list) = state.list(device, measurement) else {
                return Ok(None);
            };
            if list.data_type() != data_type {
                return Err(MemTableError::SchemaMismatch {
                    path,
                    expected: list.data_type(),
                    actual: data_type,
                });
            }
            (list.clone(), state.modifications.deleted_up_to(&path))
        };
        Ok(Some(SnapshotChunk::new(path, list, deleted_up_to)))
    }

    /// Number of buffered entries across all series
    pub fn size(&self) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .series
            .values()
            .flat_map(HashMap::values)
            .map(TvList::len)
            .sum()
    }

    /// Estimated bytes written so far
    pub fn mem_size(&self) -> u64 {
        self.mem_size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn contains(&self, device: &str, measurement: &str) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.list(device, measurement).is_some()
    }

    /// Every series held, ordered by path
    pub fn series(&self) -> Vec<(SeriesPath, DataType)> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut series: Vec<_> = state
            .series
            .iter()
            .flat_map(|(device, columns)| {
                columns.iter().map(move |(measurement, list)| {
                    (
                        SeriesPath::new(device.as_str(), measurement.as_str()),
                        list.data_type(),
                    )
                })
            })
            .collect();
        series.sort();
        series
    }

    /// Number of range deletions recorded
    pub fn modification_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.modifications.len()
    }

    /// Returns every buffer to the allocator. Must be the last call made on a
    /// MemTable; later writes and queries fail with [`MemTableError::Released`].
    /// Calling it again is a no-op.
    pub fn release(&self) -> usize {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.released {
            return 0;
        }
        state.released = true;
        state.modifications.clear();

        let mut released = 0;
        for (_, columns) in state.series.drain() {
            for (_, list) in columns {
                self.allocator.release(list);
                released += 1;
            }
        }
        info!(
            "Released MemTable: version={}, buffers={}",
            self.version, released
        );
        released
    }

    pub fn is_released(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .released
    }
}

impl Drop for MemTable {
    fn drop(&mut self) {
        if !self.is_released() {
            warn!(
                "MemTable {} dropped without release, returning buffers",
                self.version
            );
            self.release();
        }
    }
}
