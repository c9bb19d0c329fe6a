//! Disk-backed merge for wide fan-in queries.
//!
//! A group of merge readers is drained once, in merged order, into a spill
//! file of fixed-width records:
//!
//! ```text
//! timestamp i64 LE | type tag u8 | value payload padded to the type's width
//! ```
//!
//! The file is then replayed lazily through a [`SpillReader`]. Spill files
//! belong to the query that created them and are deleted when it ends.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::context::{QueryId, QueryResourceManager};
use super::merge::PriorityMergeReader;
use super::reader::PointReader;
use super::{QueryError, QueryResult};
use crate::metrics;
use crate::storage::data::{DataType, TimeValuePair, Value};

const TIMESTAMP_WIDTH: usize = 8;

/// Bytes of one record holding a `data_type` value
pub fn record_width(data_type: DataType, text_width: usize) -> usize {
    TIMESTAMP_WIDTH + 1 + data_type.fixed_width(text_width)
}

fn spill_error(e: impl Into<io::Error>) -> QueryError {
    QueryError::SpillIo(e.into())
}

/// Appends fixed-width records to a spill file
pub struct SpillWriter {
    writer: BufWriter<File>,
    data_type: DataType,
    text_width: usize,
    record: Vec<u8>,
    records: u64,
}

impl SpillWriter {
    pub fn create(path: &Path, data_type: DataType, text_width: usize) -> io::Result<Self> {
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            data_type,
            text_width,
            record: Vec::with_capacity(record_width(data_type, text_width)),
            records: 0,
        })
    }

    pub fn write(&mut self, point: &TimeValuePair) -> QueryResult<()> {
        if point.value().data_type() != self.data_type {
            return Err(spill_error(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} value in a {} spill",
                    point.value().data_type(),
                    self.data_type
                ),
            )));
        }
        self.record.clear();
        self.record.extend_from_slice(&point.timestamp().to_le_bytes());
        point
            .value()
            .encode_fixed(self.text_width, &mut self.record)
            .map_err(|e| spill_error(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        self.writer.write_all(&self.record).map_err(spill_error)?;
        self.records += 1;
        Ok(())
    }

    /// Flushes buffered records and returns how many were written
    pub fn finish(mut self) -> QueryResult<u64> {
        self.writer.flush().map_err(spill_error)?;
        Ok(self.records)
    }
}

/// Lazy point source over a spill file
pub struct SpillReader {
    reader: Option<BufReader<File>>,
    data_type: DataType,
    record: Vec<u8>,
    record_count: u64,
    position: u64,
}

impl SpillReader {
    pub fn open(path: &Path, data_type: DataType, text_width: usize) -> QueryResult<Self> {
        let file = File::open(path).map_err(spill_error)?;
        let width = record_width(data_type, text_width);
        let len = file.metadata().map_err(spill_error)?.len();
        if len % width as u64 != 0 {
            return Err(spill_error(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("spill file of {} bytes is not a multiple of {}", len, width),
            )));
        }
        Ok(Self {
            reader: Some(BufReader::new(file)),
            data_type,
            record: vec![0u8; width],
            record_count: len / width as u64,
            position: 0,
        })
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Positions the reader so the next point returned is record `index`
    pub fn seek_record(&mut self, index: u64) -> QueryResult<()> {
        let width = self.record.len() as u64;
        if let Some(reader) = &mut self.reader {
            reader
                .seek(SeekFrom::Start(index.min(self.record_count) * width))
                .map_err(spill_error)?;
        }
        self.position = index.min(self.record_count);
        Ok(())
    }
}

impl PointReader for SpillReader {
    fn next_point(&mut self) -> QueryResult<Option<TimeValuePair>> {
        let Some(reader) = &mut self.reader else {
            return Ok(None);
        };
        if self.position >= self.record_count {
            return Ok(None);
        }
        reader.read_exact(&mut self.record).map_err(spill_error)?;
        self.position += 1;

        let mut timestamp = [0u8; TIMESTAMP_WIDTH];
        timestamp.copy_from_slice(&self.record[..TIMESTAMP_WIDTH]);
        let value = Value::decode_fixed(&self.record[TIMESTAMP_WIDTH..])
            .map_err(|e| spill_error(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        if value.data_type() != self.data_type {
            return Err(spill_error(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} record in a {} spill", value.data_type(), self.data_type),
            )));
        }
        Ok(Some(TimeValuePair::new(i64::from_le_bytes(timestamp), value)))
    }

    fn close(&mut self) -> QueryResult<()> {
        self.reader = None;
        Ok(())
    }
}

/// Spills groups of merge readers of one query to disk
pub struct ExternalSortMerger {
    query: QueryId,
    spill_dir: PathBuf,
    text_width: usize,
    resources: Arc<QueryResourceManager>,
}

impl ExternalSortMerger {
    pub fn new(
        query: QueryId,
        spill_dir: impl Into<PathBuf>,
        text_width: usize,
        resources: Arc<QueryResourceManager>,
    ) -> Self {
        Self {
            query,
            spill_dir: spill_dir.into(),
            text_width,
            resources,
        }
    }

    fn spill_path(&self) -> PathBuf {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        self.spill_dir
            .join(format!("{}_{}_{}.spill", self.query, nanos, Uuid::new_v4()))
    }

    /// Drains `sources` into a spill file and returns a merge reader over it.
    ///
    /// Each source enters the spill merge at its own priority; the returned
    /// reader carries the priority of the first source so it can stand in for
    /// the group in an outer merge. On failure every source is closed and the
    /// partial file removed before the error is returned.
    pub fn merge(
        &self,
        data_type: DataType,
        sources: Vec<PriorityMergeReader>,
    ) -> QueryResult<PriorityMergeReader> {
        let priority = sources.first().map_or(0, PriorityMergeReader::priority);
        let path = self.spill_path();

        let mut writer = match SpillWriter::create(&path, data_type, self.text_width) {
            Ok(writer) => writer,
            Err(e) => {
                error!("Failed to create spill file {}: {}", path.display(), e);
                close_all(sources);
                return Err(QueryError::SpillIo(e));
            }
        };
        self.resources.register_temp_file(self.query, path.clone());

        let records = match drain_into(&mut writer, sources).and_then(|_| writer.finish()) {
            Ok(records) => records,
            Err(e) => {
                error!("Spill to {} failed: {}", path.display(), e);
                if let Err(remove) = fs::remove_file(&path) {
                    warn!("Failed to remove partial spill {}: {}", path.display(), remove);
                }
                return Err(e);
            }
        };

        let bytes = records * record_width(data_type, self.text_width) as u64;
        metrics::record_spill(bytes);
        debug!(
            "Spilled merge: query={}, file={}, records={}, bytes={}",
            self.query,
            path.display(),
            records,
            bytes
        );

        let reader = SpillReader::open(&path, data_type, self.text_width)?;
        let mut merged = PriorityMergeReader::with_priority(priority);
        merged.add_reader(Box::new(reader), priority)?;
        Ok(merged)
    }
}

fn close_all(sources: Vec<PriorityMergeReader>) {
    for mut source in sources {
        if let Err(e) = source.close() {
            warn!("Failed to close spill source: {}", e);
        }
    }
}

/// Merges `sources` and writes the result. Every source is closed on return.
fn drain_into(writer: &mut SpillWriter, sources: Vec<PriorityMergeReader>) -> QueryResult<()> {
    let mut merge = PriorityMergeReader::new();
    let mut pending = sources.into_iter();
    while let Some(source) = pending.next() {
        let priority = source.priority();
        if let Err(e) = merge.add_reader(Box::new(source), priority) {
            close_all(pending.collect());
            return Err(e);
        }
    }

    let result = (|| -> QueryResult<()> {
        while let Some(point) = merge.next_point()? {
            writer.write(&point)?;
        }
        Ok(())
    })();
    match result {
        Ok(()) => merge.close(),
        Err(e) => {
            if let Err(close) = merge.close() {
                warn!("Failed to close spill sources: {}", close);
            }
            Err(e)
        }
    }
}
