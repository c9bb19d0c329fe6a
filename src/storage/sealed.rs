//! Sealed chunk files written by flush.
//!
//! A chunk file starts with a header (magic, format version, chunk version)
//! followed by one block per series:
//!
//! ```text
//! device_len u32 | device | measurement_len u32 | measurement
//! type tag u8 | point_count u32 | start_timestamp i64
//! point_count x timestamp delta from start (i64)
//! point_count x tagged value
//! ```
//!
//! All integers are little endian. Chunks are immutable once written. Range
//! deletions recorded after the fact are appended to a sidecar file with the
//! same stem and a `.mods` extension, one record per deletion:
//!
//! ```text
//! device_len u32 | device | measurement_len u32 | measurement | up_to i64
//! ```
//!
//! Readers drop every point at or before the largest boundary of the series.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::query::filter::TimeFilter;
use crate::query::merge::PriorityMergeReader;
use crate::query::reader::{
    PointReader, ReaderByTimestamp, SeriesReaderByTimestamp, TimeFilteredReader, VecPointReader,
};
use crate::query::QueryResult;
use crate::storage::data::{DataError, DataType, SeriesPath, TimeValuePair, Value};

/// Magic number for chunk files
const CHUNK_MAGIC: u32 = 0x5343_484B; // "SCHK"
/// Current version of the chunk format
const CHUNK_FORMAT_VERSION: u32 = 1;
const CHUNK_EXTENSION: &str = "chunk";
const MODS_EXTENSION: &str = "mods";

#[derive(Debug, Error)]
pub enum SealedChunkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error("Invalid chunk magic number")]
    InvalidMagic,
    #[error("Unsupported chunk format version: {0}")]
    UnsupportedVersion(u32),
    #[error("Corrupt block at offset {offset}: {reason}")]
    CorruptBlock { offset: u64, reason: String },
    #[error("Series {0} written twice to one chunk")]
    DuplicateSeries(SeriesPath),
}

/// Location and summary of one series block
#[derive(Debug, Clone)]
pub struct BlockMetadata {
    pub offset: u64,
    pub len: u64,
    pub data_type: DataType,
    pub point_count: u32,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

/// One immutable chunk file
#[derive(Debug)]
pub struct SealedChunk {
    path: PathBuf,
    version: u64,
    file: Mutex<File>,
    blocks: HashMap<SeriesPath, BlockMetadata>,
    /// Largest deleted timestamp per series, recorded after the chunk was sealed
    deletions: RwLock<HashMap<SeriesPath, i64>>,
}

impl SealedChunk {
    /// File name of the chunk holding `version`
    pub fn file_name(version: u64) -> String {
        format!("{:020}.{}", version, CHUNK_EXTENSION)
    }

    /// Creates an empty chunk file at `path`
    pub fn create<P: AsRef<Path>>(path: P, version: u64) -> Result<Self, SealedChunkError> {
        let path = path.as_ref().to_path_buf();
        // a leftover sidecar would apply old deletions to new data
        match fs::remove_file(path.with_extension(MODS_EXTENSION)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        file.write_all(&CHUNK_MAGIC.to_le_bytes())?;
        file.write_all(&CHUNK_FORMAT_VERSION.to_le_bytes())?;
        file.write_all(&version.to_le_bytes())?;
        file.flush()?;

        Ok(Self {
            path,
            version,
            file: Mutex::new(file),
            blocks: HashMap::new(),
            deletions: RwLock::new(HashMap::new()),
        })
    }

    /// Opens an existing chunk and rebuilds its block index by walking the file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SealedChunkError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut cursor = ByteCursor::new(&bytes, 0);
        if cursor.u32()? != CHUNK_MAGIC {
            return Err(SealedChunkError::InvalidMagic);
        }
        let format = cursor.u32()?;
        if format != CHUNK_FORMAT_VERSION {
            return Err(SealedChunkError::UnsupportedVersion(format));
        }
        let version = cursor.u64()?;

        let mut blocks = HashMap::new();
        while !cursor.is_empty() {
            let offset = cursor.position();
            let (series, data_type, points) = decode_block(&mut cursor)?;
            blocks.insert(
                series,
                BlockMetadata {
                    offset,
                    len: cursor.position() - offset,
                    data_type,
                    point_count: points.len() as u32,
                    min_timestamp: points.first().map_or(0, TimeValuePair::timestamp),
                    max_timestamp: points.last().map_or(0, TimeValuePair::timestamp),
                },
            );
        }

        let deletions = load_deletions(&path.with_extension(MODS_EXTENSION))?;
        debug!(
            "Opened sealed chunk: path={}, version={}, series={}, deleted_series={}",
            path.display(),
            version,
            blocks.len(),
            deletions.len()
        );
        Ok(Self {
            path,
            version,
            file: Mutex::new(file),
            blocks,
            deletions: RwLock::new(deletions),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn contains(&self, series: &SeriesPath) -> bool {
        self.blocks.contains_key(series)
    }

    pub fn block(&self, series: &SeriesPath) -> Option<&BlockMetadata> {
        self.blocks.get(series)
    }

    pub fn series(&self) -> impl Iterator<Item = (&SeriesPath, DataType)> {
        self.blocks.iter().map(|(path, meta)| (path, meta.data_type))
    }

    /// Appends the block of one series. `points` must be sorted by timestamp
    /// without duplicates.
    pub fn write_series(
        &mut self,
        series: &SeriesPath,
        data_type: DataType,
        points: &[TimeValuePair],
    ) -> Result<(), SealedChunkError> {
        if self.blocks.contains_key(series) {
            return Err(SealedChunkError::DuplicateSeries(series.clone()));
        }
        let block = encode_block(series, data_type, points);

        let file = self.file.get_mut().unwrap_or_else(PoisonError::into_inner);
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(&block)?;
        file.flush()?;

        self.blocks.insert(
            series.clone(),
            BlockMetadata {
                offset,
                len: block.len() as u64,
                data_type,
                point_count: points.len() as u32,
                min_timestamp: points.first().map_or(0, TimeValuePair::timestamp),
                max_timestamp: points.last().map_or(0, TimeValuePair::timestamp),
            },
        );
        Ok(())
    }

    /// Flushes written blocks to stable storage
    pub fn sync(&self) -> Result<(), SealedChunkError> {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sync_all()?;
        Ok(())
    }

    /// Reads the points of one series, without applying deletions
    pub fn read_series(
        &self,
        series: &SeriesPath,
    ) -> Result<Option<Vec<TimeValuePair>>, SealedChunkError> {
        let Some(meta) = self.blocks.get(series) else {
            return Ok(None);
        };

        let mut bytes = vec![0u8; meta.len as usize];
        {
            let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
            file.seek(SeekFrom::Start(meta.offset))?;
            file.read_exact(&mut bytes)?;
        }

        let mut cursor = ByteCursor::new(&bytes, meta.offset);
        let (found, _, points) = decode_block(&mut cursor)?;
        if &found != series {
            return Err(SealedChunkError::CorruptBlock {
                offset: meta.offset,
                reason: format!("expected series {}, found {}", series, found),
            });
        }
        Ok(Some(points))
    }

    /// Path of the sidecar holding deletions recorded against this chunk
    pub fn mods_path(&self) -> PathBuf {
        self.path.with_extension(MODS_EXTENSION)
    }

    /// Records a range deletion against the sealed data of `series` and
    /// persists it to the sidecar before it takes effect
    pub fn delete(&self, series: &SeriesPath, timestamp: i64) -> Result<(), SealedChunkError> {
        if !self.contains(series) {
            return Ok(());
        }
        let mut deletions = self.deletions.write().unwrap_or_else(PoisonError::into_inner);
        if deletions.get(series).is_some_and(|&up_to| up_to >= timestamp) {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.mods_path())?;
        file.write_all(&encode_deletion(series, timestamp))?;
        file.sync_all()?;

        deletions.insert(series.clone(), timestamp);
        debug!(
            "Recorded sealed deletion: chunk={}, series={}, up_to={}",
            self.version, series, timestamp
        );
        Ok(())
    }

    /// Largest deleted timestamp of `series` in this chunk, if any
    pub fn deleted_up_to(&self, series: &SeriesPath) -> Option<i64> {
        self.deletions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(series)
            .copied()
    }

    /// Reads `series` and opens a point source over its live points
    pub fn open_reader(&self, series: &SeriesPath) -> Result<Option<VecPointReader>, SealedChunkError> {
        let deleted_up_to = self.deleted_up_to(series);
        Ok(self.read_series(series)?.map(|mut points| {
            if let Some(up_to) = deleted_up_to {
                points.retain(|p| p.timestamp() > up_to);
            }
            VecPointReader::new(points)
        }))
    }
}

fn encode_block(series: &SeriesPath, data_type: DataType, points: &[TimeValuePair]) -> Vec<u8> {
    let mut buf = Vec::new();
    for part in [series.device(), series.measurement()] {
        buf.extend_from_slice(&(part.len() as u32).to_le_bytes());
        buf.extend_from_slice(part.as_bytes());
    }
    buf.push(data_type.tag());
    buf.extend_from_slice(&(points.len() as u32).to_le_bytes());

    let start = points.first().map_or(0, TimeValuePair::timestamp);
    buf.extend_from_slice(&start.to_le_bytes());
    for point in points {
        buf.extend_from_slice(&point.timestamp().wrapping_sub(start).to_le_bytes());
    }
    for point in points {
        point.value().encode(&mut buf);
    }
    buf
}

fn decode_block(
    cursor: &mut ByteCursor<'_>,
) -> Result<(SeriesPath, DataType, Vec<TimeValuePair>), SealedChunkError> {
    let device = cursor.string()?;
    let measurement = cursor.string()?;
    let data_type = DataType::from_tag(cursor.u8()?)?;
    let count = cursor.u32()? as usize;
    let start = cursor.i64()?;

    let mut timestamps = Vec::with_capacity(count);
    for _ in 0..count {
        timestamps.push(start.wrapping_add(cursor.i64()?));
    }
    let mut points = Vec::with_capacity(count);
    for timestamp in timestamps {
        let value = cursor.value()?;
        if value.data_type() != data_type {
            return Err(cursor.corrupt(format!(
                "{} value in a {} block",
                value.data_type(),
                data_type
            )));
        }
        points.push(TimeValuePair::new(timestamp, value));
    }
    Ok((SeriesPath::new(device, measurement), data_type, points))
}

fn encode_deletion(series: &SeriesPath, timestamp: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    for part in [series.device(), series.measurement()] {
        buf.extend_from_slice(&(part.len() as u32).to_le_bytes());
        buf.extend_from_slice(part.as_bytes());
    }
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf
}

/// Reads the deletion sidecar at `path`, keeping the largest boundary per
/// series. A torn trailing record from an interrupted append is ignored.
fn load_deletions(path: &Path) -> Result<HashMap<SeriesPath, i64>, SealedChunkError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut deletions = HashMap::new();
    let mut cursor = ByteCursor::new(&bytes, 0);
    while !cursor.is_empty() {
        let offset = cursor.position();
        let record = (|| -> Result<(SeriesPath, i64), SealedChunkError> {
            let device = cursor.string()?;
            let measurement = cursor.string()?;
            Ok((SeriesPath::new(device, measurement), cursor.i64()?))
        })();
        match record {
            Ok((series, up_to)) => {
                let entry = deletions.entry(series).or_insert(up_to);
                *entry = (*entry).max(up_to);
            }
            Err(e) => {
                warn!(
                    "Ignoring unreadable deletion record: path={}, offset={}, error={}",
                    path.display(),
                    offset,
                    e
                );
                break;
            }
        }
    }
    Ok(deletions)
}

/// Bounds-checked little-endian reader over a byte slice
struct ByteCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// File offset of `bytes[0]`, for error reporting
    base: u64,
}

impl<'a> ByteCursor<'a> {
    fn new(bytes: &'a [u8], base: u64) -> Self {
        Self { bytes, pos: 0, base }
    }

    fn position(&self) -> u64 {
        self.base + self.pos as u64
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn corrupt(&self, reason: String) -> SealedChunkError {
        SealedChunkError::CorruptBlock {
            offset: self.position(),
            reason,
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SealedChunkError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(SealedChunkError::Data(DataError::Truncated))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], SealedChunkError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, SealedChunkError> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, SealedChunkError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, SealedChunkError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, SealedChunkError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String, SealedChunkError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| self.corrupt(e.to_string()))
    }

    fn value(&mut self) -> Result<Value, SealedChunkError> {
        let (value, used) = Value::decode(&self.bytes[self.pos..])?;
        self.pos += used;
        Ok(value)
    }
}

/// Read access to sealed series data
pub trait ChunkStore: Send + Sync {
    /// Opens a point source over every sealed point of `series` passing
    /// `filter`, or `None` when no chunk holds the series
    fn open_point_reader(
        &self,
        series: &SeriesPath,
        filter: Option<&TimeFilter>,
    ) -> QueryResult<Option<Box<dyn PointReader>>>;

    /// Opens a by-timestamp reader over the sealed points of `series`
    fn open_point_reader_by_timestamp(
        &self,
        series: &SeriesPath,
    ) -> QueryResult<Option<Box<dyn ReaderByTimestamp>>>;
}

/// The sealed chunks of one engine, kept in ascending version order
#[derive(Debug)]
pub struct SealedChunkStore {
    dir: PathBuf,
    chunks: RwLock<Vec<Arc<SealedChunk>>>,
}

impl SealedChunkStore {
    /// Opens the store rooted at `dir`, loading every chunk file found there
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, SealedChunkError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut chunks = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(CHUNK_EXTENSION) {
                chunks.push(Arc::new(SealedChunk::open(&path)?));
            }
        }
        chunks.sort_by_key(|c| c.version());

        info!(
            "Opened sealed chunk store: dir={}, chunks={}",
            dir.display(),
            chunks.len()
        );
        Ok(Self {
            dir,
            chunks: RwLock::new(chunks),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a new chunk of `version` should be created at
    pub fn chunk_path(&self, version: u64) -> PathBuf {
        self.dir.join(SealedChunk::file_name(version))
    }

    pub fn add_chunk(&self, chunk: SealedChunk) {
        let mut chunks = self.chunks.write().unwrap_or_else(PoisonError::into_inner);
        debug!(
            "Added sealed chunk: path={}, version={}, series={}",
            chunk.path().display(),
            chunk.version(),
            chunk.blocks.len()
        );
        chunks.push(Arc::new(chunk));
        chunks.sort_by_key(|c| c.version());
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Highest chunk version held, if any
    pub fn max_version(&self) -> Option<u64> {
        self.chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .map(|c| c.version())
    }

    /// Every series present in some chunk, ordered by path
    pub fn series(&self) -> Vec<(SeriesPath, DataType)> {
        let chunks = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = chunks
            .iter()
            .flat_map(|c| c.series().map(|(p, t)| (p.clone(), t)).collect::<Vec<_>>())
            .collect();
        all.sort();
        all.dedup();
        all
    }

    /// Applies a range deletion to every chunk sealed so far
    pub fn delete(&self, series: &SeriesPath, timestamp: i64) -> Result<(), SealedChunkError> {
        let chunks = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        for chunk in chunks.iter() {
            chunk.delete(series, timestamp)?;
        }
        Ok(())
    }

    fn chunks_for(&self, series: &SeriesPath) -> Vec<Arc<SealedChunk>> {
        self.chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.contains(series))
            .cloned()
            .collect()
    }

    fn merged_reader(&self, series: &SeriesPath) -> QueryResult<Option<PriorityMergeReader>> {
        let chunks = self.chunks_for(series);
        if chunks.is_empty() {
            return Ok(None);
        }
        let mut merge = PriorityMergeReader::new();
        // later chunks hold newer writes
        for (priority, chunk) in chunks.iter().enumerate() {
            if let Some(reader) = chunk.open_reader(series)? {
                merge.add_reader(Box::new(reader), priority as u32)?;
            }
        }
        Ok(Some(merge))
    }
}

impl ChunkStore for SealedChunkStore {
    fn open_point_reader(
        &self,
        series: &SeriesPath,
        filter: Option<&TimeFilter>,
    ) -> QueryResult<Option<Box<dyn PointReader>>> {
        Ok(self.merged_reader(series)?.map(|merge| match filter {
            Some(filter) => {
                Box::new(TimeFilteredReader::new(merge, filter.clone())) as Box<dyn PointReader>
            }
            None => Box::new(merge) as Box<dyn PointReader>,
        }))
    }

    fn open_point_reader_by_timestamp(
        &self,
        series: &SeriesPath,
    ) -> QueryResult<Option<Box<dyn ReaderByTimestamp>>> {
        Ok(self.merged_reader(series)?.map(|merge| {
            Box::new(SeriesReaderByTimestamp::new(merge)) as Box<dyn ReaderByTimestamp>
        }))
    }
}
