//! Query module for the engine
//! Handles merging of point sources, value-filter evaluation, external sort and execution.

pub mod context;
pub mod executor;
pub mod external_sort;
pub mod filter;
pub mod merge;
pub mod reader;
pub mod timegen;

use std::io;
use thiserror::Error;

use crate::storage::data::{DataError, SeriesPath};
use crate::storage::memtable::MemTableError;
use crate::storage::schema::SchemaError;
use crate::storage::sealed::SealedChunkError;

pub use context::{QueryId, QueryResourceManager};
pub use executor::{QueryDataSet, QueryExecutor, QueryExpression, RowRecord};
pub use external_sort::ExternalSortMerger;
pub use filter::{CompareOp, FilterExpr, TimeFilter, ValueFilter};
pub use merge::PriorityMergeReader;
pub use reader::{PointReader, ReaderByTimestamp};
pub use timegen::TimeGenerator;

/// Error type for query operations
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Series not found: {0}")]
    SeriesNotFound(SeriesPath),
    #[error("Spill failed: {0}")]
    SpillIo(io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error("MemTable error: {0}")]
    MemTable(#[from] MemTableError),
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("Sealed chunk error: {0}")]
    SealedChunk(#[from] SealedChunkError),
    #[error("Two sources registered with priority {0}")]
    DuplicatePriority(u32),
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
}

/// Result type for query operations
pub type QueryResult<T> = Result<T, QueryError>;
