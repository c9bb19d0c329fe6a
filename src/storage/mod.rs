//! Storage layer: write buffers, sealed chunks and the engine tying them together

pub mod data;
pub mod engine;
pub mod flush;
pub mod memtable;
pub mod schema;
pub mod sealed;

pub use data::{DataError, DataType, Decimal, SeriesPath, TimeValuePair, Value};
pub use engine::{EngineError, InsertRow, SeriesSources, StorageEngine};
pub use flush::{FlushError, FlushManager, FlushStats};
pub use memtable::{MemTable, MemTableError, SnapshotChunk, TvListAllocator};
pub use schema::{MemorySchemaCatalog, SchemaCatalog, SchemaError};
pub use sealed::{ChunkStore, SealedChunk, SealedChunkError, SealedChunkStore};
