use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::reader::PointReader;
use super::{QueryError, QueryResult};
use crate::storage::data::TimeValuePair;

pub type QueryId = u64;

/// A reader whose lifetime is tied to a query
pub type SharedReader = Arc<Mutex<dyn PointReader>>;

#[derive(Default)]
struct QueryResources {
    temp_files: Vec<PathBuf>,
    readers: Vec<SharedReader>,
}

/// Tracks what each running query holds open so that ending the query,
/// normally or not, releases it all.
pub struct QueryResourceManager {
    next_id: AtomicU64,
    queries: Mutex<HashMap<QueryId, QueryResources>>,
}

impl Default for QueryResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryResourceManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            queries: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin_query(&self) -> QueryId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, QueryResources::default());
        debug!("Began query {}", id);
        id
    }

    /// Registers a file to delete when the query ends
    pub fn register_temp_file(&self, query: QueryId, path: PathBuf) {
        let mut queries = self.queries.lock().unwrap_or_else(PoisonError::into_inner);
        match queries.get_mut(&query) {
            Some(resources) => resources.temp_files.push(path),
            None => {
                // the query already ended; nothing would clean this up later
                warn!("Temp file registered for ended query {}: {}", query, path.display());
                drop(queries);
                remove_file(&path);
            }
        }
    }

    /// Registers a reader to close when the query ends
    pub fn register_reader(&self, query: QueryId, reader: SharedReader) {
        let mut queries = self.queries.lock().unwrap_or_else(PoisonError::into_inner);
        match queries.get_mut(&query) {
            Some(resources) => resources.readers.push(reader),
            None => {
                drop(queries);
                if let Err(e) = close_shared(&reader) {
                    warn!("Failed to close reader of ended query {}: {}", query, e);
                }
            }
        }
    }

    /// Closes every reader and deletes every temp file of `query`. Cleanup
    /// continues past failures; the first one is returned. Ending an unknown
    /// query is a no-op.
    pub fn end_query(&self, query: QueryId) -> QueryResult<()> {
        let resources = self
            .queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&query);
        let Some(resources) = resources else {
            return Ok(());
        };

        let mut first_error = None;
        for reader in &resources.readers {
            if let Err(e) = close_shared(reader) {
                warn!("Failed to close reader of query {}: {}", query, e);
                first_error.get_or_insert(e);
            }
        }
        for path in &resources.temp_files {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to delete temp file {}: {}", path.display(), e);
                    first_error.get_or_insert(QueryError::Io(e));
                }
            }
        }
        info!(
            "Ended query {}: readers={}, temp_files={}",
            query,
            resources.readers.len(),
            resources.temp_files.len()
        );
        first_error.map_or(Ok(()), Err)
    }

    pub fn active_queries(&self) -> usize {
        self.queries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Temp files currently registered to `query`
    pub fn temp_files(&self, query: QueryId) -> Vec<PathBuf> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&query)
            .map(|r| r.temp_files.clone())
            .unwrap_or_default()
    }
}

fn close_shared(reader: &SharedReader) -> QueryResult<()> {
    reader.lock().unwrap_or_else(PoisonError::into_inner).close()
}

fn remove_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to delete temp file {}: {}", path.display(), e);
        }
    }
}

/// Point source handle shared with the resource manager: the query reads
/// through it while the manager can close it at query end
pub struct TrackedReader {
    inner: SharedReader,
}

impl TrackedReader {
    /// Registers `reader` with `query` and returns the handle to read from
    pub fn register<R>(manager: &QueryResourceManager, query: QueryId, reader: R) -> Self
    where
        R: PointReader + 'static,
    {
        let inner: SharedReader = Arc::new(Mutex::new(reader));
        manager.register_reader(query, Arc::clone(&inner));
        Self { inner }
    }
}

impl PointReader for TrackedReader {
    fn next_point(&mut self) -> QueryResult<Option<TimeValuePair>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_point()
    }

    fn close(&mut self) -> QueryResult<()> {
        close_shared(&self.inner)
    }
}
