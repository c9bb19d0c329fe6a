use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tracing::{debug, warn};

use super::reader::PointReader;
use super::{QueryError, QueryResult};
use crate::storage::data::TimeValuePair;

/// Heap entry: the current head of one source
#[derive(Debug)]
struct HeapEntry {
    point: TimeValuePair,
    priority: u32,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap pops the greatest entry: earliest timestamp, then highest priority
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .point
            .timestamp()
            .cmp(&self.point.timestamp())
            .then(self.priority.cmp(&other.priority))
    }
}

struct Source {
    reader: Box<dyn PointReader>,
    priority: u32,
    open: bool,
}

/// K-way merge of point sources of one series.
///
/// Every source carries a distinct priority; when several sources hold a
/// point at the same timestamp only the one from the highest-priority source
/// is emitted. Output timestamps are strictly increasing.
pub struct PriorityMergeReader {
    /// Priority of the merged stream when it is itself fed into a merge
    priority: u32,
    sources: Vec<Source>,
    heap: BinaryHeap<HeapEntry>,
    closed: bool,
}

impl Default for PriorityMergeReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityMergeReader {
    pub fn new() -> Self {
        Self::with_priority(0)
    }

    pub fn with_priority(priority: u32) -> Self {
        Self {
            priority,
            sources: Vec::new(),
            heap: BinaryHeap::new(),
            closed: false,
        }
    }

    /// Builds a merge where a source's position in `readers` is its priority
    pub fn from_sources(readers: Vec<Box<dyn PointReader>>) -> QueryResult<Self> {
        let mut merge = Self::new();
        for (priority, reader) in readers.into_iter().enumerate() {
            merge.add_reader(reader, priority as u32)?;
        }
        Ok(merge)
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    /// Number of sources added, exhausted ones included
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Priorities of the sources, in insertion order
    pub fn source_priorities(&self) -> Vec<u32> {
        self.sources.iter().map(|s| s.priority).collect()
    }

    /// Adds a source. On failure the source and every source added before it
    /// are closed.
    pub fn add_reader(&mut self, mut reader: Box<dyn PointReader>, priority: u32) -> QueryResult<()> {
        if self.sources.iter().any(|s| s.priority == priority) {
            if let Err(e) = reader.close() {
                warn!("Failed to close rejected source: {}", e);
            }
            self.close_quietly();
            return Err(QueryError::DuplicatePriority(priority));
        }
        self.sources.push(Source {
            reader,
            priority,
            open: true,
        });
        let index = self.sources.len() - 1;
        if let Err(e) = self.advance(index) {
            self.close_quietly();
            return Err(e);
        }
        Ok(())
    }

    /// Pulls the next point of source `index` into the heap, closing the
    /// source once it is exhausted
    fn advance(&mut self, index: usize) -> QueryResult<()> {
        let source = &mut self.sources[index];
        if !source.open {
            return Ok(());
        }
        match source.reader.next_point()? {
            Some(point) => self.heap.push(HeapEntry {
                point,
                priority: source.priority,
                source: index,
            }),
            None => {
                source.open = false;
                source.reader.close()?;
            }
        }
        Ok(())
    }

    fn next_merged(&mut self) -> QueryResult<Option<TimeValuePair>> {
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        self.advance(top.source)?;

        while let Some(entry) = self.heap.peek() {
            if entry.point.timestamp() != top.point.timestamp() {
                break;
            }
            if let Some(shadowed) = self.heap.pop() {
                debug!(
                    "Dropped shadowed point: timestamp={}, priority={}, winner={}",
                    shadowed.point.timestamp(),
                    shadowed.priority,
                    top.priority
                );
                self.advance(shadowed.source)?;
            }
        }
        Ok(Some(top.point))
    }

    fn close_quietly(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close merge sources: {}", e);
        }
    }
}

impl PointReader for PriorityMergeReader {
    fn next_point(&mut self) -> QueryResult<Option<TimeValuePair>> {
        if self.closed {
            return Ok(None);
        }
        match self.next_merged() {
            Ok(point) => Ok(point),
            Err(e) => {
                self.close_quietly();
                Err(e)
            }
        }
    }

    /// Closes every source still open and reports the first failure
    fn close(&mut self) -> QueryResult<()> {
        self.closed = true;
        self.heap.clear();
        let mut first_error = None;
        for source in self.sources.iter_mut().filter(|s| s.open) {
            source.open = false;
            if let Err(e) = source.reader.close() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for PriorityMergeReader {
    fn drop(&mut self) {
        if !self.closed {
            self.close_quietly();
        }
    }
}
