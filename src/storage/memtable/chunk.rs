use tracing::debug;

use super::tvlist::TvList;
use crate::query::reader::PointReader;
use crate::query::QueryResult;
use crate::storage::data::{DataType, SeriesPath, TimeValuePair};

/// Read view of one series taken when a query opens it.
///
/// Holds a private, already sorted copy of the series buffer together with
/// the deletion boundary seen at the same instant. Points at or before the
/// boundary are never yielded.
#[derive(Debug, Clone)]
pub struct SnapshotChunk {
    path: SeriesPath,
    list: TvList,
    deleted_up_to: Option<i64>,
}

impl SnapshotChunk {
    pub(crate) fn new(path: SeriesPath, mut list: TvList, deleted_up_to: Option<i64>) -> Self {
        list.sort();
        Self {
            path,
            list,
            deleted_up_to,
        }
    }

    pub fn path(&self) -> &SeriesPath {
        &self.path
    }

    pub fn data_type(&self) -> DataType {
        self.list.data_type()
    }

    /// Range deletion boundary applied to this snapshot
    pub fn deleted_up_to(&self) -> Option<i64> {
        self.deleted_up_to
    }

    /// First rank whose timestamp is past the deletion boundary
    fn first_live_rank(&self) -> usize {
        let len = self.list.sorted_len().unwrap_or(0);
        let Some(boundary) = self.deleted_up_to else {
            return 0;
        };
        let (mut lo, mut hi) = (0, len);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.list.sorted_timestamp(mid) {
                Some(ts) if ts <= boundary => lo = mid + 1,
                _ => hi = mid,
            }
        }
        lo
    }

    /// Number of points visible through this snapshot
    pub fn len(&self) -> usize {
        self.list.sorted_len().unwrap_or(0) - self.first_live_rank()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible points in ascending timestamp order
    pub fn iter(&self) -> impl Iterator<Item = TimeValuePair> + '_ {
        (self.first_live_rank()..).map_while(move |rank| self.list.sorted_point(rank))
    }

    pub fn into_reader(self) -> SnapshotReader {
        let rank = self.first_live_rank();
        debug!(
            "Opened snapshot reader: series={}, points={}, deleted_up_to={:?}",
            self.path,
            self.len(),
            self.deleted_up_to
        );
        SnapshotReader {
            chunk: Some(self),
            rank,
        }
    }
}

/// Point source over a [`SnapshotChunk`]
#[derive(Debug)]
pub struct SnapshotReader {
    chunk: Option<SnapshotChunk>,
    rank: usize,
}

impl PointReader for SnapshotReader {
    fn next_point(&mut self) -> QueryResult<Option<TimeValuePair>> {
        let Some(chunk) = &self.chunk else {
            return Ok(None);
        };
        let point = chunk.list.sorted_point(self.rank);
        if point.is_some() {
            self.rank += 1;
        }
        Ok(point)
    }

    fn close(&mut self) -> QueryResult<()> {
        self.chunk = None;
        Ok(())
    }
}
