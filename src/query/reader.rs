//! Point sources consumed by the merge layer.
//!
//! Every source of series data (memtable snapshots, sealed chunks, spill
//! files, nested merges) implements [`PointReader`]: a forward-only stream of
//! points in strictly ascending timestamp order.

use std::collections::VecDeque;

use super::filter::TimeFilter;
use super::QueryResult;
use crate::storage::data::{TimeValuePair, Value};

pub trait PointReader: Send {
    /// Returns the next point, or `None` once the source is exhausted
    fn next_point(&mut self) -> QueryResult<Option<TimeValuePair>>;

    /// Releases the resources behind this source. Must be idempotent and safe
    /// to call before the stream is drained.
    fn close(&mut self) -> QueryResult<()>;
}

impl<R: PointReader + ?Sized> PointReader for Box<R> {
    fn next_point(&mut self) -> QueryResult<Option<TimeValuePair>> {
        (**self).next_point()
    }

    fn close(&mut self) -> QueryResult<()> {
        (**self).close()
    }
}

/// Random access by timestamp over one series
pub trait ReaderByTimestamp: Send {
    /// Value stored at exactly `timestamp`. Successive calls must use
    /// non-decreasing timestamps.
    fn value_at(&mut self, timestamp: i64) -> QueryResult<Option<Value>>;

    fn close(&mut self) -> QueryResult<()>;
}

/// Points already materialized in memory, e.g. a decoded sealed block
#[derive(Debug, Default)]
pub struct VecPointReader {
    points: VecDeque<TimeValuePair>,
}

impl VecPointReader {
    /// `points` must be in strictly ascending timestamp order
    pub fn new(points: Vec<TimeValuePair>) -> Self {
        Self {
            points: points.into(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.points.len()
    }
}

impl PointReader for VecPointReader {
    fn next_point(&mut self) -> QueryResult<Option<TimeValuePair>> {
        Ok(self.points.pop_front())
    }

    fn close(&mut self) -> QueryResult<()> {
        self.points.clear();
        Ok(())
    }
}

/// Adds one point of lookahead to any reader
pub struct PeekableReader<R> {
    inner: R,
    peeked: Option<TimeValuePair>,
    exhausted: bool,
}

impl<R: PointReader> PeekableReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            peeked: None,
            exhausted: false,
        }
    }

    pub fn peek(&mut self) -> QueryResult<Option<&TimeValuePair>> {
        if self.peeked.is_none() && !self.exhausted {
            self.peeked = self.inner.next_point()?;
            self.exhausted = self.peeked.is_none();
        }
        Ok(self.peeked.as_ref())
    }

    pub fn has_next(&mut self) -> QueryResult<bool> {
        Ok(self.peek()?.is_some())
    }

    pub fn peek_timestamp(&mut self) -> QueryResult<Option<i64>> {
        Ok(self.peek()?.map(TimeValuePair::timestamp))
    }

    /// Skips every point before `timestamp` and returns the point at exactly
    /// `timestamp` without consuming it
    pub fn seek(&mut self, timestamp: i64) -> QueryResult<Option<&TimeValuePair>> {
        while let Some(ts) = self.peek_timestamp()? {
            if ts >= timestamp {
                break;
            }
            self.peeked = None;
        }
        Ok(self.peek()?.filter(|p| p.timestamp() == timestamp))
    }
}

impl<R: PointReader> PointReader for PeekableReader<R> {
    fn next_point(&mut self) -> QueryResult<Option<TimeValuePair>> {
        self.peek()?;
        Ok(self.peeked.take())
    }

    fn close(&mut self) -> QueryResult<()> {
        self.peeked = None;
        self.exhausted = true;
        self.inner.close()
    }
}

/// Drops points outside a time filter
pub struct TimeFilteredReader<R> {
    inner: R,
    filter: TimeFilter,
}

impl<R: PointReader> TimeFilteredReader<R> {
    pub fn new(inner: R, filter: TimeFilter) -> Self {
        Self { inner, filter }
    }
}

impl<R: PointReader> PointReader for TimeFilteredReader<R> {
    fn next_point(&mut self) -> QueryResult<Option<TimeValuePair>> {
        while let Some(point) = self.inner.next_point()? {
            if self.filter.satisfy(point.timestamp()) {
                return Ok(Some(point));
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> QueryResult<()> {
        self.inner.close()
    }
}

/// Answers timestamp lookups by walking a point stream forward
pub struct SeriesReaderByTimestamp<R> {
    inner: PeekableReader<R>,
}

impl<R: PointReader> SeriesReaderByTimestamp<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: PeekableReader::new(inner),
        }
    }
}

impl<R: PointReader> ReaderByTimestamp for SeriesReaderByTimestamp<R> {
    fn value_at(&mut self, timestamp: i64) -> QueryResult<Option<Value>> {
        Ok(self.inner.seek(timestamp)?.map(|p| p.value().clone()))
    }

    fn close(&mut self) -> QueryResult<()> {
        self.inner.close()
    }
}

#[cfg(test)]
pub(crate) fn int_points(pairs: &[(i64, i32)]) -> Vec<TimeValuePair> {
    pairs
        .iter()
        .map(|&(ts, v)| TimeValuePair::new(ts, Value::Int32(v)))
        .collect()
}

#[cfg(test)]
pub(crate) fn drain<R: PointReader + ?Sized>(reader: &mut R) -> Vec<TimeValuePair> {
    let mut points = Vec::new();
    while let Some(point) = reader.next_point().unwrap() {
        points.push(point);
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::filter::CompareOp;

    #[test]
    fn test_peekable_reader() {
        let mut reader = PeekableReader::new(VecPointReader::new(int_points(&[(1, 1), (2, 2)])));
        assert_eq!(reader.peek_timestamp().unwrap(), Some(1));
        assert_eq!(reader.peek_timestamp().unwrap(), Some(1));
        assert_eq!(reader.next_point().unwrap().unwrap().timestamp(), 1);
        assert!(reader.has_next().unwrap());
        assert_eq!(reader.next_point().unwrap().unwrap().timestamp(), 2);
        assert!(!reader.has_next().unwrap());
        assert!(reader.next_point().unwrap().is_none());
    }

    #[test]
    fn test_seek() {
        let mut reader =
            PeekableReader::new(VecPointReader::new(int_points(&[(1, 1), (3, 3), (5, 5)])));
        assert!(reader.seek(2).unwrap().is_none());
        assert_eq!(reader.peek_timestamp().unwrap(), Some(3));
        assert_eq!(reader.seek(3).unwrap().unwrap().value(), &Value::Int32(3));
        assert_eq!(reader.seek(5).unwrap().unwrap().timestamp(), 5);
        assert!(reader.seek(6).unwrap().is_none());
    }

    #[test]
    fn test_time_filtered_reader() {
        let source = VecPointReader::new(int_points(&[(1, 1), (2, 2), (3, 3), (4, 4)]));
        let mut reader = TimeFilteredReader::new(source, TimeFilter::Compare(CompareOp::GtEq, 3));
        let timestamps: Vec<i64> = drain(&mut reader).iter().map(|p| p.timestamp()).collect();
        assert_eq!(timestamps, vec![3, 4]);
    }

    #[test]
    fn test_reader_by_timestamp() {
        let source = VecPointReader::new(int_points(&[(10, 1), (20, 2), (30, 3)]));
        let mut reader = SeriesReaderByTimestamp::new(source);
        assert_eq!(reader.value_at(5).unwrap(), None);
        assert_eq!(reader.value_at(20).unwrap(), Some(Value::Int32(2)));
        assert_eq!(reader.value_at(20).unwrap(), Some(Value::Int32(2)));
        assert_eq!(reader.value_at(25).unwrap(), None);
        assert_eq!(reader.value_at(30).unwrap(), Some(Value::Int32(3)));
        assert_eq!(reader.value_at(40).unwrap(), None);
        reader.close().unwrap();
    }
}
