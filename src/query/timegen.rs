use tracing::{debug, warn};

use super::filter::{FilterExpr, SeriesFilter, TimeFilter};
use super::reader::{PeekableReader, PointReader};
use super::{QueryError, QueryResult};
use crate::storage::data::SeriesPath;

/// Filter tree with series leaves replaced by leaf indices
#[derive(Debug)]
enum Node {
    Leaf(usize),
    Time(TimeFilter),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
}

struct Leaf {
    filter: SeriesFilter,
    reader: PeekableReader<Box<dyn PointReader>>,
}

/// Produces, in ascending order, the timestamps at which a filter
/// expression holds.
///
/// Candidate timestamps are the points of the series leaves: each pass takes
/// the smallest head among the leaf readers, evaluates the tree against the
/// values the leaves hold at exactly that timestamp (a leaf without a point
/// there is false), then moves every leaf past it.
pub struct TimeGenerator {
    root: Node,
    leaves: Vec<Leaf>,
    next: Option<i64>,
    closed: bool,
}

impl TimeGenerator {
    /// Builds a generator, opening one reader per series leaf through `open`
    pub fn new<F>(expr: &FilterExpr, mut open: F) -> QueryResult<Self>
    where
        F: FnMut(&SeriesPath) -> QueryResult<Box<dyn PointReader>>,
    {
        let mut leaves = Vec::new();
        let root = match build(expr, &mut leaves, &mut open) {
            Ok(root) => root,
            Err(e) => {
                close_leaves(&mut leaves);
                return Err(e);
            }
        };
        if leaves.is_empty() {
            return Err(QueryError::InvalidFilter(
                "expression has no series predicate".to_string(),
            ));
        }
        debug!("Built time generator: leaves={}", leaves.len());
        Ok(Self {
            root,
            leaves,
            next: None,
            closed: false,
        })
    }

    pub fn has_next(&mut self) -> QueryResult<bool> {
        if self.next.is_none() && !self.closed {
            self.next = self.guard(Self::find_next)?;
        }
        Ok(self.next.is_some())
    }

    /// The next qualifying timestamp, or `None` when no more exist
    pub fn next_timestamp(&mut self) -> QueryResult<Option<i64>> {
        self.has_next()?;
        Ok(self.next.take())
    }

    /// Closes the leaf readers, reporting the first failure
    pub fn close(&mut self) -> QueryResult<()> {
        self.closed = true;
        self.next = None;
        let mut first_error = None;
        for leaf in &mut self.leaves {
            if let Err(e) = leaf.reader.close() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Runs `step`, closing the generator if it fails
    fn guard<T>(&mut self, step: fn(&mut Self) -> QueryResult<T>) -> QueryResult<T> {
        step(self).inspect_err(|_| {
            if let Err(e) = self.close() {
                warn!("Failed to close time generator: {}", e);
            }
        })
    }

    fn find_next(&mut self) -> QueryResult<Option<i64>> {
        loop {
            let mut candidate: Option<i64> = None;
            for leaf in &mut self.leaves {
                if let Some(ts) = leaf.reader.peek_timestamp()? {
                    candidate = Some(candidate.map_or(ts, |c| c.min(ts)));
                }
            }
            let Some(timestamp) = candidate else {
                return Ok(None);
            };

            let mut verdicts = vec![None; self.leaves.len()];
            let matched = evaluate(&self.root, &mut self.leaves, &mut verdicts, timestamp)?;

            for leaf in &mut self.leaves {
                while leaf.reader.peek_timestamp()?.is_some_and(|ts| ts <= timestamp) {
                    leaf.reader.next_point()?;
                }
            }
            if matched {
                return Ok(Some(timestamp));
            }
        }
    }
}

impl Drop for TimeGenerator {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!("Failed to close time generator: {}", e);
            }
        }
    }
}

fn build<F>(expr: &FilterExpr, leaves: &mut Vec<Leaf>, open: &mut F) -> QueryResult<Node>
where
    F: FnMut(&SeriesPath) -> QueryResult<Box<dyn PointReader>>,
{
    Ok(match expr {
        FilterExpr::Series(filter) => {
            let reader = open(&filter.path)?;
            leaves.push(Leaf {
                filter: filter.clone(),
                reader: PeekableReader::new(reader),
            });
            Node::Leaf(leaves.len() - 1)
        }
        FilterExpr::GlobalTime(filter) => Node::Time(filter.clone()),
        FilterExpr::And(left, right) => Node::And(
            Box::new(build(left, leaves, open)?),
            Box::new(build(right, leaves, open)?),
        ),
        FilterExpr::Or(left, right) => Node::Or(
            Box::new(build(left, leaves, open)?),
            Box::new(build(right, leaves, open)?),
        ),
        FilterExpr::Not(inner) => Node::Not(Box::new(build(inner, leaves, open)?)),
    })
}

fn close_leaves(leaves: &mut [Leaf]) {
    for leaf in leaves {
        if let Err(e) = leaf.reader.close() {
            warn!("Failed to close filter reader: {}", e);
        }
    }
}

/// Evaluates `node` at `timestamp`. Each leaf is read at most once per pass;
/// AND and OR stop at the first operand that decides them.
fn evaluate(
    node: &Node,
    leaves: &mut [Leaf],
    verdicts: &mut [Option<bool>],
    timestamp: i64,
) -> QueryResult<bool> {
    match node {
        Node::Leaf(index) => {
            if let Some(verdict) = verdicts[*index] {
                return Ok(verdict);
            }
            let leaf = &mut leaves[*index];
            let verdict = match leaf.reader.peek()? {
                Some(point) if point.timestamp() == timestamp => {
                    leaf.filter.satisfy(timestamp, point.value())
                }
                _ => false,
            };
            verdicts[*index] = Some(verdict);
            Ok(verdict)
        }
        Node::Time(filter) => Ok(filter.satisfy(timestamp)),
        Node::And(left, right) => Ok(evaluate(left, leaves, verdicts, timestamp)?
            && evaluate(right, leaves, verdicts, timestamp)?),
        Node::Or(left, right) => Ok(evaluate(left, leaves, verdicts, timestamp)?
            || evaluate(right, leaves, verdicts, timestamp)?),
        Node::Not(inner) => Ok(!evaluate(inner, leaves, verdicts, timestamp)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::filter::CompareOp;
    use crate::query::merge::tests::CountingReader;
    use crate::query::reader::{int_points, VecPointReader};
    use crate::storage::data::{TimeValuePair, Value};
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn opener(
        data: HashMap<SeriesPath, Vec<TimeValuePair>>,
    ) -> impl FnMut(&SeriesPath) -> QueryResult<Box<dyn PointReader>> {
        move |path| {
            let points = data.get(path).cloned().unwrap_or_default();
            Ok(Box::new(VecPointReader::new(points)) as Box<dyn PointReader>)
        }
    }

    fn collect(generator: &mut TimeGenerator) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(ts) = generator.next_timestamp().unwrap() {
            out.push(ts);
        }
        out
    }

    fn satisfying(points: &[TimeValuePair], filter: &SeriesFilter) -> BTreeSet<i64> {
        points
            .iter()
            .filter(|p| filter.satisfy(p.timestamp(), p.value()))
            .map(|p| p.timestamp())
            .collect()
    }

    #[test]
    fn test_and_is_intersection() {
        let a = SeriesPath::new("d1", "s1");
        let b = SeriesPath::new("d1", "s2");
        let a_points: Vec<TimeValuePair> = (0..40)
            .map(|ts| TimeValuePair::new(ts, Value::Int32((ts * 7 % 11) as i32)))
            .collect();
        let b_points: Vec<TimeValuePair> = (0..40)
            .filter(|ts| ts % 3 != 0)
            .map(|ts| TimeValuePair::new(ts, Value::Int32((ts * 5 % 13) as i32)))
            .collect();

        let expr = FilterExpr::value(a.clone(), CompareOp::Gt, Value::Int32(4))
            .and(FilterExpr::value(b.clone(), CompareOp::LtEq, Value::Int32(6)));
        let leaves = expr.series_filters();
        let expected: BTreeSet<i64> = satisfying(&a_points, leaves[0])
            .intersection(&satisfying(&b_points, leaves[1]))
            .copied()
            .collect();

        let data = HashMap::from([(a, a_points), (b, b_points)]);
        let mut generator = TimeGenerator::new(&expr, opener(data)).unwrap();
        let produced = collect(&mut generator);
        assert_eq!(produced, expected.into_iter().collect::<Vec<_>>());
        generator.close().unwrap();
    }

    #[test]
    fn test_or_is_union() {
        let a = SeriesPath::new("d1", "s1");
        let b = SeriesPath::new("d2", "s1");
        let data = HashMap::from([
            (a.clone(), int_points(&[(1, 10), (2, 0), (5, 10)])),
            (b.clone(), int_points(&[(2, 10), (3, 0), (4, 10)])),
        ]);
        let expr = FilterExpr::value(a, CompareOp::Eq, Value::Int32(10))
            .or(FilterExpr::value(b, CompareOp::Eq, Value::Int32(10)));
        let mut generator = TimeGenerator::new(&expr, opener(data)).unwrap();
        assert_eq!(collect(&mut generator), vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_not_and_global_time() {
        let a = SeriesPath::new("d1", "s1");
        let data = HashMap::from([(
            a.clone(),
            int_points(&[(1, 1), (2, 2), (3, 3), (4, 4), (5, 5)]),
        )]);
        let expr = FilterExpr::value(a, CompareOp::Eq, Value::Int32(3))
            .not()
            .and(FilterExpr::time(TimeFilter::Compare(CompareOp::GtEq, 2)));
        let mut generator = TimeGenerator::new(&expr, opener(data)).unwrap();
        assert_eq!(collect(&mut generator), vec![2, 4, 5]);
    }

    #[test]
    fn test_series_time_predicate() {
        let a = SeriesPath::new("d1", "s1");
        let data = HashMap::from([(a.clone(), int_points(&[(1, 9), (2, 9), (3, 9)]))]);
        let expr = FilterExpr::Series(SeriesFilter {
            path: a,
            value: Some(crate::query::filter::ValueFilter::new(
                CompareOp::Gt,
                Value::Int32(5),
            )),
            time: Some(TimeFilter::Between(2, 3)),
        });
        let mut generator = TimeGenerator::new(&expr, opener(data)).unwrap();
        assert!(generator.has_next().unwrap());
        assert!(generator.has_next().unwrap());
        assert_eq!(collect(&mut generator), vec![2, 3]);
        assert!(!generator.has_next().unwrap());
    }

    #[test]
    fn test_time_only_expression_rejected() {
        let expr = FilterExpr::time(TimeFilter::Compare(CompareOp::Gt, 0));
        let result = TimeGenerator::new(&expr, opener(HashMap::new()));
        assert!(matches!(result, Err(QueryError::InvalidFilter(_))));
    }

    #[test]
    fn test_failed_open_closes_opened_leaves() {
        let closes = Arc::new(AtomicUsize::new(0));
        let expr = FilterExpr::value(SeriesPath::new("d1", "s1"), CompareOp::Gt, Value::Int32(0))
            .and(FilterExpr::value(SeriesPath::new("d1", "s2"), CompareOp::Gt, Value::Int32(0)));
        let mut opened = 0;
        let leaf_closes = closes.clone();
        let result = TimeGenerator::new(&expr, move |path| {
            opened += 1;
            if opened > 1 {
                return Err(QueryError::SeriesNotFound(path.clone()));
            }
            Ok(Box::new(CountingReader::new(int_points(&[(1, 1)]), leaf_closes.clone()))
                as Box<dyn PointReader>)
        });
        assert!(matches!(result, Err(QueryError::SeriesNotFound(_))));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_failure_closes_generator() {
        let closes = Arc::new(AtomicUsize::new(0));
        let expr = FilterExpr::value(SeriesPath::new("d1", "s1"), CompareOp::Gt, Value::Int32(0));
        let leaf_closes = closes.clone();
        let mut generator = TimeGenerator::new(&expr, move |_| {
            Ok(Box::new(
                CountingReader::new(int_points(&[(1, 1), (2, 2)]), leaf_closes.clone())
                    .failing_after(1),
            ) as Box<dyn PointReader>)
        })
        .unwrap();
        assert!(generator.next_timestamp().is_err());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(generator.next_timestamp().unwrap().is_none());
    }
}
