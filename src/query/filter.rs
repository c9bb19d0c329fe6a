//! Filter expressions: time predicates, per-series value predicates, and the
//! boolean trees built from them.

use std::cmp::Ordering;
use std::fmt;

use crate::storage::data::{SeriesPath, Value};

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::NotEq => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::LtEq => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::GtEq => ordering != Ordering::Less,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        };
        f.write_str(symbol)
    }
}

/// Predicate over point values: `value <op> operand`
#[derive(Debug, Clone, PartialEq)]
pub struct ValueFilter {
    pub op: CompareOp,
    pub operand: Value,
}

impl ValueFilter {
    pub fn new(op: CompareOp, operand: Value) -> Self {
        Self { op, operand }
    }

    /// Values that cannot be compared with the operand never match
    pub fn satisfy(&self, value: &Value) -> bool {
        value
            .compare(&self.operand)
            .is_some_and(|ordering| self.op.accepts(ordering))
    }
}

/// Predicate over timestamps
#[derive(Debug, Clone, PartialEq)]
pub enum TimeFilter {
    /// `timestamp <op> bound`
    Compare(CompareOp, i64),
    /// Inclusive range
    Between(i64, i64),
    And(Box<TimeFilter>, Box<TimeFilter>),
    Or(Box<TimeFilter>, Box<TimeFilter>),
    Not(Box<TimeFilter>),
}

impl TimeFilter {
    pub fn satisfy(&self, timestamp: i64) -> bool {
        match self {
            TimeFilter::Compare(op, bound) => op.accepts(timestamp.cmp(bound)),
            TimeFilter::Between(low, high) => (*low..=*high).contains(&timestamp),
            TimeFilter::And(left, right) => left.satisfy(timestamp) && right.satisfy(timestamp),
            TimeFilter::Or(left, right) => left.satisfy(timestamp) || right.satisfy(timestamp),
            TimeFilter::Not(inner) => !inner.satisfy(timestamp),
        }
    }

    pub fn and(self, other: TimeFilter) -> TimeFilter {
        TimeFilter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: TimeFilter) -> TimeFilter {
        TimeFilter::Or(Box::new(self), Box::new(other))
    }
}

/// Leaf predicate on one series: a value filter, optionally narrowed by a time filter
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesFilter {
    pub path: SeriesPath,
    pub value: Option<ValueFilter>,
    pub time: Option<TimeFilter>,
}

impl SeriesFilter {
    pub fn satisfy(&self, timestamp: i64, value: &Value) -> bool {
        self.time.as_ref().map_or(true, |t| t.satisfy(timestamp))
            && self.value.as_ref().map_or(true, |v| v.satisfy(value))
    }
}

/// Boolean filter tree over series predicates and a global time predicate
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    Series(SeriesFilter),
    GlobalTime(TimeFilter),
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    /// `path <op> operand`
    pub fn value(path: SeriesPath, op: CompareOp, operand: Value) -> Self {
        FilterExpr::Series(SeriesFilter {
            path,
            value: Some(ValueFilter::new(op, operand)),
            time: None,
        })
    }

    pub fn time(filter: TimeFilter) -> Self {
        FilterExpr::GlobalTime(filter)
    }

    pub fn and(self, other: FilterExpr) -> Self {
        FilterExpr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: FilterExpr) -> Self {
        FilterExpr::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        FilterExpr::Not(Box::new(self))
    }

    /// The equivalent time filter if the tree only constrains time
    pub fn as_time_filter(&self) -> Option<TimeFilter> {
        match self {
            FilterExpr::Series(_) => None,
            FilterExpr::GlobalTime(filter) => Some(filter.clone()),
            FilterExpr::And(left, right) => Some(left.as_time_filter()?.and(right.as_time_filter()?)),
            FilterExpr::Or(left, right) => Some(left.as_time_filter()?.or(right.as_time_filter()?)),
            FilterExpr::Not(inner) => Some(TimeFilter::Not(Box::new(inner.as_time_filter()?))),
        }
    }

    /// Series leaves in left-to-right order
    pub fn series_filters(&self) -> Vec<&SeriesFilter> {
        let mut leaves = Vec::new();
        self.collect_series(&mut leaves);
        leaves
    }

    fn collect_series<'a>(&'a self, leaves: &mut Vec<&'a SeriesFilter>) {
        match self {
            FilterExpr::Series(filter) => leaves.push(filter),
            FilterExpr::GlobalTime(_) => {}
            FilterExpr::And(left, right) | FilterExpr::Or(left, right) => {
                left.collect_series(leaves);
                right.collect_series(leaves);
            }
            FilterExpr::Not(inner) => inner.collect_series(leaves),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_filter() {
        let gt = ValueFilter::new(CompareOp::Gt, Value::Int32(10));
        assert!(gt.satisfy(&Value::Int32(11)));
        assert!(!gt.satisfy(&Value::Int32(10)));
        assert!(gt.satisfy(&Value::Double(10.5)));
        assert!(!gt.satisfy(&Value::Text("11".into())));

        let ne = ValueFilter::new(CompareOp::NotEq, Value::Boolean(true));
        assert!(ne.satisfy(&Value::Boolean(false)));
    }

    #[test]
    fn test_time_filter() {
        let filter = TimeFilter::Between(5, 10).and(TimeFilter::Not(Box::new(TimeFilter::Compare(
            CompareOp::Eq,
            7,
        ))));
        assert!(filter.satisfy(5));
        assert!(!filter.satisfy(7));
        assert!(filter.satisfy(10));
        assert!(!filter.satisfy(11));
        assert!(TimeFilter::Compare(CompareOp::Lt, 0).or(TimeFilter::Compare(CompareOp::Gt, 9)).satisfy(-1));
    }

    #[test]
    fn test_expression_shape() {
        let a = SeriesPath::new("d1", "s1");
        let b = SeriesPath::new("d1", "s2");
        let expr = FilterExpr::value(a.clone(), CompareOp::Gt, Value::Int32(1))
            .and(FilterExpr::time(TimeFilter::Compare(CompareOp::GtEq, 0)))
            .or(FilterExpr::value(b.clone(), CompareOp::Lt, Value::Int32(3)).not());

        let paths: Vec<&SeriesPath> = expr.series_filters().iter().map(|f| &f.path).collect();
        assert_eq!(paths, vec![&a, &b]);
        assert!(expr.as_time_filter().is_none());

        let time_only = FilterExpr::time(TimeFilter::Compare(CompareOp::Gt, 3))
            .and(FilterExpr::time(TimeFilter::Compare(CompareOp::Lt, 6)));
        let filter = time_only.as_time_filter().unwrap();
        assert!(filter.satisfy(4));
        assert!(!filter.satisfy(6));
    }
}
