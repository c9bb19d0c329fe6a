use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::context::{QueryId, QueryResourceManager, TrackedReader};
use super::external_sort::ExternalSortMerger;
use super::filter::{FilterExpr, TimeFilter};
use super::merge::PriorityMergeReader;
use super::reader::{PeekableReader, PointReader, ReaderByTimestamp};
use super::timegen::TimeGenerator;
use super::{QueryError, QueryResult};
use crate::metrics;
use crate::storage::data::{DataType, SeriesPath, TimeValuePair, Value};
use crate::storage::engine::{SeriesSources, StorageEngine};
use crate::storage::schema::SchemaError;

/// A query: the series to return and an optional filter
#[derive(Debug, Clone, PartialEq)]
pub struct QueryExpression {
    pub selected: Vec<SeriesPath>,
    pub expression: Option<FilterExpr>,
}

impl QueryExpression {
    pub fn new(selected: Vec<SeriesPath>) -> Self {
        Self {
            selected,
            expression: None,
        }
    }

    pub fn with_filter(mut self, expression: FilterExpr) -> Self {
        self.expression = Some(expression);
        self
    }
}

/// One result row: a timestamp and one field per selected series
#[derive(Debug, Clone, PartialEq)]
pub struct RowRecord {
    pub timestamp: i64,
    pub fields: Vec<Option<Value>>,
}

impl fmt::Display for RowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.timestamp)?;
        for field in &self.fields {
            match field {
                Some(value) => write!(f, "\t{}", value)?,
                None => write!(f, "\tnull")?,
            }
        }
        Ok(())
    }
}

/// Builds data sets over a [`StorageEngine`]
pub struct QueryExecutor {
    engine: Arc<StorageEngine>,
}

impl QueryExecutor {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self { engine }
    }

    /// Runs `query`. Without a filter, or with a filter on time alone, every
    /// series is merged directly; otherwise a [`TimeGenerator`] picks the
    /// timestamps and the selected series are read at those timestamps.
    pub fn execute(&self, query: &QueryExpression) -> QueryResult<QueryDataSet> {
        let resources = Arc::clone(self.engine.resources());
        let id = resources.begin_query();
        let started = Instant::now();

        let built = self.build(id, query);
        let kind = match built {
            Ok(kind) => kind,
            Err(e) => {
                if let Err(cleanup) = resources.end_query(id) {
                    warn!("Failed to clean up query {}: {}", id, cleanup);
                }
                return Err(e);
            }
        };

        info!(
            "Executing query {}: series={}, value_filter={}",
            id,
            query.selected.len(),
            matches!(kind, DataSetKind::WithValueFilter(_))
        );
        Ok(QueryDataSet {
            id,
            paths: query.selected.clone(),
            data_types: kind.data_types().to_vec(),
            kind,
            resources,
            started,
            cached: None,
            closed: false,
        })
    }

    fn build(&self, id: QueryId, query: &QueryExpression) -> QueryResult<DataSetKind> {
        let mut data_types = Vec::with_capacity(query.selected.len());
        for path in &query.selected {
            data_types.push(self.resolve(path)?);
        }

        let time_filter = match &query.expression {
            None => None,
            Some(expr) => match expr.as_time_filter() {
                Some(filter) => Some(filter),
                None => {
                    return self.build_with_value_filter(id, query, expr, data_types);
                }
            },
        };

        let mut columns = Vec::with_capacity(query.selected.len());
        for path in &query.selected {
            columns.push(PeekableReader::new(self.open_column(id, path, time_filter.as_ref())?));
        }
        Ok(DataSetKind::WithoutValueFilter(DataSetWithoutValueFilter {
            data_types,
            columns,
        }))
    }

    fn build_with_value_filter(
        &self,
        id: QueryId,
        query: &QueryExpression,
        expr: &FilterExpr,
        data_types: Vec<DataType>,
    ) -> QueryResult<DataSetKind> {
        let generator = TimeGenerator::new(expr, |path| self.open_column(id, path, None))?;
        let mut data_set = DataSetWithValueFilter {
            data_types,
            generator,
            readers: Vec::with_capacity(query.selected.len()),
        };
        for path in &query.selected {
            match self.engine.open_reader_by_timestamp(path) {
                Ok(reader) => data_set.readers.push(reader),
                Err(e) => {
                    data_set.close_quietly();
                    return Err(e);
                }
            }
        }
        Ok(DataSetKind::WithValueFilter(data_set))
    }

    fn resolve(&self, path: &SeriesPath) -> QueryResult<DataType> {
        self.engine
            .resolve_series_type(path)
            .map_err(|e| match e {
                SchemaError::PathNotFound(path) => QueryError::SeriesNotFound(path),
                other => QueryError::Schema(other),
            })
    }

    /// Opens the merged stream of one series, spilling it when it has more
    /// sources than the configured threshold. The stream is tied to the query.
    fn open_column(
        &self,
        id: QueryId,
        path: &SeriesPath,
        filter: Option<&TimeFilter>,
    ) -> QueryResult<Box<dyn PointReader>> {
        let sources = self.engine.open_series_sources(path, filter)?;
        let threshold = self.engine.config().external_sort_threshold;
        let merge = if sources.len() > threshold {
            debug!(
                "Series {} has {} sources, spilling (threshold {})",
                path,
                sources.len(),
                threshold
            );
            self.spill(id, sources)?
        } else {
            sources.into_merge()?
        };
        Ok(Box::new(TrackedReader::register(
            self.engine.resources(),
            id,
            merge,
        )))
    }

    /// Replaces consecutive groups of sources with spilled merges of them
    fn spill(&self, id: QueryId, sources: SeriesSources) -> QueryResult<PriorityMergeReader> {
        let config = self.engine.config();
        let merger = ExternalSortMerger::new(
            id,
            config.spill_dir.clone(),
            config.max_text_spill_bytes,
            Arc::clone(self.engine.resources()),
        );
        let group_size = config.external_sort_group_size.max(1);
        let data_type = sources.data_type;

        let mut outer = PriorityMergeReader::new();
        let mut pending = sources.readers.into_iter();
        loop {
            let group: Vec<(Box<dyn PointReader>, u32)> = pending.by_ref().take(group_size).collect();
            if group.is_empty() {
                return Ok(outer);
            }
            let result = wrap_group(group).and_then(|group| {
                let priority = group.first().map_or(0, PriorityMergeReader::priority);
                let spilled = merger.merge(data_type, group)?;
                outer.add_reader(Box::new(spilled), priority)
            });
            if let Err(e) = result {
                for (mut reader, _) in pending {
                    if let Err(close) = reader.close() {
                        warn!("Failed to close source after spill failure: {}", close);
                    }
                }
                if let Err(close) = outer.close() {
                    warn!("Failed to close spilled sources: {}", close);
                }
                return Err(e);
            }
        }
    }
}

/// Gives every source of a group its own merge reader at the source's priority
fn wrap_group(group: Vec<(Box<dyn PointReader>, u32)>) -> QueryResult<Vec<PriorityMergeReader>> {
    let mut wrapped = Vec::with_capacity(group.len());
    let mut pending = group.into_iter();
    while let Some((reader, priority)) = pending.next() {
        let mut merge = PriorityMergeReader::with_priority(priority);
        if let Err(e) = merge.add_reader(reader, priority) {
            for (mut rest, _) in pending {
                if let Err(close) = rest.close() {
                    warn!("Failed to close source: {}", close);
                }
            }
            return Err(e);
        }
        wrapped.push(merge);
    }
    Ok(wrapped)
}

/// Rows of queries without a value filter: a timestamp-aligned merge of the
/// selected series
pub struct DataSetWithoutValueFilter {
    data_types: Vec<DataType>,
    columns: Vec<PeekableReader<Box<dyn PointReader>>>,
}

impl DataSetWithoutValueFilter {
    fn next_row(&mut self) -> QueryResult<Option<RowRecord>> {
        let mut timestamp: Option<i64> = None;
        for column in &mut self.columns {
            if let Some(ts) = column.peek_timestamp()? {
                timestamp = Some(timestamp.map_or(ts, |t| t.min(ts)));
            }
        }
        let Some(timestamp) = timestamp else {
            return Ok(None);
        };

        let mut fields = Vec::with_capacity(self.columns.len());
        for column in &mut self.columns {
            if column.peek_timestamp()? == Some(timestamp) {
                fields.push(column.next_point()?.map(TimeValuePair::into_value));
            } else {
                fields.push(None);
            }
        }
        Ok(Some(RowRecord { timestamp, fields }))
    }

    fn close(&mut self) -> QueryResult<()> {
        let mut first_error = None;
        for column in &mut self.columns {
            if let Err(e) = column.close() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Rows of queries with a value filter: the selected series read at the
/// timestamps the filter accepts
pub struct DataSetWithValueFilter {
    data_types: Vec<DataType>,
    generator: TimeGenerator,
    readers: Vec<Box<dyn ReaderByTimestamp>>,
}

impl DataSetWithValueFilter {
    /// Timestamps where no selected series has a value produce no row
    fn next_row(&mut self) -> QueryResult<Option<RowRecord>> {
        while let Some(timestamp) = self.generator.next_timestamp()? {
            let mut fields = Vec::with_capacity(self.readers.len());
            for reader in &mut self.readers {
                fields.push(reader.value_at(timestamp)?);
            }
            if fields.iter().any(Option::is_some) {
                return Ok(Some(RowRecord { timestamp, fields }));
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> QueryResult<()> {
        let mut first_error = self.generator.close().err();
        for reader in &mut self.readers {
            if let Err(e) = reader.close() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn close_quietly(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close data set: {}", e);
        }
    }
}

enum DataSetKind {
    WithoutValueFilter(DataSetWithoutValueFilter),
    WithValueFilter(DataSetWithValueFilter),
}

impl DataSetKind {
    fn data_types(&self) -> &[DataType] {
        match self {
            DataSetKind::WithoutValueFilter(set) => &set.data_types,
            DataSetKind::WithValueFilter(set) => &set.data_types,
        }
    }
}

/// Lazily produced query result, in ascending timestamp order.
///
/// Closing the data set, explicitly or by dropping it, ends the query: its
/// readers are closed and its spill files deleted.
pub struct QueryDataSet {
    id: QueryId,
    paths: Vec<SeriesPath>,
    data_types: Vec<DataType>,
    kind: DataSetKind,
    resources: Arc<QueryResourceManager>,
    started: Instant,
    cached: Option<RowRecord>,
    closed: bool,
}

impl QueryDataSet {
    pub fn query_id(&self) -> QueryId {
        self.id
    }

    pub fn paths(&self) -> &[SeriesPath] {
        &self.paths
    }

    pub fn data_types(&self) -> &[DataType] {
        &self.data_types
    }

    pub fn has_value_filter(&self) -> bool {
        matches!(self.kind, DataSetKind::WithValueFilter(_))
    }

    pub fn has_next(&mut self) -> QueryResult<bool> {
        if self.cached.is_none() && !self.closed {
            self.cached = self.fetch()?;
        }
        Ok(self.cached.is_some())
    }

    pub fn next_row(&mut self) -> QueryResult<Option<RowRecord>> {
        self.has_next()?;
        Ok(self.cached.take())
    }

    /// Drains the remaining rows
    pub fn collect_rows(&mut self) -> QueryResult<Vec<RowRecord>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(rows)
    }

    fn fetch(&mut self) -> QueryResult<Option<RowRecord>> {
        let row = match &mut self.kind {
            DataSetKind::WithoutValueFilter(set) => set.next_row(),
            DataSetKind::WithValueFilter(set) => set.next_row(),
        };
        if row.is_err() {
            if let Err(e) = self.close() {
                warn!("Failed to close failed query {}: {}", self.id, e);
            }
        }
        row
    }

    /// Ends the query. Further calls return no rows.
    pub fn close(&mut self) -> QueryResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cached = None;

        let closed = match &mut self.kind {
            DataSetKind::WithoutValueFilter(set) => set.close(),
            DataSetKind::WithValueFilter(set) => set.close(),
        };
        let ended = self.resources.end_query(self.id);

        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        metrics::record_query(elapsed_ms);
        debug!("Closed query {} after {:.2}ms", self.id, elapsed_ms);
        closed.and(ended)
    }
}

impl Drop for QueryDataSet {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close query {}: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::query::filter::CompareOp;
    use crate::storage::engine::InsertRow;
    use crate::storage::schema::MemorySchemaCatalog;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        engine: Arc<StorageEngine>,
    }

    fn fixture(external_sort_threshold: usize) -> Fixture {
        let dir = tempdir().unwrap();
        let config = EngineConfig {
            spill_dir: dir.path().join("spill"),
            data_dir: dir.path().join("chunks"),
            external_sort_threshold,
            external_sort_group_size: 2,
            max_text_spill_bytes: 16,
            metrics_addr: None,
            ..EngineConfig::default()
        };
        let schema = Arc::new(MemorySchemaCatalog::new());
        schema.register(SeriesPath::new("d1", "temperature"), DataType::Double).unwrap();
        schema.register(SeriesPath::new("d1", "status"), DataType::Text).unwrap();
        schema.register(SeriesPath::new("d2", "count"), DataType::Int32).unwrap();
        let engine = Arc::new(StorageEngine::open(config, schema).unwrap());
        Fixture { dir, engine }
    }

    fn insert(engine: &StorageEngine, device: &str, timestamp: i64, columns: &[(&str, Value)]) {
        engine
            .insert(InsertRow {
                device: device.into(),
                timestamp,
                measurements: columns.iter().map(|(m, _)| m.to_string()).collect(),
                values: columns.iter().map(|(_, v)| v.clone()).collect(),
            })
            .unwrap();
    }

    fn load(engine: &StorageEngine) {
        insert(engine, "d1", 1, &[("temperature", Value::Double(20.5)), ("status", Value::Text("ok".into()))]);
        insert(engine, "d1", 2, &[("temperature", Value::Double(30.0))]);
        insert(engine, "d2", 2, &[("count", Value::Int32(5))]);
        engine.flush().unwrap();
        insert(engine, "d1", 3, &[("temperature", Value::Double(25.0)), ("status", Value::Text("warn".into()))]);
        insert(engine, "d1", 2, &[("temperature", Value::Double(31.0))]);
        insert(engine, "d2", 4, &[("count", Value::Int32(7))]);
    }

    fn paths() -> Vec<SeriesPath> {
        vec![
            SeriesPath::new("d1", "temperature"),
            SeriesPath::new("d1", "status"),
            SeriesPath::new("d2", "count"),
        ]
    }

    fn spill_files(fixture: &Fixture) -> usize {
        fs::read_dir(fixture.dir.path().join("spill")).unwrap().count()
    }

    #[test]
    fn test_full_scan_aligns_series() {
        let fixture = fixture(8);
        load(&fixture.engine);
        let executor = QueryExecutor::new(fixture.engine.clone());

        let mut data_set = executor.execute(&QueryExpression::new(paths())).unwrap();
        assert!(!data_set.has_value_filter());
        assert_eq!(
            data_set.data_types(),
            &[DataType::Double, DataType::Text, DataType::Int32]
        );
        let rows = data_set.collect_rows().unwrap();
        assert_eq!(
            rows,
            vec![
                RowRecord {
                    timestamp: 1,
                    fields: vec![Some(Value::Double(20.5)), Some(Value::Text("ok".into())), None],
                },
                RowRecord {
                    timestamp: 2,
                    fields: vec![Some(Value::Double(31.0)), None, Some(Value::Int32(5))],
                },
                RowRecord {
                    timestamp: 3,
                    fields: vec![Some(Value::Double(25.0)), Some(Value::Text("warn".into())), None],
                },
                RowRecord {
                    timestamp: 4,
                    fields: vec![None, None, Some(Value::Int32(7))],
                },
            ]
        );
        assert_eq!(rows[3].to_string(), "4\tnull\tnull\t7");

        data_set.close().unwrap();
        assert_eq!(fixture.engine.resources().active_queries(), 0);
    }

    #[test]
    fn test_global_time_filter() {
        let fixture = fixture(8);
        load(&fixture.engine);
        let executor = QueryExecutor::new(fixture.engine.clone());

        let query = QueryExpression::new(paths()).with_filter(FilterExpr::time(
            TimeFilter::Between(2, 3),
        ));
        let mut data_set = executor.execute(&query).unwrap();
        assert!(!data_set.has_value_filter());
        let timestamps: Vec<i64> = data_set
            .collect_rows()
            .unwrap()
            .iter()
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(timestamps, vec![2, 3]);
    }

    #[test]
    fn test_value_filter() {
        let fixture = fixture(8);
        load(&fixture.engine);
        let executor = QueryExecutor::new(fixture.engine.clone());

        let filter = FilterExpr::value(
            SeriesPath::new("d1", "temperature"),
            CompareOp::GtEq,
            Value::Double(25.0),
        );
        let query = QueryExpression::new(vec![
            SeriesPath::new("d1", "status"),
            SeriesPath::new("d2", "count"),
        ])
        .with_filter(filter);
        let mut data_set = executor.execute(&query).unwrap();
        assert!(data_set.has_value_filter());
        assert_eq!(
            data_set.collect_rows().unwrap(),
            vec![
                RowRecord {
                    timestamp: 2,
                    fields: vec![None, Some(Value::Int32(5))],
                },
                RowRecord {
                    timestamp: 3,
                    fields: vec![Some(Value::Text("warn".into())), None],
                },
            ]
        );
        data_set.close().unwrap();
        assert_eq!(fixture.engine.resources().active_queries(), 0);
    }

    #[test]
    fn test_spilled_query_matches_direct_query() {
        let direct = {
            let fixture = fixture(8);
            load(&fixture.engine);
            let mut data_set = QueryExecutor::new(fixture.engine.clone())
                .execute(&QueryExpression::new(paths()))
                .unwrap();
            data_set.collect_rows().unwrap()
        };

        let fixture = fixture(1);
        load(&fixture.engine);
        let executor = QueryExecutor::new(fixture.engine.clone());
        let mut data_set = executor.execute(&QueryExpression::new(paths())).unwrap();
        assert!(spill_files(&fixture) > 0);
        assert_eq!(data_set.collect_rows().unwrap(), direct);

        drop(data_set);
        assert_eq!(spill_files(&fixture), 0);
        assert_eq!(fixture.engine.resources().active_queries(), 0);
    }

    #[test]
    fn test_unknown_series() {
        let fixture = fixture(8);
        let executor = QueryExecutor::new(fixture.engine.clone());
        let result = executor.execute(&QueryExpression::new(vec![SeriesPath::new("d9", "x")]));
        assert!(matches!(result, Err(QueryError::SeriesNotFound(_))));
        assert_eq!(fixture.engine.resources().active_queries(), 0);
    }

    #[test]
    fn test_known_series_without_data() {
        let fixture = fixture(8);
        let executor = QueryExecutor::new(fixture.engine.clone());
        let mut data_set = executor
            .execute(&QueryExpression::new(vec![SeriesPath::new("d2", "count")]))
            .unwrap();
        assert!(!data_set.has_next().unwrap());
    }

    #[test]
    fn test_query_sees_snapshot_at_open() {
        let fixture = fixture(8);
        load(&fixture.engine);
        let executor = QueryExecutor::new(fixture.engine.clone());
        let mut data_set = executor
            .execute(&QueryExpression::new(vec![SeriesPath::new("d2", "count")]))
            .unwrap();

        insert(&fixture.engine, "d2", 10, &[("count", Value::Int32(9))]);
        let timestamps: Vec<i64> = data_set
            .collect_rows()
            .unwrap()
            .iter()
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(timestamps, vec![2, 4]);
    }
}
