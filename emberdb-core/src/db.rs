//! Database - the embedded store facade
//!
//! Owns the write path (insert staging, collapsing, retention drops), the
//! flush protocol (merge the MemTable into the current StaticTable, publish
//! a new snapshot, retire the old generation's files), and the read path
//! (query compilation and execution against the current snapshot).

use crate::dimension::DimensionSet;
use crate::error::{EmberError, Result};
use crate::memtable::{IntervalRows, MemTable, StagedRow};
use crate::query::{self, CancelToken, Query};
use crate::schema::{ColumnRef, RowLayout, Schema};
use crate::storage::{
    remove_generation, write_dimensions, write_interval, write_metadata, Interval, IntervalMeta,
    Metadata, StaticTable,
};
use crate::types::{unix_now, RowMap, Timestamp, UnpackedRow};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runtime options, fixed at open time
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Persistence root; `None` keeps the whole store in memory
    pub dir: Option<PathBuf>,
    /// Spawn a background flusher with this period (>= 1s)
    pub flush_interval: Option<Duration>,
    /// Drop rows and intervals older than `retention`
    pub fixed_retention: bool,
    /// Retention window (>= 1 day when fixed_retention is set)
    pub retention: Duration,
    /// Number of intervals scanned concurrently by a query
    pub query_parallelism: usize,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            dir: None,
            flush_interval: None,
            fixed_retention: false,
            retention: Duration::from_secs(7 * 24 * 3600),
            query_parallelism: 1,
        }
    }
}

impl DatabaseOptions {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn disk_backed(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::default()
        }
    }

    /// Enable fixed retention of the given number of days
    pub fn retention_days(mut self, days: u32) -> Self {
        self.fixed_retention = true;
        self.retention = Duration::from_secs(days as u64 * 24 * 3600);
        self
    }

    pub fn flush_every(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn query_parallelism(mut self, parallelism: usize) -> Self {
        self.query_parallelism = parallelism.max(1);
        self
    }

    fn validate(&self) -> Result<()> {
        if let Some(interval) = self.flush_interval {
            if interval < crate::config::MIN_FLUSH_INTERVAL {
                return Err(EmberError::Config(format!(
                    "flush interval is too small: {:?}",
                    interval
                )));
            }
        }
        if self.fixed_retention && self.retention < crate::config::MIN_RETENTION {
            return Err(EmberError::Config(format!(
                "retention is too small: {:?}",
                self.retention
            )));
        }
        Ok(())
    }
}

/// Liveness summary for status endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub last_updated_unix: Option<Timestamp>,
    pub oldest_interval_unix: Option<Timestamp>,
}

/// Size summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Collapsed rows staged in the MemTable
    pub memtable_rows: usize,
    /// Collapsed rows in the current StaticTable
    pub static_rows: usize,
    pub intervals: usize,
    pub segments: usize,
}

/// Everything mutated under the writer lock: the staging MemTable and the
/// live dimension tables
struct WriteState {
    memtable: MemTable,
    dims: DimensionSet,
}

struct DbInner {
    layout: Arc<RowLayout>,
    options: DatabaseOptions,
    state: RwLock<WriteState>,
    static_table: RwLock<Arc<StaticTable>>,
    /// Serializes flushes end to end (the writer lock is only held briefly
    /// for the MemTable handoff)
    flush_lock: Mutex<()>,
    last_insert: AtomicU32,
}

/// An embedded, append-only, time-partitioned OLAP store
pub struct Database {
    inner: Arc<DbInner>,
    flusher: Mutex<Option<Flusher>>,
    closed: AtomicBool,
}

struct Flusher {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

impl Database {
    /// Create or reopen a database. A disk-backed database must be reopened
    /// with the identical schema.
    pub fn open(schema: Schema, options: DatabaseOptions) -> Result<Database> {
        options.validate()?;
        let layout = Arc::new(RowLayout::new(schema)?);

        let mut dims = DimensionSet::new(&layout.schema.dimension_columns);
        let mut intervals = BTreeMap::new();
        if let Some(dir) = &options.dir {
            std::fs::create_dir_all(dir)?;
            if let Some(loaded) = crate::storage::load_database(dir, &layout)? {
                dims = loaded.dimensions;
                intervals = loaded.intervals;
            }
        }

        let static_table = Arc::new(StaticTable {
            layout: layout.clone(),
            intervals,
            dimensions: dims.snapshot(),
        });
        info!(
            intervals = static_table.intervals.len(),
            rows = static_table.row_count(),
            disk_backed = options.dir.is_some(),
            "opened database"
        );

        let flush_interval = options.flush_interval;
        let db = Database {
            inner: Arc::new(DbInner {
                layout,
                options,
                state: RwLock::new(WriteState {
                    memtable: MemTable::new(),
                    dims,
                }),
                static_table: RwLock::new(static_table),
                flush_lock: Mutex::new(()),
                last_insert: AtomicU32::new(0),
            }),
            flusher: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        if let Some(interval) = flush_interval {
            db.start_flusher(interval);
        }
        Ok(db)
    }

    /// Insert a batch of rows. The batch is atomic: a validation failure on
    /// any row leaves the store untouched (newly interned dimension values
    /// may remain, unreferenced). Rows older than the retention window are
    /// silently dropped.
    pub fn insert(&self, rows: &[RowMap]) -> Result<()> {
        self.inner.insert(rows)
    }

    /// Merge the MemTable into the StaticTable and publish the new snapshot.
    /// A no-op when nothing is staged and nothing has expired.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    /// Run a query against the current StaticTable snapshot
    pub fn query(&self, query: &Query) -> Result<Vec<RowMap>> {
        self.inner.query(query, &CancelToken::new())
    }

    /// Like [`Self::query`], checking the token at interval boundaries
    pub fn query_cancellable(&self, query: &Query, cancel: &CancelToken) -> Result<Vec<RowMap>> {
        self.inner.query(query, cancel)
    }

    /// All stored rows (MemTable and StaticTable combined, as one consistent
    /// snapshot) in caller-visible form. A debugging and test surface; the
    /// hot read path is [`Self::query`].
    pub fn debug_rows(&self) -> Result<Vec<UnpackedRow>> {
        self.inner.debug_rows()
    }

    /// All values of a string dimension, in id order
    pub fn list_dimension(&self, column: &str) -> Result<Vec<String>> {
        self.inner.list_dimension(column)
    }

    pub fn status(&self) -> Status {
        self.inner.status()
    }

    pub fn stats(&self) -> DatabaseStats {
        self.inner.stats()
    }

    /// Stop the background flusher and flush any staged rows
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_flusher();
        self.inner.flush()
    }

    fn start_flusher(&self, every: Duration) {
        let (shutdown, signal) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::spawn(move || loop {
            match signal.recv_timeout(every) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = inner.flush() {
                        warn!("background flush failed: {}", e);
                    }
                }
                _ => break,
            }
        });
        *self.flusher.lock() = Some(Flusher { shutdown, handle });
    }

    fn stop_flusher(&self) {
        if let Some(flusher) = self.flusher.lock().take() {
            let _ = flusher.shutdown.send(());
            let _ = flusher.handle.join();
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.stop_flusher();
    }
}

impl DbInner {
    fn retention_cutoff(&self, now: Timestamp) -> Option<i64> {
        self.options
            .fixed_retention
            .then(|| now as i64 - self.options.retention.as_secs() as i64)
    }

    fn insert(&self, rows: &[RowMap]) -> Result<()> {
        let now = unix_now();
        let cutoff = self.retention_cutoff(now);

        let mut state = self.state.write();
        let mut staged = MemTable::new();
        let mut dropped = 0usize;
        for row in rows {
            self.layout.check_columns(row)?;
            let ts = self.layout.row_timestamp(row)?;
            // Rows at exactly the cutoff are retained; strictly older drop.
            if cutoff.is_some_and(|cutoff| (ts as i64) < cutoff) {
                dropped += 1;
                continue;
            }
            let packed = self.layout.pack_row(row, &mut state.dims)?;
            let key = self.layout.collation_key(&packed);
            let t0 = self.layout.bucket(ts);
            staged.upsert(&self.layout, t0, key, packed, 1)?;
        }
        state.memtable.merge_from(&self.layout, staged)?;
        drop(state);

        if dropped > 0 {
            debug!("dropped {} rows older than the retention window", dropped);
        }
        self.last_insert.store(now.max(1), Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let _flush = self.flush_lock.lock();
        let now = unix_now();
        let cutoff = self.retention_cutoff(now);
        let duration = self.layout.interval_duration();
        let current = self.static_table.read().clone();

        let out_of_retention = |t0: Timestamp| {
            cutoff.is_some_and(|cutoff| t0 as i64 + duration as i64 <= cutoff)
        };
        let anything_expired = current.intervals.keys().any(|&t0| out_of_retention(t0));

        // Handoff: swap in a fresh MemTable and freeze the dimension tables.
        // Inserts resume immediately against the new MemTable.
        let (staged, dimensions) = {
            let mut state = self.state.write();
            if state.memtable.is_empty() && !anything_expired {
                return Ok(());
            }
            (std::mem::take(&mut state.memtable), state.dims.snapshot())
        };

        let result = self.publish(&current, &staged, dimensions, out_of_retention);
        match result {
            Ok(flushed) => {
                info!(
                    rows = flushed,
                    intervals = self.static_table.read().intervals.len(),
                    "flushed memtable"
                );
                Ok(())
            }
            Err(e) => {
                // The staged rows were accepted by inserts; put them back so
                // the previous snapshot stays live and nothing is lost.
                let mut state = self.state.write();
                let newer = std::mem::take(&mut state.memtable);
                state.memtable = staged;
                state.memtable.absorb(&self.layout, newer);
                Err(e)
            }
        }
    }

    /// Merge, write the new generation, install the snapshot, and retire
    /// superseded files. Returns the number of rows drained from the
    /// MemTable.
    fn publish(
        &self,
        current: &Arc<StaticTable>,
        staged: &MemTable,
        dimensions: crate::dimension::DimensionSnapshot,
        out_of_retention: impl Fn(Timestamp) -> bool,
    ) -> Result<usize> {
        let staged_intervals = staged.intervals();
        let starts: BTreeSet<Timestamp> = current
            .intervals
            .keys()
            .chain(staged_intervals.keys())
            .copied()
            .collect();

        let mut new_intervals: BTreeMap<Timestamp, Arc<Interval>> = BTreeMap::new();
        // (t0, generation, segment count) of filesets to unlink after swap
        let mut superseded: Vec<(Timestamp, u64, usize)> = Vec::new();
        for t0 in starts {
            let existing = current.intervals.get(&t0);
            if out_of_retention(t0) {
                if let Some(interval) = existing {
                    superseded.push((t0, interval.generation, interval.segments.len()));
                    debug!("dropping interval {} (out of retention)", t0);
                }
                continue;
            }
            let staged_rows = staged_intervals.get(&t0);
            match (existing, staged_rows) {
                // Untouched interval: reuse as-is, generation unchanged.
                (Some(interval), None) => {
                    new_intervals.insert(t0, interval.clone());
                }
                (existing, Some(rows)) => {
                    let generation = existing.map_or(0, |i| i.generation + 1);
                    let merged = merge_interval_rows(&self.layout, existing, rows);
                    let mut interval = Interval::build(
                        t0,
                        generation,
                        merged,
                        self.layout.row_width,
                        self.layout.rows_per_segment(),
                    );
                    if let Some(dir) = &self.options.dir {
                        interval = write_interval(dir, interval)?;
                    }
                    if let Some(old) = existing {
                        superseded.push((t0, old.generation, old.segments.len()));
                    }
                    new_intervals.insert(t0, Arc::new(interval));
                }
                (None, None) => {}
            }
        }

        if let Some(dir) = &self.options.dir {
            let dimension_files = write_dimensions(dir, &self.layout, &dimensions)?;
            let metadata = Metadata {
                schema: self.layout.schema.clone(),
                intervals: new_intervals
                    .values()
                    .map(|interval| IntervalMeta {
                        start: interval.start,
                        generation: interval.generation,
                        segments: interval.segments.len(),
                        rows: interval.rows,
                    })
                    .collect(),
                dimension_files,
            };
            write_metadata(dir, &metadata)?;
        }

        let new_table = Arc::new(StaticTable {
            layout: self.layout.clone(),
            intervals: new_intervals,
            dimensions,
        });
        *self.static_table.write() = new_table;

        // Old-generation files stay on disk until every reader of the
        // previous snapshot has released its handle.
        self.await_readers(current);
        if let Some(dir) = &self.options.dir {
            for (t0, generation, segments) in superseded {
                remove_generation(dir, t0, generation, segments);
            }
        }
        Ok(staged.len())
    }

    fn await_readers(&self, previous: &Arc<StaticTable>) {
        let mut spins = 0u32;
        while Arc::strong_count(previous) > 1 {
            std::thread::sleep(Duration::from_millis(1));
            spins += 1;
            if spins % 5000 == 0 {
                warn!(
                    readers = Arc::strong_count(previous) - 1,
                    "flush still waiting for readers of the previous snapshot"
                );
            }
        }
    }

    fn query(&self, query: &Query, cancel: &CancelToken) -> Result<Vec<RowMap>> {
        let table = self.static_table.read().clone();
        let plan = query::plan(query, &table.layout, &table.dimensions)?;
        query::execute(&plan, &table, self.options.query_parallelism, cancel)
    }

    fn debug_rows(&self) -> Result<Vec<UnpackedRow>> {
        // Holding the flush lock keeps the MemTable and StaticTable halves
        // of the snapshot consistent with each other.
        let _flush = self.flush_lock.lock();
        let state = self.state.read();
        let table = self.static_table.read().clone();

        let mut merged: BTreeMap<Timestamp, IntervalRows> = BTreeMap::new();
        for (t0, interval) in &table.intervals {
            let rows = merged.entry(*t0).or_default();
            for (row, count) in interval.iter_rows(self.layout.row_width) {
                rows.insert(
                    self.layout.collation_key(row),
                    StagedRow {
                        row: row.to_vec(),
                        count,
                    },
                );
            }
        }
        for (t0, rows) in state.memtable.intervals() {
            let merged_rows = merged.entry(*t0).or_default();
            for (key, staged) in rows {
                match merged_rows.entry(key.clone()) {
                    std::collections::btree_map::Entry::Occupied(mut entry) => {
                        let existing = entry.get_mut();
                        self.layout.sum_metrics(&mut existing.row, &staged.row);
                        existing.count = existing.count.wrapping_add(staged.count);
                    }
                    std::collections::btree_map::Entry::Vacant(entry) => {
                        entry.insert(staged.clone());
                    }
                }
            }
        }

        let mut out = Vec::new();
        for rows in merged.values() {
            for staged in rows.values() {
                out.push(UnpackedRow {
                    row: self.layout.unpack_row(&staged.row, &state.dims)?,
                    count: staged.count,
                });
            }
        }
        Ok(out)
    }

    fn list_dimension(&self, column: &str) -> Result<Vec<String>> {
        let index = match self.layout.column(column) {
            Some(ColumnRef::Dimension(i)) if self.layout.dims[i].string_backed => i,
            Some(_) => {
                return Err(EmberError::SchemaMismatch(format!(
                    "column {:?} is not a string dimension",
                    column
                )))
            }
            None => {
                return Err(EmberError::SchemaMismatch(format!(
                    "unknown column {:?}",
                    column
                )))
            }
        };
        let state = self.state.read();
        Ok(state
            .dims
            .table(index)
            .map(|table| table.values().to_vec())
            .unwrap_or_default())
    }

    fn status(&self) -> Status {
        let last = self.last_insert.load(Ordering::Relaxed);
        Status {
            last_updated_unix: (last != 0).then_some(last),
            oldest_interval_unix: self.static_table.read().oldest_interval(),
        }
    }

    fn stats(&self) -> DatabaseStats {
        let memtable_rows = self.state.read().memtable.len();
        let table = self.static_table.read().clone();
        DatabaseStats {
            memtable_rows,
            static_rows: table.row_count(),
            intervals: table.intervals.len(),
            segments: table.intervals.values().map(|i| i.segments.len()).sum(),
        }
    }
}

/// Merge one interval's stored rows with its staged rows by collation key,
/// collapsing matches. Both inputs are sorted, so this is a single pass.
fn merge_interval_rows(
    layout: &RowLayout,
    existing: Option<&Arc<Interval>>,
    staged: &IntervalRows,
) -> Vec<StagedRow> {
    let Some(interval) = existing else {
        return staged.values().cloned().collect();
    };

    let mut out = Vec::with_capacity(interval.rows + staged.len());
    let mut staged_iter = staged.iter().peekable();
    for (row, count) in interval.iter_rows(layout.row_width) {
        let stored_key = layout.collation_key(row);
        let mut collapsed = false;
        loop {
            let cmp = match staged_iter.peek() {
                Some((key, _)) => key.as_slice().cmp(stored_key.as_slice()),
                None => break,
            };
            match cmp {
                CmpOrdering::Less => {
                    if let Some((_, staged_row)) = staged_iter.next() {
                        out.push(staged_row.clone());
                    }
                }
                CmpOrdering::Equal => {
                    if let Some((_, staged_row)) = staged_iter.next() {
                        let mut merged = row.to_vec();
                        layout.sum_metrics(&mut merged, &staged_row.row);
                        out.push(StagedRow {
                            row: merged,
                            count: count.wrapping_add(staged_row.count),
                        });
                        collapsed = true;
                    }
                    break;
                }
                CmpOrdering::Greater => break,
            }
        }
        if !collapsed {
            out.push(StagedRow {
                row: row.to_vec(),
                count,
            });
        }
    }
    out.extend(staged_iter.map(|(_, staged_row)| staged_row.clone()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ColumnType;
    use crate::query::{FilterOp, QueryAggregate, QueryFilter, QueryGrouping};
    use crate::schema::{DimensionColumn, MetricColumn};
    use crate::types::Untyped;
    use tempfile::TempDir;

    fn test_schema() -> Schema {
        Schema::new("at", 3600)
            .dimension(DimensionColumn::string("dim1", ColumnType::U8))
            .metric(MetricColumn::new("metric1", ColumnType::U32))
    }

    fn make_test_db() -> Database {
        Database::open(test_schema(), DatabaseOptions::in_memory()).unwrap()
    }

    fn row(ts: f64, dim1: Untyped, metric1: f64) -> RowMap {
        [
            ("at".to_string(), Untyped::Float(ts)),
            ("dim1".to_string(), dim1),
            ("metric1".to_string(), Untyped::Float(metric1)),
        ]
        .into_iter()
        .collect()
    }

    fn unpacked(ts: u64, dim1: Untyped, metric1: u64, count: u32) -> UnpackedRow {
        UnpackedRow {
            row: [
                ("at".to_string(), Untyped::UInt(ts)),
                ("dim1".to_string(), dim1),
                ("metric1".to_string(), Untyped::UInt(metric1)),
            ]
            .into_iter()
            .collect(),
            count,
        }
    }

    /// Order-insensitive comparison of debug row listings
    fn assert_same_rows(actual: Vec<UnpackedRow>, expected: Vec<UnpackedRow>) {
        let mut actual: Vec<String> = actual.iter().map(|r| format!("{:?}", r)).collect();
        let mut expected: Vec<String> = expected.iter().map(|r| format!("{:?}", r)).collect();
        actual.sort();
        expected.sort();
        assert_eq!(actual, expected);
    }

    fn sum_query() -> Query {
        Query {
            aggregates: vec![QueryAggregate::sum("metric1", "metric1")],
            ..Default::default()
        }
    }

    fn run_with_filter(db: &Database, filter: QueryFilter) -> Untyped {
        let mut query = sum_query();
        query.filters = vec![filter];
        db.query(&query).unwrap()[0]["metric1"].clone()
    }

    fn hours_back(now: Timestamp, n: u32) -> f64 {
        (now - n * 3600) as f64
    }

    #[test]
    fn test_rows_get_collapsed_upon_insertion() {
        let db = make_test_db();
        db.insert(&[
            // These two rows collapse.
            row(0.0, Untyped::from("string1"), 1.0),
            row(0.0, Untyped::from("string1"), 3.0),
            // This one does not: it has a nil dimension.
            row(0.0, Untyped::Null, 5.0),
            // And this one falls in a different interval.
            row(7200.0, Untyped::from("string1"), 7.0),
        ])
        .unwrap();

        assert_same_rows(
            db.debug_rows().unwrap(),
            vec![
                unpacked(0, Untyped::from("string1"), 4, 2),
                unpacked(0, Untyped::Null, 5, 1),
                unpacked(7200, Untyped::from("string1"), 7, 1),
            ],
        );
    }

    #[test]
    fn test_expected_number_of_segments_are_allocated() {
        // Rows are 10 bytes apiece, so 3 rows fit one 32-byte segment.
        let db = Database::open(
            test_schema().segment_size(32),
            DatabaseOptions::in_memory(),
        )
        .unwrap();
        db.insert(&[
            row(0.0, Untyped::from("a"), 1.0),
            row(0.0, Untyped::from("b"), 1.0),
            row(0.0, Untyped::from("c"), 1.0),
            row(0.0, Untyped::from("d"), 1.0),
        ])
        .unwrap();
        db.flush().unwrap();

        let stats = db.stats();
        assert_eq!(stats.intervals, 1);
        assert_eq!(stats.segments, 2);
        assert_eq!(stats.static_rows, 4);
    }

    #[test]
    fn test_mem_and_static_intervals_are_combined() {
        let db = make_test_db();
        let now = unix_now();

        db.insert(&[
            row(hours_back(now, 0), Untyped::from("string1"), 1.0),
            row(hours_back(now, 1), Untyped::from("string1"), 1.0),
        ])
        .unwrap();
        db.flush().unwrap();
        assert_eq!(db.stats().intervals, 2);

        db.insert(&[
            row(hours_back(now, 1), Untyped::from("string1"), 1.0),
            row(hours_back(now, 2), Untyped::from("string1"), 1.0),
        ])
        .unwrap();
        db.flush().unwrap();
        assert_eq!(db.stats().intervals, 3);

        assert_same_rows(
            db.debug_rows().unwrap(),
            vec![
                unpacked(now as u64, Untyped::from("string1"), 1, 1),
                unpacked(now as u64 - 3600, Untyped::from("string1"), 2, 2),
                unpacked(now as u64 - 2 * 3600, Untyped::from("string1"), 1, 1),
            ],
        );
    }

    #[test]
    fn test_insert_drops_rows_out_of_retention() {
        let db = Database::open(
            test_schema(),
            DatabaseOptions::in_memory().retention_days(1),
        )
        .unwrap();
        let now = unix_now();

        let kept = row(hours_back(now, 22), Untyped::from("foo"), 1.0);
        let dropped = row(hours_back(now, 26), Untyped::from("bar"), 1.0);
        db.insert(&[kept, dropped]).unwrap();

        assert_same_rows(
            db.debug_rows().unwrap(),
            vec![unpacked(
                (now - 22 * 3600) as u64,
                Untyped::from("foo"),
                1,
                1,
            )],
        );
    }

    #[test]
    fn test_retention_boundary_is_inclusive() {
        let db = Database::open(
            test_schema(),
            DatabaseOptions::in_memory().retention_days(1),
        )
        .unwrap();
        let now = unix_now();
        let boundary = now - 24 * 3600;

        db.insert(&[
            row((boundary + 2) as f64, Untyped::from("kept"), 1.0),
            row((boundary - 2) as f64, Untyped::from("gone"), 1.0),
        ])
        .unwrap();

        let rows = db.debug_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row["dim1"], Untyped::from("kept"));
    }

    #[test]
    fn test_flush_drops_whole_intervals_out_of_retention() {
        // Rows inserted while retention was off age out of the store at the
        // first flush after the database is reopened with retention on.
        let dir = TempDir::new().unwrap();
        let now = unix_now();
        let db = Database::open(
            test_schema(),
            DatabaseOptions::disk_backed(dir.path()),
        )
        .unwrap();
        db.insert(&[
            row(hours_back(now, 36), Untyped::from("old"), 1.0),
            row(hours_back(now, 12), Untyped::from("new"), 1.0),
        ])
        .unwrap();
        db.flush().unwrap();
        assert_eq!(db.stats().intervals, 2);
        db.close().unwrap();
        drop(db);

        let db = Database::open(
            test_schema(),
            DatabaseOptions::disk_backed(dir.path()).retention_days(1),
        )
        .unwrap();
        assert_eq!(db.stats().intervals, 2);
        db.insert(&[row(hours_back(now, 12), Untyped::from("new"), 1.0)])
            .unwrap();
        db.flush().unwrap();

        assert_eq!(db.stats().intervals, 1);
        let rows = db.debug_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row["dim1"], Untyped::from("new"));
        assert_eq!(rows[0].count, 2);
    }

    #[test]
    fn test_insert_overflow_fails_batch() {
        let schema = Schema::new("at", 3600)
            .dimension(DimensionColumn::string("dim1", ColumnType::U8))
            .metric(MetricColumn::new("metric1", ColumnType::U8));
        let db = Database::open(schema, DatabaseOptions::in_memory()).unwrap();

        // 257 distinct values cannot fit a uint8 dimension table.
        let rows: Vec<RowMap> = (0..257)
            .map(|i| row(0.0, Untyped::from(i.to_string()), 1.0))
            .collect();
        assert!(matches!(
            db.insert(&rows),
            Err(EmberError::TypeRange(_))
        ));
        assert!(db.debug_rows().unwrap().is_empty());

        // A value out of the metric type's range fails too.
        assert!(matches!(
            db.insert(&[row(0.0, Untyped::from("0"), 1000.0)]),
            Err(EmberError::TypeRange(_))
        ));
    }

    #[test]
    fn test_collapse_overflow_fails_the_causing_insert() {
        let schema = Schema::new("at", 3600)
            .dimension(DimensionColumn::string("dim1", ColumnType::U8))
            .metric(MetricColumn::new("metric1", ColumnType::U8));
        let db = Database::open(schema, DatabaseOptions::in_memory()).unwrap();

        db.insert(&[
            row(0.0, Untyped::from("a"), 250.0),
            row(0.0, Untyped::from("a"), 3.0),
        ])
        .unwrap();
        assert!(matches!(
            db.insert(&[row(0.0, Untyped::from("a"), 5.0)]),
            Err(EmberError::TypeRange(_))
        ));

        let rows = db.debug_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row["metric1"], Untyped::UInt(253));
        assert_eq!(rows[0].count, 2);
    }

    #[test]
    fn test_unknown_column_fails_batch() {
        let db = make_test_db();
        let mut bad = row(0.0, Untyped::from("a"), 1.0);
        bad.insert("bogus".to_string(), Untyped::Int(1));
        assert!(matches!(
            db.insert(&[row(0.0, Untyped::from("a"), 1.0), bad]),
            Err(EmberError::SchemaMismatch(_))
        ));
        assert!(db.debug_rows().unwrap().is_empty());
    }

    #[test]
    fn test_inserting_same_batch_twice_doubles_counts() {
        let db = make_test_db();
        let batch = vec![
            row(0.0, Untyped::from("a"), 2.0),
            row(0.0, Untyped::from("b"), 3.0),
        ];
        db.insert(&batch).unwrap();
        db.flush().unwrap();
        db.insert(&batch).unwrap();

        assert_same_rows(
            db.debug_rows().unwrap(),
            vec![
                unpacked(0, Untyped::from("a"), 4, 2),
                unpacked(0, Untyped::from("b"), 6, 2),
            ],
        );
    }

    #[test]
    fn test_query_sees_only_flushed_rows() {
        let db = make_test_db();
        db.insert(&[row(0.0, Untyped::from("a"), 5.0)]).unwrap();

        let results = db.query(&sum_query()).unwrap();
        assert_eq!(results[0]["metric1"], Untyped::UInt(0));
        assert_eq!(results[0]["rowCount"], Untyped::UInt(0));

        db.flush().unwrap();
        let results = db.query(&sum_query()).unwrap();
        assert_eq!(results[0]["metric1"], Untyped::UInt(5));
        assert_eq!(results[0]["rowCount"], Untyped::UInt(1));
    }

    #[test]
    fn test_query_filters() {
        let db = make_test_db();
        db.insert(&[
            row(0.0, Untyped::from("string1"), 1.0),
            row(0.0, Untyped::from("string2"), 2.0),
        ])
        .unwrap();
        db.flush().unwrap();

        let eq = |column: &str, value: Untyped| {
            run_with_filter(&db, QueryFilter::new(FilterOp::Equal, column, value))
        };
        assert_eq!(eq("metric1", Untyped::Float(2.0)), Untyped::UInt(2));
        assert_eq!(eq("dim1", Untyped::from("string2")), Untyped::UInt(2));
        assert_eq!(eq("at", Untyped::Float(0.0)), Untyped::UInt(3));
        assert_eq!(eq("at", Untyped::Float(1.0)), Untyped::UInt(0));
        // These match zero rows.
        assert_eq!(eq("metric1", Untyped::Float(3.0)), Untyped::UInt(0));
        assert_eq!(eq("dim1", Untyped::from("non-existent")), Untyped::UInt(0));

        assert_eq!(
            run_with_filter(
                &db,
                QueryFilter::new(FilterOp::LessThan, "metric1", Untyped::Float(2.0))
            ),
            Untyped::UInt(1)
        );
        assert_eq!(
            run_with_filter(
                &db,
                QueryFilter::new(FilterOp::LessThan, "at", Untyped::Float(10.0))
            ),
            Untyped::UInt(3)
        );

        let within = |column: &str, values: Vec<Untyped>| {
            run_with_filter(&db, QueryFilter::within(column, values))
        };
        assert_eq!(within("metric1", vec![Untyped::Int(2)]), Untyped::UInt(2));
        assert_eq!(
            within("metric1", vec![Untyped::Int(2), Untyped::Int(1)]),
            Untyped::UInt(3)
        );
        assert_eq!(
            within("dim1", vec![Untyped::from("string1")]),
            Untyped::UInt(1)
        );
        assert_eq!(
            within(
                "at",
                vec![Untyped::Int(0), Untyped::Int(10), Untyped::Int(100)]
            ),
            Untyped::UInt(3)
        );
        assert_eq!(within("metric1", vec![Untyped::Int(3)]), Untyped::UInt(0));
        assert_eq!(
            within("dim1", vec![Untyped::from("non-existent")]),
            Untyped::UInt(0)
        );
    }

    #[test]
    fn test_group_by_string_column() {
        let db = make_test_db();
        db.insert(&[
            row(0.0, Untyped::from("string1"), 1.0),
            row(0.0, Untyped::from("string1"), 2.0),
            row(0.0, Untyped::from("string2"), 5.0),
        ])
        .unwrap();
        db.flush().unwrap();

        let mut query = sum_query();
        query.groupings = vec![QueryGrouping::new("dim1", "groupbykey")];
        let results = db.query(&query).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["groupbykey"], Untyped::from("string1"));
        assert_eq!(results[0]["metric1"], Untyped::UInt(3));
        assert_eq!(results[0]["rowCount"], Untyped::UInt(2));
        assert_eq!(results[1]["groupbykey"], Untyped::from("string2"));
        assert_eq!(results[1]["metric1"], Untyped::UInt(5));
        assert_eq!(results[1]["rowCount"], Untyped::UInt(1));
    }

    #[test]
    fn test_persistence_end_to_end() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(
            test_schema(),
            DatabaseOptions::disk_backed(dir.path()),
        )
        .unwrap();

        // 10000 inserts over 100 unique rows.
        let rows: Vec<RowMap> = (0..10000)
            .map(|i| row(0.0, Untyped::from((i % 100).to_string()), 1.0))
            .collect();
        db.insert(&rows).unwrap();
        db.flush().unwrap();

        assert_eq!(db.stats().static_rows, 100);
        let results = db.query(&sum_query()).unwrap();
        assert_eq!(results[0]["metric1"], Untyped::UInt(10000));
        let before = db.debug_rows().unwrap();
        db.close().unwrap();
        drop(db);

        // Reopen and query again.
        let db = Database::open(
            test_schema(),
            DatabaseOptions::disk_backed(dir.path()),
        )
        .unwrap();
        assert_eq!(db.stats().static_rows, 100);
        let results = db.query(&sum_query()).unwrap();
        assert_eq!(results[0]["metric1"], Untyped::UInt(10000));
        assert_same_rows(db.debug_rows().unwrap(), before);
    }

    #[test]
    fn test_old_generation_files_are_deleted() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(
            test_schema(),
            DatabaseOptions::disk_backed(dir.path()),
        )
        .unwrap();

        db.insert(&[row(0.0, Untyped::from("string1"), 1.0)]).unwrap();
        db.flush().unwrap();
        let first_gen = dir.path().join("interval.0.generation0000.segment0000.dat");
        assert!(first_gen.exists());

        db.insert(&[row(0.0, Untyped::from("string1"), 1.0)]).unwrap();
        db.flush().unwrap();
        assert!(!first_gen.exists());
        assert!(dir
            .path()
            .join("interval.0.generation0001.segment0000.dat")
            .exists());
        assert!(dir
            .path()
            .join("interval.0.generation0001.segment0000.counts")
            .exists());
    }

    #[test]
    fn test_flushing_empty_memtable_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(
            test_schema(),
            DatabaseOptions::disk_backed(dir.path()),
        )
        .unwrap();
        db.insert(&[row(0.0, Untyped::from("a"), 1.0)]).unwrap();
        db.flush().unwrap();

        db.flush().unwrap();
        // Generation numbers are untouched.
        assert!(dir
            .path()
            .join("interval.0.generation0000.segment0000.dat")
            .exists());
        assert!(!dir
            .path()
            .join("interval.0.generation0001.segment0000.dat")
            .exists());
    }

    #[test]
    fn test_untouched_intervals_keep_their_generation() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(
            test_schema(),
            DatabaseOptions::disk_backed(dir.path()),
        )
        .unwrap();
        db.insert(&[row(0.0, Untyped::from("a"), 1.0)]).unwrap();
        db.flush().unwrap();

        // A flush touching only another interval leaves this one alone.
        db.insert(&[row(7200.0, Untyped::from("a"), 1.0)]).unwrap();
        db.flush().unwrap();
        assert!(dir
            .path()
            .join("interval.0.generation0000.segment0000.dat")
            .exists());
        assert!(dir
            .path()
            .join("interval.7200.generation0000.segment0000.dat")
            .exists());
    }

    #[test]
    fn test_close_flushes_staged_rows() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(
            test_schema(),
            DatabaseOptions::disk_backed(dir.path()),
        )
        .unwrap();
        db.insert(&[row(0.0, Untyped::from("a"), 1.0)]).unwrap();
        db.close().unwrap();
        db.close().unwrap(); // idempotent
        drop(db);

        let db = Database::open(
            test_schema(),
            DatabaseOptions::disk_backed(dir.path()),
        )
        .unwrap();
        assert_eq!(db.stats().static_rows, 1);
    }

    #[test]
    fn test_schema_mismatch_on_reopen() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(
            test_schema(),
            DatabaseOptions::disk_backed(dir.path()),
        )
        .unwrap();
        db.insert(&[row(0.0, Untyped::from("a"), 1.0)]).unwrap();
        db.close().unwrap();
        drop(db);

        let other = Schema::new("at", 3600)
            .dimension(DimensionColumn::string("dim1", ColumnType::U16))
            .metric(MetricColumn::new("metric1", ColumnType::U32));
        assert!(matches!(
            Database::open(other, DatabaseOptions::disk_backed(dir.path())),
            Err(EmberError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_retention_survives_flush_and_reopen() {
        let dir = TempDir::new().unwrap();
        let now = unix_now();
        let options = || DatabaseOptions::disk_backed(dir.path()).retention_days(1);
        let db = Database::open(test_schema(), options()).unwrap();
        db.insert(&[
            row(hours_back(now, 22), Untyped::from("kept"), 1.0),
            row(hours_back(now, 26), Untyped::from("gone"), 1.0),
        ])
        .unwrap();
        assert_eq!(db.debug_rows().unwrap().len(), 1);
        db.close().unwrap();
        drop(db);

        let db = Database::open(test_schema(), options()).unwrap();
        let rows = db.debug_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row["dim1"], Untyped::from("kept"));
    }

    #[test]
    fn test_list_dimension() {
        let db = make_test_db();
        db.insert(&[
            row(0.0, Untyped::from("b-first"), 1.0),
            row(0.0, Untyped::from("a-second"), 1.0),
        ])
        .unwrap();

        // Values come back in id (first-observation) order, not sorted.
        assert_eq!(
            db.list_dimension("dim1").unwrap(),
            vec!["b-first".to_string(), "a-second".to_string()]
        );
        assert!(db.list_dimension("metric1").is_err());
        assert!(db.list_dimension("missing").is_err());
    }

    #[test]
    fn test_status() {
        let db = make_test_db();
        let status = db.status();
        assert_eq!(status.last_updated_unix, None);
        assert_eq!(status.oldest_interval_unix, None);

        db.insert(&[row(3600.0, Untyped::from("a"), 1.0)]).unwrap();
        assert!(db.status().last_updated_unix.is_some());

        db.flush().unwrap();
        assert_eq!(db.status().oldest_interval_unix, Some(3600));
    }

    #[test]
    fn test_background_flusher() {
        let db = Database::open(
            test_schema(),
            DatabaseOptions::in_memory().flush_every(Duration::from_secs(1)),
        )
        .unwrap();
        db.insert(&[row(0.0, Untyped::from("a"), 1.0)]).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while db.stats().static_rows == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(db.stats().static_rows, 1);
        db.close().unwrap();
    }

    #[test]
    fn test_concurrent_inserts_and_queries() {
        let db = Arc::new(make_test_db());
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        db.insert(&[row(
                            (i % 4) as f64 * 3600.0,
                            Untyped::from(format!("t{}", t)),
                            1.0,
                        )])
                        .unwrap();
                    }
                })
            })
            .collect();

        // Interleave flushes and queries with the writers.
        for _ in 0..10 {
            db.flush().unwrap();
            let results = db.query(&sum_query()).unwrap();
            assert!(results[0]["metric1"].as_f64().unwrap() <= 200.0);
        }
        for thread in threads {
            thread.join().unwrap();
        }

        db.flush().unwrap();
        let results = db.query(&sum_query()).unwrap();
        assert_eq!(results[0]["metric1"], Untyped::UInt(200));
    }

    #[test]
    fn test_options_validation() {
        assert!(matches!(
            Database::open(
                test_schema(),
                DatabaseOptions::in_memory().flush_every(Duration::from_millis(10)),
            ),
            Err(EmberError::Config(_))
        ));

        let mut options = DatabaseOptions::in_memory();
        options.fixed_retention = true;
        options.retention = Duration::from_secs(3600);
        assert!(matches!(
            Database::open(test_schema(), options),
            Err(EmberError::Config(_))
        ));
    }
}
