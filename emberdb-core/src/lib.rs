//! EmberDB Core - Embedded Time-Partitioned OLAP Store
//!
//! An append-only store for wide, fixed-schema event rows, optimized for:
//! - High-throughput insertion of millions of small typed rows
//! - Interactive group-by / filter / sum queries over time ranges
//! - Narrow packed rows via dictionary-encoded string dimensions
//!
//! # Architecture
//!
//! - **MemTable**: ordered in-memory staging; rows with identical
//!   (timestamp, dimensions) collapse at insert time
//! - **StaticTable**: the immutable published snapshot, one generation of
//!   fixed-size packed-row segments per time interval, memory-mapped when
//!   disk-backed
//! - **Flush**: merges the MemTable into the StaticTable, writes the next
//!   generation, and swaps the reader pointer atomically
//! - **Query engine**: compiles filters/groupings/aggregates into typed
//!   closures, then makes a single pass over each interval's packed bytes

pub mod codec;
pub mod dimension;
pub mod memtable;
pub mod query;
pub mod schema;
pub mod storage;

mod db;
mod error;
mod types;

pub use db::{Database, DatabaseOptions, DatabaseStats, Status};
pub use error::{EmberError, Result};
pub use query::{
    AggregateKind, CancelToken, FilterOp, Query, QueryAggregate, QueryFilter, QueryGrouping,
    TimeTruncation,
};
pub use schema::{ColumnRef, DimensionColumn, MetricColumn, RowLayout, Schema};
pub use types::{unix_now, RowMap, TimeRange, Timestamp, UnpackedRow, Untyped};

/// EmberDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values and validation thresholds
pub mod config {
    use std::time::Duration;

    /// Default maximum bytes per segment (1MB)
    pub const DEFAULT_SEGMENT_SIZE: usize = 1_000_000;

    /// Smallest allowed interval duration (1 minute)
    pub const MIN_INTERVAL_DURATION_SECS: u32 = 60;

    /// Smallest allowed background flush interval (1 second)
    pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

    /// Smallest allowed retention window (1 day)
    pub const MIN_RETENTION: Duration = Duration::from_secs(24 * 3600);
}
