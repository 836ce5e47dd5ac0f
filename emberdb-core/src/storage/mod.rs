//! Segments, intervals, and static tables
//!
//! Storage is columnar at the interval level and row-oriented within an
//! interval: each interval owns a generation number and a list of fixed-size
//! segments of packed rows, with a parallel u32 count per row. A disk-backed
//! database keeps segments in files named
//! `interval.<t0>.generation<NNNN>.segment<MMMM>.dat` (rows) and `.counts`
//! (counts), memory-mapped read-only. An in-memory database keeps the same
//! buffers on the heap.

mod interval;
mod loader;
mod static_table;
mod writer;

pub use interval::Interval;
pub use loader::{load_database, LoadedDatabase};
pub use static_table::StaticTable;
pub use writer::{remove_generation, sync_dir, write_dimensions, write_interval, write_metadata};

use crate::schema::Schema;
use crate::types::Timestamp;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata file name inside the database directory
pub const METADATA_FILE: &str = "metadata.json";
/// Temporary name the metadata file is written to before the atomic rename
pub const METADATA_TMP_FILE: &str = "metadata.json.tmp";

/// Data file name for one segment of one interval generation
pub fn segment_data_file(t0: Timestamp, generation: u64, segment: usize) -> String {
    format!(
        "interval.{}.generation{:04}.segment{:04}.dat",
        t0, generation, segment
    )
}

/// Counts file name for one segment of one interval generation
pub fn segment_counts_file(t0: Timestamp, generation: u64, segment: usize) -> String {
    format!(
        "interval.{}.generation{:04}.segment{:04}.counts",
        t0, generation, segment
    )
}

/// Dimension table file name for a string-backed column
pub fn dimension_file(column: &str) -> String {
    format!("dimension.{}.dat", column)
}

/// A parsed segment file name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentFileName {
    pub t0: Timestamp,
    pub generation: u64,
    pub segment: usize,
    pub counts: bool,
}

/// Parse a segment or counts file name; returns None for unrelated files
pub fn parse_segment_file(name: &str) -> Option<SegmentFileName> {
    let mut parts = name.split('.');
    if parts.next()? != "interval" {
        return None;
    }
    let t0 = parts.next()?.parse().ok()?;
    let generation = parts.next()?.strip_prefix("generation")?.parse().ok()?;
    let segment = parts.next()?.strip_prefix("segment")?.parse().ok()?;
    let counts = match parts.next()? {
        "dat" => false,
        "counts" => true,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(SegmentFileName {
        t0,
        generation,
        segment,
        counts,
    })
}

/// Backing storage for a segment buffer: heap for in-memory databases,
/// read-only mapping for disk-backed ones
#[derive(Debug)]
enum SegmentBuf {
    Heap(Vec<u8>),
    Mapped(Mmap),
}

impl AsRef<[u8]> for SegmentBuf {
    fn as_ref(&self) -> &[u8] {
        match self {
            SegmentBuf::Heap(v) => v,
            SegmentBuf::Mapped(m) => m,
        }
    }
}

/// A fixed-size array of whole packed rows plus the parallel per-row counts
#[derive(Debug)]
pub struct Segment {
    data: SegmentBuf,
    counts: SegmentBuf,
    rows: usize,
}

impl Segment {
    pub fn in_memory(data: Vec<u8>, counts: Vec<u8>, rows: usize) -> Self {
        Self {
            data: SegmentBuf::Heap(data),
            counts: SegmentBuf::Heap(counts),
            rows,
        }
    }

    pub fn mapped(data: Mmap, counts: Mmap, rows: usize) -> Self {
        Self {
            data: SegmentBuf::Mapped(data),
            counts: SegmentBuf::Mapped(counts),
            rows,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// The packed row bytes, `rows * row_width` long
    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// The raw little-endian count bytes, `rows * 4` long
    pub fn counts_bytes(&self) -> &[u8] {
        self.counts.as_ref()
    }

    /// Collapse count of the i-th row
    pub fn count(&self, row: usize) -> u32 {
        let bytes = self.counts.as_ref();
        let offset = row * 4;
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }
}

/// Per-interval entry in the metadata file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalMeta {
    pub start: Timestamp,
    pub generation: u64,
    pub segments: usize,
    pub rows: usize,
}

/// The metadata file: schema, current interval generations, and dimension
/// table file names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub schema: Schema,
    pub intervals: Vec<IntervalMeta>,
    pub dimension_files: BTreeMap<String, String>,
}
