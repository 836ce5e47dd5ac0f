//! Schema definition and packed row layout
//!
//! A schema names one u32 timestamp column, a set of (optionally
//! string-backed) dimension columns and a set of metric columns. The derived
//! [`RowLayout`] fixes the byte width of a packed row and the offset of every
//! column for the lifetime of the database:
//!
//! ```text
//! [nil bitmap][timestamp][dimensions...][metrics...]
//! ```
//!
//! The nil bitmap covers the dimension columns in declaration order; metrics
//! and the timestamp are never nullable.

use crate::codec::{self, ColumnType};
use crate::dimension::{DimensionLookup, DimensionSet};
use crate::error::{EmberError, Result};
use crate::types::{RowMap, Timestamp, Untyped};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A dimension column: nullable, optionally dictionary-encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    /// When set, row storage is an unsigned id into the column's dimension
    /// table rather than a native value
    #[serde(default)]
    pub string_backed: bool,
}

impl DimensionColumn {
    /// A dimension stored as a native numeric value
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            string_backed: false,
        }
    }

    /// A string dimension interned to ids of the given unsigned width
    pub fn string(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            string_backed: true,
        }
    }
}

/// A metric column: native numeric, non-nullable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
}

impl MetricColumn {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Database schema, fixed at open time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Name of the u32 Unix-seconds timestamp column
    pub timestamp_column: String,
    pub dimension_columns: Vec<DimensionColumn>,
    pub metric_columns: Vec<MetricColumn>,
    /// Time bucket size in seconds
    pub interval_duration_secs: u32,
    /// Maximum bytes per segment
    pub segment_size: usize,
}

impl Schema {
    pub fn new(timestamp_column: impl Into<String>, interval_duration_secs: u32) -> Self {
        Self {
            timestamp_column: timestamp_column.into(),
            dimension_columns: Vec::new(),
            metric_columns: Vec::new(),
            interval_duration_secs,
            segment_size: crate::config::DEFAULT_SEGMENT_SIZE,
        }
    }

    /// Add a dimension column
    pub fn dimension(mut self, column: DimensionColumn) -> Self {
        self.dimension_columns.push(column);
        self
    }

    /// Add a metric column
    pub fn metric(mut self, column: MetricColumn) -> Self {
        self.metric_columns.push(column);
        self
    }

    /// Set the segment size in bytes
    pub fn segment_size(mut self, bytes: usize) -> Self {
        self.segment_size = bytes;
        self
    }

    /// Validate schema shape and thresholds
    pub fn validate(&self) -> Result<()> {
        if self.interval_duration_secs < crate::config::MIN_INTERVAL_DURATION_SECS {
            return Err(EmberError::Config(format!(
                "interval duration is too short: {}s",
                self.interval_duration_secs
            )));
        }
        if self.segment_size == 0 {
            return Err(EmberError::Config("segment size must be non-zero".into()));
        }
        if self.metric_columns.is_empty() {
            return Err(EmberError::Config(
                "schema must include at least one metric column".into(),
            ));
        }
        let mut names = vec![self.timestamp_column.as_str()];
        for col in &self.dimension_columns {
            if col.string_backed
                && !matches!(col.ty, ColumnType::U8 | ColumnType::U16 | ColumnType::U32)
            {
                return Err(EmberError::Config(format!(
                    "string dimension {:?} must use uint8, uint16, or uint32 ids",
                    col.name
                )));
            }
            names.push(&col.name);
        }
        for col in &self.metric_columns {
            names.push(&col.name);
        }
        let mut seen = std::collections::HashSet::new();
        for name in names {
            if !seen.insert(name) {
                return Err(EmberError::Config(format!("duplicate column name {:?}", name)));
            }
        }
        Ok(())
    }
}

/// Where a named column lives in the row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRef {
    Timestamp,
    Dimension(usize),
    Metric(usize),
}

/// Byte layout of one dimension column
#[derive(Debug, Clone)]
pub struct DimLayout {
    pub name: String,
    pub ty: ColumnType,
    pub string_backed: bool,
    pub offset: usize,
    pub nil_offset: usize,
    pub nil_mask: u8,
}

/// Byte layout of one metric column
#[derive(Debug, Clone)]
pub struct MetricLayout {
    pub name: String,
    pub ty: ColumnType,
    pub offset: usize,
}

/// The compiled schema: fixed row width and per-column offsets
#[derive(Debug)]
pub struct RowLayout {
    pub schema: Schema,
    pub row_width: usize,
    pub nil_bytes: usize,
    pub ts_offset: usize,
    pub dims: Vec<DimLayout>,
    pub metrics: Vec<MetricLayout>,
    /// Width of the collation key: big-endian timestamp plus a (nil flag,
    /// value bytes) pair per dimension
    pub key_width: usize,
    columns: HashMap<String, ColumnRef>,
}

impl RowLayout {
    pub fn new(schema: Schema) -> Result<Self> {
        schema.validate()?;

        let nil_bytes = (schema.dimension_columns.len() + 7) / 8;
        let ts_offset = nil_bytes;
        let mut offset = ts_offset + ColumnType::U32.width();
        let mut key_width = std::mem::size_of::<Timestamp>();

        let mut columns = HashMap::new();
        columns.insert(schema.timestamp_column.clone(), ColumnRef::Timestamp);

        let mut dims = Vec::with_capacity(schema.dimension_columns.len());
        for (i, col) in schema.dimension_columns.iter().enumerate() {
            dims.push(DimLayout {
                name: col.name.clone(),
                ty: col.ty,
                string_backed: col.string_backed,
                offset,
                nil_offset: i / 8,
                nil_mask: 1 << (i % 8),
            });
            columns.insert(col.name.clone(), ColumnRef::Dimension(i));
            offset += col.ty.width();
            key_width += 1 + col.ty.width();
        }

        let mut metrics = Vec::with_capacity(schema.metric_columns.len());
        for (i, col) in schema.metric_columns.iter().enumerate() {
            metrics.push(MetricLayout {
                name: col.name.clone(),
                ty: col.ty,
                offset,
            });
            columns.insert(col.name.clone(), ColumnRef::Metric(i));
            offset += col.ty.width();
        }

        Ok(Self {
            schema,
            row_width: offset,
            nil_bytes,
            ts_offset,
            dims,
            metrics,
            key_width,
            columns,
        })
    }

    /// Resolve a column name
    pub fn column(&self, name: &str) -> Option<ColumnRef> {
        self.columns.get(name).copied()
    }

    /// Interval duration in seconds
    pub fn interval_duration(&self) -> u32 {
        self.schema.interval_duration_secs
    }

    /// Bucket start for a timestamp
    pub fn bucket(&self, ts: Timestamp) -> Timestamp {
        ts - ts % self.schema.interval_duration_secs
    }

    /// Packed rows per segment
    pub fn rows_per_segment(&self) -> usize {
        (self.schema.segment_size / self.row_width).max(1)
    }

    pub fn timestamp(&self, row: &[u8]) -> Timestamp {
        codec::read_key_bits(row, self.ts_offset, ColumnType::U32) as Timestamp
    }

    pub fn is_nil(&self, row: &[u8], dim: usize) -> bool {
        let d = &self.dims[dim];
        row[d.nil_offset] & d.nil_mask != 0
    }

    /// Validate that every key in the row map names a schema column
    pub fn check_columns(&self, row: &RowMap) -> Result<()> {
        for name in row.keys() {
            if !self.columns.contains_key(name) {
                return Err(EmberError::SchemaMismatch(format!(
                    "unknown column {:?}",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Extract and range-check the timestamp of an untyped row
    pub fn row_timestamp(&self, row: &RowMap) -> Result<Timestamp> {
        let value = row.get(&self.schema.timestamp_column).ok_or_else(|| {
            EmberError::SchemaMismatch(format!(
                "missing timestamp column {:?}",
                self.schema.timestamp_column
            ))
        })?;
        let ts = value.as_f64().ok_or_else(|| {
            EmberError::SchemaMismatch(format!(
                "timestamp column {:?} must be numeric",
                self.schema.timestamp_column
            ))
        })?;
        if !ColumnType::U32.in_range(ts) {
            return Err(EmberError::TypeRange(format!(
                "timestamp {} out of uint32 range",
                ts
            )));
        }
        Ok(ts as Timestamp)
    }

    /// Pack an untyped row into its fixed-width byte form, interning string
    /// dimension values as needed
    pub fn pack_row(&self, row: &RowMap, dims: &mut DimensionSet) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; self.row_width];
        let ts = self.row_timestamp(row)?;
        codec::write_id(&mut bytes, self.ts_offset, ColumnType::U32, ts as u64);

        for (i, dim) in self.dims.iter().enumerate() {
            match row.get(&dim.name) {
                None | Some(Untyped::Null) => bytes[dim.nil_offset] |= dim.nil_mask,
                Some(Untyped::Str(s)) => {
                    if !dim.string_backed {
                        return Err(EmberError::SchemaMismatch(format!(
                            "column {:?} does not accept string values",
                            dim.name
                        )));
                    }
                    let id = dims.intern(i, s)?;
                    codec::write_id(&mut bytes, dim.offset, dim.ty, id);
                }
                Some(value) => {
                    if dim.string_backed {
                        return Err(EmberError::SchemaMismatch(format!(
                            "column {:?} expects a string value, got {}",
                            dim.name, value
                        )));
                    }
                    let v = value.as_f64().ok_or_else(|| {
                        EmberError::SchemaMismatch(format!(
                            "column {:?} expects a numeric value",
                            dim.name
                        ))
                    })?;
                    if !dim.ty.in_range(v) {
                        return Err(EmberError::TypeRange(format!(
                            "value {} out of range for {} column {:?}",
                            v,
                            dim.ty.name(),
                            dim.name
                        )));
                    }
                    codec::write_f64(&mut bytes, dim.offset, dim.ty, v);
                }
            }
        }

        for metric in &self.metrics {
            let value = row.get(&metric.name).ok_or_else(|| {
                EmberError::SchemaMismatch(format!("missing metric column {:?}", metric.name))
            })?;
            let v = value.as_f64().ok_or_else(|| {
                EmberError::SchemaMismatch(format!(
                    "metric column {:?} expects a numeric value, got {}",
                    metric.name, value
                ))
            })?;
            if !metric.ty.in_range(v) {
                return Err(EmberError::TypeRange(format!(
                    "value {} out of range for {} column {:?}",
                    v,
                    metric.ty.name(),
                    metric.name
                )));
            }
            codec::write_f64(&mut bytes, metric.offset, metric.ty, v);
        }

        Ok(bytes)
    }

    /// Unpack a stored row back into caller-visible form
    pub fn unpack_row(&self, row: &[u8], dims: &impl DimensionLookup) -> Result<RowMap> {
        let mut map = RowMap::new();
        map.insert(
            self.schema.timestamp_column.clone(),
            Untyped::UInt(self.timestamp(row) as u64),
        );
        for (i, dim) in self.dims.iter().enumerate() {
            let value = if self.is_nil(row, i) {
                Untyped::Null
            } else if dim.string_backed {
                let id = codec::read_key_bits(row, dim.offset, dim.ty);
                let value = dims.value(i, id).ok_or_else(|| {
                    EmberError::Corruption(format!(
                        "row references unknown id {} in dimension {:?}",
                        id, dim.name
                    ))
                })?;
                Untyped::Str(value.to_string())
            } else {
                codec::read_untyped(row, dim.offset, dim.ty)
            };
            map.insert(dim.name.clone(), value);
        }
        for metric in &self.metrics {
            map.insert(
                metric.name.clone(),
                codec::read_untyped(row, metric.offset, metric.ty),
            );
        }
        Ok(map)
    }

    /// The collation key: big-endian timestamp, then a (nil flag, value
    /// bytes) pair per dimension. Byte-lexicographic order of these keys is
    /// the row order everywhere in the engine, and sorts nil after every
    /// value of the same dimension.
    pub fn collation_key(&self, row: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.key_width);
        key.extend_from_slice(&self.timestamp(row).to_be_bytes());
        for (i, dim) in self.dims.iter().enumerate() {
            key.push(self.is_nil(row, i) as u8);
            key.extend_from_slice(&row[dim.offset..dim.offset + dim.ty.width()]);
        }
        key
    }

    /// Pointwise-sum the metric cells of `src` into `dst`, wrapping on
    /// integer overflow
    pub fn sum_metrics(&self, dst: &mut [u8], src: &[u8]) {
        for metric in &self.metrics {
            codec::sum_into(metric.ty, dst, metric.offset, src, metric.offset);
        }
    }

    /// Checked variant of [`Self::sum_metrics`]. On overflow `dst` may be
    /// partially updated; callers discard the buffer on error.
    pub fn checked_sum_metrics(&self, dst: &mut [u8], src: &[u8]) -> Result<()> {
        for metric in &self.metrics {
            if !codec::checked_sum_into(metric.ty, dst, metric.offset, src, metric.offset) {
                return Err(EmberError::TypeRange(format!(
                    "metric column {:?} overflowed {} while collapsing rows",
                    metric.name,
                    metric.ty.name()
                )));
            }
        }
        Ok(())
    }
}
