//! MemTable: mutable insert staging
//!
//! One ordered map per interval, keyed by the row's collation key (which
//! excludes metric bytes). Collapsing is an O(log n) upsert: rows sharing a
//! key have their metrics pointwise-summed and their counts added. Iteration
//! order is the collation order, so flush can merge against stored segments
//! with a single pass.

use crate::error::{EmberError, Result};
use crate::schema::RowLayout;
use crate::types::Timestamp;
use std::collections::BTreeMap;

/// A staged row: full packed bytes plus the number of input rows collapsed
/// into it
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    pub row: Vec<u8>,
    pub count: u32,
}

/// Rows staged for one interval, in collation order
pub type IntervalRows = BTreeMap<Vec<u8>, StagedRow>;

/// In-memory staging for inserts between flushes
#[derive(Debug, Default)]
pub struct MemTable {
    intervals: BTreeMap<Timestamp, IntervalRows>,
    rows: usize,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct (collapsed) rows staged
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn intervals(&self) -> &BTreeMap<Timestamp, IntervalRows> {
        &self.intervals
    }

    /// Insert or collapse a packed row into its interval. Metric sums are
    /// checked; an overflow error leaves the caller to discard this table.
    pub fn upsert(
        &mut self,
        layout: &RowLayout,
        t0: Timestamp,
        key: Vec<u8>,
        row: Vec<u8>,
        count: u32,
    ) -> Result<()> {
        let interval = self.intervals.entry(t0).or_default();
        match interval.entry(key) {
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                let staged = entry.get_mut();
                layout.checked_sum_metrics(&mut staged.row, &row)?;
                staged.count = staged.count.checked_add(count).ok_or_else(|| {
                    EmberError::TypeRange("row count overflowed u32 while collapsing".into())
                })?;
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(StagedRow { row, count });
                self.rows += 1;
            }
        }
        Ok(())
    }

    /// Fold another table into this one with wrapping metric sums. Only used
    /// to restore staged rows after a failed flush, where the rows were
    /// already accepted and must not be dropped.
    pub fn absorb(&mut self, layout: &RowLayout, other: MemTable) {
        for (t0, rows) in other.intervals {
            let interval = self.intervals.entry(t0).or_default();
            for (key, staged) in rows {
                match interval.entry(key) {
                    std::collections::btree_map::Entry::Occupied(mut entry) => {
                        let existing = entry.get_mut();
                        layout.sum_metrics(&mut existing.row, &staged.row);
                        existing.count = existing.count.wrapping_add(staged.count);
                    }
                    std::collections::btree_map::Entry::Vacant(entry) => {
                        entry.insert(staged);
                        self.rows += 1;
                    }
                }
            }
        }
    }

    /// Merge a fully staged batch into this table. The merge is atomic: all
    /// collapsed sums are computed (and range-checked) before anything is
    /// written, so an overflow leaves this table untouched.
    pub fn merge_from(&mut self, layout: &RowLayout, staged: MemTable) -> Result<()> {
        let mut merged: Vec<(Timestamp, Vec<u8>, StagedRow)> = Vec::with_capacity(staged.len());
        for (t0, rows) in &staged.intervals {
            let existing_interval = self.intervals.get(t0);
            for (key, staged_row) in rows {
                let next = match existing_interval.and_then(|rows| rows.get(key)) {
                    Some(existing) => {
                        let mut row = existing.row.clone();
                        layout.checked_sum_metrics(&mut row, &staged_row.row)?;
                        let count = existing.count.checked_add(staged_row.count).ok_or_else(
                            || {
                                EmberError::TypeRange(
                                    "row count overflowed u32 while collapsing".into(),
                                )
                            },
                        )?;
                        StagedRow { row, count }
                    }
                    None => staged_row.clone(),
                };
                merged.push((*t0, key.clone(), next));
            }
        }
        for (t0, key, row) in merged {
            let interval = self.intervals.entry(t0).or_default();
            if interval.insert(key, row).is_none() {
                self.rows += 1;
            }
        }
        Ok(())
    }
}
