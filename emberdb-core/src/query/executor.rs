//! Query execution
//!
//! One strictly sequential pass over the packed bytes of each selected
//! interval: apply the compiled predicates, extract the group key, fold the
//! row into that group's accumulator. Intervals are independent, so they can
//! be scanned in parallel and their partial group containers merged.
//! Grouping keys that fit one unsigned byte use a dense 257-slot array (256
//! values plus the nil group); everything else uses a hash map keyed by the
//! canonical key bits.

use super::planner::QueryPlan;
use super::{CancelToken, ROW_COUNT_COLUMN};
use crate::codec;
use crate::dimension::{DimensionLookup, DimensionSnapshot};
use crate::error::{EmberError, Result};
use crate::storage::{Interval, StaticTable};
use crate::types::{RowMap, Untyped};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

/// One group's accumulator row and collapsed input-row count
#[derive(Debug, Clone)]
struct GroupSlot {
    acc: Vec<u8>,
    row_count: u64,
}

impl GroupSlot {
    fn new(acc_width: usize) -> Self {
        Self {
            acc: vec![0; acc_width],
            row_count: 0,
        }
    }
}

/// Per-scan group container
enum Grouper {
    /// Degenerate single group (no grouping requested)
    Single(GroupSlot),
    /// Dense container for one-byte keys; index 256 is the nil group
    Array(Vec<Option<GroupSlot>>),
    /// General container keyed by canonical key bits; `None` is the nil group
    Map(HashMap<Option<u64>, GroupSlot>),
}

const NIL_SLOT: usize = 256;

impl Grouper {
    fn new(plan: &QueryPlan) -> Self {
        match &plan.grouping {
            None => Grouper::Single(GroupSlot::new(plan.acc_width)),
            Some(group) if group.one_byte => Grouper::Array(vec![None; NIL_SLOT + 1]),
            Some(_) => Grouper::Map(HashMap::new()),
        }
    }

    fn update(&mut self, plan: &QueryPlan, row: &[u8], count: u32) {
        let slot = match self {
            Grouper::Single(slot) => slot,
            Grouper::Array(slots) => {
                let index = match plan.grouping.as_ref().map(|g| (g.extract)(row)) {
                    Some(Some(bits)) => bits as usize,
                    _ => NIL_SLOT,
                };
                slots[index].get_or_insert_with(|| GroupSlot::new(plan.acc_width))
            }
            Grouper::Map(map) => {
                let key = plan.grouping.as_ref().and_then(|g| (g.extract)(row));
                map.entry(key)
                    .or_insert_with(|| GroupSlot::new(plan.acc_width))
            }
        };
        for aggregate in &plan.aggregates {
            aggregate.apply(&mut slot.acc, row, count);
        }
        slot.row_count += count as u64;
    }

    fn merge(mut self, other: Grouper, plan: &QueryPlan) -> Grouper {
        fn merge_slot(plan: &QueryPlan, into: &mut GroupSlot, from: &GroupSlot) {
            for aggregate in &plan.aggregates {
                aggregate.merge(&mut into.acc, &from.acc);
            }
            into.row_count += from.row_count;
        }
        match (&mut self, other) {
            (Grouper::Single(a), Grouper::Single(b)) => merge_slot(plan, a, &b),
            (Grouper::Array(a), Grouper::Array(b)) => {
                for (index, slot) in b.into_iter().enumerate() {
                    if let Some(slot) = slot {
                        match &mut a[index] {
                            Some(existing) => merge_slot(plan, existing, &slot),
                            empty => *empty = Some(slot),
                        }
                    }
                }
            }
            (Grouper::Map(a), Grouper::Map(b)) => {
                for (key, slot) in b {
                    match a.get_mut(&key) {
                        Some(existing) => merge_slot(plan, existing, &slot),
                        None => {
                            a.insert(key, slot);
                        }
                    }
                }
            }
            // Construction from the same plan always yields matching shapes.
            _ => unreachable!("mismatched group containers"),
        }
        self
    }

    /// Drain into (key, slot) pairs; `None` keys are the nil group
    fn into_groups(self) -> Vec<(Option<u64>, GroupSlot)> {
        match self {
            Grouper::Single(_) => Vec::new(),
            Grouper::Array(slots) => slots
                .into_iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    let key = (index != NIL_SLOT).then_some(index as u64);
                    slot.map(|slot| (key, slot))
                })
                .collect(),
            Grouper::Map(map) => map.into_iter().collect(),
        }
    }
}

fn scan_interval(plan: &QueryPlan, interval: &Interval, row_width: usize) -> Grouper {
    let mut grouper = Grouper::new(plan);
    'rows: for (row, count) in interval.iter_rows(row_width) {
        for filter in &plan.filters {
            if !filter(row) {
                continue 'rows;
            }
        }
        grouper.update(plan, row, count);
    }
    grouper
}

/// Execute a compiled plan against a static table snapshot
pub fn execute(
    plan: &QueryPlan,
    table: &StaticTable,
    parallelism: usize,
    cancel: &CancelToken,
) -> Result<Vec<RowMap>> {
    let intervals = table.intervals_in_range(plan.time_range);
    let row_width = table.layout.row_width;

    let grouper = if parallelism > 1 && intervals.len() > 1 {
        parallel_scan(plan, &intervals, row_width, cancel)?
    } else {
        let mut grouper = Grouper::new(plan);
        for interval in &intervals {
            if cancel.is_cancelled() {
                return Err(EmberError::Cancelled);
            }
            grouper = grouper.merge(scan_interval(plan, interval, row_width), plan);
        }
        grouper
    };

    materialize(plan, grouper, &table.dimensions)
}

fn parallel_scan(
    plan: &QueryPlan,
    intervals: &[Arc<Interval>],
    row_width: usize,
    cancel: &CancelToken,
) -> Result<Grouper> {
    intervals
        .par_iter()
        .map(|interval| {
            if cancel.is_cancelled() {
                return Err(EmberError::Cancelled);
            }
            Ok(scan_interval(plan, interval, row_width))
        })
        .try_reduce(|| Grouper::new(plan), |a, b| Ok(a.merge(b, plan)))
}

fn materialize(
    plan: &QueryPlan,
    grouper: Grouper,
    dimensions: &DimensionSnapshot,
) -> Result<Vec<RowMap>> {
    let group = match &plan.grouping {
        None => {
            // Single-result queries return exactly one row, zero matches
            // included (typed zeros and rowCount 0).
            let Grouper::Single(slot) = grouper else {
                unreachable!("ungrouped plan built a grouped container")
            };
            return Ok(vec![materialize_slot(plan, None, &slot, None, dimensions)?]);
        }
        Some(group) => group,
    };

    let mut groups = grouper.into_groups();
    groups.sort_by(|(a, _), (b, _)| match (a, b) {
        // Nil sorts after every value.
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (Some(_), None) => std::cmp::Ordering::Less,
        (Some(a), Some(b)) => codec::compare_key_bits(group.ty, *a, *b),
    });

    groups
        .into_iter()
        .map(|(key, slot)| materialize_slot(plan, Some(key), &slot, Some(group), dimensions))
        .collect()
}

fn materialize_slot(
    plan: &QueryPlan,
    key: Option<Option<u64>>,
    slot: &GroupSlot,
    group: Option<&super::planner::GroupPlan>,
    dimensions: &DimensionSnapshot,
) -> Result<RowMap> {
    let mut row = RowMap::new();
    if let (Some(key), Some(group)) = (key, group) {
        let value = match key {
            None => Untyped::Null,
            Some(bits) => match group.string_dim {
                Some(dim) => {
                    let value = dimensions.value(dim, bits).ok_or_else(|| {
                        EmberError::Corruption(format!(
                            "group key references unknown id {} in dimension {:?}",
                            bits, group.name
                        ))
                    })?;
                    Untyped::Str(value.to_string())
                }
                None => codec::key_bits_to_untyped(group.ty, bits),
            },
        };
        row.insert(group.name.clone(), value);
    }
    for aggregate in &plan.aggregates {
        row.insert(aggregate.name.clone(), aggregate.materialize(&slot.acc));
    }
    row.insert(ROW_COUNT_COLUMN.to_string(), Untyped::UInt(slot.row_count));
    Ok(row)
}
