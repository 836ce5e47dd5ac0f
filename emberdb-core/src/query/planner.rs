//! Query compilation
//!
//! Validates a query against the schema and compiles it into typed closures
//! over packed rows: one boolean predicate per filter, a group-key extractor,
//! and one accumulate op per aggregate. Each closure is specialized once per
//! (column type, operator) at plan time so the scan loop never branches on
//! types.

use super::{AggregateKind, FilterOp, Query, QueryFilter, QueryGrouping, TimeTruncation};
use crate::codec::{self, with_column_type, ColumnType, RowValue};
use crate::dimension::DimensionSnapshot;
use crate::error::{EmberError, Result};
use crate::schema::{ColumnRef, RowLayout};
use crate::types::{TimeRange, Untyped};

/// A compiled filter predicate
pub type FilterFn = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// A compiled group-key extractor; `None` is the nil group
pub type GroupKeyFn = Box<dyn Fn(&[u8]) -> Option<u64> + Send + Sync>;

/// A compiled, executable query
pub struct QueryPlan {
    pub time_range: Option<TimeRange>,
    pub filters: Vec<FilterFn>,
    pub grouping: Option<GroupPlan>,
    pub aggregates: Vec<AggregatePlan>,
    /// Byte width of one group's accumulator row
    pub acc_width: usize,
}

/// The (at most one) grouping of a plan
pub struct GroupPlan {
    pub name: String,
    pub ty: ColumnType,
    /// Dimension index when the grouping column is string-backed, for
    /// id → string materialization
    pub string_dim: Option<usize>,
    pub extract: GroupKeyFn,
    /// Keys fit one unsigned byte; the executor uses the dense container
    pub one_byte: bool,
}

/// How one aggregate updates its accumulator slot
pub enum AggregateOp {
    /// Pointwise sum of a metric cell, in the metric's own type
    Sum { ty: ColumnType, row_offset: usize },
    /// Sum of collapse counts, in a u64 slot
    Count,
}

/// One compiled aggregate
pub struct AggregatePlan {
    pub name: String,
    pub op: AggregateOp,
    pub acc_offset: usize,
}

impl AggregatePlan {
    pub fn slot_width(&self) -> usize {
        match &self.op {
            AggregateOp::Sum { ty, .. } => ty.width(),
            AggregateOp::Count => 8,
        }
    }

    /// Fold one matching row into the accumulator
    pub fn apply(&self, acc: &mut [u8], row: &[u8], count: u32) {
        match &self.op {
            AggregateOp::Sum { ty, row_offset } => {
                codec::sum_into(*ty, acc, self.acc_offset, row, *row_offset);
            }
            AggregateOp::Count => {
                let sum = u64::read(acc, self.acc_offset).wrapping_add(count as u64);
                sum.write(acc, self.acc_offset);
            }
        }
    }

    /// Fold another accumulator for the same group into this one
    pub fn merge(&self, acc: &mut [u8], other: &[u8]) {
        match &self.op {
            AggregateOp::Sum { ty, .. } => {
                codec::sum_into(*ty, acc, self.acc_offset, other, self.acc_offset);
            }
            AggregateOp::Count => {
                let sum = u64::read(acc, self.acc_offset).wrapping_add(u64::read(other, self.acc_offset));
                sum.write(acc, self.acc_offset);
            }
        }
    }

    /// Convert the accumulator slot to its output value
    pub fn materialize(&self, acc: &[u8]) -> Untyped {
        match &self.op {
            AggregateOp::Sum { ty, .. } => codec::read_untyped(acc, self.acc_offset, *ty),
            AggregateOp::Count => Untyped::UInt(u64::read(acc, self.acc_offset)),
        }
    }
}

/// Compile a query against the schema and a dimension snapshot
pub fn plan(
    query: &Query,
    layout: &RowLayout,
    dimensions: &DimensionSnapshot,
) -> Result<QueryPlan> {
    let mut aggregates = Vec::with_capacity(query.aggregates.len());
    let mut acc_width = 0;
    for aggregate in &query.aggregates {
        let column = layout.column(&aggregate.column).ok_or_else(|| {
            EmberError::InvalidQuery(format!(
                "unknown column {:?} in aggregate",
                aggregate.column
            ))
        })?;
        let op = match aggregate.kind {
            AggregateKind::Average => {
                return Err(EmberError::InvalidQuery(
                    "average aggregates are not supported; request sum and rowCount instead"
                        .into(),
                ))
            }
            AggregateKind::Count => AggregateOp::Count,
            AggregateKind::Sum => match column {
                ColumnRef::Metric(i) => {
                    let metric = &layout.metrics[i];
                    AggregateOp::Sum {
                        ty: metric.ty,
                        row_offset: metric.offset,
                    }
                }
                _ => {
                    return Err(EmberError::InvalidQuery(format!(
                        "sum aggregates apply to metric columns, not {:?}",
                        aggregate.column
                    )))
                }
            },
        };
        let plan = AggregatePlan {
            name: aggregate.name.clone(),
            op,
            acc_offset: acc_width,
        };
        acc_width += plan.slot_width();
        aggregates.push(plan);
    }

    if query.groupings.len() > 1 {
        return Err(EmberError::InvalidQuery(
            "at most one grouping is supported".into(),
        ));
    }
    let grouping = query
        .groupings
        .first()
        .map(|g| compile_grouping(g, layout))
        .transpose()?;

    let filters = query
        .filters
        .iter()
        .map(|f| compile_filter(f, layout, dimensions))
        .collect::<Result<Vec<_>>>()?;

    Ok(QueryPlan {
        time_range: query.time_range,
        filters,
        grouping,
        aggregates,
        acc_width,
    })
}

fn compile_grouping(grouping: &QueryGrouping, layout: &RowLayout) -> Result<GroupPlan> {
    let column = layout.column(&grouping.column).ok_or_else(|| {
        EmberError::InvalidQuery(format!("unknown column {:?} in grouping", grouping.column))
    })?;
    let truncation = grouping.time_truncation.seconds();

    let (ty, offset, nil, string_dim) = match column {
        ColumnRef::Timestamp => (ColumnType::U32, layout.ts_offset, None, None),
        ColumnRef::Dimension(i) => {
            let dim = &layout.dims[i];
            (
                dim.ty,
                dim.offset,
                Some((dim.nil_offset, dim.nil_mask)),
                dim.string_backed.then_some(i),
            )
        }
        ColumnRef::Metric(i) => {
            let metric = &layout.metrics[i];
            (metric.ty, metric.offset, None, None)
        }
    };
    if truncation.is_some() && (!ty.is_unsigned() || string_dim.is_some()) {
        return Err(EmberError::InvalidQuery(format!(
            "time truncation requires an unsigned integer column, {:?} is {}",
            grouping.column,
            if string_dim.is_some() { "a string dimension" } else { ty.name() }
        )));
    }

    let extract: GroupKeyFn = with_column_type!(ty, T => {
        match (truncation, nil) {
            (None, None) => Box::new(move |row: &[u8]| Some(T::read(row, offset).to_key_bits())),
            (Some(k), None) => Box::new(move |row: &[u8]| {
                let v = T::read(row, offset).to_key_bits();
                Some(v - v % k)
            }),
            (None, Some((nil_offset, nil_mask))) => Box::new(move |row: &[u8]| {
                if row[nil_offset] & nil_mask != 0 {
                    None
                } else {
                    Some(T::read(row, offset).to_key_bits())
                }
            }),
            (Some(k), Some((nil_offset, nil_mask))) => Box::new(move |row: &[u8]| {
                if row[nil_offset] & nil_mask != 0 {
                    None
                } else {
                    let v = T::read(row, offset).to_key_bits();
                    Some(v - v % k)
                }
            }),
        }
    });

    Ok(GroupPlan {
        name: grouping.name.clone(),
        ty,
        string_dim,
        extract,
        one_byte: ty == ColumnType::U8 && truncation.is_none(),
    })
}

fn compile_filter(
    filter: &QueryFilter,
    layout: &RowLayout,
    dimensions: &DimensionSnapshot,
) -> Result<FilterFn> {
    let column = layout.column(&filter.column).ok_or_else(|| {
        EmberError::InvalidQuery(format!("unknown column {:?} in filter", filter.column))
    })?;
    match column {
        ColumnRef::Timestamp => {
            compile_numeric_filter(filter, ColumnType::U32, layout.ts_offset, None)
        }
        ColumnRef::Metric(i) => {
            let metric = &layout.metrics[i];
            compile_numeric_filter(filter, metric.ty, metric.offset, None)
        }
        ColumnRef::Dimension(i) => {
            let dim = &layout.dims[i];
            let nil = Some((dim.nil_offset, dim.nil_mask));
            if dim.string_backed {
                compile_string_filter(filter, dim.ty, dim.offset, nil, i, dimensions)
            } else {
                compile_numeric_filter(filter, dim.ty, dim.offset, nil)
            }
        }
    }
}

fn always(result: bool) -> FilterFn {
    Box::new(move |_| result)
}

fn compile_numeric_filter(
    filter: &QueryFilter,
    ty: ColumnType,
    offset: usize,
    nil: Option<(usize, u8)>,
) -> Result<FilterFn> {
    if filter.op == FilterOp::In {
        let mut accept_nil = false;
        let mut targets = Vec::with_capacity(filter.values.len());
        for value in &filter.values {
            match value {
                Untyped::Null => {
                    if nil.is_none() {
                        return Err(EmberError::InvalidQuery(format!(
                            "column {:?} is not nullable",
                            filter.column
                        )));
                    }
                    accept_nil = true;
                }
                other => {
                    let v = other.as_f64().ok_or_else(|| {
                        EmberError::InvalidQuery(format!(
                            "column {:?} expects numeric filter values",
                            filter.column
                        ))
                    })?;
                    targets.push(v);
                }
            }
        }
        return Ok(with_column_type!(ty, T => {
            let targets: Vec<T> = targets.iter().map(|&v| T::from_f64(v)).collect();
            make_in_filter::<T>(targets, accept_nil, offset, nil)
        }));
    }

    if filter.value.is_null() {
        return compile_nil_filter(filter, nil);
    }
    let v = filter.value.as_f64().ok_or_else(|| {
        EmberError::InvalidQuery(format!(
            "column {:?} expects a numeric filter value, got {}",
            filter.column, filter.value
        ))
    })?;
    Ok(with_column_type!(ty, T => {
        make_compare_filter::<T>(filter.op, T::from_f64(v), offset, nil)
    }))
}

fn compile_string_filter(
    filter: &QueryFilter,
    ty: ColumnType,
    offset: usize,
    nil: Option<(usize, u8)>,
    dim: usize,
    dimensions: &DimensionSnapshot,
) -> Result<FilterFn> {
    if filter.op == FilterOp::In {
        let mut accept_nil = false;
        let mut ids = Vec::with_capacity(filter.values.len());
        for value in &filter.values {
            match value {
                Untyped::Null => accept_nil = true,
                Untyped::Str(s) => {
                    // A value this table has never seen matches no row.
                    if let Some(id) = dimensions.resolve(dim, s) {
                        ids.push(id);
                    }
                }
                other => {
                    return Err(EmberError::InvalidQuery(format!(
                        "column {:?} expects string filter values, got {}",
                        filter.column, other
                    )))
                }
            }
        }
        return Ok(with_column_type!(ty, T => {
            let targets: Vec<T> = ids.iter().map(|&id| T::from_key_bits(id)).collect();
            make_in_filter::<T>(targets, accept_nil, offset, nil)
        }));
    }

    if filter.value.is_null() {
        return compile_nil_filter(filter, nil);
    }
    let value = match &filter.value {
        Untyped::Str(s) => s,
        other => {
            return Err(EmberError::InvalidQuery(format!(
                "column {:?} expects a string filter value, got {}",
                filter.column, other
            )))
        }
    };
    match dimensions.resolve(dim, value) {
        Some(id) => Ok(with_column_type!(ty, T => {
            make_compare_filter::<T>(filter.op, T::from_key_bits(id), offset, nil)
        })),
        // Unknown string: equality can never hold, inequality always does
        // (nil rows included, per the nil truth table).
        None => Ok(always(filter.op == FilterOp::NotEqual)),
    }
}

/// Filters comparing a nullable column against nil itself
fn compile_nil_filter(filter: &QueryFilter, nil: Option<(usize, u8)>) -> Result<FilterFn> {
    let (nil_offset, nil_mask) = nil.ok_or_else(|| {
        EmberError::InvalidQuery(format!("column {:?} is not nullable", filter.column))
    })?;
    match filter.op {
        FilterOp::Equal => Ok(Box::new(move |row| row[nil_offset] & nil_mask != 0)),
        FilterOp::NotEqual => Ok(Box::new(move |row| row[nil_offset] & nil_mask == 0)),
        op => Err(EmberError::InvalidQuery(format!(
            "operator {} cannot compare against null",
            op
        ))),
    }
}

fn make_compare_filter<T: RowValue>(
    op: FilterOp,
    target: T,
    offset: usize,
    nil: Option<(usize, u8)>,
) -> FilterFn {
    // Nil truth table: nil rows satisfy != and nothing else.
    match (op, nil) {
        (FilterOp::Equal, None) => Box::new(move |row| T::read(row, offset) == target),
        (FilterOp::Equal, Some((no, mask))) => {
            Box::new(move |row| row[no] & mask == 0 && T::read(row, offset) == target)
        }
        (FilterOp::NotEqual, None) => Box::new(move |row| T::read(row, offset) != target),
        (FilterOp::NotEqual, Some((no, mask))) => {
            Box::new(move |row| row[no] & mask != 0 || T::read(row, offset) != target)
        }
        (FilterOp::LessThan, None) => Box::new(move |row| T::read(row, offset) < target),
        (FilterOp::LessThan, Some((no, mask))) => {
            Box::new(move |row| row[no] & mask == 0 && T::read(row, offset) < target)
        }
        (FilterOp::LessThanOrEqual, None) => Box::new(move |row| T::read(row, offset) <= target),
        (FilterOp::LessThanOrEqual, Some((no, mask))) => {
            Box::new(move |row| row[no] & mask == 0 && T::read(row, offset) <= target)
        }
        (FilterOp::GreaterThan, None) => Box::new(move |row| T::read(row, offset) > target),
        (FilterOp::GreaterThan, Some((no, mask))) => {
            Box::new(move |row| row[no] & mask == 0 && T::read(row, offset) > target)
        }
        (FilterOp::GreaterThanOrEqual, None) => Box::new(move |row| T::read(row, offset) >= target),
        (FilterOp::GreaterThanOrEqual, Some((no, mask))) => {
            Box::new(move |row| row[no] & mask == 0 && T::read(row, offset) >= target)
        }
        (FilterOp::In, _) => always(false),
    }
}

fn make_in_filter<T: RowValue>(
    targets: Vec<T>,
    accept_nil: bool,
    offset: usize,
    nil: Option<(usize, u8)>,
) -> FilterFn {
    match nil {
        Some((no, mask)) => Box::new(move |row| {
            if row[no] & mask != 0 {
                return accept_nil;
            }
            let v = T::read(row, offset);
            targets.iter().any(|t| *t == v)
        }),
        None => Box::new(move |row| {
            let v = T::read(row, offset);
            targets.iter().any(|t| *t == v)
        }),
    }
}
