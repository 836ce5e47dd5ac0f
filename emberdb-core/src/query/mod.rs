//! Query engine
//!
//! Queries arrive as typed wire structures (the JSON shapes are stable
//! across collaborators): a list of sum/count aggregates, at most one
//! grouping with an optional time truncation, a list of filters, and an
//! optional time range. The planner compiles them into typed closures over
//! packed rows; the executor runs a single scan per interval.

mod executor;
mod planner;

pub use executor::execute;
pub use planner::{plan, QueryPlan};

use crate::types::{TimeRange, Untyped};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Name of the implicit aggregate counting collapsed input rows
pub const ROW_COUNT_COLUMN: &str = "rowCount";

/// A query over the store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
    /// Restrict the scan to intervals overlapping this range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub filters: Vec<QueryFilter>,
    #[serde(default)]
    pub groupings: Vec<QueryGrouping>,
    #[serde(default)]
    pub aggregates: Vec<QueryAggregate>,
}

/// Aggregate function kinds accepted on the wire. `Average` parses but is
/// rejected at validation; the engine exposes sum and count only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateKind {
    #[serde(rename = "sum")]
    Sum,
    #[serde(rename = "count")]
    Count,
    #[serde(rename = "average")]
    Average,
}

/// One requested aggregate: `{type, column, name}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAggregate {
    #[serde(rename = "type")]
    pub kind: AggregateKind,
    pub column: String,
    pub name: String,
}

impl QueryAggregate {
    pub fn sum(column: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: AggregateKind::Sum,
            column: column.into(),
            name: name.into(),
        }
    }
}

/// Time truncation applied to a grouping column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeTruncation {
    #[default]
    #[serde(rename = "none", alias = "")]
    None,
    #[serde(rename = "minute")]
    Minute,
    #[serde(rename = "hour")]
    Hour,
    #[serde(rename = "day")]
    Day,
}

impl TimeTruncation {
    /// Truncation modulus in seconds
    pub fn seconds(self) -> Option<u64> {
        match self {
            TimeTruncation::None => None,
            TimeTruncation::Minute => Some(60),
            TimeTruncation::Hour => Some(3600),
            TimeTruncation::Day => Some(86400),
        }
    }
}

/// One grouping: `{time_truncation, column, name}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryGrouping {
    #[serde(default)]
    pub time_truncation: TimeTruncation,
    pub column: String,
    pub name: String,
}

impl QueryGrouping {
    pub fn new(column: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            time_truncation: TimeTruncation::None,
            column: column.into(),
            name: name.into(),
        }
    }

    pub fn truncated(mut self, truncation: TimeTruncation) -> Self {
        self.time_truncation = truncation;
        self
    }
}

/// Filter comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessThanOrEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    #[serde(rename = "in")]
    In,
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            FilterOp::Equal => "=",
            FilterOp::NotEqual => "!=",
            FilterOp::LessThan => "<",
            FilterOp::LessThanOrEqual => "<=",
            FilterOp::GreaterThan => ">",
            FilterOp::GreaterThanOrEqual => ">=",
            FilterOp::In => "in",
        };
        write!(f, "{}", symbol)
    }
}

/// One filter: `{op, column, value}` or `{op: "in", column, values}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryFilter {
    pub op: FilterOp,
    pub column: String,
    #[serde(default, skip_serializing_if = "Untyped::is_null")]
    pub value: Untyped,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Untyped>,
}

impl QueryFilter {
    pub fn new(op: FilterOp, column: impl Into<String>, value: Untyped) -> Self {
        Self {
            op,
            column: column.into(),
            value,
            values: Vec::new(),
        }
    }

    pub fn within(column: impl Into<String>, values: Vec<Untyped>) -> Self {
        Self {
            op: FilterOp::In,
            column: column.into(),
            value: Untyped::Null,
            values,
        }
    }
}

/// Cooperative cancellation handle checked at interval boundaries
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_json_shape() {
        let json = r#"{
            "aggregates": [{"type": "sum", "column": "metric1", "name": "metric1"}],
            "groupings": [{"time_truncation": "day", "column": "at", "name": "day"}],
            "filters": [
                {"op": "=", "column": "dim1", "value": "a"},
                {"op": "in", "column": "metric1", "values": [1, 2]}
            ]
        }"#;
        let query: Query = serde_json::from_str(json).unwrap();
        assert_eq!(query.aggregates[0].kind, AggregateKind::Sum);
        assert_eq!(query.groupings[0].time_truncation, TimeTruncation::Day);
        assert_eq!(query.filters[0].op, FilterOp::Equal);
        assert_eq!(query.filters[1].values.len(), 2);
        assert!(query.time_range.is_none());
    }

    #[test]
    fn test_average_parses_on_the_wire() {
        let json = r#"{"type": "average", "column": "m", "name": "m"}"#;
        let aggregate: QueryAggregate = serde_json::from_str(json).unwrap();
        assert_eq!(aggregate.kind, AggregateKind::Average);
    }

    #[test]
    fn test_filter_op_symbols() {
        let op: FilterOp = serde_json::from_str("\"<=\"").unwrap();
        assert_eq!(op, FilterOp::LessThanOrEqual);
        assert_eq!(op.to_string(), "<=");
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.clone().cancel();
        assert!(token.is_cancelled());
    }
}
