//! Core types for EmberDB

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Timestamp in seconds since Unix epoch
pub type Timestamp = u32;

/// An untyped row as submitted by callers: column name to value
pub type RowMap = BTreeMap<String, Untyped>;

/// A dynamically typed value crossing the engine boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Untyped {
    /// Null (only valid for dimension columns)
    Null,
    /// Signed integer
    Int(i64),
    /// Unsigned integer (used when the value exceeds i64)
    UInt(u64),
    /// 64-bit float
    Float(f64),
    /// String (only valid for string-backed dimension columns)
    Str(String),
}

impl Untyped {
    /// Get as f64 if the value is numeric
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Untyped::Int(v) => Some(*v as f64),
            Untyped::UInt(v) => Some(*v as f64),
            Untyped::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as &str if the value is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Untyped::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Untyped::Null)
    }
}

impl Default for Untyped {
    fn default() -> Self {
        Untyped::Null
    }
}

impl fmt::Display for Untyped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Untyped::Null => write!(f, "null"),
            Untyped::Int(v) => write!(f, "{}", v),
            Untyped::UInt(v) => write!(f, "{}", v),
            Untyped::Float(v) => write!(f, "{}", v),
            Untyped::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for Untyped {
    fn from(v: f64) -> Self {
        Untyped::Float(v)
    }
}

impl From<i64> for Untyped {
    fn from(v: i64) -> Self {
        Untyped::Int(v)
    }
}

impl From<u64> for Untyped {
    fn from(v: u64) -> Self {
        Untyped::UInt(v)
    }
}

impl From<u32> for Untyped {
    fn from(v: u32) -> Self {
        Untyped::UInt(v as u64)
    }
}

impl From<String> for Untyped {
    fn from(v: String) -> Self {
        Untyped::Str(v)
    }
}

impl From<&str> for Untyped {
    fn from(v: &str) -> Self {
        Untyped::Str(v.to_string())
    }
}

/// A stored row unpacked back into caller-visible form, with its collapse count
#[derive(Debug, Clone, PartialEq)]
pub struct UnpackedRow {
    pub row: RowMap,
    pub count: u32,
}

/// Inclusive time range for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if the half-open interval `[t0, t0 + duration)` overlaps this range
    pub fn overlaps_interval(&self, t0: Timestamp, duration: u32) -> bool {
        let end = t0 as u64 + duration as u64;
        (t0 as u64) <= self.end as u64 && end > self.start as u64
    }
}

/// Current wall-clock time in Unix seconds
pub fn unix_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as Timestamp)
        .unwrap_or(0)
}
