//! Dimension tables
//!
//! Each string-backed dimension column owns a bijection between string
//! values and small unsigned ids; rows store only the id. Ids are assigned
//! monotonically on first observation and are never reused, reordered, or
//! deleted for the lifetime of the database. On disk a table is a
//! length-prefixed sequence of UTF-8 values in id order.

use crate::codec::ColumnType;
use crate::error::{EmberError, Result};
use crate::schema::DimensionColumn;
use bytes::{Buf, BufMut};
use std::collections::HashMap;
use std::sync::Arc;

/// Read access to dimension values by (column index, id)
pub trait DimensionLookup {
    fn value(&self, dim: usize, id: u64) -> Option<&str>;
}

/// The intern table for a single string-backed dimension column
#[derive(Debug, Clone)]
pub struct DimensionTable {
    name: String,
    ty: ColumnType,
    values: Vec<String>,
    ids: HashMap<String, u64>,
}

impl DimensionTable {
    fn new(name: String, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            values: Vec::new(),
            ids: HashMap::new(),
        }
    }

    /// Intern a value, assigning the next id on first observation
    pub fn intern(&mut self, value: &str) -> Result<u64> {
        if let Some(&id) = self.ids.get(value) {
            return Ok(id);
        }
        let id = self.values.len() as u64;
        if id > self.ty.max_dimension_id() {
            return Err(EmberError::TypeRange(format!(
                "dimension {:?} exhausted its {} id space",
                self.name,
                self.ty.name()
            )));
        }
        self.values.push(value.to_string());
        self.ids.insert(value.to_string(), id);
        Ok(id)
    }

    /// Map a value to its id without interning
    pub fn resolve(&self, value: &str) -> Option<u64> {
        self.ids.get(value).copied()
    }

    /// Map an id back to its value
    pub fn value(&self, id: u64) -> Option<&str> {
        self.values.get(id as usize).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Serialize to the on-disk form: u32 count, then (u32 length, UTF-8
    /// bytes) per value in id order
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.values.iter().map(|v| 4 + v.len()).sum::<usize>());
        buf.put_u32_le(self.values.len() as u32);
        for value in &self.values {
            buf.put_u32_le(value.len() as u32);
            buf.put_slice(value.as_bytes());
        }
        buf
    }

    /// Parse the on-disk form
    pub fn decode(name: String, ty: ColumnType, data: &[u8]) -> Result<Self> {
        let mut cursor = data;
        if cursor.remaining() < 4 {
            return Err(EmberError::Corruption(format!(
                "dimension file for {:?} is truncated",
                name
            )));
        }
        let count = cursor.get_u32_le() as usize;
        let mut table = Self::new(name, ty);
        for _ in 0..count {
            if cursor.remaining() < 4 {
                return Err(EmberError::Corruption(format!(
                    "dimension file for {:?} is truncated",
                    table.name
                )));
            }
            let len = cursor.get_u32_le() as usize;
            if cursor.remaining() < len {
                return Err(EmberError::Corruption(format!(
                    "dimension file for {:?} is truncated",
                    table.name
                )));
            }
            let value = std::str::from_utf8(&cursor[..len]).map_err(|_| {
                EmberError::Corruption(format!(
                    "dimension file for {:?} contains invalid UTF-8",
                    table.name
                ))
            })?;
            table.intern(value)?;
            cursor.advance(len);
        }
        Ok(table)
    }
}

/// The live, mutable set of dimension tables; one slot per dimension column,
/// populated only for string-backed columns. Mutation happens under the
/// database writer lock.
#[derive(Debug)]
pub struct DimensionSet {
    tables: Vec<Option<DimensionTable>>,
}

impl DimensionSet {
    pub fn new(columns: &[DimensionColumn]) -> Self {
        let tables = columns
            .iter()
            .map(|col| {
                col.string_backed
                    .then(|| DimensionTable::new(col.name.clone(), col.ty))
            })
            .collect();
        Self { tables }
    }

    /// Replace a column's table with one loaded from disk
    pub fn restore(&mut self, dim: usize, table: DimensionTable) {
        self.tables[dim] = Some(table);
    }

    pub fn table(&self, dim: usize) -> Option<&DimensionTable> {
        self.tables.get(dim).and_then(|t| t.as_ref())
    }

    pub fn intern(&mut self, dim: usize, value: &str) -> Result<u64> {
        match self.tables.get_mut(dim).and_then(|t| t.as_mut()) {
            Some(table) => table.intern(value),
            None => Err(EmberError::SchemaMismatch(format!(
                "dimension {} is not string-backed",
                dim
            ))),
        }
    }

    pub fn resolve(&self, dim: usize, value: &str) -> Option<u64> {
        self.table(dim).and_then(|t| t.resolve(value))
    }

    /// Capture a frozen view for readers
    pub fn snapshot(&self) -> DimensionSnapshot {
        DimensionSnapshot {
            tables: Arc::new(
                self.tables
                    .iter()
                    .map(|t| t.as_ref().map(|t| Arc::new(t.clone())))
                    .collect(),
            ),
        }
    }
}

impl DimensionLookup for DimensionSet {
    fn value(&self, dim: usize, id: u64) -> Option<&str> {
        self.table(dim).and_then(|t| t.value(id))
    }
}

/// An immutable view of the dimension tables, captured at flush time and
/// carried by each StaticTable
#[derive(Debug, Clone)]
pub struct DimensionSnapshot {
    tables: Arc<Vec<Option<Arc<DimensionTable>>>>,
}

impl DimensionSnapshot {
    pub fn empty(columns: &[DimensionColumn]) -> Self {
        DimensionSet::new(columns).snapshot()
    }

    pub fn table(&self, dim: usize) -> Option<&DimensionTable> {
        self.tables.get(dim).and_then(|t| t.as_deref())
    }

    pub fn resolve(&self, dim: usize, value: &str) -> Option<u64> {
        self.table(dim).and_then(|t| t.resolve(value))
    }
}

impl DimensionLookup for DimensionSnapshot {
    fn value(&self, dim: usize, id: u64) -> Option<&str> {
        self.table(dim).and_then(|t| t.value(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<DimensionColumn> {
        vec![
            DimensionColumn::string("dim1", ColumnType::U8),
            DimensionColumn::new("dim2", ColumnType::I32),
        ]
    }

    #[test]
    fn test_intern_lookup_round_trip() {
        let mut set = DimensionSet::new(&columns());
        let a = set.intern(0, "a").unwrap();
        let b = set.intern(0, "b").unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(set.intern(0, "a").unwrap(), 0); // stable on re-intern
        assert_eq!(set.value(0, 1), Some("b"));
        assert_eq!(set.resolve(0, "b"), Some(1));
        assert_eq!(set.resolve(0, "missing"), None);
    }

    #[test]
    fn test_id_space_exhaustion() {
        let mut set = DimensionSet::new(&columns());
        for i in 0..256 {
            set.intern(0, &i.to_string()).unwrap();
        }
        // 256 distinct values fit a uint8 table; the 257th does not.
        assert!(matches!(
            set.intern(0, "one-too-many"),
            Err(EmberError::TypeRange(_))
        ));
        // Existing values still intern fine.
        assert_eq!(set.intern(0, "0").unwrap(), 0);
    }

    #[test]
    fn test_non_string_column_rejects_intern() {
        let mut set = DimensionSet::new(&columns());
        assert!(set.intern(1, "x").is_err());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut set = DimensionSet::new(&columns());
        for value in ["x", "y", "z"] {
            set.intern(0, value).unwrap();
        }
        let table = set.table(0).unwrap();
        let encoded = table.encode();
        let decoded = DimensionTable::decode("dim1".to_string(), ColumnType::U8, &encoded).unwrap();
        assert_eq!(decoded.values(), table.values());
        assert_eq!(decoded.resolve("y"), Some(1));
    }

    #[test]
    fn test_decode_truncated() {
        let err = DimensionTable::decode("dim1".to_string(), ColumnType::U8, &[1, 0]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_snapshot_is_frozen() {
        let mut set = DimensionSet::new(&columns());
        set.intern(0, "a").unwrap();
        let snapshot = set.snapshot();
        set.intern(0, "b").unwrap();
        assert_eq!(snapshot.table(0).unwrap().len(), 1);
        assert_eq!(set.table(0).unwrap().len(), 2);
    }
}
