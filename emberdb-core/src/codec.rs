//! Typed column codecs
//!
//! The closed set of numeric column types and the primitive operations over
//! packed row bytes: read a cell, write a cell, sum one cell into another,
//! cast from f64. Everything else in the engine carries byte slices and
//! offsets; this module is the only place raw bytes are interpreted.

use crate::types::Untyped;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The numeric column types supported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "int8")]
    I8,
    #[serde(rename = "uint16")]
    U16,
    #[serde(rename = "int16")]
    I16,
    #[serde(rename = "uint32")]
    U32,
    #[serde(rename = "int32")]
    I32,
    #[serde(rename = "uint64")]
    U64,
    #[serde(rename = "int64")]
    I64,
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float64")]
    F64,
}

impl ColumnType {
    /// Cell width in bytes
    pub fn width(self) -> usize {
        match self {
            ColumnType::U8 | ColumnType::I8 => 1,
            ColumnType::U16 | ColumnType::I16 => 2,
            ColumnType::U32 | ColumnType::I32 | ColumnType::F32 => 4,
            ColumnType::U64 | ColumnType::I64 | ColumnType::F64 => 8,
        }
    }

    /// Type name as used in configuration ("uint8", "float64", ...)
    pub fn name(self) -> &'static str {
        match self {
            ColumnType::U8 => "uint8",
            ColumnType::I8 => "int8",
            ColumnType::U16 => "uint16",
            ColumnType::I16 => "int16",
            ColumnType::U32 => "uint32",
            ColumnType::I32 => "int32",
            ColumnType::U64 => "uint64",
            ColumnType::I64 => "int64",
            ColumnType::F32 => "float32",
            ColumnType::F64 => "float64",
        }
    }

    /// Parse a configuration type name
    pub fn parse(name: &str) -> Option<ColumnType> {
        match name {
            "uint8" => Some(ColumnType::U8),
            "int8" => Some(ColumnType::I8),
            "uint16" => Some(ColumnType::U16),
            "int16" => Some(ColumnType::I16),
            "uint32" => Some(ColumnType::U32),
            "int32" => Some(ColumnType::I32),
            "uint64" => Some(ColumnType::U64),
            "int64" => Some(ColumnType::I64),
            "float32" => Some(ColumnType::F32),
            "float64" => Some(ColumnType::F64),
            _ => None,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            ColumnType::U8 | ColumnType::U16 | ColumnType::U32 | ColumnType::U64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, ColumnType::F32 | ColumnType::F64)
    }

    /// Largest dimension id representable by this type. Only meaningful for
    /// the unsigned types allowed as string-backed dimension storage.
    pub fn max_dimension_id(self) -> u64 {
        match self {
            ColumnType::U8 => u8::MAX as u64,
            ColumnType::U16 => u16::MAX as u64,
            ColumnType::U32 => u32::MAX as u64,
            ColumnType::U64 => u64::MAX,
            _ => 0,
        }
    }

    /// Check that an f64 value fits this type (after truncation)
    pub fn in_range(self, v: f64) -> bool {
        if !v.is_finite() {
            return false;
        }
        match self {
            ColumnType::U8 => v >= 0.0 && v <= u8::MAX as f64,
            ColumnType::I8 => v >= i8::MIN as f64 && v <= i8::MAX as f64,
            ColumnType::U16 => v >= 0.0 && v <= u16::MAX as f64,
            ColumnType::I16 => v >= i16::MIN as f64 && v <= i16::MAX as f64,
            ColumnType::U32 => v >= 0.0 && v <= u32::MAX as f64,
            ColumnType::I32 => v >= i32::MIN as f64 && v <= i32::MAX as f64,
            ColumnType::U64 => v >= 0.0 && v <= u64::MAX as f64,
            ColumnType::I64 => v >= i64::MIN as f64 && v <= i64::MAX as f64,
            ColumnType::F32 | ColumnType::F64 => true,
        }
    }
}

/// A fixed-width value that can live in a packed row cell.
///
/// Implemented once per numeric type; generic functions over `RowValue` are
/// the monomorphized equivalent of per-type code generation.
pub trait RowValue: Copy + PartialEq + PartialOrd + Send + Sync + 'static {
    const TYPE: ColumnType;
    const WIDTH: usize;

    fn read(bytes: &[u8], offset: usize) -> Self;
    fn write(self, bytes: &mut [u8], offset: usize);
    /// Truncating cast from f64 (saturating at the type bounds)
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
    fn to_untyped(self) -> Untyped;
    fn checked_add(self, other: Self) -> Option<Self>;
    fn wrapping_add(self, other: Self) -> Self;
    /// Canonical 8-byte representation used as a grouping key
    fn to_key_bits(self) -> u64;
    fn from_key_bits(bits: u64) -> Self;
}

macro_rules! impl_row_value_uint {
    ($t:ty, $ct:expr) => {
        impl RowValue for $t {
            const TYPE: ColumnType = $ct;
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn read(bytes: &[u8], offset: usize) -> Self {
                let mut buf = [0u8; Self::WIDTH];
                buf.copy_from_slice(&bytes[offset..offset + Self::WIDTH]);
                <$t>::from_le_bytes(buf)
            }
            fn write(self, bytes: &mut [u8], offset: usize) {
                bytes[offset..offset + Self::WIDTH].copy_from_slice(&self.to_le_bytes());
            }
            fn from_f64(v: f64) -> Self {
                v as $t
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn to_untyped(self) -> Untyped {
                Untyped::UInt(self as u64)
            }
            fn checked_add(self, other: Self) -> Option<Self> {
                <$t>::checked_add(self, other)
            }
            fn wrapping_add(self, other: Self) -> Self {
                <$t>::wrapping_add(self, other)
            }
            fn to_key_bits(self) -> u64 {
                self as u64
            }
            fn from_key_bits(bits: u64) -> Self {
                bits as $t
            }
        }
    };
}

macro_rules! impl_row_value_int {
    ($t:ty, $ct:expr) => {
        impl RowValue for $t {
            const TYPE: ColumnType = $ct;
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn read(bytes: &[u8], offset: usize) -> Self {
                let mut buf = [0u8; Self::WIDTH];
                buf.copy_from_slice(&bytes[offset..offset + Self::WIDTH]);
                <$t>::from_le_bytes(buf)
            }
            fn write(self, bytes: &mut [u8], offset: usize) {
                bytes[offset..offset + Self::WIDTH].copy_from_slice(&self.to_le_bytes());
            }
            fn from_f64(v: f64) -> Self {
                v as $t
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn to_untyped(self) -> Untyped {
                Untyped::Int(self as i64)
            }
            fn checked_add(self, other: Self) -> Option<Self> {
                <$t>::checked_add(self, other)
            }
            fn wrapping_add(self, other: Self) -> Self {
                <$t>::wrapping_add(self, other)
            }
            fn to_key_bits(self) -> u64 {
                self as i64 as u64
            }
            fn from_key_bits(bits: u64) -> Self {
                bits as i64 as $t
            }
        }
    };
}

macro_rules! impl_row_value_float {
    ($t:ty, $ct:expr) => {
        impl RowValue for $t {
            const TYPE: ColumnType = $ct;
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn read(bytes: &[u8], offset: usize) -> Self {
                let mut buf = [0u8; Self::WIDTH];
                buf.copy_from_slice(&bytes[offset..offset + Self::WIDTH]);
                <$t>::from_le_bytes(buf)
            }
            fn write(self, bytes: &mut [u8], offset: usize) {
                bytes[offset..offset + Self::WIDTH].copy_from_slice(&self.to_le_bytes());
            }
            fn from_f64(v: f64) -> Self {
                v as $t
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn to_untyped(self) -> Untyped {
                Untyped::Float(self as f64)
            }
            fn checked_add(self, other: Self) -> Option<Self> {
                Some(self + other)
            }
            fn wrapping_add(self, other: Self) -> Self {
                self + other
            }
            fn to_key_bits(self) -> u64 {
                self.to_bits() as u64
            }
            fn from_key_bits(bits: u64) -> Self {
                <$t>::from_bits(bits as _)
            }
        }
    };
}

impl_row_value_uint!(u8, ColumnType::U8);
impl_row_value_uint!(u16, ColumnType::U16);
impl_row_value_uint!(u32, ColumnType::U32);
impl_row_value_uint!(u64, ColumnType::U64);
impl_row_value_int!(i8, ColumnType::I8);
impl_row_value_int!(i16, ColumnType::I16);
impl_row_value_int!(i32, ColumnType::I32);
impl_row_value_int!(i64, ColumnType::I64);
impl_row_value_float!(f32, ColumnType::F32);
impl_row_value_float!(f64, ColumnType::F64);

/// Dispatch a `ColumnType` value to a block monomorphized on the matching
/// Rust type. `$T` becomes a type alias inside the block.
macro_rules! with_column_type {
    ($ty:expr, $T:ident => $body:expr) => {
        match $ty {
            $crate::codec::ColumnType::U8 => {
                type $T = u8;
                $body
            }
            $crate::codec::ColumnType::I8 => {
                type $T = i8;
                $body
            }
            $crate::codec::ColumnType::U16 => {
                type $T = u16;
                $body
            }
            $crate::codec::ColumnType::I16 => {
                type $T = i16;
                $body
            }
            $crate::codec::ColumnType::U32 => {
                type $T = u32;
                $body
            }
            $crate::codec::ColumnType::I32 => {
                type $T = i32;
                $body
            }
            $crate::codec::ColumnType::U64 => {
                type $T = u64;
                $body
            }
            $crate::codec::ColumnType::I64 => {
                type $T = i64;
                $body
            }
            $crate::codec::ColumnType::F32 => {
                type $T = f32;
                $body
            }
            $crate::codec::ColumnType::F64 => {
                type $T = f64;
                $body
            }
        }
    };
}
pub(crate) use with_column_type;

/// Read a cell into an untyped value
pub fn read_untyped(bytes: &[u8], offset: usize, ty: ColumnType) -> Untyped {
    with_column_type!(ty, T => T::read(bytes, offset).to_untyped())
}

/// Write an f64 into a cell, truncating to the cell type
pub fn write_f64(bytes: &mut [u8], offset: usize, ty: ColumnType, value: f64) {
    with_column_type!(ty, T => T::from_f64(value).write(bytes, offset))
}

/// Write a dimension id into a cell
pub fn write_id(bytes: &mut [u8], offset: usize, ty: ColumnType, id: u64) {
    with_column_type!(ty, T => T::from_key_bits(id).write(bytes, offset))
}

/// Sum the cell at `src[src_offset]` into `dst[dst_offset]`, wrapping on
/// integer overflow
pub fn sum_into(ty: ColumnType, dst: &mut [u8], dst_offset: usize, src: &[u8], src_offset: usize) {
    with_column_type!(ty, T => {
        let sum = T::read(dst, dst_offset).wrapping_add(T::read(src, src_offset));
        sum.write(dst, dst_offset);
    })
}

/// Checked variant of [`sum_into`]; returns false (and leaves `dst`
/// unmodified) on integer overflow
pub fn checked_sum_into(
    ty: ColumnType,
    dst: &mut [u8],
    dst_offset: usize,
    src: &[u8],
    src_offset: usize,
) -> bool {
    with_column_type!(ty, T => {
        match T::read(dst, dst_offset).checked_add(T::read(src, src_offset)) {
            Some(sum) => {
                sum.write(dst, dst_offset);
                true
            }
            None => false,
        }
    })
}

/// Read a cell as canonical grouping-key bits
pub fn read_key_bits(bytes: &[u8], offset: usize, ty: ColumnType) -> u64 {
    with_column_type!(ty, T => T::read(bytes, offset).to_key_bits())
}

/// Convert canonical key bits back into an untyped value
pub fn key_bits_to_untyped(ty: ColumnType, bits: u64) -> Untyped {
    with_column_type!(ty, T => T::from_key_bits(bits).to_untyped())
}

/// Order two canonical keys by the column's native value order
pub fn compare_key_bits(ty: ColumnType, a: u64, b: u64) -> Ordering {
    with_column_type!(ty, T => {
        let (a, b) = (T::from_key_bits(a), T::from_key_bits(b));
        a.partial_cmp(&b).unwrap_or(Ordering::Equal)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_round_trip() {
        let mut buf = vec![0u8; 16];
        write_f64(&mut buf, 2, ColumnType::I16, -123.0);
        assert_eq!(read_untyped(&buf, 2, ColumnType::I16), Untyped::Int(-123));

        write_f64(&mut buf, 8, ColumnType::F64, 2.5);
        assert_eq!(read_untyped(&buf, 8, ColumnType::F64), Untyped::Float(2.5));

        write_id(&mut buf, 4, ColumnType::U8, 200);
        assert_eq!(read_key_bits(&buf, 4, ColumnType::U8), 200);
    }

    #[test]
    fn test_from_f64_truncates() {
        let mut buf = vec![0u8; 8];
        write_f64(&mut buf, 0, ColumnType::U32, 7.9);
        assert_eq!(read_untyped(&buf, 0, ColumnType::U32), Untyped::UInt(7));
    }

    #[test]
    fn test_checked_sum_overflow() {
        let mut dst = vec![250u8];
        let src = vec![10u8];
        assert!(!checked_sum_into(ColumnType::U8, &mut dst, 0, &src, 0));
        assert_eq!(dst[0], 250); // untouched on overflow

        let src = vec![5u8];
        assert!(checked_sum_into(ColumnType::U8, &mut dst, 0, &src, 0));
        assert_eq!(dst[0], 255);
    }

    #[test]
    fn test_wrapping_sum() {
        let mut dst = vec![250u8];
        let src = vec![10u8];
        sum_into(ColumnType::U8, &mut dst, 0, &src, 0);
        assert_eq!(dst[0], 4);
    }

    #[test]
    fn test_in_range() {
        assert!(ColumnType::U8.in_range(255.0));
        assert!(!ColumnType::U8.in_range(256.0));
        assert!(!ColumnType::U8.in_range(-1.0));
        assert!(ColumnType::I8.in_range(-128.0));
        assert!(!ColumnType::I8.in_range(-129.0));
        assert!(ColumnType::F32.in_range(1e30));
        assert!(!ColumnType::U32.in_range(f64::NAN));
    }

    #[test]
    fn test_key_bits_round_trip_signed() {
        let mut buf = vec![0u8; 8];
        write_f64(&mut buf, 0, ColumnType::I32, -5.0);
        let bits = read_key_bits(&buf, 0, ColumnType::I32);
        assert_eq!(key_bits_to_untyped(ColumnType::I32, bits), Untyped::Int(-5));
        assert_eq!(
            compare_key_bits(ColumnType::I32, bits, 0),
            Ordering::Less
        );
    }
}
