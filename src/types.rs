use serde::{Deserialize, Serialize};

/// Commit timestamps are 64-bit and strictly increase over the life of a
/// tablet. In logical-clock mode they are a plain counter; in hybrid mode the
/// upper bits carry physical microseconds.
pub type Timestamp = u64;

/// Primary keys travel through the engine in their order-preserving encoded
/// form (see [`crate::Schema::encode_key`]). Byte-wise comparison of two
/// encoded keys matches column-wise comparison of the original key tuples.
pub type KeyBytes = Vec<u8>;

/// Primitive column types. The engine makes no semantic distinction among
/// value-column types beyond their encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    I8,
    I16,
    I32,
    I64,
    Bytes,
}

impl DataType {
    /// Fixed encoded width, if the type has one.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            DataType::I8 => Some(1),
            DataType::I16 => Some(2),
            DataType::I32 => Some(4),
            DataType::I64 => Some(8),
            DataType::Bytes => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::I8 => "i8",
            DataType::I16 => "i16",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::Bytes => "bytes",
        };
        write!(f, "{}", name)
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Datum {
    Null,
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Bytes(Vec<u8>),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Whether this datum can be stored in a column of `ty`.
    pub fn fits(&self, ty: DataType, nullable: bool) -> bool {
        match self {
            Datum::Null => nullable,
            Datum::I8(_) => ty == DataType::I8,
            Datum::I16(_) => ty == DataType::I16,
            Datum::I32(_) => ty == DataType::I32,
            Datum::I64(_) => ty == DataType::I64,
            Datum::Bytes(_) => ty == DataType::Bytes,
        }
    }

    /// Rough in-memory footprint, used for size accounting.
    pub fn size_bytes(&self) -> usize {
        match self {
            Datum::Null => 1,
            Datum::I8(_) => 1,
            Datum::I16(_) => 2,
            Datum::I32(_) => 4,
            Datum::I64(_) => 8,
            Datum::Bytes(b) => 8 + b.len(),
        }
    }
}

impl std::fmt::Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::I8(v) => write!(f, "{}", v),
            Datum::I16(v) => write!(f, "{}", v),
            Datum::I32(v) => write!(f, "{}", v),
            Datum::I64(v) => write!(f, "{}", v),
            Datum::Bytes(b) => write!(f, "{:02x?}", b),
        }
    }
}

/// A full schema-ordered row: key columns first, then value columns.
pub type Row = Vec<Datum>;
