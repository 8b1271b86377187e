use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::error::{EngineResult, RowError, TracedEngineError};
use crate::types::{DataType, Datum, KeyBytes, Row};

/// Description of a single column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    name: String,
    data_type: DataType,
    nullable: bool,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }
}

/// An ordered column list whose prefix of `pk_len` columns forms the primary
/// key. Key columns are non-nullable and immutable for the lifetime of a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnDesc>,
    pk_len: usize,
}

impl Schema {
    pub fn new(columns: Vec<ColumnDesc>, pk_len: usize) -> EngineResult<Self> {
        if pk_len == 0 || pk_len > columns.len() {
            return Err(TracedEngineError::schema_mismatch(format!(
                "primary key prefix length {} out of range for {} columns",
                pk_len,
                columns.len()
            )));
        }
        for column in &columns[..pk_len] {
            if column.nullable {
                return Err(TracedEngineError::schema_mismatch(format!(
                    "key column {} must not be nullable",
                    column.name
                )));
            }
        }
        let mut names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != columns.len() {
            return Err(TracedEngineError::schema_mismatch("duplicate column name"));
        }
        Ok(Self { columns, pk_len })
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn pk_len(&self) -> usize {
        self.pk_len
    }

    pub fn num_value_columns(&self) -> usize {
        self.columns.len() - self.pk_len
    }

    pub fn key_columns(&self) -> &[ColumnDesc] {
        &self.columns[..self.pk_len]
    }

    pub fn value_columns(&self) -> &[ColumnDesc] {
        &self.columns[self.pk_len..]
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Validate a full schema-ordered row.
    pub fn check_row(&self, row: &Row) -> Result<(), RowError> {
        if row.len() != self.columns.len() {
            return Err(RowError::InvalidRow(format!(
                "expected {} columns, got {}",
                self.columns.len(),
                row.len()
            )));
        }
        for (datum, column) in row.iter().zip(&self.columns) {
            if !datum.fits(column.data_type, column.nullable) {
                return Err(RowError::InvalidRow(format!(
                    "datum {} does not fit column {} ({}{})",
                    datum,
                    column.name,
                    column.data_type,
                    if column.nullable { ", nullable" } else { "" }
                )));
            }
        }
        Ok(())
    }

    /// Validate a key tuple (the first `pk_len` datums of a row).
    pub fn check_key(&self, key: &[Datum]) -> Result<(), RowError> {
        if key.len() != self.pk_len {
            return Err(RowError::InvalidRow(format!(
                "expected {} key columns, got {}",
                self.pk_len,
                key.len()
            )));
        }
        for (datum, column) in key.iter().zip(self.key_columns()) {
            if !datum.fits(column.data_type, false) {
                return Err(RowError::InvalidRow(format!(
                    "key datum {} does not fit column {}",
                    datum, column.name
                )));
            }
        }
        Ok(())
    }

    /// Validate an update changelist: value-column indexes with new datums.
    /// An empty changelist is legal; it denotes a no-op update.
    pub fn check_changelist(&self, changes: &[(u32, Datum)]) -> Result<(), RowError> {
        for (idx, datum) in changes {
            let Some(column) = self.value_columns().get(*idx as usize) else {
                return Err(RowError::InvalidRow(format!(
                    "changelist references value column {} of {}",
                    idx,
                    self.num_value_columns()
                )));
            };
            if !datum.fits(column.data_type, column.nullable) {
                return Err(RowError::InvalidRow(format!(
                    "datum {} does not fit column {}",
                    datum, column.name
                )));
            }
        }
        Ok(())
    }

    /// Encode a key tuple into order-preserving bytes: byte-wise comparison of
    /// two encoded keys matches column-wise comparison of the tuples.
    ///
    /// Integers are written big-endian with the sign bit flipped. Binary
    /// segments escape interior zero bytes (`00 -> 00 FF`) and close with a
    /// `00 00` terminator so that prefixes sort first.
    pub fn encode_key(&self, key: &[Datum]) -> KeyBytes {
        debug_assert_eq!(key.len(), self.pk_len);
        let mut out = Vec::with_capacity(16);
        for datum in key {
            match datum {
                Datum::I8(v) => out.put_u8((*v as u8) ^ 0x80),
                Datum::I16(v) => out.put_u16((*v as u16) ^ (1 << 15)),
                Datum::I32(v) => out.put_u32((*v as u32) ^ (1 << 31)),
                Datum::I64(v) => out.put_u64((*v as u64) ^ (1 << 63)),
                Datum::Bytes(b) => {
                    for byte in b {
                        if *byte == 0x00 {
                            out.put_u8(0x00);
                            out.put_u8(0xFF);
                        } else {
                            out.put_u8(*byte);
                        }
                    }
                    out.put_u8(0x00);
                    out.put_u8(0x00);
                }
                Datum::Null => unreachable!("key columns are non-nullable"),
            }
        }
        out
    }
}
