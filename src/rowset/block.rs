//! Block encoding for base data columns.
//!
//! A block is the minimum read unit of a column. The on-disk scheme is:
//!
//! ```plain
//! | block_type | cksum_type | cksum  |    data     |
//! |    4B      |     4B     |   8B   |  variable   |
//! ```
//!
//! Fixed-width data is packed little-endian; nullable blocks prepend a null
//! bitmap over the positions and keep fixed slots for null cells so access
//! stays positional; blob blocks carry an offset table.

use bitvec::prelude::{BitVec, Lsb0};
use bytes::{Buf, BufMut, Bytes};

use crate::error::{EngineResult, TracedEngineError};
use crate::types::{DataType, Datum};

/// A block is simply a [`Bytes`] array (header included).
pub type Block = Bytes;

pub const BLOCK_HEADER_SIZE: usize = 4 + 4 + 8;

const BLOCK_TYPE_FIXED: u32 = 1;
const BLOCK_TYPE_FIXED_NULLABLE: u32 = 2;
const BLOCK_TYPE_BLOB: u32 = 3;
const BLOCK_TYPE_BLOB_NULLABLE: u32 = 4;

const CHECKSUM_NONE: u32 = 0;
const CHECKSUM_CRC32: u32 = 1;

/// A key in the block cache: `(rowset, column, block)`.
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct BlockCacheKey {
    pub rowset_id: u32,
    pub column_id: u32,
    pub block_id: u32,
}

impl BlockCacheKey {
    pub fn rowset(mut self, rowset_id: u32) -> Self {
        self.rowset_id = rowset_id;
        self
    }

    pub fn column(mut self, column_id: u32) -> Self {
        self.column_id = column_id;
        self
    }

    pub fn block(mut self, block_id: u32) -> Self {
        self.block_id = block_id;
        self
    }
}

/// Builds one block of a column. The caller checks [`Self::should_finish`]
/// before each append and cuts the block when it reports full.
pub struct BlockBuilder {
    data_type: DataType,
    nullable: bool,
    target_size: usize,
    count: u32,
    nulls: BitVec<u8, Lsb0>,
    /// Fixed-width payload, or blob bytes.
    data: Vec<u8>,
    /// Blob offsets; unused for fixed-width types.
    offsets: Vec<u32>,
}

impl BlockBuilder {
    pub fn new(data_type: DataType, nullable: bool, target_size: usize) -> Self {
        Self {
            data_type,
            nullable,
            target_size,
            count: 0,
            nulls: BitVec::new(),
            data: Vec::with_capacity(target_size),
            offsets: vec![0],
        }
    }

    pub fn append(&mut self, datum: &Datum) {
        debug_assert!(datum.fits(self.data_type, self.nullable));
        if self.nullable {
            self.nulls.push(datum.is_null());
        }
        match self.data_type {
            DataType::Bytes => {
                if let Datum::Bytes(b) = datum {
                    self.data.put_slice(b);
                }
                self.offsets.push(self.data.len() as u32);
            }
            _ => {
                // Nulls keep their fixed slot (zeroed) so access stays
                // positional.
                match datum {
                    Datum::Null => {
                        let width = self.data_type.fixed_width().unwrap();
                        self.data.resize(self.data.len() + width, 0);
                    }
                    Datum::I8(v) => self.data.put_i8(*v),
                    Datum::I16(v) => self.data.put_i16_le(*v),
                    Datum::I32(v) => self.data.put_i32_le(*v),
                    Datum::I64(v) => self.data.put_i64_le(*v),
                    Datum::Bytes(_) => unreachable!(),
                }
            }
        }
        self.count += 1;
    }

    pub fn estimated_size(&self) -> usize {
        self.data.len() + self.offsets.len() * 4 + self.nulls.len() / 8
    }

    pub fn should_finish(&self, next: &Datum) -> bool {
        !self.is_empty() && self.estimated_size() + next.size_bytes() > self.target_size
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Frame the block: header, checksum, payload.
    pub fn finish(self) -> Vec<u8> {
        let block_type = match (self.data_type, self.nullable) {
            (DataType::Bytes, false) => BLOCK_TYPE_BLOB,
            (DataType::Bytes, true) => BLOCK_TYPE_BLOB_NULLABLE,
            (_, false) => BLOCK_TYPE_FIXED,
            (_, true) => BLOCK_TYPE_FIXED_NULLABLE,
        };

        let mut payload = Vec::with_capacity(self.estimated_size() + 16);
        payload.put_u32(self.count);
        if self.nullable {
            let mut bitmap = self.nulls;
            bitmap.set_uninitialized(false);
            payload.put_slice(bitmap.as_raw_slice());
        }
        if self.data_type == DataType::Bytes {
            for offset in &self.offsets {
                payload.put_u32_le(*offset);
            }
        }
        payload.put_slice(&self.data);

        let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE + payload.len());
        out.put_u32(block_type);
        out.put_u32(CHECKSUM_CRC32);
        out.put_u64(crc32fast::hash(&payload) as u64);
        out.put_slice(&payload);
        out
    }
}

/// Decode a framed block back into datums. Verifies the checksum and that the
/// block type matches what the column expects.
pub fn decode_block(block: &Block, data_type: DataType, nullable: bool) -> EngineResult<Vec<Datum>> {
    let mut buf = &block[..];
    if buf.remaining() < BLOCK_HEADER_SIZE {
        return Err(TracedEngineError::corruption("block shorter than header"));
    }
    let block_type = buf.get_u32();
    let cksum_type = buf.get_u32();
    let cksum = buf.get_u64();
    let expected_type = match (data_type, nullable) {
        (DataType::Bytes, false) => BLOCK_TYPE_BLOB,
        (DataType::Bytes, true) => BLOCK_TYPE_BLOB_NULLABLE,
        (_, false) => BLOCK_TYPE_FIXED,
        (_, true) => BLOCK_TYPE_FIXED_NULLABLE,
    };
    if block_type != expected_type {
        return Err(TracedEngineError::corruption(format!(
            "block type {} does not match column ({} expected)",
            block_type, expected_type
        )));
    }
    match cksum_type {
        CHECKSUM_NONE => {}
        CHECKSUM_CRC32 => {
            let actual = crc32fast::hash(buf) as u64;
            if actual != cksum {
                return Err(TracedEngineError::corruption(format!(
                    "block checksum mismatch (found {:#x}, expected {:#x})",
                    actual, cksum
                )));
            }
        }
        other => {
            return Err(TracedEngineError::corruption(format!(
                "unknown checksum type {}",
                other
            )))
        }
    }

    let short = || TracedEngineError::corruption("truncated block payload");
    if buf.remaining() < 4 {
        return Err(short());
    }
    let count = buf.get_u32() as usize;

    let nulls: Option<BitVec<u8, Lsb0>> = if nullable {
        let bitmap_bytes = count.div_ceil(8);
        if buf.remaining() < bitmap_bytes {
            return Err(short());
        }
        let mut bitmap = BitVec::<u8, Lsb0>::from_slice(&buf[..bitmap_bytes]);
        bitmap.truncate(count);
        buf.advance(bitmap_bytes);
        Some(bitmap)
    } else {
        None
    };

    let mut out = Vec::with_capacity(count);
    match data_type {
        DataType::Bytes => {
            if buf.remaining() < (count + 1) * 4 {
                return Err(short());
            }
            let mut offsets = Vec::with_capacity(count + 1);
            for _ in 0..=count {
                offsets.push(buf.get_u32_le() as usize);
            }
            let payload = buf;
            for idx in 0..count {
                if nulls.as_ref().map(|n| n[idx]).unwrap_or(false) {
                    out.push(Datum::Null);
                    continue;
                }
                let (start, end) = (offsets[idx], offsets[idx + 1]);
                if end < start || end > payload.len() {
                    return Err(short());
                }
                out.push(Datum::Bytes(payload[start..end].to_vec()));
            }
        }
        _ => {
            let width = data_type.fixed_width().unwrap();
            if buf.remaining() < count * width {
                return Err(short());
            }
            for idx in 0..count {
                if nulls.as_ref().map(|n| n[idx]).unwrap_or(false) {
                    buf.advance(width);
                    out.push(Datum::Null);
                    continue;
                }
                out.push(match data_type {
                    DataType::I8 => Datum::I8(buf.get_i8()),
                    DataType::I16 => Datum::I16(buf.get_i16_le()),
                    DataType::I32 => Datum::I32(buf.get_i32_le()),
                    DataType::I64 => Datum::I64(buf.get_i64_le()),
                    DataType::Bytes => unreachable!(),
                });
            }
        }
    }
    Ok(out)
}
