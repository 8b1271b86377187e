use bytes::{Buf, BufMut};

use crate::error::{EngineResult, TracedEngineError};

pub const COLUMN_INDEX_MAGIC: u32 = 0x7AB1_C01D;
const INDEX_FOOTER_SIZE: usize = 4 + 8 + 8;
const INDEX_ENTRY_SIZE: usize = 8 + 8 + 4 + 4;

/// Location of one block within a column data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub offset: u64,
    pub length: u64,
    pub first_ordinal: u32,
    pub row_count: u32,
}

/// Builds the `.idx` file for a column: a fixed-width entry per block plus a
/// footer carrying the magic, entry count, and a CRC over the entries.
///
/// ```plain
/// | entry | entry | ... | magic (4B) | entry count (8B) | crc32 (8B) |
/// ```
pub struct IndexBuilder {
    data: Vec<u8>,
    cnt: u64,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self {
            data: vec![],
            cnt: 0,
        }
    }

    pub fn append(&mut self, entry: BlockIndexEntry) {
        self.cnt += 1;
        self.data.put_u64(entry.offset);
        self.data.put_u64(entry.length);
        self.data.put_u32(entry.first_ordinal);
        self.data.put_u32(entry.row_count);
    }

    pub fn finish(self) -> Vec<u8> {
        let mut data = self.data;
        let crc = crc32fast::hash(&data);
        data.put_u32(COLUMN_INDEX_MAGIC);
        data.put_u64(self.cnt);
        data.put_u64(crc as u64);
        data
    }
}

impl Default for IndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The parsed block index of one column, resident in memory.
#[derive(Clone)]
pub struct ColumnIndex {
    indexes: std::sync::Arc<[BlockIndexEntry]>,
}

impl ColumnIndex {
    pub fn from_bytes(data: &[u8]) -> EngineResult<Self> {
        if data.len() < INDEX_FOOTER_SIZE {
            return Err(TracedEngineError::corruption("column index too short"));
        }
        let (entry_data, mut footer) = data.split_at(data.len() - INDEX_FOOTER_SIZE);
        if footer.get_u32() != COLUMN_INDEX_MAGIC {
            return Err(TracedEngineError::corruption(
                "failed to decode column index: invalid magic",
            ));
        }
        let count = footer.get_u64() as usize;
        let expected_crc = footer.get_u64();
        let actual_crc = crc32fast::hash(entry_data) as u64;
        if actual_crc != expected_crc {
            return Err(TracedEngineError::corruption(format!(
                "column index checksum mismatch (found {:#x}, expected {:#x})",
                actual_crc, expected_crc
            )));
        }
        if entry_data.len() != count * INDEX_ENTRY_SIZE {
            return Err(TracedEngineError::corruption(format!(
                "column index length {} does not match {} entries",
                entry_data.len(),
                count
            )));
        }

        let mut buf = entry_data;
        let mut indexes = Vec::with_capacity(count);
        for _ in 0..count {
            indexes.push(BlockIndexEntry {
                offset: buf.get_u64(),
                length: buf.get_u64(),
                first_ordinal: buf.get_u32(),
                row_count: buf.get_u32(),
            });
        }
        Ok(Self {
            indexes: indexes.into(),
        })
    }

    pub fn index(&self, block_id: u32) -> &BlockIndexEntry {
        &self.indexes[block_id as usize]
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Total rows across all blocks.
    pub fn row_count(&self) -> u32 {
        self.indexes
            .last()
            .map(|e| e.first_ordinal + e.row_count)
            .unwrap_or(0)
    }

    /// Find the block containing `ordinal` by partitioning on first ordinals.
    pub fn block_of_ordinal(&self, ordinal: u32) -> u32 {
        let pp = self
            .indexes
            .partition_point(|index| index.first_ordinal <= ordinal) as u32;
        debug_assert!(pp > 0, "ordinal {} below the first block", ordinal);
        pp - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> ColumnIndex {
        let mut builder = IndexBuilder::new();
        builder.append(BlockIndexEntry {
            offset: 0,
            length: 100,
            first_ordinal: 0,
            row_count: 10,
        });
        builder.append(BlockIndexEntry {
            offset: 100,
            length: 80,
            first_ordinal: 10,
            row_count: 7,
        });
        ColumnIndex::from_bytes(&builder.finish()).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let index = sample_index();
        assert_eq!(index.len(), 2);
        assert_eq!(index.row_count(), 17);
        assert_eq!(index.index(1).offset, 100);
    }

    #[test]
    fn test_block_of_ordinal() {
        let index = sample_index();
        assert_eq!(index.block_of_ordinal(0), 0);
        assert_eq!(index.block_of_ordinal(9), 0);
        assert_eq!(index.block_of_ordinal(10), 1);
        assert_eq!(index.block_of_ordinal(16), 1);
    }

    #[test]
    fn test_bad_magic() {
        let mut data = {
            let mut builder = IndexBuilder::new();
            builder.append(BlockIndexEntry {
                offset: 0,
                length: 1,
                first_ordinal: 0,
                row_count: 1,
            });
            builder.finish()
        };
        let magic_pos = data.len() - INDEX_FOOTER_SIZE;
        data[magic_pos] ^= 0xFF;
        assert!(ColumnIndex::from_bytes(&data).is_err());
    }
}
