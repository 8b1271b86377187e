use bytes::{Buf, BufMut};

use super::bloom::BloomFilter;
use crate::error::{EngineResult, TracedEngineError};
use crate::types::KeyBytes;

const PK_META_MAGIC: u32 = 0x9B1D_4E85;

/// Maps encoded primary keys to row ordinals for one row set.
///
/// The base data is key-sorted, so the index is the ordinal-ordered list of
/// encoded keys plus a bloom filter for cheap negative answers. It is written
/// once at build time and fully resident after open.
///
/// ```plain
/// | row_count (4B) | key_len (2B) key | ... | bloom | magic (4B) | crc32 (8B) |
/// ```
pub struct PkIndex {
    keys: Vec<KeyBytes>,
    bloom: BloomFilter,
}

impl PkIndex {
    /// Build from ordinal-ordered keys. Keys must be strictly ascending.
    pub fn build(keys: Vec<KeyBytes>, bloom_fpp: f64) -> Self {
        debug_assert!(keys.windows(2).all(|w| w[0] < w[1]));
        let mut bloom = BloomFilter::with_capacity(keys.len(), bloom_fpp);
        for key in &keys {
            bloom.insert(key);
        }
        Self { keys, bloom }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.put_u32(self.keys.len() as u32);
        for key in &self.keys {
            body.put_u16(key.len() as u16);
            body.put_slice(key);
        }
        self.bloom.encode(&mut body);
        let crc = crc32fast::hash(&body);
        body.put_u32(PK_META_MAGIC);
        body.put_u64(crc as u64);
        body
    }

    pub fn decode(data: &[u8]) -> EngineResult<Self> {
        if data.len() < 12 {
            return Err(TracedEngineError::corruption("pk index too short"));
        }
        let (body, mut footer) = data.split_at(data.len() - 12);
        if footer.get_u32() != PK_META_MAGIC {
            return Err(TracedEngineError::corruption("pk index: bad magic"));
        }
        let expected_crc = footer.get_u64();
        let actual_crc = crc32fast::hash(body) as u64;
        if actual_crc != expected_crc {
            return Err(TracedEngineError::corruption(format!(
                "pk index checksum mismatch (found {:#x}, expected {:#x})",
                actual_crc, expected_crc
            )));
        }

        let mut buf = body;
        if buf.remaining() < 4 {
            return Err(TracedEngineError::corruption("pk index truncated"));
        }
        let count = buf.get_u32() as usize;
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 2 {
                return Err(TracedEngineError::corruption("pk index truncated"));
            }
            let len = buf.get_u16() as usize;
            if buf.remaining() < len {
                return Err(TracedEngineError::corruption("pk index truncated"));
            }
            let mut key = vec![0u8; len];
            buf.copy_to_slice(&mut key);
            keys.push(key);
        }
        if !keys.windows(2).all(|w| w[0] < w[1]) {
            return Err(TracedEngineError::corruption(
                "pk index keys are not strictly ascending",
            ));
        }
        let bloom = BloomFilter::decode(&mut buf)?;
        Ok(Self { keys, bloom })
    }

    /// Ordinal of `key`, if this row set contains it (live or ghost).
    pub fn ordinal_of(&self, key: &[u8]) -> Option<u32> {
        if !self.bloom.may_contain(key) {
            return None;
        }
        self.keys
            .binary_search_by(|probe| probe.as_slice().cmp(key))
            .ok()
            .map(|idx| idx as u32)
    }

    pub fn key_at(&self, ordinal: u32) -> &[u8] {
        &self.keys[ordinal as usize]
    }

    pub fn row_count(&self) -> u32 {
        self.keys.len() as u32
    }

    pub fn min_key(&self) -> Option<&[u8]> {
        self.keys.first().map(|k| k.as_slice())
    }

    pub fn max_key(&self) -> Option<&[u8]> {
        self.keys.last().map(|k| k.as_slice())
    }
}
