use bytes::{Buf, BufMut};

use crate::error::{EngineResult, TracedEngineError};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const SECOND_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// A bloom filter over encoded primary keys, consulted before the key index
/// on point lookups and insert presence checks. No false negatives; false
/// positives only cost an extra binary search.
///
/// Uses double hashing, `h(i) = h1 + i * h2`, with both hashes derived from
/// FNV-1a under different seeds.
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Size the filter for `expected_items` at the target false positive
    /// rate. An empty row set still gets a minimal filter.
    pub fn with_capacity(expected_items: usize, false_positive_rate: f64) -> Self {
        debug_assert!(false_positive_rate > 0.0 && false_positive_rate < 1.0);
        let n = expected_items.max(1) as f64;
        let m = (-n * false_positive_rate.ln() / (std::f64::consts::LN_2.powi(2))).ceil() as u64;
        let m = m.max(64);
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil().max(1.0) as u32;
        Self {
            bits: vec![0; m.div_ceil(8) as usize],
            num_bits: m,
            num_hashes: k,
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = (h1.wrapping_add((i as u64).wrapping_mul(h2))) % self.num_bits;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = (h1.wrapping_add((i as u64).wrapping_mul(h2))) % self.num_bits;
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    fn hash_pair(key: &[u8]) -> (u64, u64) {
        (fnv1a(key, FNV_OFFSET_BASIS), fnv1a(key, SECOND_SEED))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u64(self.num_bits);
        buf.put_u32(self.num_hashes);
        buf.put_u32(self.bits.len() as u32);
        buf.put_slice(&self.bits);
    }

    pub fn decode(buf: &mut &[u8]) -> EngineResult<Self> {
        if buf.remaining() < 8 + 4 + 4 {
            return Err(TracedEngineError::corruption("truncated bloom filter"));
        }
        let num_bits = buf.get_u64();
        let num_hashes = buf.get_u32();
        let len = buf.get_u32() as usize;
        if num_bits == 0 || num_hashes == 0 || len != num_bits.div_ceil(8) as usize {
            return Err(TracedEngineError::corruption("malformed bloom filter"));
        }
        if buf.remaining() < len {
            return Err(TracedEngineError::corruption("truncated bloom filter"));
        }
        let mut bits = vec![0u8; len];
        buf.copy_to_slice(&mut bits);
        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }
}

fn fnv1a(data: &[u8], seed: u64) -> u64 {
    let mut hash = seed;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut bf = BloomFilter::with_capacity(1000, 0.01);
        let keys: Vec<Vec<u8>> = (0..1000u32).map(|i| i.to_be_bytes().to_vec()).collect();
        for key in &keys {
            bf.insert(key);
        }
        for key in &keys {
            assert!(bf.may_contain(key));
        }
    }

    #[test]
    fn test_false_positive_rate_reasonable() {
        let mut bf = BloomFilter::with_capacity(1000, 0.01);
        for i in 0..1000u32 {
            bf.insert(&i.to_be_bytes());
        }
        let false_positives = (1000..11000u32)
            .filter(|i| bf.may_contain(&i.to_be_bytes()))
            .count();
        // Allow generous slack over the 1% target.
        assert!(false_positives < 500, "{} false positives", false_positives);
    }

    #[test]
    fn test_encode_decode() {
        let mut bf = BloomFilter::with_capacity(10, 0.05);
        bf.insert(b"hello");
        let mut buf = Vec::new();
        bf.encode(&mut buf);
        let decoded = BloomFilter::decode(&mut buf.as_slice()).unwrap();
        assert!(decoded.may_contain(b"hello"));
        assert_eq!(decoded.num_bits, bf.num_bits);
    }
}
