//! Read filters.
//!
//! A filter block answers "might this table contain the key?" without
//! touching data blocks. One filter is generated per 2 KiB range of data
//! block offsets:
//!
//! ```text
//! +----------------+----------------+-----+----------------------+
//! | filter 0 bytes | filter 1 bytes | ... | offsets: u32_le each |
//! +----------------+----------------+-----+----------------------+
//! | offset-array start: u32_le | base_lg: u8                     |
//! +-----------------------------------------------------------—--+
//! ```
//!
//! The bundled policy is a bloom filter using two 64-bit halves of an
//! xxh3-128 digest for double hashing: bit positions are
//! `h1 + i * h2 (mod bits)`.

use byteorder::{ByteOrder, LittleEndian};

use xxhash_rust::xxh3::xxh3_128;

/// Filters keys per 2 KiB of data-block offset space.
const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// A pluggable per-table filter.
pub trait FilterPolicy: Send + Sync {
    /// Name stored in the metaindex; a reader with a different policy name
    /// ignores the filter block.
    fn name(&self) -> &'static str;

    /// Builds a filter covering `keys`, appended to the block verbatim.
    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8>;

    /// Must return true if `key` was in the set the filter was built from;
    /// may return true for keys that were not (false positive).
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Double-hashed bloom filter.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    k: u32,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        // k = bits_per_key * ln(2), clamped to a sane probe count.
        let k = ((bits_per_key as f64) * 0.69).round() as u32;
        Self {
            bits_per_key,
            k: k.clamp(1, 30),
        }
    }

    fn hashes(key: &[u8]) -> (u64, u64) {
        let h = xxh3_128(key);
        (h as u64, (h >> 64) as u64)
    }
}

impl Default for BloomFilterPolicy {
    fn default() -> Self {
        Self::new(10)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "cinderdb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        let bits = (keys.len() * self.bits_per_key).max(64);
        let bytes = bits.div_ceil(8);
        let bits = bytes * 8;

        let mut filter = vec![0u8; bytes + 1];
        filter[bytes] = self.k as u8;

        for key in keys {
            let (h1, h2) = Self::hashes(key);
            for i in 0..self.k as u64 {
                let pos = (h1.wrapping_add(i.wrapping_mul(h2)) % bits as u64) as usize;
                filter[pos / 8] |= 1 << (pos % 8);
            }
        }
        filter
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            return true;
        }
        let bytes = filter.len() - 1;
        let bits = bytes * 8;
        let k = filter[bytes];
        if k > 30 {
            // Reserved for future encodings; err on the side of a read.
            return true;
        }

        let (h1, h2) = Self::hashes(key);
        for i in 0..k as u64 {
            let pos = (h1.wrapping_add(i.wrapping_mul(h2)) % bits as u64) as usize;
            if filter[pos / 8] & (1 << (pos % 8)) == 0 {
                return false;
            }
        }
        true
    }
}

/// Accumulates filters while a table is built.
pub struct FilterBlockBuilder {
    policy: std::sync::Arc<dyn FilterPolicy>,
    keys: Vec<Vec<u8>>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: std::sync::Arc<dyn FilterPolicy>) -> Self {
        Self {
            policy,
            keys: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Called when a data block begins at `block_offset`; emits filters for
    /// every 2 KiB boundary crossed since the last call.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    pub fn finish(mut self) -> Vec<u8> {
        if !self.keys.is_empty() {
            self.generate_filter();
        }
        let array_start = self.result.len() as u32;
        for &offset in &self.filter_offsets {
            let mut buf = [0u8; 4];
            LittleEndian::write_u32(&mut buf, offset);
            self.result.extend_from_slice(&buf);
        }
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, array_start);
        self.result.extend_from_slice(&buf);
        self.result.push(FILTER_BASE_LG);
        self.result
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.keys.is_empty() {
            // Empty range: record a zero-length filter.
            return;
        }
        let filter = self.policy.create_filter(&self.keys);
        self.result.extend_from_slice(&filter);
        self.keys.clear();
    }
}

/// Reads filters back out of a finished filter block.
pub struct FilterBlockReader {
    data: Vec<u8>,
    /// Offset of the u32 offset array inside `data`.
    array_start: usize,
    num_filters: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    /// Returns None if the block is structurally unusable; the caller then
    /// reads without a filter.
    pub fn new(data: Vec<u8>) -> Option<Self> {
        if data.len() < 5 {
            return None;
        }
        let base_lg = data[data.len() - 1];
        let array_start = LittleEndian::read_u32(&data[data.len() - 5..data.len() - 1]) as usize;
        if array_start > data.len() - 5 {
            return None;
        }
        let num_filters = (data.len() - 5 - array_start) / 4;
        Some(Self {
            data,
            array_start,
            num_filters,
            base_lg,
        })
    }

    pub fn key_may_match(
        &self,
        policy: &dyn FilterPolicy,
        block_offset: u64,
        key: &[u8],
    ) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            return true;
        }
        let at = self.array_start + index * 4;
        let start = LittleEndian::read_u32(&self.data[at..at + 4]) as usize;
        let limit = if index + 1 < self.num_filters {
            LittleEndian::read_u32(&self.data[at + 4..at + 8]) as usize
        } else {
            self.array_start
        };
        if start > limit || limit > self.array_start {
            // Malformed entry; do the read rather than lose it.
            return true;
        }
        if start == limit {
            // Empty filter covers no keys.
            return false;
        }
        policy.key_may_match(key, &self.data[start..limit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_no_false_negatives() {
        let policy = BloomFilterPolicy::new(10);
        let keys: Vec<Vec<u8>> = (0..1000).map(|i| format!("key-{i}").into_bytes()).collect();
        let filter = policy.create_filter(&keys);

        for key in &keys {
            assert!(
                policy.key_may_match(key, &filter),
                "false negative for {}",
                String::from_utf8_lossy(key)
            );
        }
    }

    #[test]
    fn test_bloom_filters_most_absent_keys() {
        let policy = BloomFilterPolicy::new(10);
        let keys: Vec<Vec<u8>> = (0..1000).map(|i| format!("key-{i}").into_bytes()).collect();
        let filter = policy.create_filter(&keys);

        let mut false_positives = 0;
        for i in 0..1000 {
            if policy.key_may_match(format!("absent-{i}").as_bytes(), &filter) {
                false_positives += 1;
            }
        }
        // ~1% expected at 10 bits/key; 5% is a generous bound.
        assert!(false_positives < 50, "{false_positives} false positives");
    }

    #[test]
    fn test_filter_block_single_block() {
        let policy = BloomFilterPolicy::new(10);
        let mut builder = FilterBlockBuilder::new(std::sync::Arc::new(BloomFilterPolicy::new(10)));
        builder.start_block(0);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        let block = builder.finish();

        let reader = FilterBlockReader::new(block).expect("unreadable filter block");
        assert!(reader.key_may_match(&policy, 0, b"foo"));
        assert!(reader.key_may_match(&policy, 0, b"bar"));
        assert!(!reader.key_may_match(&policy, 0, b"definitely-absent-key"));
    }

    #[test]
    fn test_filter_block_multiple_ranges() {
        let policy = BloomFilterPolicy::new(10);
        let mut builder = FilterBlockBuilder::new(std::sync::Arc::new(BloomFilterPolicy::new(10)));

        builder.start_block(0);
        builder.add_key(b"first");
        builder.start_block(3000); // second 2 KiB range
        builder.add_key(b"second");
        builder.start_block(9000); // skips empty ranges in between
        builder.add_key(b"third");
        let block = builder.finish();

        let reader = FilterBlockReader::new(block).expect("unreadable filter block");
        assert!(reader.key_may_match(&policy, 0, b"first"));
        assert!(reader.key_may_match(&policy, 3000, b"second"));
        assert!(reader.key_may_match(&policy, 9000, b"third"));

        assert!(!reader.key_may_match(&policy, 0, b"second"));
        assert!(!reader.key_may_match(&policy, 3000, b"first"));
        // Range with no keys at all rejects everything.
        assert!(!reader.key_may_match(&policy, 5000, b"first"));
    }

    #[test]
    fn test_unreadable_filter_block() {
        assert!(FilterBlockReader::new(vec![1, 2]).is_none());
    }
}
