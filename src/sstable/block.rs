//! Prefix-compressed key-value blocks.
//!
//! Entries share prefixes with their predecessor:
//!
//! ```text
//! entry   := varint shared | varint unshared | varint value_len
//!          | key[shared..] | value
//! block   := entry* | restart_offsets: u32_le* | num_restarts: u32_le
//! ```
//!
//! Every `restart_interval` entries the builder emits a full key
//! (`shared = 0`) and records its offset in the restart array, which the
//! iterator binary-searches during `seek`. `prev` re-decodes forward from
//! the nearest restart point, since deltas only chain forward.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::encoding::{decode_varint32, encode_varint32};
use crate::error::{Error, Result};
use crate::iterator::DbIter;
use crate::key::Comparator;

pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    counter: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        assert!(restart_interval >= 1);
        Self {
            buffer: Vec::new(),
            restarts: vec![0],
            restart_interval,
            counter: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in strictly increasing order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.counter < self.restart_interval {
            self.last_key
                .iter()
                .zip(key.iter())
                .take_while(|(a, b)| a == b)
                .count()
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };
        let unshared = key.len() - shared;

        encode_varint32(&mut self.buffer, shared as u32);
        encode_varint32(&mut self.buffer, unshared as u32);
        encode_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Appends the restart array and returns the finished block contents.
    pub fn finish(mut self) -> Vec<u8> {
        for &restart in &self.restarts {
            let mut buf = [0u8; 4];
            LittleEndian::write_u32(&mut buf, restart);
            self.buffer.extend_from_slice(&buf);
        }
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, self.restarts.len() as u32);
        self.buffer.extend_from_slice(&buf);
        self.buffer
    }

    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

/// An immutable, decoded block.
pub struct Block {
    data: Vec<u8>,
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Corruption("block too small".to_string()));
        }
        let num_restarts = LittleEndian::read_u32(&data[data.len() - 4..]);
        let array_bytes = num_restarts as usize * 4 + 4;
        if array_bytes > data.len() {
            return Err(Error::Corruption(
                "block restart array overflows block".to_string(),
            ));
        }
        let restart_offset = data.len() - array_bytes;
        Ok(Self {
            data,
            restart_offset,
            num_restarts,
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn restart_point(&self, index: u32) -> usize {
        debug_assert!(index < self.num_restarts);
        let at = self.restart_offset + index as usize * 4;
        LittleEndian::read_u32(&self.data[at..at + 4]) as usize
    }

    pub fn iter(self: &Arc<Self>, cmp: Arc<dyn Comparator>) -> BlockIter {
        BlockIter {
            block: Arc::clone(self),
            cmp,
            current: self.restart_offset,
            restart_index: self.num_restarts,
            key: Vec::new(),
            value_offset: 0,
            value_len: 0,
            err: None,
        }
    }
}

struct EntryHeader {
    shared: usize,
    unshared: usize,
    value_len: usize,
    /// Offset of the unshared key bytes.
    delta_offset: usize,
}

/// Bidirectional cursor over one block.
pub struct BlockIter {
    block: Arc<Block>,
    cmp: Arc<dyn Comparator>,
    /// Offset of the current entry; `restart_offset` means not valid.
    current: usize,
    restart_index: u32,
    key: Vec<u8>,
    value_offset: usize,
    value_len: usize,
    err: Option<Error>,
}

impl BlockIter {
    fn next_entry_offset(&self) -> usize {
        self.value_offset + self.value_len
    }

    fn decode_entry(&self, offset: usize) -> Result<EntryHeader> {
        let limit = self.block.restart_offset;
        if offset >= limit {
            return Err(Error::Corruption("entry offset out of range".to_string()));
        }
        let data = &self.block.data[..limit];
        let mut pos = offset;

        let mut read = |what: &str| -> Result<u32> {
            let (v, n) = decode_varint32(&data[pos..])
                .ok_or_else(|| Error::Corruption(format!("bad {what} in block entry")))?;
            pos += n;
            Ok(v)
        };
        let shared = read("shared length")? as usize;
        let unshared = read("unshared length")? as usize;
        let value_len = read("value length")? as usize;

        if pos + unshared + value_len > limit {
            return Err(Error::Corruption("block entry overruns block".to_string()));
        }
        Ok(EntryHeader {
            shared,
            unshared,
            value_len,
            delta_offset: pos,
        })
    }

    fn corrupt(&mut self, err: Error) {
        self.err = Some(err);
        self.current = self.block.restart_offset;
        self.restart_index = self.block.num_restarts;
        self.key.clear();
        self.value_len = 0;
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        // Dummy zero-length value ending at the restart offset, so
        // next_entry_offset lands on the restart point.
        self.value_offset = self.block.restart_point(index);
        self.value_len = 0;
    }

    /// Advances to the entry at `next_entry_offset`. Returns false at the
    /// end of the entry region or on corruption.
    fn parse_next_key(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.block.restart_offset {
            self.current = self.block.restart_offset;
            self.restart_index = self.block.num_restarts;
            return false;
        }

        let header = match self.decode_entry(self.current) {
            Ok(h) => h,
            Err(e) => {
                self.corrupt(e);
                return false;
            }
        };
        if header.shared > self.key.len() {
            self.corrupt(Error::Corruption(
                "shared prefix longer than previous key".to_string(),
            ));
            return false;
        }

        self.key.truncate(header.shared);
        self.key.extend_from_slice(
            &self.block.data[header.delta_offset..header.delta_offset + header.unshared],
        );
        self.value_offset = header.delta_offset + header.unshared;
        self.value_len = header.value_len;

        while self.restart_index + 1 < self.block.num_restarts
            && self.block.restart_point(self.restart_index + 1) < self.current
        {
            self.restart_index += 1;
        }
        true
    }
}

impl DbIter for BlockIter {
    fn valid(&self) -> bool {
        self.err.is_none() && self.current < self.block.restart_offset
    }

    fn seek_to_first(&mut self) {
        if self.err.is_some() || self.block.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    fn seek_to_last(&mut self) {
        if self.err.is_some() || self.block.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(self.block.num_restarts - 1);
        while self.parse_next_key() && self.next_entry_offset() < self.block.restart_offset {}
    }

    fn seek(&mut self, target: &[u8]) {
        if self.err.is_some() || self.block.num_restarts == 0 {
            return;
        }
        // Binary search over restart points for the last full key < target.
        let mut left: u32 = 0;
        let mut right: u32 = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let offset = self.block.restart_point(mid);
            let header = match self.decode_entry(offset) {
                Ok(h) if h.shared == 0 => h,
                Ok(_) => {
                    self.corrupt(Error::Corruption(
                        "restart entry carries a shared prefix".to_string(),
                    ));
                    return;
                }
                Err(e) => {
                    self.corrupt(e);
                    return;
                }
            };
            let key = &self.block.data[header.delta_offset..header.delta_offset + header.unshared];
            if self.cmp.compare(key, target) == Ordering::Less {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        self.seek_to_restart_point(left);
        // Linear scan inside the restart span.
        loop {
            if !self.parse_next_key() {
                return;
            }
            if self.cmp.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_key();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let original = self.current;

        // Find the last restart point strictly before the current entry.
        while self.block.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                // No entry before the current one.
                self.current = self.block.restart_offset;
                self.restart_index = self.block.num_restarts;
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        // Walk forward until the entry just before `original`.
        while self.parse_next_key() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.block.data[self.value_offset..self.value_offset + self.value_len]
    }

    fn status(&self) -> Result<()> {
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::BytewiseComparator;

    fn build(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(restart_interval);
        for (k, v) in entries {
            builder.add(k, v);
        }
        Arc::new(Block::new(builder.finish()).expect("bad block"))
    }

    fn cmp() -> Arc<dyn Comparator> {
        Arc::new(BytewiseComparator)
    }

    fn sample() -> Vec<(&'static [u8], &'static [u8])> {
        vec![
            (b"apple", b"fruit"),
            (b"application", b"software"),
            (b"banana", b"fruit"),
            (b"band", b"music"),
            (b"bandana", b"clothing"),
        ]
    }

    #[test]
    fn test_forward_scan_roundtrip() {
        for interval in [1, 2, 16] {
            let entries = sample();
            let block = build(&entries, interval);
            let mut iter = block.iter(cmp());
            iter.seek_to_first();
            for (k, v) in &entries {
                assert!(iter.valid(), "interval {interval}");
                assert_eq!(iter.key(), *k);
                assert_eq!(iter.value(), *v);
                iter.next();
            }
            assert!(!iter.valid());
            iter.status().unwrap();
        }
    }

    #[test]
    fn test_backward_scan() {
        let entries = sample();
        let block = build(&entries, 2);
        let mut iter = block.iter(cmp());
        iter.seek_to_last();
        for (k, _) in entries.iter().rev() {
            assert!(iter.valid());
            assert_eq!(iter.key(), *k);
            iter.prev();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek() {
        let block = build(&sample(), 2);
        let mut iter = block.iter(cmp());

        iter.seek(b"band");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"band");

        // Between keys: lands on the next one.
        iter.seek(b"bana");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"banana");

        // Before everything.
        iter.seek(b"a");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"apple");

        // Past everything.
        iter.seek(b"zebra");
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek_then_prev() {
        let block = build(&sample(), 2);
        let mut iter = block.iter(cmp());
        iter.seek(b"band");
        iter.prev();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"banana");

        iter.seek(b"apple");
        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn test_empty_block() {
        let block = Arc::new(Block::new(BlockBuilder::new(16).finish()).unwrap());
        let mut iter = block.iter(cmp());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
        iter.seek(b"anything");
        assert!(!iter.valid());
        iter.status().unwrap();
    }

    #[test]
    fn test_large_block_many_restarts() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..500)
            .map(|i| {
                (
                    format!("key_{i:05}").into_bytes(),
                    format!("value_{i:05}").into_bytes(),
                )
            })
            .collect();
        let refs: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let block = build(&refs, 16);

        let mut iter = block.iter(cmp());
        for (k, v) in &refs {
            iter.seek(k);
            assert!(iter.valid());
            assert_eq!(&iter.key(), k);
            assert_eq!(&iter.value(), v);
        }

        // Seek to a mid-span key and walk backwards across restarts.
        iter.seek(b"key_00100");
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.prev();
        }
        assert_eq!(count, 101);
    }

    #[test]
    fn test_truncated_block_rejected() {
        assert!(Block::new(vec![1, 2]).is_err());

        // Claim more restarts than fit.
        let mut data = vec![0u8; 8];
        LittleEndian::write_u32(&mut data[4..], 1000);
        assert!(Block::new(data).is_err());
    }

    #[test]
    fn test_corrupt_entry_sets_status() {
        let mut raw = {
            let mut b = BlockBuilder::new(16);
            b.add(b"aaa", b"1");
            b.add(b"aab", b"2");
            b.finish()
        };
        // Clobber the second entry's shared-length varint: entry 0 occupies
        // 3 header bytes + "aaa" + "1" = 7 bytes, so entry 1 starts at 7.
        raw[7] = 0xff;
        raw[8] = 0xff;
        let block = Arc::new(Block::new(raw).unwrap());
        let mut iter = block.iter(cmp());
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"aaa");
        iter.next();
        assert!(!iter.valid());
        assert!(matches!(iter.status(), Err(Error::Corruption(_))));
    }
}
