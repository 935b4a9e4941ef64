//! Atomic write batches.
//!
//! A batch is the unit of logging and application: a starting sequence
//! number, a record count, and a run of put/delete records.
//!
//! ```text
//! +---------------+--------------+-------------------------------+
//! | sequence: u64 | count: u32   | records...                    |
//! +---------------+--------------+-------------------------------+
//!
//! record := 0x01 | varint key_len | key | varint value_len | value   (put)
//!         | 0x00 | varint key_len | key                              (delete)
//! ```
//!
//! Integers are little-endian. The same byte string is appended verbatim to
//! the write-ahead log, so a batch is replayed on recovery exactly as it
//! was applied.

use byteorder::{ByteOrder, LittleEndian};

use crate::encoding::{get_length_prefixed_slice, put_length_prefixed_slice};
use crate::error::{Error, Result};
use crate::key::{SequenceNumber, ValueTag};
use crate::memtable::MemTable;

/// sequence (8) + count (4).
pub const BATCH_HEADER_SIZE: usize = 12;

/// An ordered set of updates applied atomically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            rep: vec![0; BATCH_HEADER_SIZE],
        }
    }

    /// Parses a batch back from its wire form (log replay).
    pub fn from_contents(rep: Vec<u8>) -> Result<Self> {
        if rep.len() < BATCH_HEADER_SIZE {
            return Err(Error::Corruption("batch too small".to_string()));
        }
        Ok(Self { rep })
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueTag::Value as u8);
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueTag::Deletion as u8);
        put_length_prefixed_slice(&mut self.rep, key);
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    pub fn count(&self) -> u32 {
        LittleEndian::read_u32(&self.rep[8..12])
    }

    pub fn set_count(&mut self, count: u32) {
        LittleEndian::write_u32(&mut self.rep[8..12], count);
    }

    pub fn sequence(&self) -> SequenceNumber {
        LittleEndian::read_u64(&self.rep[..8])
    }

    pub fn set_sequence(&mut self, seq: SequenceNumber) {
        LittleEndian::write_u64(&mut self.rep[..8], seq);
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Byte size of the wire representation.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Appends every record of `other` to this batch.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_SIZE..]);
    }

    /// Iterates the records, in insertion order.
    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            rest: &self.rep[BATCH_HEADER_SIZE..],
            remaining: self.count(),
        }
    }

    /// Applies every record to `mem`, assigning one sequence number per
    /// record starting at the batch's sequence.
    pub fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut seq = self.sequence();
        for record in self.iter() {
            match record? {
                BatchRecord::Put { key, value } => mem.add(seq, ValueTag::Value, key, value),
                BatchRecord::Delete { key } => mem.add(seq, ValueTag::Deletion, key, b""),
            }
            seq += 1;
        }
        Ok(())
    }
}

/// A single decoded batch record.
#[derive(Debug, PartialEq, Eq)]
pub enum BatchRecord<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Delete { key: &'a [u8] },
}

pub struct BatchIter<'a> {
    rest: &'a [u8],
    remaining: u32,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            if !self.rest.is_empty() {
                self.remaining = 0;
                return Some(Err(Error::Corruption(
                    "batch has trailing bytes past its record count".to_string(),
                )));
            }
            return None;
        }
        self.remaining -= 1;

        let (&tag, rest) = self.rest.split_first()?;
        let Some((key, n)) = get_length_prefixed_slice(rest) else {
            self.remaining = 0;
            return Some(Err(Error::Corruption("bad batch key".to_string())));
        };
        let rest = &rest[n..];

        match ValueTag::from_u8(tag) {
            Some(ValueTag::Value) => {
                let Some((value, n)) = get_length_prefixed_slice(rest) else {
                    self.remaining = 0;
                    return Some(Err(Error::Corruption("bad batch value".to_string())));
                };
                self.rest = &rest[n..];
                Some(Ok(BatchRecord::Put { key, value }))
            }
            Some(ValueTag::Deletion) => {
                self.rest = rest;
                Some(Ok(BatchRecord::Delete { key }))
            }
            None => {
                self.remaining = 0;
                Some(Err(Error::Corruption(format!("bad batch tag: {tag:#x}"))))
            }
        }
    }
}
