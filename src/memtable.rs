//! In-memory write buffer.
//!
//! The memtable is a concurrent skip list ordered by internal key. A single
//! writer (the holder of the write slot) appends while any number of
//! readers iterate, which is exactly the discipline `crossbeam-skiplist`
//! provides without locks. Deletions insert a tombstone entry; the read
//! path reports them as "definitely absent" so older values in lower
//! levels stay hidden.
//!
//! Memtables are shared by `Arc`: the coordinator holds one reference and
//! every outstanding iterator holds another, so a memtable's memory is
//! reclaimed only after the last reader is done with it.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::error::Result;
use crate::iterator::DbIter;
use crate::key::{
    make_internal_key, parse_internal_key, InternalKeyComparator, SequenceNumber, ValueTag,
    TAG_FOR_SEEK,
};

/// A skip-list key carrying the comparator used to order it. The internal
/// key comparator is dynamic (it wraps the user's comparator), so each key
/// holds a shared handle to it rather than relying on a static `Ord`.
struct MemKey {
    bytes: Vec<u8>,
    cmp: Arc<InternalKeyComparator>,
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        use crate::key::Comparator;
        self.cmp.compare(&self.bytes, &other.bytes)
    }
}

/// Lookup outcome for a point read against one memtable.
pub enum MemGet {
    /// Key present with this value.
    Found(Vec<u8>),
    /// Key deleted at or before the read sequence; stop probing.
    Deleted,
    /// This memtable knows nothing about the key.
    NotFound,
}

pub struct MemTable {
    cmp: Arc<InternalKeyComparator>,
    map: SkipMap<MemKey, Vec<u8>>,
    approximate_size: AtomicUsize,
}

impl MemTable {
    pub fn new(cmp: InternalKeyComparator) -> Self {
        Self {
            cmp: Arc::new(cmp),
            map: SkipMap::new(),
            approximate_size: AtomicUsize::new(0),
        }
    }

    fn mem_key(&self, bytes: Vec<u8>) -> MemKey {
        MemKey {
            bytes,
            cmp: Arc::clone(&self.cmp),
        }
    }

    /// Inserts an entry. `value` is ignored semantically for tombstones but
    /// still stored (empty by convention).
    pub fn add(&self, seq: SequenceNumber, tag: ValueTag, user_key: &[u8], value: &[u8]) {
        let internal_key = make_internal_key(user_key, seq, tag);
        let charge = internal_key.len() + value.len() + 32;
        self.map.insert(self.mem_key(internal_key), value.to_vec());
        self.approximate_size
            .fetch_add(charge, AtomicOrdering::Relaxed);
    }

    /// Point lookup at `seq`: the newest entry for `user_key` with sequence
    /// <= seq decides the outcome.
    pub fn get(&self, user_key: &[u8], seq: SequenceNumber) -> MemGet {
        use crate::key::Comparator;

        let probe = self.mem_key(make_internal_key(user_key, seq, TAG_FOR_SEEK));
        let entry = match self.map.range((Bound::Included(probe), Bound::Unbounded)).next() {
            Some(entry) => entry,
            None => return MemGet::NotFound,
        };
        let Some(parsed) = parse_internal_key(&entry.key().bytes) else {
            return MemGet::NotFound;
        };
        if self
            .cmp
            .user_comparator()
            .compare(parsed.user_key, user_key)
            != Ordering::Equal
        {
            return MemGet::NotFound;
        }
        match parsed.tag {
            ValueTag::Value => MemGet::Found(entry.value().clone()),
            ValueTag::Deletion => MemGet::Deleted,
        }
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.approximate_size.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn iter(self: &Arc<Self>) -> MemTableIter {
        MemTableIter {
            mem: Arc::clone(self),
            current: None,
        }
    }
}

/// Bidirectional iterator over a memtable's internal entries. Positions are
/// re-resolved through the skip list on each movement, so the iterator
/// remains valid while the single writer keeps appending.
pub struct MemTableIter {
    mem: Arc<MemTable>,
    /// Current entry, owned: (internal key, value).
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemTableIter {
    fn probe(&self, bytes: Vec<u8>) -> MemKey {
        MemKey {
            bytes,
            cmp: Arc::clone(&self.mem.cmp),
        }
    }
}

impl DbIter for MemTableIter {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        self.current = self
            .mem
            .map
            .front()
            .map(|e| (e.key().bytes.clone(), e.value().clone()));
    }

    fn seek_to_last(&mut self) {
        self.current = self
            .mem
            .map
            .back()
            .map(|e| (e.key().bytes.clone(), e.value().clone()));
    }

    fn seek(&mut self, target: &[u8]) {
        let probe = self.probe(target.to_vec());
        self.current = self
            .mem
            .map
            .range((Bound::Included(probe), Bound::Unbounded))
            .next()
            .map(|e| (e.key().bytes.clone(), e.value().clone()));
    }

    fn next(&mut self) {
        let Some((key, _)) = self.current.take() else {
            return;
        };
        let probe = self.probe(key);
        self.current = self
            .mem
            .map
            .range((Bound::Excluded(probe), Bound::Unbounded))
            .next()
            .map(|e| (e.key().bytes.clone(), e.value().clone()));
    }

    fn prev(&mut self) {
        let Some((key, _)) = self.current.take() else {
            return;
        };
        let probe = self.probe(key);
        self.current = self
            .mem
            .map
            .range((Bound::Unbounded, Bound::Excluded(probe)))
            .next_back()
            .map(|e| (e.key().bytes.clone(), e.value().clone()));
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator not valid").0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator not valid").1
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::BytewiseComparator;

    fn new_mem() -> Arc<MemTable> {
        Arc::new(MemTable::new(InternalKeyComparator::new(Arc::new(
            BytewiseComparator,
        ))))
    }

    #[test]
    fn test_add_and_get() {
        let mem = new_mem();
        mem.add(1, ValueTag::Value, b"apple", b"red");
        mem.add(2, ValueTag::Value, b"banana", b"yellow");

        assert!(matches!(mem.get(b"apple", 10), MemGet::Found(v) if v == b"red"));
        assert!(matches!(mem.get(b"banana", 10), MemGet::Found(v) if v == b"yellow"));
        assert!(matches!(mem.get(b"cherry", 10), MemGet::NotFound));
    }

    #[test]
    fn test_newest_version_wins() {
        let mem = new_mem();
        mem.add(1, ValueTag::Value, b"k", b"v1");
        mem.add(5, ValueTag::Value, b"k", b"v2");

        assert!(matches!(mem.get(b"k", 10), MemGet::Found(v) if v == b"v2"));
        // A read pinned before the second write still sees the first.
        assert!(matches!(mem.get(b"k", 1), MemGet::Found(v) if v == b"v1"));
        // A read pinned before any write sees nothing.
        assert!(matches!(mem.get(b"k", 0), MemGet::NotFound));
    }

    #[test]
    fn test_tombstone_hides_value() {
        let mem = new_mem();
        mem.add(1, ValueTag::Value, b"k", b"v");
        mem.add(2, ValueTag::Deletion, b"k", b"");

        assert!(matches!(mem.get(b"k", 10), MemGet::Deleted));
        assert!(matches!(mem.get(b"k", 1), MemGet::Found(v) if v == b"v"));
    }

    #[test]
    fn test_iterator_orders_by_internal_key() {
        let mem = new_mem();
        mem.add(3, ValueTag::Value, b"b", b"3");
        mem.add(1, ValueTag::Value, b"a", b"1");
        mem.add(2, ValueTag::Value, b"c", b"2");

        let mut iter = mem.iter();
        iter.seek_to_first();
        let mut user_keys = Vec::new();
        while iter.valid() {
            user_keys.push(crate::key::extract_user_key(iter.key()).to_vec());
            iter.next();
        }
        assert_eq!(user_keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_iterator_prev() {
        let mem = new_mem();
        mem.add(1, ValueTag::Value, b"a", b"1");
        mem.add(2, ValueTag::Value, b"b", b"2");
        mem.add(3, ValueTag::Value, b"c", b"3");

        let mut iter = mem.iter();
        iter.seek_to_last();
        assert!(iter.valid());
        assert_eq!(crate::key::extract_user_key(iter.key()), b"c");
        iter.prev();
        assert_eq!(crate::key::extract_user_key(iter.key()), b"b");
        iter.prev();
        assert_eq!(crate::key::extract_user_key(iter.key()), b"a");
        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn test_iterator_seek() {
        let mem = new_mem();
        mem.add(1, ValueTag::Value, b"apple", b"1");
        mem.add(2, ValueTag::Value, b"banana", b"2");

        let mut iter = mem.iter();
        iter.seek(&make_internal_key(b"avocado", 100, TAG_FOR_SEEK));
        assert!(iter.valid());
        assert_eq!(crate::key::extract_user_key(iter.key()), b"banana");

        iter.seek(&make_internal_key(b"zzz", 100, TAG_FOR_SEEK));
        assert!(!iter.valid());
    }

    #[test]
    fn test_size_accounting_grows() {
        let mem = new_mem();
        assert_eq!(mem.approximate_memory_usage(), 0);
        mem.add(1, ValueTag::Value, b"key", b"value");
        let after_one = mem.approximate_memory_usage();
        assert!(after_one > 0);
        mem.add(2, ValueTag::Value, b"key2", b"value2");
        assert!(mem.approximate_memory_usage() > after_one);
    }
}
