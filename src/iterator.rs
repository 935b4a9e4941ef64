//! Iterator trait and merge algorithm for ordered scans.
//!
//! Every sorted data source (memtable, sstable block, whole table, level)
//! exposes the same bidirectional cursor interface, [`DbIter`]. The merging
//! iterator composes K children into one ordered stream over internal keys;
//! the newest source wins ties because the internal key comparator sorts
//! higher sequences first.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::key::{Comparator, InternalKeyComparator};

/// A positioned cursor over ordered key-value entries.
///
/// After any seek or movement, `valid()` reports whether the cursor is on
/// an entry; `key`/`value` may only be called while valid. Errors observed
/// while moving are latched and reported by `status()`.
pub trait DbIter {
    fn valid(&self) -> bool;
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    /// Positions at the first entry with key >= target.
    fn seek(&mut self, target: &[u8]);
    fn next(&mut self);
    fn prev(&mut self);
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    fn status(&self) -> Result<()>;
}

impl DbIter for Box<dyn DbIter> {
    fn valid(&self) -> bool {
        (**self).valid()
    }
    fn seek_to_first(&mut self) {
        (**self).seek_to_first()
    }
    fn seek_to_last(&mut self) {
        (**self).seek_to_last()
    }
    fn seek(&mut self, target: &[u8]) {
        (**self).seek(target)
    }
    fn next(&mut self) {
        (**self).next()
    }
    fn prev(&mut self) {
        (**self).prev()
    }
    fn key(&self) -> &[u8] {
        (**self).key()
    }
    fn value(&self) -> &[u8] {
        (**self).value()
    }
    fn status(&self) -> Result<()> {
        (**self).status()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// K-way merge of child iterators by internal key order.
///
/// The merge tracks a direction. Moving against the current direction
/// first re-positions every non-current child to straddle the current key;
/// skipping that step would hand out entries out of order.
pub struct MergingIter {
    cmp: Arc<InternalKeyComparator>,
    children: Vec<Box<dyn DbIter>>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIter {
    pub fn new(cmp: Arc<InternalKeyComparator>, children: Vec<Box<dyn DbIter>>) -> Self {
        Self {
            cmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    if self.cmp.compare(child.key(), self.children[s].key()) == Ordering::Less {
                        smallest = Some(i);
                    }
                }
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match largest {
                None => largest = Some(i),
                Some(l) => {
                    if self.cmp.compare(child.key(), self.children[l].key()) == Ordering::Greater {
                        largest = Some(i);
                    }
                }
            }
        }
        self.current = largest;
    }
}

impl DbIter for MergingIter {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn next(&mut self) {
        let Some(current) = self.current else { return };

        if self.direction != Direction::Forward {
            // All non-current children sit at or before the current key;
            // move each to the first entry after it.
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid()
                    && self.cmp.compare(&key, child.key()) == Ordering::Equal
                {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let Some(current) = self.current else { return };

        if self.direction != Direction::Reverse {
            // All non-current children sit at or after the current key;
            // move each to the last entry before it.
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() {
                    // Child is at the first entry >= key; step back once.
                    child.prev();
                } else {
                    // Everything in this child is < key.
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.expect("iterator not valid")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("iterator not valid")].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// In-memory iterator over pre-sorted (key, value) pairs.
    pub struct VecIter {
        pub entries: Vec<(Vec<u8>, Vec<u8>)>,
        pub pos: Option<usize>,
        cmp: Arc<InternalKeyComparator>,
    }

    impl VecIter {
        pub fn new(cmp: Arc<InternalKeyComparator>, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            Self {
                entries,
                pos: None,
                cmp,
            }
        }
    }

    impl DbIter for VecIter {
        fn valid(&self) -> bool {
            self.pos.is_some()
        }
        fn seek_to_first(&mut self) {
            self.pos = if self.entries.is_empty() { None } else { Some(0) };
        }
        fn seek_to_last(&mut self) {
            self.pos = self.entries.len().checked_sub(1);
        }
        fn seek(&mut self, target: &[u8]) {
            self.pos = self
                .entries
                .iter()
                .position(|(k, _)| self.cmp.compare(k, target) != Ordering::Less);
        }
        fn next(&mut self) {
            self.pos = match self.pos {
                Some(p) if p + 1 < self.entries.len() => Some(p + 1),
                _ => None,
            };
        }
        fn prev(&mut self) {
            self.pos = match self.pos {
                Some(p) if p > 0 => Some(p - 1),
                _ => None,
            };
        }
        fn key(&self) -> &[u8] {
            &self.entries[self.pos.unwrap()].0
        }
        fn value(&self) -> &[u8] {
            &self.entries[self.pos.unwrap()].1
        }
        fn status(&self) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::VecIter;
    use super::*;
    use crate::key::{make_internal_key, BytewiseComparator, ValueTag};

    fn icmp() -> Arc<InternalKeyComparator> {
        Arc::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)))
    }

    fn entry(key: &str, seq: u64, value: &str) -> (Vec<u8>, Vec<u8>) {
        (
            make_internal_key(key.as_bytes(), seq, ValueTag::Value),
            value.as_bytes().to_vec(),
        )
    }

    fn merged(sources: Vec<Vec<(Vec<u8>, Vec<u8>)>>) -> MergingIter {
        let cmp = icmp();
        let children: Vec<Box<dyn DbIter>> = sources
            .into_iter()
            .map(|s| Box::new(VecIter::new(Arc::clone(&cmp), s)) as Box<dyn DbIter>)
            .collect();
        MergingIter::new(cmp, children)
    }

    fn collect_forward(iter: &mut MergingIter) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            out.push(crate::key::extract_user_key(iter.key()).to_vec());
            iter.next();
        }
        out
    }

    #[test]
    fn test_merge_interleaved_sources() {
        let mut iter = merged(vec![
            vec![entry("a", 1, "1"), entry("d", 1, "4")],
            vec![entry("b", 1, "2"), entry("e", 1, "5")],
            vec![entry("c", 1, "3")],
        ]);
        assert_eq!(
            collect_forward(&mut iter),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]
        );
    }

    #[test]
    fn test_merge_same_user_key_newest_first() {
        let mut iter = merged(vec![
            vec![entry("k", 5, "new")],
            vec![entry("k", 2, "old")],
        ]);
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(iter.value(), b"new");
        iter.next();
        assert!(iter.valid());
        assert_eq!(iter.value(), b"old");
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_merge_reverse() {
        let mut iter = merged(vec![
            vec![entry("a", 1, "1"), entry("c", 1, "3")],
            vec![entry("b", 1, "2")],
        ]);
        iter.seek_to_last();
        let mut out = Vec::new();
        while iter.valid() {
            out.push(crate::key::extract_user_key(iter.key()).to_vec());
            iter.prev();
        }
        assert_eq!(out, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_merge_direction_switch() {
        let mut iter = merged(vec![
            vec![entry("a", 1, "1"), entry("c", 1, "3"), entry("e", 1, "5")],
            vec![entry("b", 1, "2"), entry("d", 1, "4")],
        ]);

        iter.seek_to_first(); // a
        iter.next(); // b
        iter.next(); // c
        assert_eq!(crate::key::extract_user_key(iter.key()), b"c");

        // Switch to reverse: must return b, then a.
        iter.prev();
        assert_eq!(crate::key::extract_user_key(iter.key()), b"b");
        iter.prev();
        assert_eq!(crate::key::extract_user_key(iter.key()), b"a");

        // And forward again.
        iter.next();
        assert_eq!(crate::key::extract_user_key(iter.key()), b"b");
    }

    #[test]
    fn test_merge_seek() {
        let mut iter = merged(vec![
            vec![entry("alpha", 1, "1"), entry("delta", 1, "4")],
            vec![entry("bravo", 1, "2")],
        ]);
        iter.seek(&make_internal_key(b"b", 100, ValueTag::Value));
        assert!(iter.valid());
        assert_eq!(crate::key::extract_user_key(iter.key()), b"bravo");
    }

    #[test]
    fn test_merge_empty_children() {
        let mut iter = merged(vec![vec![], vec![entry("only", 1, "1")], vec![]]);
        assert_eq!(collect_forward(&mut iter), vec![b"only".to_vec()]);

        let mut empty = merged(vec![vec![], vec![]]);
        empty.seek_to_first();
        assert!(!empty.valid());
    }
}
