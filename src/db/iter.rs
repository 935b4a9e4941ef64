//! The user-facing database iterator.
//!
//! Collapses the merged stream of internal entries into user entries: for
//! each user key only the newest version at or below the read sequence is
//! surfaced, and tombstones hide everything older. The iterator pins the
//! version it was created against (and, through its children, the
//! memtables), so its view never shifts underneath it.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::iterator::{DbIter, MergingIter};
use crate::key::{
    extract_user_key, make_internal_key, parse_internal_key, Comparator, SequenceNumber, ValueTag,
    TAG_FOR_SEEK,
};
use crate::version::Version;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// `inner` sits on the entry backing the current user entry.
    Forward,
    /// `inner` sits on the last entry *before* the current user key; the
    /// current entry is held in `saved_key`/`saved_value`.
    Reverse,
}

pub struct DatabaseIterator {
    ucmp: Arc<dyn Comparator>,
    inner: MergingIter,
    sequence: SequenceNumber,
    direction: Direction,
    valid: bool,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    /// Pins every sstable this iterator may touch.
    _version: Arc<Version>,
}

impl DatabaseIterator {
    pub(crate) fn new(
        ucmp: Arc<dyn Comparator>,
        inner: MergingIter,
        sequence: SequenceNumber,
        version: Arc<Version>,
    ) -> Self {
        Self {
            ucmp,
            inner,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            _version: version,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => extract_user_key(self.inner.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.inner.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    pub fn status(&self) -> Result<()> {
        self.inner.status()
    }

    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.inner.seek_to_first();
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.inner.seek_to_last();
        self.find_prev_user_entry();
    }

    pub fn seek(&mut self, user_key: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key = make_internal_key(user_key, self.sequence, TAG_FOR_SEEK);
        self.inner.seek(&self.saved_key.clone());
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid);
        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // inner is before the current entry; step onto or past it.
            if !self.inner.valid() {
                self.inner.seek_to_first();
            } else {
                self.inner.next();
            }
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
            // saved_key holds the user key to skip past.
        } else {
            self.saved_key = extract_user_key(self.inner.key()).to_vec();
            self.inner.next();
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }
        self.find_next_user_entry(true);
    }

    pub fn prev(&mut self) {
        debug_assert!(self.valid);
        if self.direction == Direction::Forward {
            // inner is on the current entry; back off to before its user
            // key.
            debug_assert!(self.inner.valid());
            self.saved_key = extract_user_key(self.inner.key()).to_vec();
            loop {
                self.inner.prev();
                if !self.inner.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if self
                    .ucmp
                    .compare(extract_user_key(self.inner.key()), &self.saved_key)
                    == Ordering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }
        self.find_prev_user_entry();
    }

    /// Positions on the next visible user entry at or after the inner
    /// position. With `skipping`, entries for `saved_key` are passed over.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.direction == Direction::Forward);
        while self.inner.valid() {
            if let Some(parsed) = parse_internal_key(self.inner.key()) {
                if parsed.sequence <= self.sequence {
                    match parsed.tag {
                        ValueTag::Deletion => {
                            // Everything older for this user key is gone.
                            self.saved_key = parsed.user_key.to_vec();
                            skipping = true;
                        }
                        ValueTag::Value => {
                            if skipping
                                && self.ucmp.compare(parsed.user_key, &self.saved_key)
                                    != Ordering::Greater
                            {
                                // Hidden behind a newer entry or tombstone.
                            } else {
                                self.valid = true;
                                self.saved_key.clear();
                                return;
                            }
                        }
                    }
                }
            }
            self.inner.next();
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Scans backwards until the newest visible entry of the previous user
    /// key has been seen, leaving it in `saved_key`/`saved_value`.
    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);
        let mut value_tag = ValueTag::Deletion;
        while self.inner.valid() {
            if let Some(parsed) = parse_internal_key(self.inner.key()) {
                if parsed.sequence <= self.sequence {
                    if value_tag != ValueTag::Deletion
                        && self.ucmp.compare(parsed.user_key, &self.saved_key) == Ordering::Less
                    {
                        // We have stepped past every version of the entry
                        // held in saved_*.
                        break;
                    }
                    value_tag = parsed.tag;
                    match parsed.tag {
                        ValueTag::Deletion => {
                            self.saved_key.clear();
                            self.saved_value.clear();
                        }
                        ValueTag::Value => {
                            self.saved_key = parsed.user_key.to_vec();
                            self.saved_value = self.inner.value().to_vec();
                        }
                    }
                }
            }
            self.inner.prev();
        }

        if value_tag == ValueTag::Deletion {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}

/// Forward consumption as a standard iterator: starts from the beginning
/// of the keyspace (or from wherever the cursor was explicitly
/// positioned), yields `(user_key, value)` pairs, and surfaces a latched
/// error as the final item.
pub struct Entries {
    cursor: DatabaseIterator,
    primed: bool,
    exhausted: bool,
}

impl IntoIterator for DatabaseIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;
    type IntoIter = Entries;

    fn into_iter(self) -> Entries {
        Entries {
            cursor: self,
            primed: false,
            exhausted: false,
        }
    }
}

impl Iterator for Entries {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        if !self.primed {
            self.primed = true;
            if !self.cursor.valid() {
                self.cursor.seek_to_first();
            }
        } else if self.cursor.valid() {
            self.cursor.next();
        }

        if self.cursor.valid() {
            Some(Ok((self.cursor.key().to_vec(), self.cursor.value().to_vec())))
        } else {
            self.exhausted = true;
            match self.cursor.status() {
                Ok(()) => None,
                Err(e) => Some(Err(e)),
            }
        }
    }
}
