//! Internal key format and key ordering.
//!
//! Every record the engine stores is addressed by an *internal key*: the
//! user key followed by an 8-byte suffix packing a 56-bit sequence number
//! and an 8-bit tag:
//!
//! ```text
//! +----------------+---------------------------------+
//! | user key bytes | u64_le(sequence << 8 | tag)     |
//! +----------------+---------------------------------+
//! ```
//!
//! Internal keys order by user key ascending, then by the packed suffix
//! descending, so for a given user key the newest write sorts first. A
//! forward scan starting at `(key, S, Value)` therefore yields the newest
//! entry with sequence <= S before any older one.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

/// Monotonic counter assigned per user operation by the write coordinator.
pub type SequenceNumber = u64;

/// Sequence numbers are packed together with an 8-bit tag, leaving 56 bits.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Length of the sequence+tag suffix appended to every user key.
pub const INTERNAL_KEY_SUFFIX: usize = 8;

/// Discriminates live values from deletion tombstones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueTag {
    Deletion = 0x00,
    Value = 0x01,
}

impl ValueTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(ValueTag::Deletion),
            0x01 => Some(ValueTag::Value),
            _ => None,
        }
    }
}

/// The tag used when building seek targets. `Value` is the largest tag, so
/// a seek key packs `(seq, Value)` and sorts before every entry at lower
/// sequences for the same user key.
pub const TAG_FOR_SEEK: ValueTag = ValueTag::Value;

pub fn pack_sequence_and_tag(seq: SequenceNumber, tag: ValueTag) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | tag as u64
}

/// Appends `user_key || packed suffix` to `dst`.
pub fn append_internal_key(dst: &mut Vec<u8>, user_key: &[u8], seq: SequenceNumber, tag: ValueTag) {
    dst.extend_from_slice(user_key);
    let mut suffix = [0u8; 8];
    LittleEndian::write_u64(&mut suffix, pack_sequence_and_tag(seq, tag));
    dst.extend_from_slice(&suffix);
}

/// Builds a fresh internal key buffer.
pub fn make_internal_key(user_key: &[u8], seq: SequenceNumber, tag: ValueTag) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_key.len() + INTERNAL_KEY_SUFFIX);
    append_internal_key(&mut key, user_key, seq, tag);
    key
}

/// An internal key split into its parts. Borrows the user key from the
/// encoded form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub tag: ValueTag,
}

/// Splits an internal key. Returns None if the key is too short or carries
/// an unknown tag.
pub fn parse_internal_key(key: &[u8]) -> Option<ParsedInternalKey<'_>> {
    if key.len() < INTERNAL_KEY_SUFFIX {
        return None;
    }
    let split = key.len() - INTERNAL_KEY_SUFFIX;
    let packed = LittleEndian::read_u64(&key[split..]);
    let tag = ValueTag::from_u8((packed & 0xff) as u8)?;
    Some(ParsedInternalKey {
        user_key: &key[..split],
        sequence: packed >> 8,
        tag,
    })
}

/// The user-key portion of an internal key. Panics in debug builds if the
/// key is shorter than the suffix.
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= INTERNAL_KEY_SUFFIX);
    &internal_key[..internal_key.len() - INTERNAL_KEY_SUFFIX]
}

fn extract_packed(internal_key: &[u8]) -> u64 {
    LittleEndian::read_u64(&internal_key[internal_key.len() - INTERNAL_KEY_SUFFIX..])
}

/// A total order over byte-string keys, plus the key-shortening hooks used
/// when building sstable index blocks.
pub trait Comparator: Send + Sync {
    /// Name recorded in the manifest; opening a database with a different
    /// comparator name fails.
    fn name(&self) -> &'static str;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Shortens `start` in place to some string `>= start` and `< limit`,
    /// if a shorter such string exists.
    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]);

    /// Shortens `key` in place to some string `>= key`.
    fn find_short_successor(&self, key: &mut Vec<u8>);
}

/// Plain lexicographic byte ordering; the default user comparator.
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &'static str {
        "cinderdb.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let min_len = start.len().min(limit.len());
        let mut diff = 0;
        while diff < min_len && start[diff] == limit[diff] {
            diff += 1;
        }
        if diff >= min_len {
            // One is a prefix of the other; no shortening possible.
            return;
        }
        let byte = start[diff];
        if byte < 0xff && byte + 1 < limit[diff] {
            start[diff] = byte + 1;
            start.truncate(diff + 1);
            debug_assert!(self.compare(start, limit) == Ordering::Less);
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        for i in 0..key.len() {
            if key[i] != 0xff {
                key[i] += 1;
                key.truncate(i + 1);
                return;
            }
        }
        // All 0xff: leave unchanged.
    }
}

/// Orders internal keys: user key ascending per the wrapped comparator,
/// then packed sequence+tag descending.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        Self { user }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }
}

impl Comparator for InternalKeyComparator {
    fn name(&self) -> &'static str {
        "cinderdb.InternalKeyComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => extract_packed(b).cmp(&extract_packed(a)),
            ord => ord,
        }
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let user_start = extract_user_key(start).to_vec();
        let user_limit = extract_user_key(limit);
        let mut tmp = user_start.clone();
        self.user.find_shortest_separator(&mut tmp, user_limit);
        if tmp.len() < user_start.len() && self.user.compare(&user_start, &tmp) == Ordering::Less {
            // User key became shorter but larger; tack on the maximal
            // suffix so the separator sorts before every real entry for
            // that user key.
            append_internal_key(
                &mut tmp,
                &[],
                MAX_SEQUENCE_NUMBER,
                TAG_FOR_SEEK,
            );
            debug_assert!(self.compare(start, &tmp) == Ordering::Less);
            debug_assert!(self.compare(&tmp, limit) == Ordering::Less);
            *start = tmp;
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        let user_key = extract_user_key(key).to_vec();
        let mut tmp = user_key.clone();
        self.user.find_short_successor(&mut tmp);
        if tmp.len() < user_key.len() && self.user.compare(&user_key, &tmp) == Ordering::Less {
            append_internal_key(&mut tmp, &[], MAX_SEQUENCE_NUMBER, TAG_FOR_SEEK);
            debug_assert!(self.compare(key, &tmp) == Ordering::Less);
            *key = tmp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    #[test]
    fn test_pack_and_parse() {
        let key = make_internal_key(b"widget", 42, ValueTag::Value);
        let parsed = parse_internal_key(&key).expect("parse failed");
        assert_eq!(parsed.user_key, b"widget");
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.tag, ValueTag::Value);
        assert_eq!(extract_user_key(&key), b"widget");
    }

    #[test]
    fn test_parse_rejects_short_keys() {
        assert!(parse_internal_key(b"short").is_none());
    }

    #[test]
    fn test_internal_ordering_newest_first() {
        let cmp = icmp();
        let newer = make_internal_key(b"k", 9, ValueTag::Value);
        let older = make_internal_key(b"k", 3, ValueTag::Value);
        assert_eq!(cmp.compare(&newer, &older), Ordering::Less);

        // Same sequence: Value sorts before Deletion.
        let value = make_internal_key(b"k", 5, ValueTag::Value);
        let tombstone = make_internal_key(b"k", 5, ValueTag::Deletion);
        assert_eq!(cmp.compare(&value, &tombstone), Ordering::Less);
    }

    #[test]
    fn test_internal_ordering_user_key_dominates() {
        let cmp = icmp();
        let a = make_internal_key(b"aaa", 1, ValueTag::Value);
        let b = make_internal_key(b"bbb", 100, ValueTag::Value);
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_seek_key_finds_older_entries() {
        let cmp = icmp();
        // Seeking at sequence 5 must sort before (i.e. reach) entries with
        // sequence <= 5 and after entries with sequence > 5.
        let seek = make_internal_key(b"k", 5, TAG_FOR_SEEK);
        let at_5 = make_internal_key(b"k", 5, ValueTag::Deletion);
        let at_7 = make_internal_key(b"k", 7, ValueTag::Value);
        assert!(cmp.compare(&seek, &at_5) != Ordering::Greater);
        assert_eq!(cmp.compare(&at_7, &seek), Ordering::Less);
    }

    #[test]
    fn test_bytewise_separator() {
        let cmp = BytewiseComparator;
        let mut start = b"helloworld".to_vec();
        cmp.find_shortest_separator(&mut start, b"hellozoo");
        assert!(start.as_slice() > b"helloworld".as_slice() || start == b"helloworld");
        assert!(start.as_slice() < b"hellozoo".as_slice());
        assert!(start.len() <= b"helloworld".len());

        // Prefix case: unchanged.
        let mut prefix = b"abc".to_vec();
        cmp.find_shortest_separator(&mut prefix, b"abcdef");
        assert_eq!(prefix, b"abc");
    }

    #[test]
    fn test_bytewise_successor() {
        let cmp = BytewiseComparator;
        let mut key = b"abc".to_vec();
        cmp.find_short_successor(&mut key);
        assert_eq!(key, b"b");

        let mut all_ff = vec![0xff, 0xff];
        cmp.find_short_successor(&mut all_ff);
        assert_eq!(all_ff, vec![0xff, 0xff]);
    }

    #[test]
    fn test_internal_separator_is_ordered() {
        let cmp = icmp();
        let mut start = make_internal_key(b"foobar", 10, ValueTag::Value);
        let limit = make_internal_key(b"foozap", 20, ValueTag::Value);
        let orig = start.clone();
        cmp.find_shortest_separator(&mut start, &limit);
        assert!(cmp.compare(&orig, &start) != Ordering::Greater);
        assert_eq!(cmp.compare(&start, &limit), Ordering::Less);
    }
}
