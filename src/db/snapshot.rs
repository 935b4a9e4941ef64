//! Snapshots: handles pinning a read sequence.
//!
//! The registry counts live handles per sequence number; the oldest entry
//! bounds what compaction may drop. "Read the latest state" is expressed
//! by the *absence* of a snapshot (`ReadOptions::snapshot == None`), never
//! by a sentinel sequence, so sequence 0 stays an ordinary value.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::key::SequenceNumber;

#[derive(Default)]
pub struct SnapshotRegistry {
    /// sequence -> live handle count.
    counts: Mutex<BTreeMap<SequenceNumber, usize>>,
}

impl SnapshotRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acquire(self: &Arc<Self>, sequence: SequenceNumber) -> Snapshot {
        let mut counts = self.counts.lock().expect("snapshot registry poisoned");
        *counts.entry(sequence).or_insert(0) += 1;
        Snapshot {
            inner: Arc::new(SnapshotHandle {
                sequence,
                registry: Arc::clone(self),
            }),
        }
    }

    /// Sequence of the oldest live snapshot, if any.
    pub fn oldest(&self) -> Option<SequenceNumber> {
        self.counts
            .lock()
            .expect("snapshot registry poisoned")
            .keys()
            .next()
            .copied()
    }

    pub fn is_empty(&self) -> bool {
        self.counts
            .lock()
            .expect("snapshot registry poisoned")
            .is_empty()
    }

    fn release(&self, sequence: SequenceNumber) {
        let mut counts = self.counts.lock().expect("snapshot registry poisoned");
        if let Some(count) = counts.get_mut(&sequence) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&sequence);
            }
        }
    }
}

struct SnapshotHandle {
    sequence: SequenceNumber,
    registry: Arc<SnapshotRegistry>,
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        self.registry.release(self.sequence);
    }
}

/// A pinned point-in-time view. Clones share the same registration; the
/// registry entry is released when the last clone drops.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotHandle>,
}

impl Snapshot {
    pub fn sequence(&self) -> SequenceNumber {
        self.inner.sequence
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("sequence", &self.inner.sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let registry = SnapshotRegistry::new();
        assert!(registry.oldest().is_none());

        let snap = registry.acquire(10);
        assert_eq!(snap.sequence(), 10);
        assert_eq!(registry.oldest(), Some(10));

        drop(snap);
        assert!(registry.oldest().is_none());
    }

    #[test]
    fn test_oldest_wins() {
        let registry = SnapshotRegistry::new();
        let _a = registry.acquire(30);
        let b = registry.acquire(5);
        let _c = registry.acquire(17);
        assert_eq!(registry.oldest(), Some(5));
        drop(b);
        assert_eq!(registry.oldest(), Some(17));
    }

    #[test]
    fn test_duplicate_sequences_counted() {
        let registry = SnapshotRegistry::new();
        let a = registry.acquire(7);
        let b = registry.acquire(7);
        drop(a);
        assert_eq!(registry.oldest(), Some(7));
        drop(b);
        assert!(registry.oldest().is_none());
    }

    #[test]
    fn test_clone_shares_registration() {
        let registry = SnapshotRegistry::new();
        let a = registry.acquire(3);
        let b = a.clone();
        drop(a);
        assert_eq!(registry.oldest(), Some(3));
        drop(b);
        assert!(registry.oldest().is_none());
    }

    #[test]
    fn test_sequence_zero_is_ordinary() {
        let registry = SnapshotRegistry::new();
        let snap = registry.acquire(0);
        assert_eq!(registry.oldest(), Some(0));
        drop(snap);
        assert!(registry.is_empty());
    }
}
