use std::sync::Arc;

use crate::db::snapshot::Snapshot;
use crate::key::{BytewiseComparator, Comparator};
use crate::sstable::filter::FilterPolicy;

/// Number of on-disk levels.
pub const NUM_LEVELS: usize = 7;

/// Level-0 file count that triggers a compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Level-0 file count at which writes are slowed by a 1 ms pause each.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// Level-0 file count at which writes stop until compaction catches up.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Highest level a fresh memtable flush may be pushed to when it overlaps
/// nothing below.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Block compression applied when a data block shrinks enough to be worth it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Snappy = 1,
}

impl Compression {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Compression::None),
            1 => Some(Compression::Snappy),
            _ => None,
        }
    }
}

/// Configuration for opening a database.
#[derive(Clone)]
pub struct Options {
    /// Create the database directory if it does not exist (default: false).
    pub create_if_missing: bool,

    /// Fail opening if the database already exists (default: false).
    pub error_if_exists: bool,

    /// Treat recoverable log corruption as a hard error (default: false).
    pub paranoid_checks: bool,

    /// Soft byte budget of the active memtable before rotation (default: 4 MiB).
    pub write_buffer_size: usize,

    /// Upper bound on cached open sstables (default: 1000).
    pub max_open_files: usize,

    /// Target size of compaction output files (default: 2 MiB).
    pub max_file_size: u64,

    /// Target uncompressed size of sstable data blocks (default: 4 KiB).
    pub block_size: usize,

    /// Entries between restart points in data blocks (default: 16).
    pub block_restart_interval: usize,

    /// Capacity of the decoded-block cache in bytes (default: 8 MiB).
    pub block_cache_capacity: usize,

    /// Block compression (default: snappy).
    pub compression: Compression,

    /// Key ordering (default: bytewise).
    pub comparator: Arc<dyn Comparator>,

    /// Optional per-table filter to skip reads (default: none).
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            max_file_size: 2 * 1024 * 1024,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            block_cache_capacity: 8 * 1024 * 1024,
            compression: Compression::Snappy,
            comparator: Arc::new(BytewiseComparator),
            filter_policy: None,
        }
    }
}

impl Options {
    pub fn create_if_missing(mut self, v: bool) -> Self {
        self.create_if_missing = v;
        self
    }

    pub fn error_if_exists(mut self, v: bool) -> Self {
        self.error_if_exists = v;
        self
    }

    pub fn paranoid_checks(mut self, v: bool) -> Self {
        self.paranoid_checks = v;
        self
    }

    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn max_open_files(mut self, n: usize) -> Self {
        self.max_open_files = n;
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn block_restart_interval(mut self, n: usize) -> Self {
        self.block_restart_interval = n;
        self
    }

    pub fn block_cache_capacity(mut self, bytes: usize) -> Self {
        self.block_cache_capacity = bytes;
        self
    }

    pub fn compression(mut self, c: Compression) -> Self {
        self.compression = c;
        self
    }

    pub fn comparator(mut self, cmp: Arc<dyn Comparator>) -> Self {
        self.comparator = cmp;
        self
    }

    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }
}

/// Per-read settings.
#[derive(Clone)]
pub struct ReadOptions {
    /// Verify block checksums on every read (default: false).
    pub verify_checksums: bool,

    /// Keep blocks read by this operation in the block cache (default: true).
    pub fill_cache: bool,

    /// Read as of this snapshot instead of the latest state.
    pub snapshot: Option<Snapshot>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadOptions {
    pub fn new() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }

    pub fn verify_checksums(mut self, v: bool) -> Self {
        self.verify_checksums = v;
        self
    }

    pub fn fill_cache(mut self, v: bool) -> Self {
        self.fill_cache = v;
        self
    }

    pub fn snapshot(mut self, s: Snapshot) -> Self {
        self.snapshot = Some(s);
        self
    }
}

/// Per-write settings.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    /// Fsync the log before acknowledging the write (default: false).
    pub sync: bool,
}

impl WriteOptions {
    pub fn sync(mut self, v: bool) -> Self {
        self.sync = v;
        self
    }
}
