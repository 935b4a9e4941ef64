//! CinderDB is an embedded, ordered key-value storage engine built on a
//! log-structured merge-tree.
//!
//! Keys and values are arbitrary byte strings. The engine supports point
//! reads, ordered range scans, atomic batched writes, and consistent
//! snapshots. It is a library: a single process opens a database directory
//! and owns it exclusively until the handle is dropped.
//!
//! # Architecture
//!
//! ```text
//! writes ──► writer queue ──► WAL ──► active memtable
//!                                          │ (full)
//!                                          ▼
//!                                  immutable memtable
//!                                          │ (background flush)
//!                                          ▼
//!                                  level-0 sstables ──► level 1 ──► ... ──► level 6
//!                                            (background compaction)
//! ```
//!
//! Reads consult the active memtable, the immutable memtable, then the
//! sstable levels, all under a fixed snapshot sequence number. The set of
//! live sstables per level is versioned and recorded durably in a manifest,
//! so the database always recovers to a consistent file set.

pub mod batch;
pub mod cache;
pub mod compaction;
pub mod config;
pub mod db;
pub mod encoding;
pub mod error;
pub mod filename;
pub mod flock;
pub mod iterator;
pub mod key;
pub mod memtable;
pub mod sstable;
pub mod table_cache;
pub mod tmpfs;
pub mod version;
pub mod wal;

pub use batch::WriteBatch;
pub use config::{Compression, Options, ReadOptions, WriteOptions};
pub use db::iter::DatabaseIterator;
pub use db::snapshot::Snapshot;
pub use db::{destroy, repair, Database};
pub use error::{Error, Result};
pub use key::{BytewiseComparator, Comparator};
pub use sstable::filter::{BloomFilterPolicy, FilterPolicy};
