//! The database frontend: open/recovery, the write coordinator, the
//! background worker, and the read path.
//!
//! # Concurrency model
//!
//! One mutex guards all mutable database state (memtable pointers, the
//! writer queue, the version chain, pending compaction outputs, the
//! latched background error). A single background thread services
//! memtable flushes and compactions, releasing the mutex for long I/O and
//! reacquiring it to commit. Writers queue FIFO; the head writer owns the
//! write slot, groups the batches behind it, appends once to the log, and
//! applies to the memtable outside the mutex.
//!
//! # Write flow control
//!
//! Before accepting a write the coordinator checks, in order: a latched
//! background error (fail), too many level-0 files (pause 1 ms once at the
//! slowdown threshold, block at the stop threshold), a full memtable with
//! the previous one still flushing (block), and otherwise rotates to a
//! fresh log + memtable and wakes the worker.

pub mod builder;
pub mod iter;
pub mod repair;
pub mod snapshot;

use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::batch::WriteBatch;
use crate::cache::ShardedCache;
use crate::compaction::Compaction;
use crate::config::{
    Options, ReadOptions, WriteOptions, L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER,
    NUM_LEVELS,
};
use crate::error::{Error, Result};
use crate::filename::{
    self, lock_file_name, log_file_name, parse_file_name, table_file_name, FileType, InfoLog,
};
use crate::flock::FileLock;
use crate::iterator::{DbIter, MergingIter};
use crate::key::{
    make_internal_key, parse_internal_key, Comparator, InternalKeyComparator, SequenceNumber,
    ValueTag, MAX_SEQUENCE_NUMBER, TAG_FOR_SEEK,
};
use crate::memtable::{MemGet, MemTable};
use crate::sstable::table::{BlockCache, TableBuilder};
use crate::table_cache::TableCache;
use crate::version::edit::VersionEdit;
use crate::version::set::VersionSet;
use crate::version::{FileMetaData, LookupResult, Version};
use crate::wal::{LogReader, LogWriter};

use self::builder::build_table;
use self::iter::DatabaseIterator;
use self::snapshot::{Snapshot, SnapshotRegistry};

pub use self::repair::{destroy, repair};

/// Group commit caps: a batch group never exceeds 1 MiB, and stays under
/// 128 KiB extra when the head batch is small, so tiny writes keep tiny
/// latency.
const MAX_GROUP_SIZE: usize = 1 << 20;
const SMALL_BATCH_SIZE: usize = 128 << 10;

struct WriterState {
    batch: Option<WriteBatch>,
    sync: bool,
    done: bool,
    result: Option<Result<()>>,
}

/// One queued writer. The condvar pairs with the database mutex; the
/// inner state is only touched while that mutex is held.
struct WriterHandle {
    cv: Condvar,
    state: Mutex<WriterState>,
}

impl WriterHandle {
    fn new(batch: Option<WriteBatch>, sync: bool) -> Arc<Self> {
        Arc::new(Self {
            cv: Condvar::new(),
            state: Mutex::new(WriterState {
                batch,
                sync,
                done: false,
                result: None,
            }),
        })
    }

    fn is_done(&self) -> bool {
        self.state.lock().expect("writer state poisoned").done
    }

    fn finish(&self, result: Result<()>) {
        let mut state = self.state.lock().expect("writer state poisoned");
        state.done = true;
        state.result = Some(result);
    }

    fn take_result(&self) -> Result<()> {
        self.state
            .lock()
            .expect("writer state poisoned")
            .result
            .take()
            .unwrap_or(Ok(()))
    }
}

/// A manual compaction in progress, driven one bounded round at a time.
struct ManualCompaction {
    level: usize,
    done: bool,
    /// Internal-key bounds; None means open-ended.
    begin: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Default)]
struct CompactionStats {
    micros: u64,
    bytes_read: u64,
    bytes_written: u64,
}

/// The write-ahead log and its file number; guarded by its own mutex so
/// the head writer can append while the database mutex is free. Only the
/// write-slot holder and memtable rotation touch it.
struct LogState {
    writer: LogWriter,
    number: u64,
}

struct DbState {
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,
    versions: VersionSet,
    writers: VecDeque<Arc<WriterHandle>>,
    /// Table files being written by an in-flight flush or compaction,
    /// protected from garbage collection.
    pending_outputs: HashSet<u64>,
    bg_scheduled: bool,
    bg_error: Option<Error>,
    manual: Option<ManualCompaction>,
    stats: [CompactionStats; NUM_LEVELS],
}

struct DbCore {
    dir: PathBuf,
    opts: Arc<Options>,
    icmp: Arc<InternalKeyComparator>,
    block_cache: Arc<BlockCache>,
    table_cache: Arc<TableCache>,
    info_log: InfoLog,
    _lock: FileLock,

    state: Mutex<DbState>,
    /// Signalled whenever a round of background work completes.
    background_work_done: Condvar,
    /// Wakes the background worker.
    work_signal: Condvar,
    /// Serialises manual compactions.
    manual_gate: Mutex<()>,

    shutting_down: AtomicBool,
    /// Mirror of `state.imm.is_some()` readable without the mutex, so the
    /// compaction loop notices a pending flush cheaply.
    has_imm: AtomicBool,
    snapshots: Arc<SnapshotRegistry>,
    log: Mutex<LogState>,
}

/// An open database. All methods are safe to call from multiple threads
/// through a shared reference.
pub struct Database {
    core: Arc<DbCore>,
    bg_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Database {
    /// Opens (or, with `create_if_missing`, creates) the database at `dir`
    /// and recovers it to a consistent state.
    pub fn open(dir: impl AsRef<Path>, options: Options) -> Result<Database> {
        let dir = dir.as_ref().to_path_buf();
        let opts = Arc::new(options);

        if !dir.exists() {
            if !opts.create_if_missing {
                return crate::invalid_argument!(
                    "{} does not exist (create_if_missing is false)",
                    dir.display()
                );
            }
            std::fs::create_dir_all(&dir)?;
        }

        let lock = FileLock::lock(lock_file_name(&dir))
            .map_err(|e| Error::Io(format!("could not lock database directory: {e}")))?;
        let info_log = InfoLog::open(&dir)?;

        let icmp = Arc::new(InternalKeyComparator::new(Arc::clone(&opts.comparator)));
        let block_cache: Arc<BlockCache> = Arc::new(ShardedCache::new(opts.block_cache_capacity));
        let table_cache = Arc::new(TableCache::new(
            dir.clone(),
            Arc::clone(&opts),
            Arc::clone(&icmp),
            Arc::clone(&block_cache),
        ));
        let mut versions = VersionSet::new(
            dir.clone(),
            Arc::clone(&opts),
            Arc::clone(&icmp),
            Arc::clone(&table_cache),
        );

        let current_exists = filename::current_file_name(&dir).exists();
        if !current_exists {
            if !opts.create_if_missing {
                return crate::invalid_argument!(
                    "database missing in {} (create_if_missing is false)",
                    dir.display()
                );
            }
            info_log.log("creating new database");
            versions.create_new_db()?;
        } else if opts.error_if_exists {
            return crate::invalid_argument!(
                "database already exists in {} (error_if_exists is true)",
                dir.display()
            );
        }

        versions.recover()?;

        // Replay every log the manifest has not retired, oldest first,
        // converting each into level-0 tables.
        let mut edit = VersionEdit::new();
        let mut max_sequence: SequenceNumber = 0;
        let min_log = versions.log_number();
        let mut log_numbers: Vec<u64> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_file_name(&entry.file_name().to_string_lossy()))
            .filter_map(|(kind, number)| {
                (kind == FileType::Log && number >= min_log).then_some(number)
            })
            .collect();
        log_numbers.sort_unstable();

        for &log_number in &log_numbers {
            versions.mark_file_number_used(log_number);
            let replayed = Self::replay_log(
                &dir,
                &opts,
                &icmp,
                &table_cache,
                &mut versions,
                &info_log,
                log_number,
                &mut edit,
            )?;
            max_sequence = max_sequence.max(replayed);
        }
        if versions.last_sequence() < max_sequence {
            versions.set_last_sequence(max_sequence);
        }

        // A fresh log for this incarnation; installing it retires the
        // replayed ones.
        let new_log_number = versions.new_file_number();
        let log_file = File::create(log_file_name(&dir, new_log_number))?;
        let log_writer = LogWriter::new(log_file)?;
        edit.set_log_number(new_log_number);
        versions.log_and_apply(&mut edit)?;

        let mem = Arc::new(MemTable::new(InternalKeyComparator::new(Arc::clone(
            &opts.comparator,
        ))));

        let core = Arc::new(DbCore {
            dir,
            opts,
            icmp,
            block_cache,
            table_cache,
            info_log,
            _lock: lock,
            state: Mutex::new(DbState {
                mem,
                imm: None,
                versions,
                writers: VecDeque::new(),
                pending_outputs: HashSet::new(),
                bg_scheduled: false,
                bg_error: None,
                manual: None,
                stats: [CompactionStats::default(); NUM_LEVELS],
            }),
            background_work_done: Condvar::new(),
            work_signal: Condvar::new(),
            manual_gate: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            has_imm: AtomicBool::new(false),
            snapshots: SnapshotRegistry::new(),
            log: Mutex::new(LogState {
                writer: log_writer,
                number: new_log_number,
            }),
        });

        {
            let mut guard = core.state.lock()?;
            core.delete_obsolete_files(&mut guard);
            core.maybe_schedule_compaction(&mut guard);
        }

        let bg_core = Arc::clone(&core);
        let handle = std::thread::Builder::new()
            .name("cinderdb-bg".to_string())
            .spawn(move || bg_core.background_main())
            .map_err(|e| Error::Io(e.to_string()))?;

        core.info_log.log("database opened");
        tracing::info!(dir = %core.dir.display(), "database opened");
        Ok(Database {
            core,
            bg_thread: Mutex::new(Some(handle)),
        })
    }

    /// Replays one log file into memtables, flushing them as level-0
    /// tables recorded in `edit`. Returns the highest sequence seen.
    #[allow(clippy::too_many_arguments)]
    fn replay_log(
        dir: &Path,
        opts: &Arc<Options>,
        icmp: &Arc<InternalKeyComparator>,
        table_cache: &Arc<TableCache>,
        versions: &mut VersionSet,
        info_log: &InfoLog,
        log_number: u64,
        edit: &mut VersionEdit,
    ) -> Result<SequenceNumber> {
        let path = log_file_name(dir, log_number);
        let file = File::open(&path)?;
        let mut reader = LogReader::new(file, opts.paranoid_checks);
        let mut max_sequence = 0;
        let mut mem: Option<Arc<MemTable>> = None;

        info_log.log(&format!("recovering log {log_number:06}"));
        tracing::info!(log_number, "replaying write-ahead log");

        while let Some(record) = reader.read_record()? {
            if record.len() < crate::batch::BATCH_HEADER_SIZE {
                if opts.paranoid_checks {
                    return Err(Error::Corruption("log record too small".to_string()));
                }
                tracing::warn!(log_number, "dropping undersized log record");
                continue;
            }
            let batch = WriteBatch::from_contents(record)?;
            let mem_ref = mem.get_or_insert_with(|| {
                Arc::new(MemTable::new(InternalKeyComparator::new(Arc::clone(
                    &opts.comparator,
                ))))
            });
            batch.insert_into(mem_ref)?;
            max_sequence = max_sequence.max(batch.sequence() + batch.count() as u64 - 1);

            if mem_ref.approximate_memory_usage() > opts.write_buffer_size {
                let number = versions.new_file_number();
                let mut iter = mem_ref.iter();
                let meta = build_table(dir, opts, icmp, table_cache, &mut iter, number)?;
                if meta.size > 0 {
                    edit.add_file(0, meta);
                } else {
                    versions.reuse_file_number(number);
                }
                mem = None;
            }
        }

        if let Some(mem) = mem {
            if !mem.is_empty() {
                let number = versions.new_file_number();
                let mut iter = mem.iter();
                let meta = build_table(dir, opts, icmp, table_cache, &mut iter, number)?;
                if meta.size > 0 {
                    edit.add_file(0, meta);
                } else {
                    versions.reuse_file_number(number);
                }
            }
        }
        Ok(max_sequence)
    }

    pub fn put(&self, wopts: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(wopts, batch)
    }

    pub fn delete(&self, wopts: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(wopts, batch)
    }

    /// Applies `batch` atomically.
    pub fn write(&self, wopts: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.core.write_internal(wopts, Some(batch))
    }

    /// Point read at the latest state or at `ropts.snapshot`.
    pub fn get(&self, ropts: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let core = &self.core;
        let (sequence, mem, imm, version) = {
            let guard = core.state.lock()?;
            let sequence = match &ropts.snapshot {
                Some(snapshot) => snapshot.sequence(),
                None => guard.versions.last_sequence(),
            };
            (
                sequence,
                Arc::clone(&guard.mem),
                guard.imm.clone(),
                guard.versions.current(),
            )
        };

        match mem.get(key, sequence) {
            MemGet::Found(value) => return Ok(Some(value)),
            MemGet::Deleted => return Ok(None),
            MemGet::NotFound => {}
        }
        if let Some(imm) = &imm {
            match imm.get(key, sequence) {
                MemGet::Found(value) => return Ok(Some(value)),
                MemGet::Deleted => return Ok(None),
                MemGet::NotFound => {}
            }
        }

        let (result, stats) =
            version.get(ropts, &core.icmp, &core.table_cache, key, sequence)?;
        if version.update_stats(stats) {
            let mut guard = core.state.lock()?;
            core.maybe_schedule_compaction(&mut guard);
        }
        match result {
            LookupResult::Found(value) => Ok(Some(value)),
            LookupResult::Deleted | LookupResult::NotFound => Ok(None),
        }
    }

    /// Ordered iterator over the database at the latest state or at
    /// `ropts.snapshot`. The view is fixed at creation.
    pub fn iter(&self, ropts: &ReadOptions) -> Result<DatabaseIterator> {
        let core = &self.core;
        let (sequence, mem, imm, version) = {
            let guard = core.state.lock()?;
            let sequence = match &ropts.snapshot {
                Some(snapshot) => snapshot.sequence(),
                None => guard.versions.last_sequence(),
            };
            (
                sequence,
                Arc::clone(&guard.mem),
                guard.imm.clone(),
                guard.versions.current(),
            )
        };

        let mut children: Vec<Box<dyn DbIter>> = Vec::new();
        children.push(Box::new(mem.iter()));
        if let Some(imm) = &imm {
            children.push(Box::new(imm.iter()));
        }
        children.extend(version.iters(ropts, Arc::clone(&core.icmp), &core.table_cache)?);

        let merged = MergingIter::new(Arc::clone(&core.icmp), children);
        Ok(DatabaseIterator::new(
            Arc::clone(core.icmp.user_comparator()),
            merged,
            sequence,
            version,
        ))
    }

    /// Pins the current sequence number; reads through the returned handle
    /// ignore every later write.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let guard = self.core.state.lock()?;
        Ok(self.core.snapshots.acquire(guard.versions.last_sequence()))
    }

    /// Releases a snapshot. Dropping the handle is equivalent.
    pub fn release_snapshot(&self, snapshot: Snapshot) {
        drop(snapshot);
    }

    /// Database introspection. Recognised names: `num-files-at-level<N>`,
    /// `stats`, `sstables`, `approximate-memory-usage` (all optionally
    /// prefixed with `cinderdb.`).
    pub fn property(&self, name: &str) -> Option<String> {
        let name = name.strip_prefix("cinderdb.").unwrap_or(name);
        let guard = self.core.state.lock().ok()?;

        if let Some(level) = name.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(guard.versions.num_level_files(level).to_string());
        }
        match name {
            "stats" => {
                use std::fmt::Write;
                let mut out = guard.versions.level_summary();
                let _ = writeln!(out, "compactions (level: micros, read, written):");
                for (level, s) in guard.stats.iter().enumerate() {
                    if s.micros > 0 || s.bytes_read > 0 || s.bytes_written > 0 {
                        let _ = writeln!(
                            out,
                            "  {level}: {} us, {} B in, {} B out",
                            s.micros, s.bytes_read, s.bytes_written
                        );
                    }
                }
                Some(out)
            }
            "sstables" => Some(guard.versions.current().debug_string()),
            "approximate-memory-usage" => {
                let mut total = guard.mem.approximate_memory_usage();
                if let Some(imm) = &guard.imm {
                    total += imm.approximate_memory_usage();
                }
                total += self.core.block_cache.total_charge();
                Some(total.to_string())
            }
            _ => None,
        }
    }

    /// Approximate on-disk bytes spanned by each `[begin, end)` range.
    pub fn approximate_sizes(&self, ranges: &[(Vec<u8>, Vec<u8>)]) -> Result<Vec<u64>> {
        let guard = self.core.state.lock()?;
        let version = guard.versions.current();
        let mut sizes = Vec::with_capacity(ranges.len());
        for (begin, end) in ranges {
            let start_key = make_internal_key(begin, MAX_SEQUENCE_NUMBER, TAG_FOR_SEEK);
            let limit_key = make_internal_key(end, MAX_SEQUENCE_NUMBER, TAG_FOR_SEEK);
            let start = guard.versions.approximate_offset_of(&version, &start_key);
            let limit = guard.versions.approximate_offset_of(&version, &limit_key);
            sizes.push(limit.saturating_sub(start));
        }
        Ok(sizes)
    }

    /// Compacts the given user-key range (None = open ended) all the way
    /// down, including flushing the memtable. Blocks until done.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let core = &self.core;
        let mut max_level_with_files = 1;
        {
            let guard = core.state.lock()?;
            let version = guard.versions.current();
            for level in 1..NUM_LEVELS {
                if version.overlap_in_level(&core.icmp, level, begin, end) {
                    max_level_with_files = level;
                }
            }
        }

        self.flush_memtable()?;
        for level in 0..max_level_with_files {
            core.manual_compact_level(level, begin, end)?;
        }
        Ok(())
    }

    /// Forces the active memtable out to a level-0 table and waits for the
    /// flush to finish.
    pub fn flush_memtable(&self) -> Result<()> {
        // An empty write with force=true rotates the memtable.
        self.core
            .write_internal(&WriteOptions::default(), None)?;
        let mut guard = self.core.state.lock()?;
        while guard.imm.is_some() && guard.bg_error.is_none() {
            guard = self.core.background_work_done.wait(guard)?;
        }
        match &guard.bg_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Closes the database, waiting for background work to stop. Dropping
    /// the handle does the same.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.core.shutting_down.store(true, AtomicOrdering::SeqCst);
        {
            // Taking the mutex orders the flag before the worker's next
            // wait, so the wakeup cannot be lost.
            let _guard = self.core.state.lock();
            self.core.work_signal.notify_all();
            self.core.background_work_done.notify_all();
        }
        if let Ok(mut slot) = self.bg_thread.lock() {
            if let Some(handle) = slot.take() {
                let _ = handle.join();
            }
        }
        if let Ok(mut log) = self.core.log.lock() {
            let _ = log.writer.flush();
        }
        self.core.info_log.log("database closed");
        tracing::info!(dir = %self.core.dir.display(), "database closed");
    }
}

impl DbCore {
    // ----- write coordinator -----

    /// The single write entry point. `batch == None` requests a memtable
    /// rotation (used by flushes) without writing anything.
    fn write_internal(&self, wopts: &WriteOptions, batch: Option<WriteBatch>) -> Result<()> {
        if self.shutting_down.load(AtomicOrdering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let force = batch.is_none();
        let me = WriterHandle::new(batch, wopts.sync);

        let mut guard = self.state.lock()?;
        guard.writers.push_back(Arc::clone(&me));
        loop {
            if me.is_done() {
                return me.take_result();
            }
            if guard
                .writers
                .front()
                .is_some_and(|front| Arc::ptr_eq(front, &me))
            {
                break;
            }
            guard = me.cv.wait(guard)?;
        }

        // Head writer: owns the write slot until the group completes.
        let (guard_back, room) = self.make_room_for_write(guard, force);
        guard = guard_back;
        let mut status = room;
        let mut group_size = 1;

        let has_batch = {
            let state = me.state.lock().expect("writer state poisoned");
            state.batch.is_some()
        };

        if status.is_ok() && has_batch {
            let (mut group, count) = Self::build_batch_group(&mut guard);
            group_size = count;

            let sequence = guard.versions.last_sequence() + 1;
            group.set_sequence(sequence);
            let record_count = group.count() as u64;
            let mem = Arc::clone(&guard.mem);
            let sync = wopts.sync;
            drop(guard);

            // Only the head writer is here; the log mutex is uncontended
            // and the memtable accepts one writer by construction.
            let mut sync_error = false;
            let mut result = {
                let mut log = self.log.lock()?;
                let r = log.writer.add_record(group.contents()).and_then(|_| {
                    if sync {
                        log.writer.sync().inspect_err(|_| sync_error = true)
                    } else {
                        log.writer.flush()
                    }
                });
                r
            };
            if result.is_ok() {
                result = group.insert_into(&mem);
            }

            guard = self.state.lock()?;
            guard
                .versions
                .set_last_sequence(sequence + record_count - 1);
            if sync_error {
                // The log tail is now suspect; no further writes may be
                // acknowledged against it.
                let err = result.clone().unwrap_err();
                self.record_background_error(&mut guard, err);
            }
            status = result;
        }

        // Complete the whole group and wake the next head.
        for _ in 0..group_size {
            let writer = guard.writers.pop_front().expect("writer queue underflow");
            if !Arc::ptr_eq(&writer, &me) {
                writer.finish(status.clone());
                writer.cv.notify_one();
            }
        }
        if let Some(front) = guard.writers.front() {
            front.cv.notify_one();
        }
        drop(guard);
        status
    }

    /// Merges the head writer's batch with queued followers, bounded by
    /// size and by sync compatibility. Returns the combined batch and how
    /// many writers it covers.
    fn build_batch_group(guard: &mut MutexGuard<'_, DbState>) -> (WriteBatch, usize) {
        let head = Arc::clone(&guard.writers[0]);
        let mut head_state = head.state.lock().expect("writer state poisoned");
        let head_sync = head_state.sync;
        let mut group = head_state.batch.take().expect("head writer has no batch");
        drop(head_state);

        let mut max_size = MAX_GROUP_SIZE;
        if group.approximate_size() <= SMALL_BATCH_SIZE {
            max_size = group.approximate_size() + SMALL_BATCH_SIZE;
        }

        let mut count = 1;
        let mut size = group.approximate_size();
        for writer in guard.writers.iter().skip(1) {
            let mut state = writer.state.lock().expect("writer state poisoned");
            // A sync write must not ride a non-sync append.
            if state.sync && !head_sync {
                break;
            }
            let Some(batch) = state.batch.as_ref() else {
                // Rotation request: leave it to run on its own.
                break;
            };
            if size + batch.approximate_size() > max_size {
                break;
            }
            let batch = state.batch.take().expect("batch vanished");
            group.append(&batch);
            size += batch.approximate_size();
            count += 1;
        }
        (group, count)
    }

    /// Write flow control. Holds the write slot; may sleep, wait on the
    /// background worker, or rotate the memtable.
    fn make_room_for_write<'a>(
        &'a self,
        mut guard: MutexGuard<'a, DbState>,
        mut force: bool,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        let mut allow_delay = !force;
        loop {
            if let Some(e) = guard.bg_error.clone() {
                return (guard, Err(e));
            }
            if allow_delay && guard.versions.num_level_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER {
                // Back off once to let the worker gain ground, spreading
                // the stall across writers instead of one hard wall.
                drop(guard);
                std::thread::sleep(Duration::from_millis(1));
                allow_delay = false;
                guard = match self.state.lock() {
                    Ok(g) => g,
                    Err(e) => panic!("state mutex poisoned: {e}"),
                };
                continue;
            }
            if !force
                && guard.mem.approximate_memory_usage() <= self.opts.write_buffer_size
            {
                return (guard, Ok(()));
            }
            if guard.imm.is_some() {
                // Previous memtable still flushing; wait for the worker.
                tracing::debug!("write stalled: immutable memtable still flushing");
                guard = self
                    .background_work_done
                    .wait(guard)
                    .expect("state mutex poisoned");
                continue;
            }
            if guard.versions.num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
                tracing::warn!("write stalled: too many level-0 files");
                guard = self
                    .background_work_done
                    .wait(guard)
                    .expect("state mutex poisoned");
                continue;
            }

            // Rotate: fresh log + memtable, old memtable to the flush slot.
            let new_log_number = guard.versions.new_file_number();
            let log_file = match File::create(log_file_name(&self.dir, new_log_number)) {
                Ok(f) => f,
                Err(e) => {
                    guard.versions.reuse_file_number(new_log_number);
                    return (guard, Err(e.into()));
                }
            };
            let new_writer = match LogWriter::new(log_file) {
                Ok(w) => w,
                Err(e) => {
                    guard.versions.reuse_file_number(new_log_number);
                    return (guard, Err(e));
                }
            };
            {
                let mut log = self.log.lock().expect("log mutex poisoned");
                let _ = log.writer.flush();
                log.writer = new_writer;
                log.number = new_log_number;
            }

            let old_mem = std::mem::replace(
                &mut guard.mem,
                Arc::new(MemTable::new(InternalKeyComparator::new(Arc::clone(
                    &self.opts.comparator,
                )))),
            );
            guard.imm = Some(old_mem);
            self.has_imm.store(true, AtomicOrdering::Release);
            force = false;
            tracing::debug!(log_number = new_log_number, "rotated memtable and log");
            self.maybe_schedule_compaction(&mut guard);
        }
    }

    // ----- background worker -----

    fn maybe_schedule_compaction(&self, guard: &mut MutexGuard<'_, DbState>) {
        if guard.bg_scheduled
            || self.shutting_down.load(AtomicOrdering::SeqCst)
            || guard.bg_error.is_some()
        {
            return;
        }
        if guard.imm.is_none() && guard.manual.is_none() && !guard.versions.needs_compaction() {
            return;
        }
        guard.bg_scheduled = true;
        self.work_signal.notify_one();
    }

    fn background_main(self: Arc<Self>) {
        let mut guard = self.state.lock().expect("state mutex poisoned");
        let mut failed_once = false;
        loop {
            while !self.shutting_down.load(AtomicOrdering::SeqCst) && !guard.bg_scheduled {
                guard = self.work_signal.wait(guard).expect("state mutex poisoned");
            }
            if self.shutting_down.load(AtomicOrdering::SeqCst) {
                break;
            }

            let (guard_back, result) = self.background_compaction(guard);
            guard = guard_back;
            match result {
                Ok(()) => failed_once = false,
                Err(e) if !failed_once && e != Error::Shutdown => {
                    // Allow one retry in case the failure was transient
                    // (e.g. a momentary I/O error); pause off-lock first.
                    failed_once = true;
                    tracing::warn!(error = %e, "background work failed; retrying once");
                    drop(guard);
                    std::thread::sleep(Duration::from_millis(100));
                    guard = self.state.lock().expect("state mutex poisoned");
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "background work failed");
                    self.info_log.log(&format!("background error: {e}"));
                    self.record_background_error(&mut guard, e);
                }
            }

            guard.bg_scheduled = false;
            // More may have become eligible while this round ran.
            self.maybe_schedule_compaction(&mut guard);
            self.background_work_done.notify_all();
        }
        drop(guard);
        tracing::debug!("background worker exited");
    }

    /// One round of background work: an immutable-memtable flush takes
    /// priority, then one compaction (manual, seek- or size-triggered).
    fn background_compaction<'a>(
        &'a self,
        mut guard: MutexGuard<'a, DbState>,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        if guard.imm.is_some() {
            return self.compact_memtable(guard);
        }

        let mut is_manual = false;
        let mut manual_end: Option<Vec<u8>> = None;
        let compaction: Option<Compaction> = {
            let state = &mut *guard;
            if let Some(manual) = &mut state.manual {
                is_manual = true;
                let c = state.versions.compact_range(
                    manual.level,
                    manual.begin.as_deref(),
                    manual.end.as_deref(),
                );
                match &c {
                    Some(c) => {
                        manual_end = Some(c.input(0, c.num_input_files(0) - 1).largest.clone());
                    }
                    None => manual.done = true,
                }
                c
            } else {
                state.versions.pick_compaction()
            }
        };

        let result = match compaction {
            None => Ok(()),
            Some(mut c) if !is_manual && c.is_trivial_move(self.opts.max_file_size) => {
                // Move the file down a level with a manifest edit only.
                let file = Arc::clone(c.input(0, 0));
                c.edit.delete_file(c.level(), file.number);
                c.edit.add_file(c.level() + 1, (*file).clone());
                let status = guard.versions.log_and_apply(&mut c.edit);
                tracing::info!(
                    file = file.number,
                    from = c.level(),
                    to = c.level() + 1,
                    size = file.size,
                    "trivial move"
                );
                self.info_log.log(&format!(
                    "moved table {:06} to level {}",
                    file.number,
                    c.level() + 1
                ));
                c.release_inputs();
                status
            }
            Some(mut c) => {
                let (guard_back, status) = self.do_compaction_work(guard, &mut c);
                guard = guard_back;
                c.release_inputs();
                self.delete_obsolete_files(&mut guard);
                status
            }
        };

        if is_manual {
            if let Some(manual) = &mut guard.manual {
                if result.is_err() {
                    manual.done = true;
                }
                if !manual.done {
                    // Resume the next round after what this one covered.
                    manual.begin = manual_end;
                }
            }
        }
        (guard, result)
    }

    /// Flushes the immutable memtable to a level-0 table and installs it.
    fn compact_memtable<'a>(
        &'a self,
        mut guard: MutexGuard<'a, DbState>,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        let Some(imm) = guard.imm.clone() else {
            return (guard, Ok(()));
        };

        let mut edit = VersionEdit::new();
        let base = guard.versions.current();
        let (guard_back, result) = self.write_level0_table(guard, &imm, &mut edit, Some(&base));
        guard = guard_back;
        drop(base);

        let result = result.and_then(|_| {
            if self.shutting_down.load(AtomicOrdering::SeqCst) {
                return Err(Error::Shutdown);
            }
            // The flushed memtable's log is no longer needed.
            let log_number = self.log.lock().expect("log mutex poisoned").number;
            edit.set_log_number(log_number);
            guard.versions.log_and_apply(&mut edit)
        });

        match result {
            Ok(()) => {
                guard.imm = None;
                self.has_imm.store(false, AtomicOrdering::Release);
                self.delete_obsolete_files(&mut guard);
                (guard, Ok(()))
            }
            Err(e) => (guard, Err(e)),
        }
    }

    /// Builds a table from `mem` outside the mutex and records it in
    /// `edit` at the best level.
    fn write_level0_table<'a>(
        &'a self,
        mut guard: MutexGuard<'a, DbState>,
        mem: &Arc<MemTable>,
        edit: &mut VersionEdit,
        base: Option<&Version>,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        let number = guard.versions.new_file_number();
        guard.pending_outputs.insert(number);
        let start = std::time::Instant::now();
        tracing::info!(table = number, "level-0 flush started");

        let meta_result = {
            drop(guard);
            let mut iter = mem.iter();
            let result = build_table(
                &self.dir,
                &self.opts,
                &self.icmp,
                &self.table_cache,
                &mut iter,
                number,
            );
            guard = self.state.lock().expect("state mutex poisoned");
            result
        };
        guard.pending_outputs.remove(&number);

        let result = match meta_result {
            Ok(meta) if meta.size > 0 => {
                let smallest_user = crate::key::extract_user_key(&meta.smallest).to_vec();
                let largest_user = crate::key::extract_user_key(&meta.largest).to_vec();
                let level = match base {
                    Some(base) => base.pick_level_for_memtable_output(
                        &self.icmp,
                        self.opts.max_file_size,
                        &smallest_user,
                        &largest_user,
                    ),
                    None => 0,
                };
                let micros = start.elapsed().as_micros() as u64;
                guard.stats[level].micros += micros;
                guard.stats[level].bytes_written += meta.size;
                tracing::info!(
                    table = number,
                    level,
                    bytes = meta.size,
                    micros,
                    "level-0 flush finished"
                );
                self.info_log
                    .log(&format!("flushed table {number:06} to level {level}"));
                edit.add_file(level, meta);
                Ok(())
            }
            Ok(_) => {
                // Empty memtable; nothing written.
                guard.versions.reuse_file_number(number);
                Ok(())
            }
            Err(e) => Err(e),
        };
        (guard, result)
    }

    /// The compaction executor: k-way merge over the inputs, dropping
    /// shadowed and dead entries, splitting outputs on size and on
    /// grandparent overlap, then installing the edit.
    fn do_compaction_work<'a>(
        &'a self,
        mut guard: MutexGuard<'a, DbState>,
        c: &mut Compaction,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        let start = std::time::Instant::now();
        let level = c.level();
        tracing::info!(
            level,
            inputs = c.num_input_files(0),
            next_level_inputs = c.num_input_files(1),
            "compaction started"
        );
        self.info_log.log(&format!(
            "compacting {}@{} + {}@{}",
            c.num_input_files(0),
            level,
            c.num_input_files(1),
            level + 1
        ));

        // Entries older than every live snapshot may be dropped when
        // shadowed; entries at or above this stay.
        let smallest_snapshot = self
            .snapshots
            .oldest()
            .unwrap_or_else(|| guard.versions.last_sequence());

        let input_result = self.make_input_iterator(&guard, c);
        let mut input = match input_result {
            Ok(iter) => iter,
            Err(e) => return (guard, Err(e)),
        };
        drop(guard);

        struct Output {
            number: u64,
            smallest: Vec<u8>,
            largest: Vec<u8>,
        }
        let mut outputs: Vec<(Output, u64)> = Vec::new(); // (meta, file size)
        let mut builder: Option<(TableBuilder, Output)> = None;
        let mut status: Result<()> = Ok(());

        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = MAX_SEQUENCE_NUMBER + 1;
        let mut bytes_read = 0u64;

        input.seek_to_first();
        while input.valid() {
            if self.shutting_down.load(AtomicOrdering::SeqCst) {
                status = Err(Error::Shutdown);
                break;
            }
            // A pending flush outranks the compaction: writers block on it.
            if self.has_imm.load(AtomicOrdering::Acquire) {
                let inner = self.state.lock().expect("state mutex poisoned");
                let (inner, flush_status) = self.compact_memtable(inner);
                self.background_work_done.notify_all();
                drop(inner);
                if let Err(e) = flush_status {
                    status = Err(e);
                    break;
                }
            }

            let key = input.key().to_vec();
            bytes_read += (key.len() + input.value().len()) as u64;

            if builder.is_some()
                && c.should_stop_before(&self.icmp, &key, self.opts.max_file_size)
            {
                let (b, meta) = builder.take().expect("builder just checked");
                match b.finish() {
                    Ok(size) => outputs.push((meta, size)),
                    Err(e) => {
                        status = Err(e);
                        break;
                    }
                }
            }

            // Decide whether this entry survives.
            let mut drop_entry = false;
            match parse_internal_key(&key) {
                None => {
                    // Unparseable: keep it, and forget key history so
                    // nothing after it is dropped by mistake.
                    current_user_key = None;
                    last_sequence_for_key = MAX_SEQUENCE_NUMBER + 1;
                }
                Some(parsed) => {
                    let is_new_user_key = current_user_key
                        .as_deref()
                        .map_or(true, |cur| {
                            self.icmp.user_comparator().compare(parsed.user_key, cur)
                                != std::cmp::Ordering::Equal
                        });
                    if is_new_user_key {
                        current_user_key = Some(parsed.user_key.to_vec());
                        last_sequence_for_key = MAX_SEQUENCE_NUMBER + 1;
                    }

                    if last_sequence_for_key <= smallest_snapshot {
                        // Shadowed by a newer entry no snapshot can miss.
                        drop_entry = true;
                    } else if parsed.tag == ValueTag::Deletion
                        && parsed.sequence <= smallest_snapshot
                        && c.is_base_level_for_key(&self.icmp, parsed.user_key)
                    {
                        // Tombstone with nothing left underneath to hide.
                        drop_entry = true;
                    }
                    last_sequence_for_key = parsed.sequence;
                }
            }

            if !drop_entry {
                if builder.is_none() {
                    let mut inner = self.state.lock().expect("state mutex poisoned");
                    let number = inner.versions.new_file_number();
                    inner.pending_outputs.insert(number);
                    drop(inner);

                    match File::create(table_file_name(&self.dir, number)) {
                        Ok(file) => {
                            builder = Some((
                                TableBuilder::new(
                                    Arc::clone(&self.opts),
                                    Arc::clone(&self.icmp),
                                    file,
                                ),
                                Output {
                                    number,
                                    smallest: key.clone(),
                                    largest: Vec::new(),
                                },
                            ));
                        }
                        Err(e) => {
                            status = Err(e.into());
                            break;
                        }
                    }
                }
                let (b, meta) = builder.as_mut().expect("builder just created");
                meta.largest.clear();
                meta.largest.extend_from_slice(&key);
                if let Err(e) = b.add(&key, input.value()) {
                    status = Err(e);
                    break;
                }
                if b.file_size() >= c.max_output_file_size() {
                    let (b, meta) = builder.take().expect("builder exists");
                    match b.finish() {
                        Ok(size) => outputs.push((meta, size)),
                        Err(e) => {
                            status = Err(e);
                            break;
                        }
                    }
                }
            }

            input.next();
        }

        if status.is_ok() {
            if let Some((b, meta)) = builder.take() {
                match b.finish() {
                    Ok(size) => outputs.push((meta, size)),
                    Err(e) => status = Err(e),
                }
            }
        }
        if status.is_ok() {
            status = input.status();
        }
        drop(input);

        let mut guard = self.state.lock().expect("state mutex poisoned");
        let micros = start.elapsed().as_micros() as u64;
        let bytes_written: u64 = outputs.iter().map(|(_, size)| size).sum();
        guard.stats[level + 1].micros += micros;
        guard.stats[level + 1].bytes_read += bytes_read;
        guard.stats[level + 1].bytes_written += bytes_written;

        if status.is_ok() {
            c.add_input_deletions();
            for (meta, size) in &outputs {
                c.edit.add_file(
                    level + 1,
                    FileMetaData::new(meta.number, *size, meta.smallest.clone(), meta.largest.clone()),
                );
            }
            status = guard.versions.log_and_apply(&mut c.edit);
        }

        for (meta, _) in &outputs {
            guard.pending_outputs.remove(&meta.number);
        }

        match &status {
            Ok(()) => {
                tracing::info!(
                    level,
                    outputs = outputs.len(),
                    bytes_read,
                    bytes_written,
                    micros,
                    "compaction finished"
                );
                self.info_log.log(&format!(
                    "compacted to level {}: {} files, {} bytes",
                    level + 1,
                    outputs.len(),
                    bytes_written
                ));
            }
            Err(e) => {
                tracing::error!(level, error = %e, "compaction failed");
            }
        }
        (guard, status)
    }

    /// Merging iterator over every compaction input file.
    fn make_input_iterator(
        &self,
        guard: &MutexGuard<'_, DbState>,
        c: &Compaction,
    ) -> Result<MergingIter> {
        let _ = guard; // inputs come from a pinned version; the lock just
                       // orders this against concurrent installs.
        let ropts = ReadOptions {
            verify_checksums: self.opts.paranoid_checks,
            fill_cache: false,
            snapshot: None,
        };
        let mut children: Vec<Box<dyn DbIter>> = Vec::new();
        for which in 0..2 {
            if c.num_input_files(which) == 0 {
                continue;
            }
            if c.level() + which == 0 {
                for i in 0..c.num_input_files(0) {
                    let file = c.input(0, i);
                    children.push(Box::new(self.table_cache.iter(
                        &ropts,
                        file.number,
                        file.size,
                    )?));
                }
            } else {
                children.push(Box::new(crate::version::LevelFileIter::new(
                    Arc::clone(&self.icmp),
                    Arc::clone(&self.table_cache),
                    ropts.clone(),
                    c.inputs[which].clone(),
                )));
            }
        }
        Ok(MergingIter::new(Arc::clone(&self.icmp), children))
    }

    // ----- manual compaction -----

    fn manual_compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let _gate = self.manual_gate.lock()?;

        let manual = ManualCompaction {
            level,
            done: false,
            begin: begin.map(|b| make_internal_key(b, MAX_SEQUENCE_NUMBER, TAG_FOR_SEEK)),
            end: end.map(|e| make_internal_key(e, 0, ValueTag::Deletion)),
        };

        let mut guard = self.state.lock()?;
        debug_assert!(guard.manual.is_none());
        guard.manual = Some(manual);
        self.maybe_schedule_compaction(&mut guard);
        loop {
            if self.shutting_down.load(AtomicOrdering::SeqCst) {
                guard.manual = None;
                return Err(Error::Shutdown);
            }
            if let Some(e) = &guard.bg_error {
                let e = e.clone();
                guard.manual = None;
                return Err(e);
            }
            if guard.manual.as_ref().is_some_and(|m| m.done) {
                guard.manual = None;
                return Ok(());
            }
            self.maybe_schedule_compaction(&mut guard);
            guard = self.background_work_done.wait(guard)?;
        }
    }

    // ----- housekeeping -----

    fn record_background_error(&self, guard: &mut MutexGuard<'_, DbState>, e: Error) {
        if guard.bg_error.is_none() {
            tracing::error!(error = %e, "latching background error");
            guard.bg_error = Some(e);
            self.background_work_done.notify_all();
        }
    }

    /// Removes files no live version references: old logs, superseded
    /// manifests, and compacted-away tables.
    fn delete_obsolete_files(&self, guard: &mut MutexGuard<'_, DbState>) {
        if guard.bg_error.is_some() {
            // The version state may not reflect reality; touch nothing.
            return;
        }
        let mut live = guard.pending_outputs.clone();
        live.extend(guard.versions.live_files());

        let log_number = guard.versions.log_number();
        let manifest_number = guard.versions.manifest_file_number();

        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some((kind, number)) = parse_file_name(&name) else {
                continue;
            };
            let keep = match kind {
                FileType::Log => number >= log_number,
                FileType::Manifest => number >= manifest_number,
                FileType::Table => live.contains(&number),
                FileType::Temp => live.contains(&number),
                FileType::Current | FileType::Lock | FileType::InfoLog | FileType::OldInfoLog => {
                    true
                }
            };
            if keep {
                continue;
            }
            if kind == FileType::Table {
                self.table_cache.evict(number);
            }
            tracing::info!(file = %name, "deleting obsolete file");
            let _ = std::fs::remove_file(self.dir.join(&name));
        }
    }
}
