//! The version set: owner of the version chain, the file-number and
//! sequence counters, and the manifest.
//!
//! Every successful edit produces a new immutable [`Version`] and appends
//! the edit to `MANIFEST-<n>` (log framed). A fresh manifest starts with a
//! snapshot edit describing the full current state, then `CURRENT` is
//! atomically repointed, so recovery only ever needs one manifest file.
//!
//! All methods expect the caller to hold the database mutex; the set has
//! no interior locking of its own.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use crate::compaction::{
    expanded_compaction_byte_size_limit, max_bytes_for_level, Compaction,
};
use crate::config::{Options, L0_COMPACTION_TRIGGER, NUM_LEVELS};
use crate::error::{Error, Result};
use crate::filename::{manifest_file_name, read_current_file, set_current_file};
use crate::key::{Comparator, InternalKeyComparator, SequenceNumber};
use crate::table_cache::TableCache;
use crate::version::edit::VersionEdit;
use crate::version::{total_file_size, FileMetaData, Version};
use crate::wal::{LogReader, LogWriter};

pub struct VersionSet {
    dir: PathBuf,
    opts: Arc<Options>,
    icmp: Arc<InternalKeyComparator>,
    table_cache: Arc<TableCache>,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SequenceNumber,
    /// Logs numbered below this are no longer needed.
    log_number: u64,

    current: Arc<Version>,
    /// Every version that might still be referenced by an iterator or an
    /// in-flight read; pruned lazily when the live-file set is computed.
    live: Vec<Weak<Version>>,

    manifest_log: Option<LogWriter>,

    /// Where the next size compaction at each level resumes (internal key).
    pub compact_pointers: [Vec<u8>; NUM_LEVELS],
}

impl VersionSet {
    pub fn new(
        dir: PathBuf,
        opts: Arc<Options>,
        icmp: Arc<InternalKeyComparator>,
        table_cache: Arc<TableCache>,
    ) -> Self {
        Self {
            dir,
            opts,
            icmp,
            table_cache,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            current: Arc::new(Version::new()),
            live: Vec::new(),
            manifest_log: None,
            compact_pointers: Default::default(),
        }
    }

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, seq: SequenceNumber) {
        debug_assert!(seq >= self.last_sequence);
        self.last_sequence = seq;
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Hands an unused number back, when nothing was written under it.
    pub fn reuse_file_number(&mut self, number: u64) {
        if number + 1 == self.next_file_number {
            self.next_file_number = number;
        }
    }

    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.files[level].len()
    }

    pub fn num_level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.current.files[level])
    }

    /// Numbers of every table file referenced by any live version.
    pub fn live_files(&mut self) -> HashSet<u64> {
        let mut live = HashSet::new();
        self.live.retain(|weak| {
            if let Some(version) = weak.upgrade() {
                for level in 0..NUM_LEVELS {
                    for file in &version.files[level] {
                        live.insert(file.number);
                    }
                }
                true
            } else {
                false
            }
        });
        for level in 0..NUM_LEVELS {
            for file in &self.current.files[level] {
                live.insert(file.number);
            }
        }
        live
    }

    fn append_version(&mut self, version: Arc<Version>) {
        self.live.push(Arc::downgrade(&version));
        self.current = version;
    }

    /// Computes the level most in need of compaction for a new version.
    fn finalize(version: &mut Version) {
        let mut best_level = 0;
        let mut best_score = -1.0f64;
        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                // File count, not bytes: with a small write buffer, byte
                // scoring would compact level 0 too eagerly, and every
                // level-0 file widens every read.
                version.files[0].len() as f64 / L0_COMPACTION_TRIGGER as f64
            } else {
                total_file_size(&version.files[level]) as f64 / max_bytes_for_level(level)
            };
            if score > best_score {
                best_score = score;
                best_level = level;
            }
        }
        version.compaction_level = best_level;
        version.compaction_score = best_score;
    }

    /// Applies `edit` to the current version and checks the level
    /// invariants before anything becomes visible.
    fn build_version(&self, edit: &VersionEdit) -> Result<Version> {
        let mut files: [Vec<Arc<FileMetaData>>; NUM_LEVELS] = Default::default();
        for level in 0..NUM_LEVELS {
            files[level] = self.current.files[level].clone();
        }
        Self::apply_edit_to(&self.icmp, &mut files, edit)?;
        let mut version = Version::new();
        version.files = files;
        Self::finalize(&mut version);
        Ok(version)
    }

    fn apply_edit_to(
        icmp: &InternalKeyComparator,
        files: &mut [Vec<Arc<FileMetaData>>; NUM_LEVELS],
        edit: &VersionEdit,
    ) -> Result<()> {
        for (level, number) in &edit.deleted_files {
            if *level >= NUM_LEVELS {
                return Err(Error::Corruption(format!("edit deletes at level {level}")));
            }
            files[*level].retain(|f| f.number != *number);
        }
        for (level, meta) in &edit.new_files {
            if *level >= NUM_LEVELS {
                return Err(Error::Corruption(format!("edit adds at level {level}")));
            }
            files[*level].push(Arc::new(meta.clone()));
        }

        // Level 0 keeps insertion order (read path sorts by file number);
        // deeper levels stay sorted by smallest key and must not overlap.
        for (level, level_files) in files.iter_mut().enumerate().skip(1) {
            level_files.sort_by(|a, b| icmp.compare(&a.smallest, &b.smallest));
            for pair in level_files.windows(2) {
                if icmp.compare(&pair[0].largest, &pair[1].smallest) != std::cmp::Ordering::Less {
                    return Err(Error::Corruption(format!(
                        "files {:06} and {:06} overlap at level {level}",
                        pair[0].number, pair[1].number,
                    )));
                }
            }
        }
        Ok(())
    }

    /// Installs `edit`: builds the new version, logs the edit durably, then
    /// swaps the current version. On failure the in-memory state is
    /// untouched and the error is surfaced.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        match edit.log_number {
            Some(n) => debug_assert!(n >= self.log_number && n < self.next_file_number),
            None => edit.set_log_number(self.log_number),
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let version = self.build_version(edit)?;

        // First install after open: start a fresh manifest with a snapshot.
        let mut created_manifest = false;
        if self.manifest_log.is_none() {
            let path = manifest_file_name(&self.dir, self.manifest_file_number);
            let file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&path)?;
            let mut log = LogWriter::new(file)?;
            match self.write_snapshot(&mut log) {
                Ok(()) => {
                    self.manifest_log = Some(log);
                    created_manifest = true;
                }
                Err(e) => {
                    let _ = std::fs::remove_file(&path);
                    return Err(e);
                }
            }
        }

        let result = (|| -> Result<()> {
            let mut record = Vec::new();
            edit.encode_to(&mut record);
            let log = self.manifest_log.as_mut().expect("manifest just opened");
            log.add_record(&record)?;
            log.sync()?;
            if created_manifest {
                set_current_file(&self.dir, self.manifest_file_number)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                for (level, key) in &edit.compact_pointers {
                    self.compact_pointers[*level] = key.clone();
                }
                if let Some(n) = edit.log_number {
                    self.log_number = n;
                }
                self.append_version(Arc::new(version));
                Ok(())
            }
            Err(e) => {
                // A manifest we cannot append to would poison recovery;
                // drop it so the next install starts a fresh one.
                if created_manifest {
                    let _ = std::fs::remove_file(manifest_file_name(
                        &self.dir,
                        self.manifest_file_number,
                    ));
                } else {
                    // The half-written manifest may be the one CURRENT
                    // points at; never reuse its number.
                    self.manifest_file_number = self.new_file_number();
                }
                self.manifest_log = None;
                Err(e)
            }
        }
    }

    /// One edit describing the entire current state.
    fn write_snapshot(&self, log: &mut LogWriter) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.icmp.user_comparator().name());
        for (level, pointer) in self.compact_pointers.iter().enumerate() {
            if !pointer.is_empty() {
                edit.set_compact_pointer(level, pointer);
            }
        }
        for level in 0..NUM_LEVELS {
            for file in &self.current.files[level] {
                edit.add_file(level, (**file).clone());
            }
        }
        let mut record = Vec::new();
        edit.encode_to(&mut record);
        log.add_record(&record)?;
        Ok(())
    }

    /// Writes the initial manifest of a brand-new database and points
    /// `CURRENT` at it.
    pub fn create_new_db(&mut self) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.icmp.user_comparator().name());
        edit.set_log_number(0);
        edit.set_next_file_number(2);
        edit.set_last_sequence(0);

        let manifest_number = 1;
        let path = manifest_file_name(&self.dir, manifest_number);
        let file = File::create(&path)?;
        let mut log = LogWriter::new(file)?;
        let mut record = Vec::new();
        edit.encode_to(&mut record);
        let result = log.add_record(&record).and_then(|_| log.sync());
        match result {
            Ok(()) => set_current_file(&self.dir, manifest_number),
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                Err(e)
            }
        }
    }

    /// Rebuilds the latest version from `CURRENT` and its manifest.
    pub fn recover(&mut self) -> Result<()> {
        let manifest_name = read_current_file(&self.dir)?;
        let manifest_path = self.dir.join(&manifest_name);
        let file = File::open(&manifest_path)
            .map_err(|e| Error::Corruption(format!("cannot open {manifest_name}: {e}")))?;

        let mut files: [Vec<Arc<FileMetaData>>; NUM_LEVELS] = Default::default();
        let mut log_number: Option<u64> = None;
        let mut next_file_number: Option<u64> = None;
        let mut last_sequence: Option<u64> = None;
        let mut have_any_edit = false;

        let mut reader = LogReader::new(file, true);
        while let Some(record) = reader.read_record()? {
            let edit = VersionEdit::decode_from(&record)?;
            if let Some(name) = &edit.comparator {
                let ours = self.icmp.user_comparator().name();
                if name != ours {
                    return Err(Error::InvalidArgument(format!(
                        "comparator mismatch: database uses {name}, options supply {ours}"
                    )));
                }
            }
            Self::apply_edit_to(&self.icmp, &mut files, &edit)?;
            for (level, key) in &edit.compact_pointers {
                self.compact_pointers[*level] = key.clone();
            }
            if edit.log_number.is_some() {
                log_number = edit.log_number;
            }
            if edit.next_file_number.is_some() {
                next_file_number = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
            have_any_edit = true;
        }

        if !have_any_edit {
            return Err(Error::Corruption(format!(
                "{manifest_name} contains no version edits"
            )));
        }
        let next_file_number = next_file_number
            .ok_or_else(|| Error::Corruption("manifest missing next file number".to_string()))?;
        let last_sequence = last_sequence
            .ok_or_else(|| Error::Corruption("manifest missing last sequence".to_string()))?;
        let log_number = log_number.unwrap_or(0);

        self.next_file_number = next_file_number;
        self.mark_file_number_used(log_number);
        self.last_sequence = last_sequence;
        self.log_number = log_number;

        let mut version = Version::new();
        version.files = files;
        Self::finalize(&mut version);
        self.append_version(Arc::new(version));

        // The next manifest gets a fresh number; the old file stays on disk
        // until a new one is installed.
        self.manifest_file_number = self.new_file_number();

        tracing::info!(
            manifest = %manifest_name,
            log_number,
            next_file_number = self.next_file_number,
            last_sequence,
            "recovered version state"
        );
        Ok(())
    }

    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score >= 1.0 || self.current.file_to_compact().is_some()
    }

    /// Picks the next compaction: size-triggered first, then
    /// seek-triggered. Returns None when the tree is healthy.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current();
        let size_triggered = current.compaction_score >= 1.0;

        let mut c;
        let level;
        if size_triggered {
            level = current.compaction_level;
            debug_assert!(level + 1 < NUM_LEVELS);
            c = Compaction::new(level, self.opts.max_file_size);

            // Resume after the last compacted key at this level, wrapping
            // to the start of the keyspace.
            let pointer = &self.compact_pointers[level];
            let picked = current.files[level].iter().find(|f| {
                pointer.is_empty()
                    || self.icmp.compare(&f.largest, pointer) == std::cmp::Ordering::Greater
            });
            let file = picked.or_else(|| current.files[level].first())?;
            c.inputs[0].push(Arc::clone(file));
        } else if let Some((seek_level, file)) = current.file_to_compact() {
            level = seek_level;
            c = Compaction::new(level, self.opts.max_file_size);
            c.inputs[0].push(file);
        } else {
            return None;
        }

        c.input_version = Some(Arc::clone(&current));

        // Level-0 inputs must absorb every overlapping level-0 file.
        if level == 0 {
            let (smallest, largest) = self.range_of(&c.inputs[0]);
            c.inputs[0] =
                current.get_overlapping_inputs(&self.icmp, 0, Some(&smallest), Some(&largest));
            debug_assert!(!c.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Compaction over an explicit key range, for manual compaction. The
    /// level-L input set is trimmed so one round stays bounded; the caller
    /// loops until the range is exhausted.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Option<Compaction> {
        let current = self.current();
        let mut inputs = current.get_overlapping_inputs(&self.icmp, level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // Avoid one giant round when a range covers a whole level: stop
        // collecting inputs past the per-file byte budget.
        if level > 0 {
            let limit = crate::compaction::target_file_size(self.opts.max_file_size);
            let mut total = 0u64;
            for (i, file) in inputs.iter().enumerate() {
                total += file.size;
                if total >= limit && i + 1 < inputs.len() {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let mut c = Compaction::new(level, self.opts.max_file_size);
        c.input_version = Some(current);
        c.inputs[0] = inputs;
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Smallest and largest internal key across a file set.
    fn range_of(&self, files: &[Arc<FileMetaData>]) -> (Vec<u8>, Vec<u8>) {
        debug_assert!(!files.is_empty());
        let mut smallest = files[0].smallest.clone();
        let mut largest = files[0].largest.clone();
        for file in &files[1..] {
            if self.icmp.compare(&file.smallest, &smallest) == std::cmp::Ordering::Less {
                smallest = file.smallest.clone();
            }
            if self.icmp.compare(&file.largest, &largest) == std::cmp::Ordering::Greater {
                largest = file.largest.clone();
            }
        }
        (smallest, largest)
    }

    fn range_of_two(
        &self,
        a: &[Arc<FileMetaData>],
        b: &[Arc<FileMetaData>],
    ) -> (Vec<u8>, Vec<u8>) {
        let mut all: Vec<Arc<FileMetaData>> = a.to_vec();
        all.extend(b.iter().cloned());
        self.range_of(&all)
    }

    /// Fills in the level-(L+1) inputs, opportunistically grows the level-L
    /// set while that does not widen the level-(L+1) set, records the
    /// grandparents, and advances the compact pointer.
    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let current = c.input_version.as_ref().expect("compaction has no version").clone();
        let level = c.level();

        let (smallest, largest) = self.range_of(&c.inputs[0]);
        c.inputs[1] =
            current.get_overlapping_inputs(&self.icmp, level + 1, Some(&smallest), Some(&largest));

        let (mut all_start, mut all_limit) = self.range_of_two(&c.inputs[0], &c.inputs[1]);

        if !c.inputs[1].is_empty() {
            let expanded0 =
                current.get_overlapping_inputs(&self.icmp, level, Some(&all_start), Some(&all_limit));
            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size
                    < expanded_compaction_byte_size_limit(self.opts.max_file_size)
            {
                let (new_start, new_limit) = self.range_of(&expanded0);
                let expanded1 = current.get_overlapping_inputs(
                    &self.icmp,
                    level + 1,
                    Some(&new_start),
                    Some(&new_limit),
                );
                if expanded1.len() == c.inputs[1].len() {
                    tracing::debug!(
                        level,
                        from = c.inputs[0].len(),
                        to = expanded0.len(),
                        "expanding compaction inputs"
                    );
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                    let (s, l) = self.range_of_two(&c.inputs[0], &c.inputs[1]);
                    all_start = s;
                    all_limit = l;
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            c.set_grandparents(current.get_overlapping_inputs(
                &self.icmp,
                level + 2,
                Some(&all_start),
                Some(&all_limit),
            ));
        }

        // Future size compactions at this level resume past this range;
        // recorded in the edit now so a crash before install changes
        // nothing.
        let (_, largest) = self.range_of(&c.inputs[0]);
        self.compact_pointers[level] = largest.clone();
        c.edit.set_compact_pointer(level, &largest);
    }

    /// Approximate byte offset of `internal_key` within the whole database.
    pub fn approximate_offset_of(&self, version: &Version, internal_key: &[u8]) -> u64 {
        let mut offset = 0u64;
        for level in 0..NUM_LEVELS {
            for file in &version.files[level] {
                if self.icmp.compare(&file.largest, internal_key) != std::cmp::Ordering::Greater {
                    // Entirely before the key.
                    offset += file.size;
                } else if self.icmp.compare(&file.smallest, internal_key)
                    == std::cmp::Ordering::Greater
                {
                    // Entirely past the key; at levels > 0 the rest of the
                    // level is too.
                    if level > 0 {
                        break;
                    }
                } else if let Ok(table) = self.table_cache.find_table(file.number, file.size) {
                    offset += table.approximate_offset_of(internal_key);
                }
            }
        }
        offset
    }

    /// Per-level file counts and sizes, for the "stats" property.
    pub fn level_summary(&self) -> String {
        use std::fmt::Write;
        let mut out = String::from("level  files  bytes\n");
        for level in 0..NUM_LEVELS {
            let n = self.num_level_files(level);
            let bytes = self.num_level_bytes(level);
            if n > 0 {
                let _ = writeln!(out, "{level:>5}  {n:>5}  {bytes}");
            }
        }
        out
    }
}
