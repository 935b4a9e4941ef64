//! Versioned file sets.
//!
//! A [`Version`] is an immutable snapshot of which sstables compose each
//! level. Versions are shared by `Arc`: the version set holds the current
//! one, and every iterator or in-flight read holds its own reference, so a
//! version (and the files it names) stays alive for as long as anything
//! can observe it.
//!
//! Level 0 files may overlap and are searched newest first. Files at
//! levels >= 1 are disjoint and sorted by smallest key, so point reads
//! binary search and range scans concatenate per-file iterators.

pub mod edit;
pub mod set;

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use crate::config::{ReadOptions, MAX_MEM_COMPACT_LEVEL, NUM_LEVELS};
use crate::error::Result;
use crate::iterator::DbIter;
use crate::key::{
    extract_user_key, make_internal_key, parse_internal_key, Comparator, InternalKeyComparator,
    SequenceNumber, ValueTag, TAG_FOR_SEEK,
};
use crate::sstable::two_level::TwoLevelIter;
use crate::table_cache::TableCache;

/// Metadata for one live sstable.
#[derive(Debug)]
pub struct FileMetaData {
    pub number: u64,
    pub size: u64,
    /// Smallest internal key in the file.
    pub smallest: Vec<u8>,
    /// Largest internal key in the file.
    pub largest: Vec<u8>,
    /// Read-sampling budget: when enough point reads had to look past this
    /// file, it becomes a compaction candidate.
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(number: u64, size: u64, smallest: Vec<u8>, largest: Vec<u8>) -> Self {
        // One seek costs roughly as much as compacting 16 KiB.
        let allowed = (size / 16384).max(100) as i64;
        Self {
            number,
            size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed),
        }
    }
}

impl Clone for FileMetaData {
    fn clone(&self) -> Self {
        Self {
            number: self.number,
            size: self.size,
            smallest: self.smallest.clone(),
            largest: self.largest.clone(),
            allowed_seeks: AtomicI64::new(self.allowed_seeks.load(AtomicOrdering::Relaxed)),
        }
    }
}

pub fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

/// Outcome of probing the on-disk levels for a user key.
pub enum LookupResult {
    Found(Vec<u8>),
    Deleted,
    NotFound,
}

/// Bookkeeping from a point read, fed back into seek-triggered compaction.
#[derive(Default)]
pub struct GetStats {
    /// First file whose read was "wasted" (answer came from elsewhere).
    pub seek_file: Option<(usize, Arc<FileMetaData>)>,
}

pub struct Version {
    pub files: [Vec<Arc<FileMetaData>>; NUM_LEVELS],
    /// Level whose size-based score is highest, and the score itself;
    /// computed when the version is installed.
    pub compaction_level: usize,
    pub compaction_score: f64,
    /// File nominated by seek sampling, if any.
    seek_compact: Mutex<Option<(usize, Arc<FileMetaData>)>>,
}

impl Version {
    pub fn new() -> Self {
        Self {
            files: Default::default(),
            compaction_level: 0,
            compaction_score: -1.0,
            seek_compact: Mutex::new(None),
        }
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    /// Point lookup across levels, honouring `sequence`. Also reports the
    /// file to charge a wasted seek to, if more than one was consulted.
    pub fn get(
        &self,
        ropts: &ReadOptions,
        icmp: &InternalKeyComparator,
        table_cache: &TableCache,
        user_key: &[u8],
        sequence: SequenceNumber,
    ) -> Result<(LookupResult, GetStats)> {
        let ucmp = icmp.user_comparator();
        let lookup_key = make_internal_key(user_key, sequence, TAG_FOR_SEEK);

        // Files to probe, newest first: overlapping level-0 files sorted by
        // file number descending, then at most one file per deeper level.
        let mut candidates: Vec<(usize, Arc<FileMetaData>)> = Vec::new();
        {
            let mut level0: Vec<&Arc<FileMetaData>> = self.files[0]
                .iter()
                .filter(|f| {
                    ucmp.compare(user_key, extract_user_key(&f.smallest)) != Ordering::Less
                        && ucmp.compare(user_key, extract_user_key(&f.largest)) != Ordering::Greater
                })
                .collect();
            level0.sort_by(|a, b| b.number.cmp(&a.number));
            candidates.extend(level0.into_iter().map(|f| (0, Arc::clone(f))));
        }
        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            let index = find_file(icmp, files, &lookup_key);
            if index >= files.len() {
                continue;
            }
            let file = &files[index];
            if ucmp.compare(user_key, extract_user_key(&file.smallest)) == Ordering::Less {
                continue;
            }
            candidates.push((level, Arc::clone(file)));
        }

        let mut stats = GetStats::default();
        let mut last_file_read: Option<(usize, Arc<FileMetaData>)> = None;

        for (level, file) in candidates {
            if last_file_read.is_some() && stats.seek_file.is_none() {
                stats.seek_file = last_file_read.take();
            }
            last_file_read = Some((level, Arc::clone(&file)));

            let entry = table_cache.get(ropts, file.number, file.size, &lookup_key)?;
            let Some((found_key, value)) = entry else {
                continue;
            };
            let Some(parsed) = parse_internal_key(&found_key) else {
                continue;
            };
            if ucmp.compare(parsed.user_key, user_key) != Ordering::Equal {
                continue;
            }
            let result = match parsed.tag {
                ValueTag::Value => LookupResult::Found(value),
                ValueTag::Deletion => LookupResult::Deleted,
            };
            return Ok((result, stats));
        }

        Ok((LookupResult::NotFound, stats))
    }

    /// Charges a wasted seek. Returns true when a file's budget ran out and
    /// a compaction should be scheduled.
    pub fn update_stats(&self, stats: GetStats) -> bool {
        let Some((level, file)) = stats.seek_file else {
            return false;
        };
        let remaining = file.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed) - 1;
        if remaining <= 0 {
            let mut slot = self.seek_compact.lock().expect("version mutex poisoned");
            if slot.is_none() {
                *slot = Some((level, file));
                return true;
            }
        }
        false
    }

    pub fn file_to_compact(&self) -> Option<(usize, Arc<FileMetaData>)> {
        self.seek_compact
            .lock()
            .expect("version mutex poisoned")
            .clone()
    }

    /// True if any file at `level` overlaps the user-key range.
    pub fn overlap_in_level(
        &self,
        icmp: &InternalKeyComparator,
        level: usize,
        smallest_user: Option<&[u8]>,
        largest_user: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            icmp,
            level > 0,
            &self.files[level],
            smallest_user,
            largest_user,
        )
    }

    /// Picks the level a fresh memtable flush lands on: level 0 when it
    /// overlaps there, otherwise pushed down while it stays disjoint and
    /// does not overlap too much of the grandparent level.
    pub fn pick_level_for_memtable_output(
        &self,
        icmp: &InternalKeyComparator,
        max_file_size: u64,
        smallest_user: &[u8],
        largest_user: &[u8],
    ) -> usize {
        let mut level = 0;
        if self.overlap_in_level(icmp, 0, Some(smallest_user), Some(largest_user)) {
            return level;
        }
        let start = make_internal_key(smallest_user, crate::key::MAX_SEQUENCE_NUMBER, TAG_FOR_SEEK);
        let limit = make_internal_key(largest_user, 0, ValueTag::Deletion);
        while level < MAX_MEM_COMPACT_LEVEL {
            if self.overlap_in_level(icmp, level + 1, Some(smallest_user), Some(largest_user)) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let overlaps =
                    self.get_overlapping_inputs(icmp, level + 2, Some(&start), Some(&limit));
                if total_file_size(&overlaps) > 10 * max_file_size {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// All files at `level` whose user-key range intersects
    /// `[begin, end]` (internal-key bounds, None = open). At level 0 the
    /// range grows to cover transitively overlapping files.
    pub fn get_overlapping_inputs(
        &self,
        icmp: &InternalKeyComparator,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMetaData>> {
        let ucmp = icmp.user_comparator();
        let mut user_begin = begin.map(extract_user_key);
        let mut user_end = end.map(extract_user_key);
        let mut inputs: Vec<Arc<FileMetaData>> = Vec::new();

        let mut i = 0;
        while i < self.files[level].len() {
            let file = &self.files[level][i];
            i += 1;
            let file_start = extract_user_key(&file.smallest);
            let file_limit = extract_user_key(&file.largest);

            if user_begin.is_some_and(|b| ucmp.compare(file_limit, b) == Ordering::Less) {
                continue;
            }
            if user_end.is_some_and(|e| ucmp.compare(file_start, e) == Ordering::Greater) {
                continue;
            }

            inputs.push(Arc::clone(file));
            if level == 0 {
                // Level-0 files overlap each other; widen the range and
                // restart so every transitive overlap is included.
                if let Some(b) = user_begin {
                    if ucmp.compare(file_start, b) == Ordering::Less {
                        user_begin = Some(file_start);
                        inputs.clear();
                        i = 0;
                        continue;
                    }
                }
                if let Some(e) = user_end {
                    if ucmp.compare(file_limit, e) == Ordering::Greater {
                        user_end = Some(file_limit);
                        inputs.clear();
                        i = 0;
                    }
                }
            }
        }
        inputs
    }

    /// Iterators covering the whole version, for merging with memtables.
    pub fn iters(
        &self,
        ropts: &ReadOptions,
        icmp: Arc<InternalKeyComparator>,
        table_cache: &Arc<TableCache>,
    ) -> Result<Vec<Box<dyn DbIter>>> {
        let mut iters: Vec<Box<dyn DbIter>> = Vec::new();
        for file in &self.files[0] {
            iters.push(Box::new(table_cache.iter(ropts, file.number, file.size)?));
        }
        for level in 1..NUM_LEVELS {
            if self.files[level].is_empty() {
                continue;
            }
            iters.push(Box::new(LevelFileIter::new(
                Arc::clone(&icmp),
                Arc::clone(table_cache),
                ropts.clone(),
                self.files[level].clone(),
            )));
        }
        Ok(iters)
    }

    /// One line per file, for the "sstables" property.
    pub fn debug_string(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (level, files) in self.files.iter().enumerate() {
            if files.is_empty() {
                continue;
            }
            let _ = writeln!(out, "level {level}:");
            for f in files {
                let _ = writeln!(
                    out,
                    "  {:06}: {} bytes [{:?} .. {:?}]",
                    f.number,
                    f.size,
                    String::from_utf8_lossy(extract_user_key(&f.smallest)),
                    String::from_utf8_lossy(extract_user_key(&f.largest)),
                );
            }
        }
        out
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of the first file whose largest key is >= `internal_key`, in a
/// level sorted by smallest key. `files.len()` if none.
pub fn find_file(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetaData>],
    internal_key: &[u8],
) -> usize {
    let mut left = 0;
    let mut right = files.len();
    while left < right {
        let mid = (left + right) / 2;
        if icmp.compare(&files[mid].largest, internal_key) == Ordering::Less {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

/// Whether any file overlaps `[smallest_user, largest_user]`. With
/// `disjoint` set the files are sorted and non-overlapping, so a binary
/// search suffices; otherwise every file is checked.
pub fn some_file_overlaps_range(
    icmp: &InternalKeyComparator,
    disjoint: bool,
    files: &[Arc<FileMetaData>],
    smallest_user: Option<&[u8]>,
    largest_user: Option<&[u8]>,
) -> bool {
    let ucmp = icmp.user_comparator();
    if !disjoint {
        return files.iter().any(|f| {
            let after = smallest_user
                .is_some_and(|s| ucmp.compare(s, extract_user_key(&f.largest)) == Ordering::Greater);
            let before = largest_user
                .is_some_and(|l| ucmp.compare(l, extract_user_key(&f.smallest)) == Ordering::Less);
            !(after || before)
        });
    }

    let index = match smallest_user {
        Some(s) => {
            let probe = make_internal_key(s, crate::key::MAX_SEQUENCE_NUMBER, TAG_FOR_SEEK);
            find_file(icmp, files, &probe)
        }
        None => 0,
    };
    if index >= files.len() {
        return false;
    }
    !largest_user
        .is_some_and(|l| ucmp.compare(l, extract_user_key(&files[index].smallest)) == Ordering::Less)
}

/// Concatenating iterator over the disjoint, sorted files of one level.
pub struct LevelFileIter {
    icmp: Arc<InternalKeyComparator>,
    table_cache: Arc<TableCache>,
    ropts: ReadOptions,
    files: Vec<Arc<FileMetaData>>,
    /// `files.len()` when not positioned.
    index: usize,
    data_iter: Option<TwoLevelIter>,
    err: Option<crate::Error>,
}

impl LevelFileIter {
    pub fn new(
        icmp: Arc<InternalKeyComparator>,
        table_cache: Arc<TableCache>,
        ropts: ReadOptions,
        files: Vec<Arc<FileMetaData>>,
    ) -> Self {
        let index = files.len();
        Self {
            icmp,
            table_cache,
            ropts,
            files,
            index,
            data_iter: None,
            err: None,
        }
    }

    fn open_current(&mut self) {
        self.data_iter = None;
        if self.index >= self.files.len() {
            return;
        }
        let file = &self.files[self.index];
        match self.table_cache.iter(&self.ropts, file.number, file.size) {
            Ok(iter) => self.data_iter = Some(iter),
            Err(e) => {
                self.err = Some(e);
                self.index = self.files.len();
            }
        }
    }

    fn skip_forward(&mut self) {
        while self.data_iter.as_ref().is_none_or(|d| !d.valid()) {
            if self.index + 1 >= self.files.len() {
                self.index = self.files.len();
                self.data_iter = None;
                return;
            }
            self.index += 1;
            self.open_current();
            if let Some(d) = &mut self.data_iter {
                d.seek_to_first();
            }
        }
    }

    fn skip_backward(&mut self) {
        while self.data_iter.as_ref().is_none_or(|d| !d.valid()) {
            if self.index == 0 {
                self.index = self.files.len();
                self.data_iter = None;
                return;
            }
            self.index -= 1;
            self.open_current();
            if let Some(d) = &mut self.data_iter {
                d.seek_to_last();
            }
        }
    }
}

impl DbIter for LevelFileIter {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|d| d.valid())
    }

    fn seek_to_first(&mut self) {
        if self.files.is_empty() {
            return;
        }
        self.index = 0;
        self.open_current();
        if let Some(d) = &mut self.data_iter {
            d.seek_to_first();
        }
        self.skip_forward();
    }

    fn seek_to_last(&mut self) {
        if self.files.is_empty() {
            return;
        }
        self.index = self.files.len() - 1;
        self.open_current();
        if let Some(d) = &mut self.data_iter {
            d.seek_to_last();
        }
        self.skip_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
        if self.index >= self.files.len() {
            self.data_iter = None;
            return;
        }
        self.open_current();
        if let Some(d) = &mut self.data_iter {
            d.seek(target);
        }
        self.skip_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(d) = &mut self.data_iter {
            d.next();
        }
        self.skip_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(d) = &mut self.data_iter {
            d.prev();
        }
        self.skip_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().expect("iterator not valid").key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().expect("iterator not valid").value()
    }

    fn status(&self) -> Result<()> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        if let Some(d) = &self.data_iter {
            d.status()?;
        }
        Ok(())
    }
}
