//! Compaction descriptions.
//!
//! A [`Compaction`] names the files being merged from level L and level
//! L+1, the grandparent files at L+2 whose overlap bounds output file
//! sizes, and the version edit that will install the result. The planner
//! that builds these lives in [`crate::version::set::VersionSet`]; the
//! executor that runs them lives in the database frontend.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::NUM_LEVELS;
use crate::key::{extract_user_key, Comparator, InternalKeyComparator};
use crate::version::edit::VersionEdit;
use crate::version::{total_file_size, FileMetaData, Version};

/// Target size for compaction output files.
pub fn target_file_size(max_file_size: u64) -> u64 {
    max_file_size
}

/// Past this much grandparent overlap an output file is cut early, so a
/// future compaction of it stays cheap.
pub fn max_grandparent_overlap_bytes(max_file_size: u64) -> u64 {
    10 * target_file_size(max_file_size)
}

/// Cap on the bytes a level-L input set may grow to when expansion would
/// not widen the level-(L+1) set.
pub fn expanded_compaction_byte_size_limit(max_file_size: u64) -> u64 {
    25 * target_file_size(max_file_size)
}

/// Byte budget for a level: 10 MiB at level 1, growing 10x per level.
/// Level 0 is scored by file count instead.
pub fn max_bytes_for_level(level: usize) -> f64 {
    let mut result = 10.0 * 1048576.0;
    let mut level = level;
    while level > 1 {
        result *= 10.0;
        level -= 1;
    }
    result
}

pub struct Compaction {
    level: usize,
    max_output_file_size: u64,
    pub input_version: Option<Arc<Version>>,
    pub edit: VersionEdit,
    /// `inputs[0]` = level-L files, `inputs[1]` = level-(L+1) files.
    pub inputs: [Vec<Arc<FileMetaData>>; 2],
    pub grandparents: Vec<Arc<FileMetaData>>,
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,
    /// Per-level cursors for `is_base_level_for_key`, monotone because
    /// compaction keys arrive in order.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    pub fn new(level: usize, max_file_size: u64) -> Self {
        Self {
            level,
            max_output_file_size: target_file_size(max_file_size),
            input_version: None,
            edit: VersionEdit::new(),
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    /// The level being compacted; outputs land at `level() + 1`.
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub fn input(&self, which: usize, i: usize) -> &Arc<FileMetaData> {
        &self.inputs[which][i]
    }

    pub fn set_grandparents(&mut self, grandparents: Vec<Arc<FileMetaData>>) {
        self.grandparents = grandparents;
        self.grandparent_index = 0;
        self.seen_key = false;
        self.overlapped_bytes = 0;
    }

    /// A single input file that overlaps nothing at the next level and
    /// little at the grandparent level can be moved by a manifest edit
    /// alone, with no data rewrite.
    pub fn is_trivial_move(&self, max_file_size: u64) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= max_grandparent_overlap_bytes(max_file_size)
    }

    /// Records every input file as deleted in the edit.
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            let level = self.level + which;
            for file in &self.inputs[which] {
                self.edit.delete_file(level, file.number);
            }
        }
    }

    /// True when no level deeper than the output contains `user_key`, so a
    /// tombstone for it has nothing left to hide. Takes `&mut self`: keys
    /// arrive in order, so each level keeps a cursor that only advances.
    pub fn is_base_level_for_key(
        &mut self,
        icmp: &InternalKeyComparator,
        user_key: &[u8],
    ) -> bool {
        let Some(version) = self.input_version.clone() else {
            return false;
        };
        let ucmp = icmp.user_comparator();
        for level in self.level + 2..NUM_LEVELS {
            let files = &version.files[level];
            while self.level_ptrs[level] < files.len() {
                let file = &files[self.level_ptrs[level]];
                if ucmp.compare(user_key, extract_user_key(&file.largest)) != Ordering::Greater {
                    if ucmp.compare(user_key, extract_user_key(&file.smallest)) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// Whether the current output should be cut before `internal_key` to
    /// bound its overlap with the grandparent level.
    pub fn should_stop_before(
        &mut self,
        icmp: &InternalKeyComparator,
        internal_key: &[u8],
        max_file_size: u64,
    ) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && icmp.compare(
                internal_key,
                &self.grandparents[self.grandparent_index].largest,
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > max_grandparent_overlap_bytes(max_file_size) {
            self.overlapped_bytes = 0;
            return true;
        }
        false
    }

    /// Releases the pinned input version.
    pub fn release_inputs(&mut self) {
        self.input_version = None;
    }
}
