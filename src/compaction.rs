//! A picked compaction: its inputs, bounds, and bookkeeping.
//!
//! [`Compaction`] is produced by the version set (score- or seek-driven,
//! or from a manual range request) and consumed by the engine's background
//! worker. It carries the two input file lists, the grandparent files used
//! to bound output-file overlap, and the running state for the
//! `should_stop_before` / `is_base_level_for_key` queries the merge loop
//! makes per key.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::options::Options;
use crate::version::edit::VersionEdit;
use crate::version::{FileMetaData, NUM_LEVELS, Version, total_file_size};

/// Bytes of grandparent overlap that force an output-file rotation:
/// 10 × the target file size.
pub fn max_grandparent_overlap_bytes(options: &Options) -> u64 {
    10 * options.max_file_size
}

/// Cap on the bytes a level-N input expansion may reach:
/// 25 × the target file size.
pub fn expanded_compaction_byte_size_limit(options: &Options) -> u64 {
    25 * options.max_file_size
}

/// A planned merge of `level` into `level + 1`.
pub struct Compaction {
    level: usize,
    max_output_file_size: u64,
    max_grandparent_overlap: u64,

    /// The version the inputs were picked from; held so none of the input
    /// files can be deleted while the compaction runs.
    input_version: Arc<Version>,

    /// `inputs[0]` from `level`, `inputs[1]` from `level + 1`.
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],

    /// Files from `level + 2` overlapping the compaction's key range.
    pub(crate) grandparents: Vec<Arc<FileMetaData>>,

    // State for should_stop_before.
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    // Per-level cursors for is_base_level_for_key.
    level_ptrs: [usize; NUM_LEVELS],

    /// The edit that will delete the inputs and add the outputs.
    pub edit: VersionEdit,
}

impl Compaction {
    pub(crate) fn new(options: &Options, level: usize, input_version: Arc<Version>) -> Self {
        Self {
            level,
            max_output_file_size: options.max_file_size,
            max_grandparent_overlap: max_grandparent_overlap_bytes(options),
            input_version,
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
            edit: VersionEdit::new(),
        }
    }

    /// The level being compacted (outputs land at `level() + 1`).
    pub fn level(&self) -> usize {
        self.level
    }

    /// Output files rotate at this size.
    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub fn input(&self, which: usize, index: usize) -> &Arc<FileMetaData> {
        &self.inputs[which][index]
    }

    /// The version the inputs belong to.
    pub fn input_version(&self) -> &Arc<Version> {
        &self.input_version
    }

    /// A single input file with no level+1 overlap can be installed at
    /// the next level by a metadata-only move, provided it would not
    /// create excessive grandparent overlap.
    pub fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap
    }

    /// Record the deletion of every input file in the edit.
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for file in &self.inputs[which] {
                self.edit.remove_file(self.level + which, file.number);
            }
        }
    }

    /// True when no level deeper than the output could contain
    /// `user_key`, so a tombstone at or below the smallest snapshot can
    /// be dropped.
    ///
    /// Relies on the merge visiting keys in increasing order, which lets
    /// each level's cursor advance monotonically.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8], ucmp: &Arc<dyn Comparator>) -> bool {
        for level in (self.level + 2)..NUM_LEVELS {
            let files = self.input_version.files(level);
            while self.level_ptrs[level] < files.len() {
                let file = &files[self.level_ptrs[level]];
                if ucmp.compare(user_key, file.largest.user_key()) != Ordering::Greater {
                    if ucmp.compare(user_key, file.smallest.user_key()) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// True when the output should rotate *before* emitting
    /// `internal_key`, because the current output already overlaps too
    /// many grandparent bytes.
    pub fn should_stop_before(&mut self, internal_key: &[u8], icmp: &dyn Comparator) -> bool {
        while self.grandparent_index < self.grandparents.len() {
            let grandparent = &self.grandparents[self.grandparent_index];
            if icmp.compare(internal_key, grandparent.largest.encoded()) == Ordering::Greater {
                if self.seen_key {
                    self.overlapped_bytes += grandparent.file_size;
                }
                self.grandparent_index += 1;
            } else {
                break;
            }
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap {
            self.overlapped_bytes = 0;
            return true;
        }
        false
    }

    /// One-line summary for logging.
    pub fn describe(&self) -> String {
        format!(
            "level {} ({} + {} files)",
            self.level,
            self.inputs[0].len(),
            self.inputs[1].len()
        )
    }
}

impl std::fmt::Debug for Compaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compaction")
            .field("level", &self.level)
            .field("inputs0", &self.inputs[0].len())
            .field("inputs1", &self.inputs[1].len())
            .field("grandparents", &self.grandparents.len())
            .finish()
    }
}
