//! # Version Module
//!
//! The multi-level metadata machinery: which table files are live, at
//! which level, and how reads and compactions traverse them.
//!
//! ## Model
//!
//! - A [`Version`] is an **immutable snapshot** of the per-level file
//!   lists, shared as `Arc<Version>`; readers and iterators clone the
//!   `Arc`, so a version (and every file it references) stays alive while
//!   anything uses it.
//! - A [`VersionEdit`] is a delta (files added/deleted, counters). Edits
//!   are applied by [`VersionSet::log_and_apply`], the **only** mutator of
//!   persistent descriptor state, which appends the edit to the MANIFEST
//!   (log-framed, see [`crate::wal`]) before installing the new version.
//! - On startup [`VersionSet::recover`] reads `CURRENT`, replays the
//!   MANIFEST into a builder, and reconstructs the current version.
//!
//! ## Level invariants
//!
//! - Level 0 files may overlap and are searched newest-file-first.
//! - Levels ≥ 1 hold files with pairwise-disjoint user-key ranges, sorted
//!   by smallest key; a point lookup touches at most one file per level.
//!
//! ## Compaction accounting
//!
//! Every edit application recomputes a compaction score: level 0 by file
//! count against its trigger, higher levels by total bytes against
//! `10 MiB × 10^(level-1)`. Seek-driven compaction arms when a file
//! exhausts its `allowed_seeks` budget through unsuccessful probes.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod edit;

pub use edit::{NewFile, VersionEdit};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::TableCache;
use crate::compaction::{Compaction, expanded_compaction_byte_size_limit};
use crate::comparator::{Comparator, InternalKeyComparator};
use crate::encoding::{EncodingError, put_fixed64};
use crate::engine::filename::{manifest_file_name, read_current_file, set_current_file};
use crate::iterator::{InternalIterator, MergingIterator};
use crate::keys::{
    InternalKey, LookupKey, MAX_SEQUENCE_NUMBER, ParsedInternalKey, VALUE_TYPE_FOR_SEEK,
    ValueType,
};
use crate::options::{Options, ReadOptions};
use crate::sstable::TableError;
use crate::sstable::iterator::TwoLevelIterator;
use crate::wal::{CorruptionReporter, LogReader, LogWriter, WalError};

// ------------------------------------------------------------------------------------------------
// Tuning constants
// ------------------------------------------------------------------------------------------------

/// Number of levels in the tree.
pub const NUM_LEVELS: usize = 7;

/// Level-0 file count that triggers a compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Level-0 file count at which writers are briefly delayed.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// Level-0 file count at which writers stop until compaction catches up.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Highest level a fresh memtable flush may be placed at when nothing
/// overlaps it.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Bytes of iteration between read samples charged against files.
pub const READ_BYTES_PERIOD: u64 = 1 << 20;

/// Size ceiling for `level`; levels 0 and 1 share the 10 MiB base.
fn max_bytes_for_level(level: usize) -> f64 {
    let mut level = level;
    let mut result = 10.0 * 1024.0 * 1024.0;
    while level > 1 {
        result *= 10.0;
        level -= 1;
    }
    result
}

/// Sum of file sizes.
pub fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors from version/descriptor operations.
#[derive(Debug, Error)]
pub enum VersionError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Log-framing error while reading or writing the MANIFEST.
    #[error("descriptor log error: {0}")]
    Wal(#[from] WalError),

    /// Table read failure during a version lookup.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Wire decoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Damaged descriptor state.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Mismatched configuration, e.g. a foreign comparator name.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

// ------------------------------------------------------------------------------------------------
// FileMetaData
// ------------------------------------------------------------------------------------------------

/// Metadata for one live table file, shared between versions.
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,

    /// Seek budget: decremented on unsuccessful probes; reaching zero
    /// arms seek-driven compaction of this file.
    ///
    /// One seek costs roughly 10 ms; reading or writing 16 KiB costs
    /// about 1 ms, so one seek is "worth" ~16 KiB of compaction work —
    /// the budget lets a file absorb `size / 16 KiB` misses before a
    /// merge is cheaper than the misses.
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        let allowed_seeks = ((file_size / 16384) as i64).max(100);
        Self {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed_seeks),
        }
    }
}

impl std::fmt::Debug for FileMetaData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMetaData")
            .field("number", &self.number)
            .field("file_size", &self.file_size)
            .finish()
    }
}

/// Binary-search `files` (disjoint, sorted by smallest key) for the first
/// file whose largest key is `>= key`.
pub fn find_file(icmp: &InternalKeyComparator, files: &[Arc<FileMetaData>], key: &[u8]) -> usize {
    let mut left = 0usize;
    let mut right = files.len();
    while left < right {
        let mid = (left + right) / 2;
        if icmp.compare(files[mid].largest.encoded(), key) == Ordering::Less {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    right
}

fn after_file(ucmp: &Arc<dyn Comparator>, user_key: Option<&[u8]>, file: &FileMetaData) -> bool {
    match user_key {
        // A missing bound never excludes.
        None => false,
        Some(key) => ucmp.compare(key, file.largest.user_key()) == Ordering::Greater,
    }
}

fn before_file(ucmp: &Arc<dyn Comparator>, user_key: Option<&[u8]>, file: &FileMetaData) -> bool {
    match user_key {
        None => false,
        Some(key) => ucmp.compare(key, file.smallest.user_key()) == Ordering::Less,
    }
}

/// True iff some file in `files` overlaps `[smallest, largest]` (either
/// bound may be open). `disjoint` enables the binary-search fast path for
/// levels ≥ 1.
pub fn some_file_overlaps_range(
    icmp: &InternalKeyComparator,
    disjoint: bool,
    files: &[Arc<FileMetaData>],
    smallest_user_key: Option<&[u8]>,
    largest_user_key: Option<&[u8]>,
) -> bool {
    let ucmp = icmp.user_comparator();
    if !disjoint {
        return files
            .iter()
            .any(|f| !after_file(ucmp, smallest_user_key, f) && !before_file(ucmp, largest_user_key, f));
    }

    let index = match smallest_user_key {
        Some(key) => {
            let probe = InternalKey::new(key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            find_file(icmp, files, probe.encoded())
        }
        None => 0,
    };
    if index >= files.len() {
        return false;
    }
    !before_file(ucmp, largest_user_key, &files[index])
}

// ------------------------------------------------------------------------------------------------
// Version
// ------------------------------------------------------------------------------------------------

/// Result of a version point lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum VersionGet {
    Found(Vec<u8>),
    Deleted,
    Missing,
}

/// Read statistics fed back after a lookup; may arm seek compaction.
#[derive(Default)]
pub struct GetStats {
    /// The first file probed, when more than one file had to be probed.
    pub seek_file: Option<(usize, Arc<FileMetaData>)>,
}

/// Immutable snapshot of the table set.
pub struct Version {
    icmp: InternalKeyComparator,
    files: [Vec<Arc<FileMetaData>>; NUM_LEVELS],

    /// Next compaction target, precomputed by `finalize`.
    compaction_level: usize,
    compaction_score: f64,

    /// File armed by exhausted seek budgets, with its level.
    seek_compact: Mutex<Option<(usize, Arc<FileMetaData>)>>,
}

impl Version {
    fn empty(icmp: InternalKeyComparator) -> Self {
        Self {
            icmp,
            files: Default::default(),
            compaction_level: 0,
            compaction_score: -1.0,
            seek_compact: Mutex::new(None),
        }
    }

    /// Files at `level`.
    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    /// Point lookup across the levels, newest first.
    pub fn get(
        &self,
        options: &ReadOptions,
        key: &LookupKey,
        table_cache: &TableCache,
    ) -> Result<(VersionGet, GetStats), VersionError> {
        let internal_key = key.internal_key();
        let user_key = key.user_key();
        let ucmp = self.icmp.user_comparator().clone();

        let mut stats = GetStats::default();
        let mut last_probed: Option<(usize, Arc<FileMetaData>)> = None;

        // Candidate files, searched in order: overlapping level-0 files
        // newest first, then at most one file per deeper level.
        let mut candidates: Vec<(usize, Arc<FileMetaData>)> = Vec::new();

        let mut level0: Vec<Arc<FileMetaData>> = self.files[0]
            .iter()
            .filter(|f| {
                ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less
                    && ucmp.compare(user_key, f.largest.user_key()) != Ordering::Greater
            })
            .cloned()
            .collect();
        level0.sort_by(|a, b| b.number.cmp(&a.number));
        candidates.extend(level0.into_iter().map(|f| (0, f)));

        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            let index = find_file(&self.icmp, files, internal_key);
            if index >= files.len() {
                continue;
            }
            let file = &files[index];
            if ucmp.compare(user_key, file.smallest.user_key()) == Ordering::Less {
                continue;
            }
            candidates.push((level, Arc::clone(file)));
        }

        for (level, file) in candidates {
            if last_probed.is_some() && stats.seek_file.is_none() {
                // This lookup touches a second file: charge a seek to the
                // first one.
                stats.seek_file = last_probed.take();
            }
            last_probed = Some((level, Arc::clone(&file)));

            match table_cache.get(options, file.number, internal_key)? {
                None => continue,
                Some((found_key, value)) => {
                    let Some(parsed) = ParsedInternalKey::decode(&found_key) else {
                        return Err(VersionError::Corruption(
                            "malformed internal key in table".into(),
                        ));
                    };
                    if ucmp.compare(parsed.user_key, user_key) != Ordering::Equal {
                        continue;
                    }
                    return Ok((
                        match parsed.value_type {
                            ValueType::Value => VersionGet::Found(value),
                            ValueType::Deletion => VersionGet::Deleted,
                        },
                        stats,
                    ));
                }
            }
        }

        Ok((VersionGet::Missing, stats))
    }

    /// Apply lookup statistics; true when a compaction should be
    /// scheduled because a file's seek budget ran out.
    pub fn update_stats(&self, stats: GetStats) -> bool {
        let Some((level, file)) = stats.seek_file else {
            return false;
        };
        let remaining = file.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed) - 1;
        if remaining > 0 {
            return false;
        }
        let mut armed = self.seek_compact.lock().expect("seek_compact poisoned");
        if armed.is_none() {
            debug!(file = file.number, level, "seek budget exhausted; arming compaction");
            *armed = Some((level, file));
            true
        } else {
            false
        }
    }

    /// Charge a read sample at `internal_key` during iteration; true when
    /// a compaction got armed.
    pub fn record_read_sample(&self, internal_key: &[u8]) -> bool {
        let Some(parsed) = ParsedInternalKey::decode(internal_key) else {
            return false;
        };
        let ucmp = self.icmp.user_comparator();

        // Find up to two files overlapping the user key, in search order.
        let mut matches: Vec<(usize, Arc<FileMetaData>)> = Vec::new();
        for file in &self.files[0] {
            if ucmp.compare(parsed.user_key, file.smallest.user_key()) != Ordering::Less
                && ucmp.compare(parsed.user_key, file.largest.user_key()) != Ordering::Greater
            {
                matches.push((0, Arc::clone(file)));
                if matches.len() == 2 {
                    break;
                }
            }
        }
        if matches.len() < 2 {
            for level in 1..NUM_LEVELS {
                let files = &self.files[level];
                if files.is_empty() {
                    continue;
                }
                let index = find_file(&self.icmp, files, internal_key);
                if index < files.len() {
                    let file = &files[index];
                    if ucmp.compare(parsed.user_key, file.smallest.user_key()) != Ordering::Less {
                        matches.push((level, Arc::clone(file)));
                        if matches.len() == 2 {
                            break;
                        }
                    }
                }
            }
        }

        // Only charge when the key is covered by at least two files: a
        // single-file key cannot be made cheaper by merging.
        if matches.len() >= 2 {
            let (level, file) = matches.swap_remove(0);
            return self.update_stats(GetStats {
                seek_file: Some((level, file)),
            });
        }
        false
    }

    /// True iff any file at `level` overlaps `[smallest, largest]`.
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user_key: Option<&[u8]>,
        largest_user_key: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            level > 0,
            &self.files[level],
            smallest_user_key,
            largest_user_key,
        )
    }

    /// Choose the level for a fresh memtable flush covering
    /// `[smallest_user_key, largest_user_key]`: push it past empty,
    /// non-overlapping levels (up to [`MAX_MEM_COMPACT_LEVEL`]) as long
    /// as the grandparent overlap stays within budget.
    pub fn pick_level_for_memtable_output(
        &self,
        options: &Options,
        smallest_user_key: &[u8],
        largest_user_key: &[u8],
    ) -> usize {
        let mut level = 0;
        if self.overlap_in_level(0, Some(smallest_user_key), Some(largest_user_key)) {
            return level;
        }
        let start = InternalKey::new(smallest_user_key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
        let limit = InternalKey::new(largest_user_key, 0, ValueType::Deletion);
        while level < MAX_MEM_COMPACT_LEVEL {
            if self.overlap_in_level(level + 1, Some(smallest_user_key), Some(largest_user_key)) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let overlaps = self.get_overlapping_inputs(level + 2, Some(&start), Some(&limit));
                if total_file_size(&overlaps)
                    > crate::compaction::max_grandparent_overlap_bytes(options)
                {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// All files at `level` whose key range intersects `[begin, end]`
    /// (either bound may be open). At level 0 the search range grows
    /// transitively while included files extend it.
    pub fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        let ucmp = self.icmp.user_comparator();
        let mut user_begin = begin.map(|k| k.user_key().to_vec());
        let mut user_end = end.map(|k| k.user_key().to_vec());

        let mut inputs: Vec<Arc<FileMetaData>> = Vec::new();
        let mut i = 0;
        while i < self.files[level].len() {
            let file = Arc::clone(&self.files[level][i]);
            i += 1;
            let file_start = file.smallest.user_key();
            let file_limit = file.largest.user_key();

            if user_begin
                .as_deref()
                .is_some_and(|b| ucmp.compare(file_limit, b) == Ordering::Less)
            {
                continue; // entirely before range
            }
            if user_end
                .as_deref()
                .is_some_and(|e| ucmp.compare(file_start, e) == Ordering::Greater)
            {
                continue; // entirely after range
            }

            inputs.push(file.clone());
            if level == 0 {
                // Level-0 files overlap one another: when an included
                // file widens the range, restart so everything the wider
                // range touches is pulled in.
                if user_begin
                    .as_deref()
                    .is_some_and(|b| ucmp.compare(file_start, b) == Ordering::Less)
                {
                    user_begin = Some(file_start.to_vec());
                    inputs.clear();
                    i = 0;
                } else if user_end
                    .as_deref()
                    .is_some_and(|e| ucmp.compare(file_limit, e) == Ordering::Greater)
                {
                    user_end = Some(file_limit.to_vec());
                    inputs.clear();
                    i = 0;
                }
            }
        }
        inputs
    }

    pub(crate) fn seek_compaction(&self) -> Option<(usize, Arc<FileMetaData>)> {
        self.seek_compact.lock().expect("seek_compact poisoned").clone()
    }

    pub(crate) fn has_seek_compaction(&self) -> bool {
        self.seek_compact
            .lock()
            .expect("seek_compact poisoned")
            .is_some()
    }

    pub(crate) fn compaction_score(&self) -> f64 {
        self.compaction_score
    }
}

// ------------------------------------------------------------------------------------------------
// Level concatenation iterator
// ------------------------------------------------------------------------------------------------

/// Iterates a level's (disjoint, sorted) file list, yielding each file's
/// largest key with a `fixed64 number ‖ fixed64 size` value — the index
/// half of a two-level iterator over the level.
pub struct LevelFileNumIterator {
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,
    index: usize,
    value_buf: Vec<u8>,
}

impl LevelFileNumIterator {
    pub fn new(icmp: InternalKeyComparator, files: Vec<Arc<FileMetaData>>) -> Self {
        let index = files.len();
        Self {
            icmp,
            files,
            index,
            value_buf: Vec::with_capacity(16),
        }
    }

    fn refresh_value(&mut self) {
        self.value_buf.clear();
        if self.index < self.files.len() {
            let file = &self.files[self.index];
            put_fixed64(&mut self.value_buf, file.number);
            put_fixed64(&mut self.value_buf, file.file_size);
        }
    }
}

impl InternalIterator for LevelFileNumIterator {
    fn valid(&self) -> bool {
        self.index < self.files.len()
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
        self.refresh_value();
    }

    fn seek_to_last(&mut self) {
        self.index = self.files.len().saturating_sub(1);
        if self.files.is_empty() {
            self.index = self.files.len();
        }
        self.refresh_value();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
        self.refresh_value();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.index += 1;
        self.refresh_value();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if self.index == 0 {
            self.index = self.files.len();
        } else {
            self.index -= 1;
        }
        self.refresh_value();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.files[self.index].largest.encoded()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.value_buf
    }

    fn status(&self) -> Result<(), TableError> {
        Ok(())
    }
}

/// Two-level iterator over one sorted level, opening tables on demand.
pub fn new_level_iterator(
    table_cache: Arc<TableCache>,
    icmp: InternalKeyComparator,
    options: &ReadOptions,
    files: Vec<Arc<FileMetaData>>,
) -> Box<dyn InternalIterator> {
    let index_iter = LevelFileNumIterator::new(icmp, files);
    let options = options.clone();
    Box::new(TwoLevelIterator::new(
        Box::new(index_iter),
        Box::new(move |file_value| {
            if file_value.len() != 16 {
                return Err(TableError::Corruption(
                    "malformed file entry in level iterator".into(),
                ));
            }
            let number = u64::from_le_bytes(file_value[..8].try_into().expect("checked length"));
            table_cache.iter(&options, number)
        }),
    ))
}

// ------------------------------------------------------------------------------------------------
// Version builder — applies edits to a base version
// ------------------------------------------------------------------------------------------------

struct VersionBuilder {
    icmp: InternalKeyComparator,
    base: Arc<Version>,
    deleted: [HashSet<u64>; NUM_LEVELS],
    added: [Vec<Arc<FileMetaData>>; NUM_LEVELS],
}

impl VersionBuilder {
    fn new(icmp: InternalKeyComparator, base: Arc<Version>) -> Self {
        Self {
            icmp,
            base,
            deleted: Default::default(),
            added: Default::default(),
        }
    }

    /// Fold `edit` into the pending state, updating the version set's
    /// compaction pointers as a side effect.
    fn apply(&mut self, edit: &VersionEdit, compact_pointers: &mut [Vec<u8>; NUM_LEVELS]) {
        for (level, key) in &edit.compact_pointers {
            compact_pointers[*level] = key.encoded().to_vec();
        }
        for (level, number) in &edit.deleted_files {
            self.deleted[*level].insert(*number);
        }
        for (level, file) in &edit.new_files {
            let meta = Arc::new(FileMetaData::new(
                file.number,
                file.file_size,
                file.smallest.clone(),
                file.largest.clone(),
            ));
            self.deleted[*level].remove(&file.number);
            self.added[*level].push(meta);
        }
    }

    /// Produce the new version.
    fn save(mut self) -> Version {
        let mut version = Version::empty(self.icmp.clone());
        for level in 0..NUM_LEVELS {
            let mut files: Vec<Arc<FileMetaData>> = self.base.files[level]
                .iter()
                .filter(|f| !self.deleted[level].contains(&f.number))
                .cloned()
                .collect();
            files.append(&mut self.added[level]);
            files.sort_by(|a, b| {
                self.icmp
                    .compare(a.smallest.encoded(), b.smallest.encoded())
                    .then_with(|| a.number.cmp(&b.number))
            });

            if level > 0 {
                debug_assert!(
                    files.windows(2).all(|pair| {
                        self.icmp
                            .compare(pair[0].largest.encoded(), pair[1].smallest.encoded())
                            == Ordering::Less
                    }),
                    "overlapping files in level {level}"
                );
            }
            version.files[level] = files;
        }
        version
    }
}

// ------------------------------------------------------------------------------------------------
// VersionSet
// ------------------------------------------------------------------------------------------------

/// Captures MANIFEST read corruption so recovery can fail cleanly.
#[derive(Default)]
struct ManifestReporter {
    error: Arc<Mutex<Option<String>>>,
}

impl CorruptionReporter for ManifestReporter {
    fn corruption(&mut self, bytes: usize, reason: &str) {
        let mut slot = self.error.lock().expect("reporter mutex poisoned");
        if slot.is_none() {
            *slot = Some(format!("{reason} ({bytes} bytes)"));
        }
    }
}

/// Owner of the version list and all persistent descriptor state.
pub struct VersionSet {
    db_path: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: u64,
    /// Current WAL number; logs below this are no longer needed.
    log_number: u64,
    /// WAL of the immutable memtable still being flushed (0 = none).
    prev_log_number: u64,

    descriptor_log: Option<LogWriter>,
    current: Arc<Version>,
    /// Weak handles to every version ever installed; pruned lazily. Live
    /// entries pin table files against deletion.
    versions: Vec<Weak<Version>>,

    /// Per-level key at which the next size compaction should start,
    /// rotated through the keyspace and persisted in the MANIFEST.
    compact_pointers: [Vec<u8>; NUM_LEVELS],
}

impl VersionSet {
    pub fn new(
        db_path: PathBuf,
        options: Arc<Options>,
        icmp: InternalKeyComparator,
        table_cache: Arc<TableCache>,
    ) -> Self {
        let current = Arc::new(Version::empty(icmp.clone()));
        Self {
            db_path,
            options,
            icmp,
            table_cache,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            descriptor_log: None,
            versions: vec![Arc::downgrade(&current)],
            current,
            compact_pointers: Default::default(),
        }
    }

    // -- accessors -------------------------------------------------------------------------------

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    pub fn icmp(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    pub fn table_cache(&self) -> &Arc<TableCache> {
        &self.table_cache
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, seq: u64) {
        debug_assert!(seq >= self.last_sequence);
        self.last_sequence = seq;
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    /// Allocate a fresh file number.
    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Hand back the most recently allocated number (unused file).
    pub fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    /// Ensure the allocator never re-issues `number`.
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

    /// True when a size- or seek-driven compaction is due.
    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score() >= 1.0 || self.current.has_seek_compaction()
    }

    /// File numbers referenced by any live version.
    pub fn add_live_files(&mut self, live: &mut HashSet<u64>) {
        self.versions.retain(|weak| weak.strong_count() > 0);
        for weak in &self.versions {
            if let Some(version) = weak.upgrade() {
                for level in 0..NUM_LEVELS {
                    for file in &version.files[level] {
                        live.insert(file.number);
                    }
                }
            }
        }
    }

    // -- descriptor mutation ---------------------------------------------------------------------

    /// Apply `edit`, persist it to the MANIFEST, and install the new
    /// version. The only mutator of persistent descriptor state.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<(), VersionError> {
        if let Some(log_number) = edit.log_number {
            debug_assert!(log_number >= self.log_number);
            debug_assert!(log_number < self.next_file_number);
        } else {
            edit.log_number = Some(self.log_number);
        }
        if edit.prev_log_number.is_none() {
            edit.prev_log_number = Some(self.prev_log_number);
        }
        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(self.last_sequence);

        let mut builder = VersionBuilder::new(self.icmp.clone(), Arc::clone(&self.current));
        builder.apply(edit, &mut self.compact_pointers);
        let mut version = builder.save();
        self.finalize(&mut version);
        let version = Arc::new(version);

        // First application ever: create the MANIFEST and seed it with a
        // snapshot of the current state.
        let mut created_manifest = false;
        if self.descriptor_log.is_none() {
            if self.manifest_file_number == 0 {
                self.manifest_file_number = self.new_file_number();
                edit.next_file_number = Some(self.next_file_number);
            }
            let path = manifest_file_name(&self.db_path, self.manifest_file_number);
            let result = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .map_err(VersionError::from)
                .and_then(|file| {
                    let mut log = LogWriter::new(file);
                    self.write_snapshot(&mut log)?;
                    Ok(log)
                });
            match result {
                Ok(log) => {
                    self.descriptor_log = Some(log);
                    created_manifest = true;
                }
                Err(err) => {
                    let _ = std::fs::remove_file(&path);
                    return Err(err);
                }
            }
        }

        // Append the edit and sync.
        let write_result = (|| -> Result<(), VersionError> {
            let mut record = Vec::new();
            edit.encode_to(&mut record);
            let log = self
                .descriptor_log
                .as_mut()
                .expect("descriptor log just ensured");
            log.add_record(&record)?;
            log.sync()?;
            if created_manifest {
                set_current_file(&self.db_path, self.manifest_file_number)?;
            }
            Ok(())
        })();

        if let Err(err) = write_result {
            error!(error = %err, "MANIFEST write failed; rolling back edit");
            if created_manifest {
                self.descriptor_log = None;
                let _ =
                    std::fs::remove_file(manifest_file_name(&self.db_path, self.manifest_file_number));
            }
            return Err(err);
        }

        // Install.
        self.versions.push(Arc::downgrade(&version));
        self.current = version;
        self.log_number = edit.log_number.expect("filled above");
        self.prev_log_number = edit.prev_log_number.expect("filled above");
        Ok(())
    }

    /// Serialize the current state as one edit record (MANIFEST head).
    fn write_snapshot(&self, log: &mut LogWriter) -> Result<(), VersionError> {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some(self.icmp.user_comparator().name().to_string());

        for (level, pointer) in self.compact_pointers.iter().enumerate() {
            if !pointer.is_empty() {
                edit.set_compact_pointer(level, InternalKey::from_encoded(pointer.clone()));
            }
        }
        for level in 0..NUM_LEVELS {
            for file in &self.current.files[level] {
                edit.add_file(
                    level,
                    file.number,
                    file.file_size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
            }
        }

        let mut record = Vec::new();
        edit.encode_to(&mut record);
        log.add_record(&record)?;
        Ok(())
    }

    /// Reconstruct state from `CURRENT` + MANIFEST. Returns `true` when
    /// the caller must write a fresh descriptor (always, since old
    /// descriptors are not reused).
    pub fn recover(&mut self) -> Result<bool, VersionError> {
        let manifest_name = read_current_file(&self.db_path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                VersionError::Corruption("CURRENT file missing".into())
            } else {
                VersionError::Io(err)
            }
        })?;
        let manifest_path = self.db_path.join(&manifest_name);
        info!(manifest = %manifest_name, "recovering descriptor");

        let file = File::open(&manifest_path)?;
        let reporter = ManifestReporter::default();
        let corruption = Arc::clone(&reporter.error);
        let mut reader = LogReader::new(file, Some(Box::new(reporter)), 0);

        let mut builder = VersionBuilder::new(self.icmp.clone(), Arc::clone(&self.current));
        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        while let Some(record) = reader.read_record()? {
            let edit = VersionEdit::decode_from(&record)?;
            if let Some(name) = &edit.comparator_name {
                let ours = self.icmp.user_comparator().name();
                if name != ours {
                    return Err(VersionError::InvalidArgument(format!(
                        "comparator mismatch: descriptor has {name}, options supply {ours}"
                    )));
                }
            }
            builder.apply(&edit, &mut self.compact_pointers);
            log_number = edit.log_number.or(log_number);
            prev_log_number = edit.prev_log_number.or(prev_log_number);
            next_file_number = edit.next_file_number.or(next_file_number);
            last_sequence = edit.last_sequence.or(last_sequence);
        }

        if let Some(reason) = corruption.lock().expect("reporter mutex poisoned").take() {
            return Err(VersionError::Corruption(format!(
                "MANIFEST damaged: {reason}"
            )));
        }

        let next_file_number = next_file_number
            .ok_or_else(|| VersionError::Corruption("no next-file entry in descriptor".into()))?;
        let log_number = log_number
            .ok_or_else(|| VersionError::Corruption("no log-number entry in descriptor".into()))?;
        let last_sequence = last_sequence
            .ok_or_else(|| VersionError::Corruption("no last-sequence entry in descriptor".into()))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        let mut version = builder.save();
        self.finalize(&mut version);
        let version = Arc::new(version);
        self.versions.push(Arc::downgrade(&version));
        self.current = version;

        self.manifest_file_number = next_file_number;
        self.next_file_number = next_file_number + 1;
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.mark_file_number_used(log_number);
        self.mark_file_number_used(prev_log_number);

        // Old descriptors are never appended to; the caller writes a new
        // one via the next log_and_apply.
        Ok(true)
    }

    /// Precompute the best compaction candidate for `version`.
    fn finalize(&self, version: &mut Version) {
        let mut best_level = 0usize;
        let mut best_score = -1.0f64;

        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                // File count, not bytes: level-0 files all overlap, so
                // every file adds read amplification regardless of size,
                // and tiny write buffers must not trigger endless merges.
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

    // -- compaction picking ----------------------------------------------------------------------

    /// Pick the next compaction: size-driven first, else seek-driven.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = Arc::clone(&self.current);
        let size_compaction = current.compaction_score() >= 1.0;

        let mut compaction;
        let level;
        if size_compaction {
            level = current.compaction_level;
            debug_assert!(level + 1 < NUM_LEVELS);
            compaction = Compaction::new(&self.options, level, Arc::clone(&current));

            // Resume after the key where the previous compaction at this
            // level stopped; wrap to the start when exhausted.
            let pointer = &self.compact_pointers[level];
            for file in &current.files[level] {
                if pointer.is_empty()
                    || self.icmp.compare(file.largest.encoded(), pointer) == Ordering::Greater
                {
                    compaction.inputs[0].push(Arc::clone(file));
                    break;
                }
            }
            if compaction.inputs[0].is_empty() {
                if let Some(file) = current.files[level].first() {
                    compaction.inputs[0].push(Arc::clone(file));
                }
            }
        } else if let Some((seek_level, file)) = current.seek_compaction() {
            level = seek_level;
            compaction = Compaction::new(&self.options, level, Arc::clone(&current));
            compaction.inputs[0].push(file);
        } else {
            return None;
        }

        if level == 0 {
            // Level-0 inputs overlap each other; widen to the closure.
            let (smallest, largest) = self.key_range(&compaction.inputs[0]);
            compaction.inputs[0] =
                current.get_overlapping_inputs(0, Some(&smallest), Some(&largest));
            debug_assert!(!compaction.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Build a compaction for an explicit key range at `level`.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = Arc::clone(&self.current);
        let mut inputs = current.get_overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // Avoid one gigantic manual compaction at levels > 0: cap the
        // input set at one target file size worth of data.
        if level > 0 {
            let limit = self.options.max_file_size;
            let mut total = 0u64;
            for (i, file) in inputs.iter().enumerate() {
                total += file.file_size;
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let mut compaction = Compaction::new(&self.options, level, current);
        compaction.inputs[0] = inputs;
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Smallest and largest internal keys across `files`.
    fn key_range(&self, files: &[Arc<FileMetaData>]) -> (InternalKey, InternalKey) {
        debug_assert!(!files.is_empty());
        let mut smallest = files[0].smallest.clone();
        let mut largest = files[0].largest.clone();
        for file in &files[1..] {
            if self.icmp.compare(file.smallest.encoded(), smallest.encoded()) == Ordering::Less {
                smallest = file.smallest.clone();
            }
            if self.icmp.compare(file.largest.encoded(), largest.encoded()) == Ordering::Greater {
                largest = file.largest.clone();
            }
        }
        (smallest, largest)
    }

    fn key_range_both(&self, compaction: &Compaction) -> (InternalKey, InternalKey) {
        let all: Vec<Arc<FileMetaData>> = compaction.inputs[0]
            .iter()
            .chain(compaction.inputs[1].iter())
            .cloned()
            .collect();
        self.key_range(&all)
    }

    /// Complete a compaction plan: level+1 overlap, bounded expansion of
    /// the level-N set, grandparents, and the rotated compact pointer.
    fn setup_other_inputs(&mut self, compaction: &mut Compaction) {
        let level = compaction.level();
        let current = Arc::clone(compaction.input_version());

        add_boundary_inputs(&self.icmp, &current.files[level], &mut compaction.inputs[0]);
        let (smallest, mut largest) = self.key_range(&compaction.inputs[0]);

        compaction.inputs[1] =
            current.get_overlapping_inputs(level + 1, Some(&smallest), Some(&largest));
        add_boundary_inputs(
            &self.icmp,
            &current.files[level + 1],
            &mut compaction.inputs[1],
        );

        let (mut all_start, mut all_limit) = self.key_range_both(compaction);

        // Try to grow the level-N input set without changing the level-N+1
        // set, as long as the total stays under the expansion budget.
        if !compaction.inputs[1].is_empty() {
            let mut expanded0 =
                current.get_overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            add_boundary_inputs(&self.icmp, &current.files[level], &mut expanded0);
            let inputs1_size = total_file_size(&compaction.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > compaction.inputs[0].len()
                && inputs1_size + expanded0_size
                    < expanded_compaction_byte_size_limit(&self.options)
            {
                let (new_start, new_limit) = self.key_range(&expanded0);
                let mut expanded1 =
                    current.get_overlapping_inputs(level + 1, Some(&new_start), Some(&new_limit));
                add_boundary_inputs(&self.icmp, &current.files[level + 1], &mut expanded1);
                if expanded1.len() == compaction.inputs[1].len() {
                    debug!(
                        level,
                        from = compaction.inputs[0].len(),
                        to = expanded0.len(),
                        "expanding compaction inputs"
                    );
                    largest = new_limit;
                    compaction.inputs[0] = expanded0;
                    compaction.inputs[1] = expanded1;
                    let both = self.key_range_both(compaction);
                    all_start = both.0;
                    all_limit = both.1;
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            compaction.grandparents =
                current.get_overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        // Next size compaction at this level resumes past this range.
        self.compact_pointers[level] = largest.encoded().to_vec();
        compaction.edit.set_compact_pointer(level, largest);
    }

    /// Merged iterator over every input file of `compaction`.
    pub fn make_input_iterator(
        &self,
        compaction: &Compaction,
    ) -> Result<MergingIterator, VersionError> {
        let read_options = ReadOptions {
            verify_checksums: self.options.paranoid_checks,
            fill_cache: false,
            snapshot: None,
        };

        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        for which in 0..2 {
            if compaction.inputs[which].is_empty() {
                continue;
            }
            if compaction.level() + which == 0 {
                // Level-0 files overlap: one full table iterator each.
                for file in &compaction.inputs[which] {
                    children.push(self.table_cache.iter(&read_options, file.number)?);
                }
            } else {
                children.push(new_level_iterator(
                    Arc::clone(&self.table_cache),
                    self.icmp.clone(),
                    &read_options,
                    compaction.inputs[which].clone(),
                ));
            }
        }
        Ok(MergingIterator::new(self.icmp.clone(), children))
    }

    /// Approximate byte offset of `key` within the whole database.
    pub fn approximate_offset_of(&self, version: &Version, key: &InternalKey) -> u64 {
        let mut offset = 0u64;
        for level in 0..NUM_LEVELS {
            for file in &version.files[level] {
                if self.icmp.compare(file.largest.encoded(), key.encoded()) != Ordering::Greater {
                    // Entirely before `key`.
                    offset += file.file_size;
                } else if self.icmp.compare(file.smallest.encoded(), key.encoded())
                    == Ordering::Greater
                {
                    // Entirely after; deeper files in a sorted level too.
                    if level > 0 {
                        break;
                    }
                } else if let Ok(table) = self.table_cache.find_table(file.number) {
                    offset += table.approximate_offset_of(key.encoded());
                }
            }
        }
        offset
    }
}

/// Extend `inputs` with files whose smallest user key equals the largest
/// user key of the current set. Without this, two files split across the
/// same user key could be compacted separately, resurfacing an older
/// version of the key.
fn add_boundary_inputs(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetaData>],
    inputs: &mut Vec<Arc<FileMetaData>>,
) {
    let Some(mut largest) = inputs
        .iter()
        .map(|f| f.largest.clone())
        .max_by(|a, b| icmp.compare(a.encoded(), b.encoded()))
    else {
        return;
    };

    loop {
        // Smallest file strictly after `largest` sharing its user key.
        let boundary = level_files
            .iter()
            .filter(|f| {
                icmp.compare(f.smallest.encoded(), largest.encoded()) == Ordering::Greater
                    && icmp
                        .user_comparator()
                        .compare(f.smallest.user_key(), largest.user_key())
                        == Ordering::Equal
            })
            .min_by(|a, b| icmp.compare(a.smallest.encoded(), b.smallest.encoded()))
            .cloned();

        match boundary {
            Some(file) => {
                largest = file.largest.clone();
                warn!(file = file.number, "pulling boundary file into compaction");
                inputs.push(file);
            }
            None => break,
        }
    }
}
