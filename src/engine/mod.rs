//! # Engine Module
//!
//! The database core: it owns the two memtables (active + immutable), the
//! current write-ahead log, the version set, the writer queue, and the
//! single background compaction worker.
//!
//! ## Write path
//!
//! Writers enqueue and wait until they reach the head of the queue or a
//! batch-group leader completes them. The head makes room (possibly
//! rotating the memtable and log), folds adjacent queued batches into one
//! group, stamps sequence numbers, then **releases the state mutex** while
//! appending to the WAL and inserting into the active memtable — safe
//! because only the head-of-queue writer touches either, and only the
//! background worker touches the immutable memtable.
//!
//! ## Read path
//!
//! A read snapshots `(active, immutable, current version, sequence)` under
//! the mutex, then probes without it: active memtable → immutable →
//! version levels. Seek statistics are applied afterwards and may arm
//! seek-driven compaction.
//!
//! ## Background work
//!
//! One worker thread receives wake-ups over a channel and runs at most one
//! compaction at a time: flush the immutable memtable first, else a
//! pending manual compaction, else the picked size/seek compaction. Any
//! background failure latches into the engine; subsequent writes return
//! the latched error while reads continue from durable state.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod batch;
pub mod filename;
pub mod iter;
pub mod snapshot;

pub use batch::WriteBatch;
pub use iter::DbIterator;
pub use snapshot::Snapshot;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::{HashSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::TableCache;
use crate::compaction::Compaction;
use crate::comparator::{BytewiseComparator, Comparator, InternalKeyComparator};
use crate::iterator::{InternalIterator, MergingIterator};
use crate::keys::{
    InternalKey, LookupKey, MAX_SEQUENCE_NUMBER, ParsedInternalKey, SequenceNumber,
    VALUE_TYPE_FOR_SEEK, ValueType,
};
use crate::memtable::{MemTable, MemTableGet};
use crate::options::{Options, ReadOptions, WriteOptions};
use crate::sstable::{BlockCache, TableBuilder, TableError};
use crate::version::{
    L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER, NUM_LEVELS, Version, VersionEdit,
    VersionError, VersionGet, VersionSet, new_level_iterator,
};
use crate::wal::{CorruptionReporter, LogReader, LogWriter, WalError};

use filename::{
    FileType, current_file_name, lock_file_name, log_file_name, manifest_file_name,
    parse_file_name, set_current_file, table_file_name, temp_file_name,
};
use snapshot::SnapshotList;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Top-level engine errors. Cloneable so a latched background error can be
/// returned to every subsequent writer.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Table subsystem failure.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Version/descriptor subsystem failure.
    #[error("version error: {0}")]
    Version(Arc<VersionError>),

    /// Log subsystem failure.
    #[error("log error: {0}")]
    Wal(Arc<WalError>),

    /// Structural damage detected outside a subsystem.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Configuration or usage error.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine is closing; background work was abandoned.
    #[error("database is shutting down")]
    ShuttingDown,
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::Io(Arc::new(err))
    }
}

impl From<VersionError> for EngineError {
    fn from(err: VersionError) -> Self {
        EngineError::Version(Arc::new(err))
    }
}

impl From<WalError> for EngineError {
    fn from(err: WalError) -> Self {
        EngineError::Wal(Arc::new(err))
    }
}

// ------------------------------------------------------------------------------------------------
// Writer queue node
// ------------------------------------------------------------------------------------------------

struct Writer {
    /// `None` marks a memtable-rotation request (forced compaction).
    batch: Option<WriteBatch>,
    sync: bool,
    done: AtomicBool,
    status: Mutex<Option<Result<(), EngineError>>>,
}

impl Writer {
    fn new(batch: Option<WriteBatch>, sync: bool) -> Self {
        Self {
            batch,
            sync,
            done: AtomicBool::new(false),
            status: Mutex::new(None),
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(AtomicOrdering::Acquire)
    }

    fn complete(&self, result: Result<(), EngineError>) {
        *self.status.lock().expect("writer status poisoned") = Some(result);
        self.done.store(true, AtomicOrdering::Release);
    }

    fn take_status(&self) -> Result<(), EngineError> {
        self.status
            .lock()
            .expect("writer status poisoned")
            .take()
            .unwrap_or(Ok(()))
    }
}

// ------------------------------------------------------------------------------------------------
// Manual compaction request
// ------------------------------------------------------------------------------------------------

struct ManualCompaction {
    level: usize,
    done: bool,
    begin: Option<InternalKey>,
    end: Option<InternalKey>,
}

// ------------------------------------------------------------------------------------------------
// Engine state
// ------------------------------------------------------------------------------------------------

struct EngineState {
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,
    log: Option<LogWriter>,
    log_file_number: u64,
    versions: VersionSet,
    writers: VecDeque<Arc<Writer>>,
    bg_error: Option<EngineError>,
    bg_compaction_scheduled: bool,
    manual_compaction: Option<Arc<Mutex<ManualCompaction>>>,
    /// Files being produced by a flush or compaction; protected from GC
    /// until the producing edit lands or fails.
    pending_outputs: HashSet<u64>,
}

pub(crate) struct EngineShared {
    db_path: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    state: Mutex<EngineState>,
    /// Signaled when background work finishes (room may be available).
    bg_cv: Condvar,
    /// Signaled when the writer queue advances.
    writers_cv: Condvar,
    /// Background wake-up channel; `None` once shutdown begins.
    bg_tx: Mutex<Option<Sender<()>>>,
    shutting_down: AtomicBool,
    /// Mirror of `state.imm.is_some()`, checked lock-free by the merge
    /// loop so an immutable memtable is flushed promptly mid-compaction.
    has_imm: AtomicBool,
    snapshots: SnapshotList,
}

type StateGuard<'a> = MutexGuard<'a, EngineState>;

// ------------------------------------------------------------------------------------------------
// Engine handle
// ------------------------------------------------------------------------------------------------

/// The storage engine handle.
///
/// Dropping the handle shuts the background worker down after the current
/// compaction phase; iterators and snapshots keep their own references
/// and stay readable.
pub struct Engine {
    shared: Arc<EngineShared>,
    bg_thread: Option<std::thread::JoinHandle<()>>,
}

impl Engine {
    /// Open (or create, per [`Options::create_if_missing`]) the database
    /// at `path`.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self, EngineError> {
        let db_path = path.as_ref().to_path_buf();
        let options = Arc::new(options);
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));

        fs::create_dir_all(&db_path)?;
        // Lock file for layout fidelity; advisory locking is the platform
        // layer's concern.
        let _ = OpenOptions::new()
            .create(true)
            .write(true)
            .open(lock_file_name(&db_path))?;

        let current_exists = current_file_name(&db_path).exists();
        if !current_exists {
            if !options.create_if_missing {
                return Err(EngineError::InvalidArgument(format!(
                    "{}: does not exist (create_if_missing is false)",
                    db_path.display()
                )));
            }
            new_db(&db_path, &icmp)?;
            info!(path = %db_path.display(), "created new database");
        } else if options.error_if_exists {
            return Err(EngineError::InvalidArgument(format!(
                "{}: exists (error_if_exists is true)",
                db_path.display()
            )));
        }

        let block_cache: Arc<BlockCache> = Arc::new(BlockCache::new(options.block_cache_capacity));
        let table_cache = Arc::new(TableCache::new(
            db_path.clone(),
            Arc::clone(&options),
            icmp.clone(),
            Some(block_cache),
        ));

        let mut versions = VersionSet::new(
            db_path.clone(),
            Arc::clone(&options),
            icmp.clone(),
            Arc::clone(&table_cache),
        );
        versions.recover()?;

        // Replay every log at or after the descriptor's log number (plus
        // the immutable memtable's log, if one was mid-flush).
        let mut edit = VersionEdit::new();
        let mut max_sequence = versions.last_sequence();
        let min_log = versions.log_number();
        let prev_log = versions.prev_log_number();
        let mut log_numbers: Vec<u64> = fs::read_dir(&db_path)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_file_name(&entry.file_name().to_string_lossy()))
            .filter_map(|ty| match ty {
                FileType::Log(n) if n >= min_log || n == prev_log => Some(n),
                _ => None,
            })
            .collect();
        log_numbers.sort_unstable();

        for log_number in &log_numbers {
            let seq = recover_log_file(
                &db_path,
                &options,
                &icmp,
                &table_cache,
                &mut versions,
                *log_number,
                &mut edit,
            )?;
            versions.mark_file_number_used(*log_number);
            max_sequence = max_sequence.max(seq);
        }
        if max_sequence > versions.last_sequence() {
            versions.set_last_sequence(max_sequence);
        }

        // Always rotate to a fresh log; old ones become obsolete once the
        // edit lands.
        let log_file_number = versions.new_file_number();
        let log_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(log_file_name(&db_path, log_file_number))?;
        let log = LogWriter::new(log_file);

        edit.prev_log_number = Some(0);
        edit.log_number = Some(log_file_number);
        versions.log_and_apply(&mut edit)?;

        let mem = Arc::new(MemTable::new(icmp.clone()));
        let (bg_tx, bg_rx): (Sender<()>, Receiver<()>) = unbounded();

        let shared = Arc::new(EngineShared {
            db_path,
            options,
            icmp,
            table_cache,
            state: Mutex::new(EngineState {
                mem,
                imm: None,
                log: Some(log),
                log_file_number,
                versions,
                writers: VecDeque::new(),
                bg_error: None,
                bg_compaction_scheduled: false,
                manual_compaction: None,
                pending_outputs: HashSet::new(),
            }),
            bg_cv: Condvar::new(),
            writers_cv: Condvar::new(),
            bg_tx: Mutex::new(Some(bg_tx)),
            shutting_down: AtomicBool::new(false),
            has_imm: AtomicBool::new(false),
            snapshots: SnapshotList::new(),
        });

        {
            let mut state = shared.state.lock().expect("state poisoned");
            shared.remove_obsolete_files(&mut state);
            shared.maybe_schedule_compaction(&mut state);
        }

        let bg_shared = Arc::clone(&shared);
        let bg_thread = std::thread::Builder::new()
            .name("stratumdb-compact".into())
            .spawn(move || {
                while bg_rx.recv().is_ok() {
                    bg_shared.background_call();
                }
            })
            .map_err(EngineError::from)?;

        info!("database opened");
        Ok(Self {
            shared,
            bg_thread: Some(bg_thread),
        })
    }

    // -- public operations -----------------------------------------------------------------------

    /// Insert or overwrite `key`.
    pub fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, batch)
    }

    /// Delete `key`. Deleting an absent key succeeds and merely leaves a
    /// tombstone for the next compaction to collect.
    pub fn delete(&self, options: &WriteOptions, key: &[u8]) -> Result<(), EngineError> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, batch)
    }

    /// Apply `batch` atomically.
    pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<(), EngineError> {
        self.shared.write_internal(options, Some(batch))
    }

    /// Point lookup at the latest state or at `options.snapshot`.
    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let shared = &self.shared;
        let (mem, imm, current, sequence) = {
            let state = shared.state.lock().expect("state poisoned");
            let sequence = options
                .snapshot
                .unwrap_or_else(|| state.versions.last_sequence());
            (
                Arc::clone(&state.mem),
                state.imm.clone(),
                state.versions.current(),
                sequence,
            )
        };

        let lookup = LookupKey::new(key, sequence);

        match mem.get(&lookup) {
            MemTableGet::Found(value) => return Ok(Some(value)),
            MemTableGet::Deleted => return Ok(None),
            MemTableGet::Missing => {}
        }
        if let Some(imm) = &imm {
            match imm.get(&lookup) {
                MemTableGet::Found(value) => return Ok(Some(value)),
                MemTableGet::Deleted => return Ok(None),
                MemTableGet::Missing => {}
            }
        }

        let (result, stats) = current.get(options, &lookup, &shared.table_cache)?;

        // Apply seek statistics; this can arm a compaction.
        if current.update_stats(stats) {
            let mut state = shared.state.lock().expect("state poisoned");
            shared.maybe_schedule_compaction(&mut state);
        }

        match result {
            VersionGet::Found(value) => Ok(Some(value)),
            VersionGet::Deleted | VersionGet::Missing => Ok(None),
        }
    }

    /// Iterator over the whole database at the latest state or at
    /// `options.snapshot`.
    pub fn iter(&self, options: &ReadOptions) -> Result<DbIterator, EngineError> {
        let shared = &self.shared;
        let state = shared.state.lock().expect("state poisoned");
        let sequence = options
            .snapshot
            .unwrap_or_else(|| state.versions.last_sequence());

        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        children.push(Box::new(state.mem.iter()));
        if let Some(imm) = &state.imm {
            children.push(Box::new(imm.iter()));
        }
        let current = state.versions.current();
        for file in current.files(0) {
            children.push(shared.table_cache.iter(options, file.number)?);
        }
        for level in 1..NUM_LEVELS {
            let files = current.files(level);
            if !files.is_empty() {
                children.push(new_level_iterator(
                    Arc::clone(&shared.table_cache),
                    shared.icmp.clone(),
                    options,
                    files.to_vec(),
                ));
            }
        }
        drop(state);

        let merged = MergingIterator::new(shared.icmp.clone(), children);
        Ok(DbIterator::new(
            Arc::clone(shared),
            current,
            merged,
            sequence,
        ))
    }

    /// Take a snapshot pinning the current sequence number.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.shared.state.lock().expect("state poisoned");
        self.shared
            .snapshots
            .acquire(state.versions.last_sequence())
    }

    /// Approximate on-disk bytes spanned by user keys `[start, limit)`.
    pub fn approximate_size(&self, start: &[u8], limit: &[u8]) -> u64 {
        let state = self.shared.state.lock().expect("state poisoned");
        let version = state.versions.current();
        let k1 = InternalKey::new(start, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
        let k2 = InternalKey::new(limit, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
        let start_offset = state.versions.approximate_offset_of(&version, &k1);
        let limit_offset = state.versions.approximate_offset_of(&version, &k2);
        limit_offset.saturating_sub(start_offset)
    }

    /// Compact every level whose files intersect `[begin, end]`; `None`
    /// bounds are open. The memtable is flushed first, so repeated calls
    /// over the full range converge to a fully-compacted tree.
    pub fn compact_range(
        &self,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<(), EngineError> {
        let shared = &self.shared;
        let mut max_level_with_files = 1;
        {
            let state = shared.state.lock().expect("state poisoned");
            let base = state.versions.current();
            for level in 1..NUM_LEVELS {
                if base.overlap_in_level(level, begin, end) {
                    max_level_with_files = level;
                }
            }
        }

        self.flush_memtable()?;
        for level in 0..max_level_with_files {
            shared.manual_compact_level(level, begin, end)?;
        }
        Ok(())
    }

    /// Force the active memtable to a level-0 table and wait for the
    /// flush to finish.
    pub fn flush_memtable(&self) -> Result<(), EngineError> {
        // A null batch forces rotation in make_room_for_write.
        self.shared
            .write_internal(&WriteOptions::default(), None)?;

        let shared = &self.shared;
        let mut state = shared.state.lock().expect("state poisoned");
        while state.imm.is_some() && state.bg_error.is_none() {
            state = shared.bg_cv.wait(state).expect("state poisoned");
        }
        match &state.bg_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Number of table files at `level` (diagnostics and tests).
    pub fn num_level_files(&self, level: usize) -> usize {
        let state = self.shared.state.lock().expect("state poisoned");
        state.versions.num_level_files(level)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.shutting_down.store(true, AtomicOrdering::Release);

        // Wait out any in-flight background work, then close the wake-up
        // channel so the worker exits.
        {
            let mut state = shared.state.lock().expect("state poisoned");
            while state.bg_compaction_scheduled {
                state = shared.bg_cv.wait(state).expect("state poisoned");
            }
            if let Some(log) = state.log.as_mut() {
                if let Err(err) = log.flush() {
                    warn!(error = %err, "log flush on close failed");
                }
            }
        }
        *shared.bg_tx.lock().expect("bg_tx poisoned") = None;
        if let Some(handle) = self.bg_thread.take() {
            let _ = handle.join();
        }
        info!("database closed");
    }
}

// ------------------------------------------------------------------------------------------------
// Core implementation
// ------------------------------------------------------------------------------------------------

impl EngineShared {
    // -- write path ------------------------------------------------------------------------------

    fn write_internal(
        &self,
        options: &WriteOptions,
        batch: Option<WriteBatch>,
    ) -> Result<(), EngineError> {
        let force = batch.is_none();
        let writer = Arc::new(Writer::new(batch, options.sync));

        let mut state = self.state.lock().expect("state poisoned");
        state.writers.push_back(Arc::clone(&writer));
        while !writer.is_done()
            && !Arc::ptr_eq(state.writers.front().expect("queue non-empty"), &writer)
        {
            state = self.writers_cv.wait(state).expect("state poisoned");
        }
        if writer.is_done() {
            return writer.take_status();
        }

        // This writer is the group leader.
        let (mut state, mut status) = self.make_room_for_write(state, force);
        let mut last_writer = Arc::clone(&writer);

        if status.is_ok() && !force {
            let base_sequence = state.versions.last_sequence();
            let (mut group, last) = build_batch_group(&mut state);
            last_writer = last;
            group.set_sequence(base_sequence + 1);
            let count = u64::from(group.count());

            // Only the head-of-queue writer appends to the log or inserts
            // into the active memtable, so both are safe outside the
            // mutex.
            let mem = Arc::clone(&state.mem);
            let mut log = state.log.take().expect("log present while writing");
            drop(state);

            let mut sync_error = false;
            let mut result = log.add_record(group.contents()).map_err(EngineError::from);
            if result.is_ok() && options.sync {
                if let Err(err) = log.sync() {
                    sync_error = true;
                    result = Err(err.into());
                }
            }
            if result.is_ok() {
                result = group.insert_into(&mem);
            }

            state = self.state.lock().expect("state poisoned");
            state.log = Some(log);
            if sync_error {
                // The log may be half-written; no subsequent write may
                // succeed until the database is reopened.
                self.record_background_error(
                    &mut state,
                    result.clone().expect_err("sync error recorded"),
                );
            }
            state.versions.set_last_sequence(base_sequence + count);
            status = result;
        }

        // Complete every writer folded into the group.
        loop {
            let front = state.writers.pop_front().expect("group writers present");
            let is_last = Arc::ptr_eq(&front, &last_writer);
            if !Arc::ptr_eq(&front, &writer) {
                front.complete(status.clone());
            }
            if is_last {
                break;
            }
        }
        drop(state);
        self.writers_cv.notify_all();

        status
    }

    /// Ensure the active memtable can accept a write, possibly delaying,
    /// waiting for compaction, or rotating memtable + log.
    fn make_room_for_write<'a>(
        &'a self,
        mut state: StateGuard<'a>,
        mut force: bool,
    ) -> (StateGuard<'a>, Result<(), EngineError>) {
        let mut allow_delay = !force;
        loop {
            if let Some(err) = state.bg_error.clone() {
                return (state, Err(err));
            }

            if allow_delay
                && state.versions.num_level_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER
            {
                // Yield 1 ms to the compactor instead of stalling this
                // writer for seconds once the hard limit hits. Only once
                // per write.
                drop(state);
                std::thread::sleep(Duration::from_millis(1));
                allow_delay = false;
                state = self.state.lock().expect("state poisoned");
                continue;
            }

            if !force
                && state.mem.approximate_memory_usage() <= self.options.write_buffer_size
            {
                return (state, Ok(()));
            }

            if state.imm.is_some() {
                // Previous memtable still flushing; wait.
                debug!("write stall: immutable memtable pending");
                state = self.bg_cv.wait(state).expect("state poisoned");
                continue;
            }

            if state.versions.num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
                warn!("write stall: too many level-0 files");
                state = self.bg_cv.wait(state).expect("state poisoned");
                continue;
            }

            // Rotate: new log, active becomes immutable.
            let new_log_number = state.versions.new_file_number();
            let log_file = match OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(log_file_name(&self.db_path, new_log_number))
            {
                Ok(file) => file,
                Err(err) => {
                    state.versions.reuse_file_number(new_log_number);
                    return (state, Err(err.into()));
                }
            };

            if let Some(old_log) = state.log.as_mut() {
                if let Err(err) = old_log.flush() {
                    self.record_background_error(&mut state, err.into());
                }
            }
            state.log = Some(LogWriter::new(log_file));
            state.log_file_number = new_log_number;

            let full_mem = std::mem::replace(
                &mut state.mem,
                Arc::new(MemTable::new(self.icmp.clone())),
            );
            state.imm = Some(full_mem);
            self.has_imm.store(true, AtomicOrdering::Release);
            force = false;
            self.maybe_schedule_compaction(&mut state);
        }
    }

    // -- background machinery --------------------------------------------------------------------

    fn maybe_schedule_compaction(&self, state: &mut EngineState) {
        if state.bg_compaction_scheduled
            || self.shutting_down.load(AtomicOrdering::Acquire)
            || state.bg_error.is_some()
        {
            return;
        }
        if state.imm.is_none()
            && state.manual_compaction.is_none()
            && !state.versions.needs_compaction()
        {
            return;
        }
        state.bg_compaction_scheduled = true;
        if let Some(tx) = self.bg_tx.lock().expect("bg_tx poisoned").as_ref() {
            let _ = tx.send(());
        }
    }

    fn background_call(self: &Arc<Self>) {
        let mut state = self.state.lock().expect("state poisoned");
        debug_assert!(state.bg_compaction_scheduled);

        if !self.shutting_down.load(AtomicOrdering::Acquire) && state.bg_error.is_none() {
            state = self.background_compaction(state);
        }

        state.bg_compaction_scheduled = false;
        // The previous round may have created enough garbage (or level-0
        // files) to warrant another.
        self.maybe_schedule_compaction(&mut state);
        drop(state);
        self.bg_cv.notify_all();
    }

    fn background_compaction<'a>(self: &'a Arc<Self>, mut state: StateGuard<'a>) -> StateGuard<'a> {
        if state.imm.is_some() {
            return self.compact_memtable(state);
        }

        let manual = state.manual_compaction.clone();
        let is_manual = manual.is_some();
        let mut manual_end: Option<InternalKey> = None;

        let compaction = if let Some(manual_arc) = &manual {
            let mut m = manual_arc.lock().expect("manual compaction poisoned");
            let compaction =
                state
                    .versions
                    .compact_range(m.level, m.begin.as_ref(), m.end.as_ref());
            m.done = compaction.is_none();
            if let Some(c) = &compaction {
                manual_end = Some(c.input(0, c.num_input_files(0) - 1).largest.clone());
            }
            info!(
                level = m.level,
                done = m.done,
                "manual compaction round"
            );
            compaction
        } else if state.versions.needs_compaction() {
            state.versions.pick_compaction()
        } else {
            None
        };

        match compaction {
            None => {}
            Some(mut c) if !is_manual && c.is_trivial_move() => {
                // No merge needed: reassign the single input to the next
                // level in the descriptor.
                let file = Arc::clone(c.input(0, 0));
                let level = c.level();
                c.edit.remove_file(level, file.number);
                c.edit.add_file(
                    level + 1,
                    file.number,
                    file.file_size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
                let mut edit = std::mem::take(&mut c.edit);
                match state.versions.log_and_apply(&mut edit) {
                    Ok(()) => {
                        info!(
                            file = file.number,
                            from = level,
                            to = level + 1,
                            size = file.file_size,
                            "trivial move"
                        );
                        self.remove_obsolete_files(&mut state);
                    }
                    Err(err) => self.record_background_error(&mut state, err.into()),
                }
            }
            Some(c) => {
                state = self.do_compaction_work(state, c);
            }
        }

        if let Some(manual_arc) = &manual {
            let mut m = manual_arc.lock().expect("manual compaction poisoned");
            if state.bg_error.is_some() {
                // Give up on this round; the caller sees the latched
                // error.
                m.done = true;
            }
            if !m.done {
                // Resume after the last compacted key next round.
                m.begin = manual_end;
            }
            if m.done {
                state.manual_compaction = None;
            }
        }

        state
    }

    fn compact_memtable<'a>(self: &'a Arc<Self>, state: StateGuard<'a>) -> StateGuard<'a> {
        let imm = state
            .imm
            .clone()
            .expect("compact_memtable requires an immutable memtable");
        let base = state.versions.current();
        let mut edit = VersionEdit::new();

        let (mut state, result) = self.write_level0_table(state, &imm, &mut edit, Some(&base));

        let result = result.and_then(|_| {
            if self.shutting_down.load(AtomicOrdering::Acquire) {
                return Err(EngineError::ShuttingDown);
            }
            // The immutable memtable's log is no longer needed.
            edit.prev_log_number = Some(0);
            edit.log_number = Some(state.log_file_number);
            state
                .versions
                .log_and_apply(&mut edit)
                .map_err(EngineError::from)
        });

        match result {
            Ok(()) => {
                state.imm = None;
                self.has_imm.store(false, AtomicOrdering::Release);
                self.remove_obsolete_files(&mut state);
                debug!("memtable flush complete");
            }
            Err(err) => {
                error!(error = %err, "memtable flush failed");
                self.record_background_error(&mut state, err);
            }
        }
        state
    }

    /// Build a table from `mem`'s contents and register it in `edit` at
    /// the best level. Unlocks around the actual file build.
    fn write_level0_table<'a>(
        &'a self,
        mut state: StateGuard<'a>,
        mem: &Arc<MemTable>,
        edit: &mut VersionEdit,
        base: Option<&Version>,
    ) -> (StateGuard<'a>, Result<(), EngineError>) {
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        info!(file = number, "level-0 table build started");

        let iter = mem.iter();
        drop(state);

        let build_result = build_table(
            &self.db_path,
            &self.options,
            &self.icmp,
            &self.table_cache,
            iter,
            number,
        );

        let mut state = self.state.lock().expect("state poisoned");
        state.pending_outputs.remove(&number);

        match build_result {
            Ok(None) => {
                // Empty memtable: nothing written, recycle the number.
                state.versions.reuse_file_number(number);
                (state, Ok(()))
            }
            Ok(Some((file_size, smallest, largest))) => {
                let level = match base {
                    Some(base) => base.pick_level_for_memtable_output(
                        &self.options,
                        smallest.user_key(),
                        largest.user_key(),
                    ),
                    None => 0,
                };
                info!(file = number, size = file_size, level, "level-0 table built");
                edit.add_file(level, number, file_size, smallest, largest);
                (state, Ok(()))
            }
            Err(err) => (state, Err(err)),
        }
    }

    fn do_compaction_work<'a>(
        self: &'a Arc<Self>,
        state: StateGuard<'a>,
        mut compaction: Compaction,
    ) -> StateGuard<'a> {
        info!(what = %compaction.describe(), "compaction started");

        // Entries at or below this sequence that are shadowed by a newer
        // entry for the same user key can never be observed again.
        let smallest_snapshot = self
            .snapshots
            .oldest()
            .unwrap_or_else(|| state.versions.last_sequence());

        let input_result = state.versions.make_input_iterator(&compaction);
        let mut state = state;
        let mut input = match input_result {
            Ok(iter) => iter,
            Err(err) => {
                self.record_background_error(&mut state, err.into());
                return state;
            }
        };

        drop(state);

        let ucmp = Arc::clone(self.icmp.user_comparator());
        let mut outputs: Vec<CompactionOutput> = Vec::new();
        let mut builder: Option<TableBuilder> = None;
        let mut current_output: Option<CompactionOutput> = None;

        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key: SequenceNumber = MAX_SEQUENCE_NUMBER;

        let mut status: Result<(), EngineError> = Ok(());

        input.seek_to_first();
        while input.valid() {
            if self.shutting_down.load(AtomicOrdering::Acquire) {
                status = Err(EngineError::ShuttingDown);
                break;
            }

            // An immutable memtable takes priority over compaction work:
            // writers stall on it.
            if self.has_imm.load(AtomicOrdering::Acquire) {
                let imm_state = self.state.lock().expect("state poisoned");
                if imm_state.imm.is_some() {
                    let imm_state = self.compact_memtable(imm_state);
                    drop(imm_state);
                    self.bg_cv.notify_all();
                }
            }

            let key = input.key().to_vec();

            if compaction.should_stop_before(&key, &self.icmp) && builder.is_some() {
                if let Err(err) = self.finish_compaction_output(
                    &mut builder,
                    &mut current_output,
                    &mut outputs,
                ) {
                    status = Err(err);
                    break;
                }
            }

            // Decide whether this entry survives.
            let mut drop_entry = false;
            match ParsedInternalKey::decode(&key) {
                None => {
                    // Corrupted keys are carried through for later repair
                    // rather than silently dropped.
                    current_user_key = None;
                    last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                }
                Some(parsed) => {
                    let first_occurrence = match &current_user_key {
                        Some(existing) => {
                            ucmp.compare(existing, parsed.user_key) != std::cmp::Ordering::Equal
                        }
                        None => true,
                    };
                    if first_occurrence {
                        current_user_key = Some(parsed.user_key.to_vec());
                        last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                    }

                    if last_sequence_for_key <= smallest_snapshot {
                        // Shadowed by a newer entry that every live
                        // snapshot already sees.
                        drop_entry = true;
                    } else if parsed.value_type == ValueType::Deletion
                        && parsed.sequence <= smallest_snapshot
                        && compaction.is_base_level_for_key(parsed.user_key, &ucmp)
                    {
                        // The tombstone masks nothing below and nothing
                        // visible above: collect it.
                        drop_entry = true;
                    }
                    last_sequence_for_key = parsed.sequence;
                }
            }

            if !drop_entry {
                if builder.is_none() {
                    match self.open_compaction_output(&mut current_output) {
                        Ok(new_builder) => builder = Some(new_builder),
                        Err(err) => {
                            status = Err(err);
                            break;
                        }
                    }
                }
                let active_builder = builder.as_mut().expect("builder just ensured");
                let output = current_output.as_mut().expect("output just ensured");
                if active_builder.num_entries() == 0 {
                    output.smallest = InternalKey::from_encoded(key.clone());
                }
                output.largest = InternalKey::from_encoded(key.clone());
                if let Err(err) = active_builder.add(&key, input.value()) {
                    status = Err(err.into());
                    break;
                }

                if active_builder.file_size() >= compaction.max_output_file_size() {
                    if let Err(err) = self.finish_compaction_output(
                        &mut builder,
                        &mut current_output,
                        &mut outputs,
                    ) {
                        status = Err(err);
                        break;
                    }
                }
            }

            input.next();
        }

        if status.is_ok() {
            if let Err(err) = input.status() {
                status = Err(err.into());
            }
        }
        if status.is_ok() && builder.is_some() {
            status = self.finish_compaction_output(&mut builder, &mut current_output, &mut outputs);
        }
        if let Some(mut abandoned) = builder.take() {
            abandoned.abandon();
        }
        drop(input);

        let mut state = self.state.lock().expect("state poisoned");

        // A half-written output from a failed round is garbage.
        if let Some(orphan) = current_output.take() {
            state.pending_outputs.remove(&orphan.number);
            let _ = fs::remove_file(table_file_name(&self.db_path, orphan.number));
        }

        match status {
            Ok(()) => {
                // Install: inputs out, outputs in at level + 1.
                compaction.add_input_deletions();
                let level = compaction.level();
                for output in &outputs {
                    compaction.edit.add_file(
                        level + 1,
                        output.number,
                        output.file_size,
                        output.smallest.clone(),
                        output.largest.clone(),
                    );
                }
                let mut edit = std::mem::take(&mut compaction.edit);
                match state.versions.log_and_apply(&mut edit) {
                    Ok(()) => {
                        info!(
                            outputs = outputs.len(),
                            bytes = outputs.iter().map(|o| o.file_size).sum::<u64>(),
                            "compaction finished"
                        );
                    }
                    Err(err) => {
                        self.record_background_error(&mut state, err.into());
                    }
                }
            }
            Err(EngineError::ShuttingDown) => {
                debug!("compaction abandoned at shutdown");
            }
            Err(err) => {
                error!(error = %err, "compaction failed");
                self.record_background_error(&mut state, err);
            }
        }

        for output in &outputs {
            state.pending_outputs.remove(&output.number);
        }
        self.remove_obsolete_files(&mut state);
        state
    }

    fn open_compaction_output(
        &self,
        current_output: &mut Option<CompactionOutput>,
    ) -> Result<TableBuilder, EngineError> {
        let number = {
            let mut state = self.state.lock().expect("state poisoned");
            let number = state.versions.new_file_number();
            state.pending_outputs.insert(number);
            number
        };

        let path = table_file_name(&self.db_path, number);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        *current_output = Some(CompactionOutput {
            number,
            file_size: 0,
            smallest: InternalKey::default(),
            largest: InternalKey::default(),
        });
        let comparator: Arc<dyn Comparator> = Arc::new(self.icmp.clone());
        Ok(TableBuilder::new(
            Arc::clone(&self.options),
            comparator,
            file,
        ))
    }

    fn finish_compaction_output(
        &self,
        builder: &mut Option<TableBuilder>,
        current_output: &mut Option<CompactionOutput>,
        outputs: &mut Vec<CompactionOutput>,
    ) -> Result<(), EngineError> {
        let mut active = builder.take().expect("finish without builder");
        let mut output = current_output.take().expect("finish without output");

        let entries = active.num_entries();
        let result: Result<(), EngineError> = (|| {
            if entries == 0 {
                active.abandon();
            } else {
                output.file_size = active.finish()?;
                active.sync()?;
            }
            Ok(())
        })();

        match result {
            Ok(()) if entries > 0 => {
                // The file must be openable before its edit can land.
                if let Err(err) = self.table_cache.find_table(output.number) {
                    let _ = fs::remove_file(table_file_name(&self.db_path, output.number));
                    let mut state = self.state.lock().expect("state poisoned");
                    state.pending_outputs.remove(&output.number);
                    return Err(err.into());
                }
                outputs.push(output);
                Ok(())
            }
            Ok(()) => {
                let _ = fs::remove_file(table_file_name(&self.db_path, output.number));
                let mut state = self.state.lock().expect("state poisoned");
                state.pending_outputs.remove(&output.number);
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(table_file_name(&self.db_path, output.number));
                let mut state = self.state.lock().expect("state poisoned");
                state.pending_outputs.remove(&output.number);
                Err(err)
            }
        }
    }

    // -- manual compaction -----------------------------------------------------------------------

    fn manual_compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<(), EngineError> {
        let manual = Arc::new(Mutex::new(ManualCompaction {
            level,
            done: false,
            begin: begin.map(|b| InternalKey::new(b, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK)),
            end: end.map(|e| InternalKey::new(e, 0, ValueType::Deletion)),
        }));

        let mut state = self.state.lock().expect("state poisoned");
        loop {
            if self.shutting_down.load(AtomicOrdering::Acquire) {
                return Err(EngineError::ShuttingDown);
            }
            if let Some(err) = &state.bg_error {
                return Err(err.clone());
            }
            if manual.lock().expect("manual poisoned").done {
                return Ok(());
            }
            if state.manual_compaction.is_none() {
                state.manual_compaction = Some(Arc::clone(&manual));
                self.maybe_schedule_compaction(&mut state);
            }
            state = self.bg_cv.wait(state).expect("state poisoned");
        }
    }

    // -- housekeeping ----------------------------------------------------------------------------

    fn record_background_error(&self, state: &mut EngineState, err: EngineError) {
        if state.bg_error.is_none() {
            error!(error = %err, "background error latched");
            state.bg_error = Some(err);
        }
        self.bg_cv.notify_all();
    }

    /// Delete every file no version, pending output, or live log refers
    /// to.
    fn remove_obsolete_files(&self, state: &mut EngineState) {
        if state.bg_error.is_some() {
            // The descriptor may not reflect reality; deleting anything
            // now could destroy committed data.
            return;
        }

        let mut live: HashSet<u64> = state.pending_outputs.clone();
        state.versions.add_live_files(&mut live);

        let Ok(entries) = fs::read_dir(&self.db_path) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(file_type) = parse_file_name(&name.to_string_lossy()) else {
                continue;
            };
            let keep = match file_type {
                FileType::Log(number) => {
                    number >= state.versions.log_number()
                        || number == state.versions.prev_log_number()
                }
                FileType::Manifest(number) => number >= state.versions.manifest_file_number(),
                FileType::Table(number) => live.contains(&number),
                // A temp file is an output of an in-progress operation.
                FileType::Temp(number) => live.contains(&number),
                FileType::Current | FileType::Lock => true,
            };
            if keep {
                continue;
            }

            if let FileType::Table(number) = file_type {
                self.table_cache.evict(number);
            }
            debug!(file = %name.to_string_lossy(), "deleting obsolete file");
            if let Err(err) = fs::remove_file(entry.path()) {
                // Deletion failures only delay reclamation.
                warn!(file = %name.to_string_lossy(), error = %err, "obsolete file delete failed");
            }
        }
    }

    /// Called by iterators when read sampling arms a compaction.
    pub(crate) fn schedule_from_read_sample(&self) {
        let mut state = self.state.lock().expect("state poisoned");
        self.maybe_schedule_compaction(&mut state);
    }
}

/// One file produced by a compaction.
struct CompactionOutput {
    number: u64,
    file_size: u64,
    smallest: InternalKey,
    largest: InternalKey,
}

// ------------------------------------------------------------------------------------------------
// Batch grouping
// ------------------------------------------------------------------------------------------------

/// Fold queued batches (starting at the leader) into one. Returns the
/// merged batch and the last folded writer.
fn build_batch_group(state: &mut EngineState) -> (WriteBatch, Arc<Writer>) {
    let leader = Arc::clone(state.writers.front().expect("leader present"));
    let leader_batch = leader.batch.as_ref().expect("leader carries a batch");

    let mut group = leader_batch.clone();
    let mut size = leader_batch.approximate_size();

    // Cap the group so a burst of small writes is not penalized by one
    // huge neighbor.
    let max_size = if size <= 128 << 10 {
        size + (128 << 10)
    } else {
        1 << 20
    };

    let mut last_writer = Arc::clone(&leader);
    for follower in state.writers.iter().skip(1) {
        if follower.sync && !leader.sync {
            // A sync write must not piggyback on a non-sync commit.
            break;
        }
        if let Some(batch) = &follower.batch {
            size += batch.approximate_size();
            if size > max_size {
                break;
            }
            group.append(batch);
        }
        last_writer = Arc::clone(follower);
    }
    (group, last_writer)
}

// ------------------------------------------------------------------------------------------------
// Table building & recovery helpers
// ------------------------------------------------------------------------------------------------

/// Stream `iter`'s entries into table file `number`. Returns `None` for
/// an empty iterator, else `(file_size, smallest, largest)`.
fn build_table(
    db_path: &Path,
    options: &Arc<Options>,
    icmp: &InternalKeyComparator,
    table_cache: &TableCache,
    mut iter: impl InternalIterator,
    number: u64,
) -> Result<Option<(u64, InternalKey, InternalKey)>, EngineError> {
    iter.seek_to_first();
    if !iter.valid() {
        return Ok(None);
    }

    let path = table_file_name(db_path, number);
    let result = (|| -> Result<(u64, InternalKey, InternalKey), EngineError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let comparator: Arc<dyn Comparator> = Arc::new(icmp.clone());
        let mut builder = TableBuilder::new(Arc::clone(options), comparator, file);

        let smallest = InternalKey::from_encoded(iter.key().to_vec());
        let mut largest = smallest.clone();
        while iter.valid() {
            largest = InternalKey::from_encoded(iter.key().to_vec());
            builder.add(iter.key(), iter.value())?;
            iter.next();
        }
        iter.status()?;

        let file_size = builder.finish()?;
        builder.sync()?;

        // The new table must be readable before anything references it.
        table_cache.find_table(number)?;
        Ok((file_size, smallest, largest))
    })();

    match result {
        Ok(meta) => Ok(Some(meta)),
        Err(err) => {
            let _ = fs::remove_file(&path);
            Err(err)
        }
    }
}

/// Collects WAL replay corruption; fatal only under paranoid checks.
struct RecoveryReporter {
    error: Arc<Mutex<Option<String>>>,
}

impl CorruptionReporter for RecoveryReporter {
    fn corruption(&mut self, bytes: usize, reason: &str) {
        warn!(bytes, reason, "corruption in write-ahead log");
        let mut slot = self.error.lock().expect("reporter poisoned");
        if slot.is_none() {
            *slot = Some(format!("{reason} ({bytes} bytes)"));
        }
    }
}

/// Replay one WAL into fresh memtables, spilling level-0 tables whenever
/// the write buffer fills. Returns the highest sequence seen.
fn recover_log_file(
    db_path: &Path,
    options: &Arc<Options>,
    icmp: &InternalKeyComparator,
    table_cache: &TableCache,
    versions: &mut VersionSet,
    log_number: u64,
    edit: &mut VersionEdit,
) -> Result<SequenceNumber, EngineError> {
    let path = log_file_name(db_path, log_number);
    let file = File::open(&path)?;
    info!(log = log_number, "replaying write-ahead log");

    let corruption = Arc::new(Mutex::new(None));
    let reporter = RecoveryReporter {
        error: Arc::clone(&corruption),
    };
    let mut reader = LogReader::new(file, Some(Box::new(reporter)), 0);

    let mut mem: Option<Arc<MemTable>> = None;
    let mut max_sequence = 0;
    let mut batch = WriteBatch::new();

    while let Some(record) = reader.read_record()? {
        if record.len() < batch::BATCH_HEADER_SIZE {
            warn!(len = record.len(), "log record too small; skipping");
            continue;
        }
        batch.set_contents(record)?;

        let mem_ref = mem.get_or_insert_with(|| Arc::new(MemTable::new(icmp.clone())));
        if let Err(err) = batch.insert_into(mem_ref) {
            // A record that passed its checksum but fails to decode is
            // treated like any other log damage.
            if options.paranoid_checks {
                return Err(err);
            }
            warn!(error = %err, "bad batch in log; skipping");
            continue;
        }

        if batch.count() > 0 {
            let last_seq = batch.sequence() + u64::from(batch.count()) - 1;
            max_sequence = max_sequence.max(last_seq);
        }

        if mem_ref.approximate_memory_usage() > options.write_buffer_size {
            let full = mem.take().expect("memtable present");
            let number = versions.new_file_number();
            match build_table(db_path, options, icmp, table_cache, full.iter(), number)? {
                Some((file_size, smallest, largest)) => {
                    edit.add_file(0, number, file_size, smallest, largest);
                }
                None => versions.reuse_file_number(number),
            }
        }
    }

    if options.paranoid_checks {
        if let Some(reason) = corruption.lock().expect("reporter poisoned").take() {
            return Err(EngineError::Corruption(format!(
                "log {log_number} damaged: {reason}"
            )));
        }
    }

    if let Some(full) = mem.take() {
        let number = versions.new_file_number();
        match build_table(db_path, options, icmp, table_cache, full.iter(), number)? {
            Some((file_size, smallest, largest)) => {
                edit.add_file(0, number, file_size, smallest, largest);
            }
            None => versions.reuse_file_number(number),
        }
    }

    Ok(max_sequence)
}

/// Initialize an empty database: descriptor number 1 holding an empty
/// snapshot, pointed to by `CURRENT`.
fn new_db(db_path: &Path, icmp: &InternalKeyComparator) -> Result<(), EngineError> {
    let mut edit = VersionEdit::new();
    edit.comparator_name = Some(icmp.user_comparator().name().to_string());
    edit.log_number = Some(0);
    edit.next_file_number = Some(2);
    edit.last_sequence = Some(0);

    let manifest_path = manifest_file_name(db_path, 1);
    let result = (|| -> Result<(), EngineError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&manifest_path)?;
        let mut log = LogWriter::new(file);
        let mut record = Vec::new();
        edit.encode_to(&mut record);
        log.add_record(&record)?;
        log.sync()?;
        set_current_file(db_path, 1)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&manifest_path);
        let _ = fs::remove_file(temp_file_name(db_path, 1));
    }
    result
}
