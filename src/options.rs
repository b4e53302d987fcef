//! Engine configuration.
//!
//! [`Options`] controls the behavior of an engine instance and is read-only
//! after [`Engine::open`](crate::engine::Engine::open). [`ReadOptions`] and
//! [`WriteOptions`] tune individual operations.

use std::sync::Arc;

use crate::sstable::filter::FilterPolicy;

/// Per-block compression slot recorded in every table block trailer.
///
/// Only [`CompressionType::None`] is wired; the `Snappy` tag is reserved in
/// the on-disk format so files written by a snappy-enabled build remain
/// recognizable. Reading a snappy block yields a `NotSupported` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// Blocks are stored verbatim.
    None,
    /// Reserved tag; no codec is wired in this build.
    Snappy,
}

impl CompressionType {
    /// On-disk trailer byte for this compression type.
    pub fn as_byte(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Snappy => 1,
        }
    }

    /// Decode a trailer byte. Unknown tags are `None` here and rejected by
    /// the block reader.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }
}

/// Configuration for an engine instance.
///
/// All sizes are in bytes. Defaults mirror the values documented on each
/// field; `Options::default()` is a usable production configuration.
#[derive(Clone)]
pub struct Options {
    /// Create the database directory and descriptor if missing.
    /// Default: `false`.
    pub create_if_missing: bool,

    /// Fail `open` if the database already exists. Default: `false`.
    pub error_if_exists: bool,

    /// Verify checksums aggressively on every read path that normally
    /// trusts the storage layer. Default: `false`.
    pub paranoid_checks: bool,

    /// Active memtable budget before rotation to an immutable memtable.
    /// Default: 4 MiB.
    pub write_buffer_size: usize,

    /// Upper bound on open table files; the table cache capacity is this
    /// value minus a small reserve for other descriptors. Default: 1000.
    pub max_open_files: usize,

    /// Uncompressed data block target size. Default: 4 KiB.
    pub block_size: usize,

    /// Number of entries between restart points in a data block.
    /// Default: 16.
    pub block_restart_interval: usize,

    /// Target table file size; compaction rotates output files at this
    /// threshold. Default: 2 MiB.
    pub max_file_size: u64,

    /// Per-block compression slot. Default: [`CompressionType::None`].
    pub compression: CompressionType,

    /// Optional filter policy consulted by point lookups. `None` disables
    /// filter blocks entirely. Default: `None`.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// Capacity of the decoded-block cache in bytes. Default: 8 MiB.
    pub block_cache_capacity: usize,

    /// Accepted for configuration compatibility; recovery always rotates
    /// to a fresh log regardless. Default: `false`.
    pub reuse_logs: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            max_file_size: 2 * 1024 * 1024,
            compression: CompressionType::None,
            filter_policy: None,
            block_cache_capacity: 8 * 1024 * 1024,
            reuse_logs: false,
        }
    }
}

/// Options for read operations.
#[derive(Clone)]
pub struct ReadOptions {
    /// Verify block checksums on this read. Default: `false`.
    pub verify_checksums: bool,

    /// Insert blocks read for this operation into the block cache.
    /// Default: `true` (disabled for bulk scans such as compaction).
    pub fill_cache: bool,

    /// Read as of this sequence number instead of the latest state.
    pub snapshot: Option<u64>,
}

impl ReadOptions {
    /// Options for a normal foreground read.
    pub fn new() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}

/// Options for write operations.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    /// Force the WAL to stable storage before acknowledging the write.
    /// Default: `false`.
    pub sync: bool,
}
