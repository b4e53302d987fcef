//! Cache of open table readers.
//!
//! Opening a table means an `open(2)`, an mmap, and footer/index decoding;
//! the table cache amortizes that across reads. Capacity is
//! `max_open_files` minus a small reserve for the descriptor, log, and
//! scratch files the engine keeps open itself.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::comparator::InternalKeyComparator;
use crate::engine::filename::open_table_file;
use crate::iterator::InternalIterator;
use crate::options::{Options, ReadOptions};
use crate::sstable::{BlockCache, Table, TableError};

use super::ShardedLruCache;

/// File descriptors held back from the table cache for other uses.
const RESERVED_FILES: usize = 10;

/// LRU-bounded mapping from file number to an open [`Table`].
pub struct TableCache {
    db_path: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    block_cache: Option<Arc<BlockCache>>,
    cache: ShardedLruCache<u64, Arc<Table>>,
}

impl TableCache {
    pub fn new(
        db_path: PathBuf,
        options: Arc<Options>,
        icmp: InternalKeyComparator,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Self {
        let capacity = options.max_open_files.saturating_sub(RESERVED_FILES).max(1);
        Self {
            db_path,
            options,
            icmp,
            block_cache,
            cache: ShardedLruCache::new(capacity),
        }
    }

    /// Fetch the open table for `file_number`, opening it on a miss.
    pub fn find_table(&self, file_number: u64) -> Result<Arc<Table>, TableError> {
        if let Some(table) = self.cache.lookup(&file_number) {
            return Ok(table);
        }

        let file = open_table_file(&self.db_path, file_number)?;
        let table = Arc::new(Table::open(
            Arc::clone(&self.options),
            self.icmp.clone(),
            self.block_cache.clone(),
            &file,
        )?);
        debug!(file_number, "table opened into cache");
        self.cache.insert(file_number, Arc::clone(&table), 1);
        Ok(table)
    }

    /// Point lookup inside one table file. Returns the first entry at or
    /// after `internal_key` in the candidate block, as the table reader
    /// reports it.
    pub fn get(
        &self,
        options: &ReadOptions,
        file_number: u64,
        internal_key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, TableError> {
        let table = self.find_table(file_number)?;
        table.internal_get(options, internal_key)
    }

    /// Iterator over one table file. The iterator owns an `Arc` to the
    /// table, so a later eviction cannot invalidate it.
    pub fn iter(
        &self,
        options: &ReadOptions,
        file_number: u64,
    ) -> Result<Box<dyn InternalIterator>, TableError> {
        let table = self.find_table(file_number)?;
        Ok(Box::new(table.iter(options)))
    }

    /// Drop the cached handle for a deleted file.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&file_number);
    }
}
