//! Table builder — streams sorted entries into a complete table file.
//!
//! Construction is strictly streaming: callers feed internal keys in
//! increasing order, data blocks flush as they reach the configured target
//! size, and the index entry for each block is deferred until the first
//! key of the *next* block is known so the separator can be shortened
//! ([`Comparator::find_shortest_separator`]). `finish` appends the filter
//! block, metaindex, index, and footer; `abandon` drops an in-progress
//! build after an error.
//!
//! The builder never syncs; durability is the caller's decision (flush
//! and compaction sync before publishing the file in a version edit).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use tracing::trace;

use crate::comparator::Comparator;
use crate::keys::extract_user_key;
use crate::options::{CompressionType, Options};

use super::block::BlockBuilder;
use super::filter::FilterBlockBuilder;
use super::{BlockHandle, Footer, TableError};

/// Streaming builder for one table file.
pub struct TableBuilder {
    options: Arc<Options>,
    comparator: Arc<dyn Comparator>,
    file: BufWriter<File>,
    /// File offset where the next block payload will land.
    offset: u64,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter_block: Option<FilterBlockBuilder>,
    last_key: Vec<u8>,
    num_entries: u64,
    closed: bool,
    /// A data block was flushed and its index entry is still deferred.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
}

impl TableBuilder {
    /// Start building into `file`, which must be empty.
    pub fn new(options: Arc<Options>, comparator: Arc<dyn Comparator>, file: File) -> Self {
        let filter_block = options.filter_policy.clone().map(|policy| {
            let mut builder = FilterBlockBuilder::new(policy);
            builder.start_block(0);
            builder
        });
        Self {
            data_block: BlockBuilder::new(options.block_restart_interval),
            // Index entries are rarely adjacent-similar; a restart per
            // entry keeps index seeks cheap.
            index_block: BlockBuilder::new(1),
            filter_block,
            options,
            comparator,
            file: BufWriter::new(file),
            offset: 0,
            last_key: Vec::new(),
            num_entries: 0,
            closed: false,
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
        }
    }

    /// Append an entry. `key` must sort strictly after every key added
    /// before it.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), TableError> {
        debug_assert!(!self.closed);
        if self.num_entries > 0
            && self.comparator.compare(key, &self.last_key) != std::cmp::Ordering::Greater
        {
            return Err(TableError::InvalidArgument(
                "keys added out of order".into(),
            ));
        }

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            self.comparator.find_shortest_separator(&mut self.last_key, key);
            let mut handle_bytes = Vec::new();
            self.pending_handle.encode_to(&mut handle_bytes);
            self.index_block.add(&self.last_key, &handle_bytes);
            self.pending_index_entry = false;
        }

        if let Some(filter) = self.filter_block.as_mut() {
            let (user_key, _) = extract_user_key(key);
            filter.add_key(user_key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Force the pending data block to disk.
    pub fn flush(&mut self) -> Result<(), TableError> {
        debug_assert!(!self.closed);
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);

        self.pending_handle = self.write_data_block()?;
        self.pending_index_entry = true;
        self.file.flush()?;

        if let Some(filter) = self.filter_block.as_mut() {
            filter.start_block(self.offset);
        }
        Ok(())
    }

    /// Complete the table: filter, metaindex, index, footer. Returns the
    /// final file size.
    pub fn finish(&mut self) -> Result<u64, TableError> {
        self.flush()?;
        debug_assert!(!self.closed);
        self.closed = true;

        // Filter block (uncompressed).
        let filter_handle = match self.filter_block.as_mut() {
            Some(filter) => {
                let contents = filter.finish().to_vec();
                Some(write_raw_block(
                    &mut self.file,
                    &mut self.offset,
                    &contents,
                    CompressionType::None,
                )?)
            }
            None => None,
        };

        // Metaindex block.
        let mut metaindex = BlockBuilder::new(self.options.block_restart_interval);
        if let (Some(handle), Some(policy)) = (filter_handle, self.options.filter_policy.as_ref())
        {
            let key = format!("filter.{}", policy.name());
            let mut handle_bytes = Vec::new();
            handle.encode_to(&mut handle_bytes);
            metaindex.add(key.as_bytes(), &handle_bytes);
        }
        let metaindex_contents = metaindex.finish().to_vec();
        let compression = self.effective_compression();
        let metaindex_handle = write_raw_block(
            &mut self.file,
            &mut self.offset,
            &metaindex_contents,
            compression,
        )?;

        // Index block, including the deferred entry for the final data
        // block.
        if self.pending_index_entry {
            self.comparator.find_short_successor(&mut self.last_key);
            let mut handle_bytes = Vec::new();
            self.pending_handle.encode_to(&mut handle_bytes);
            self.index_block.add(&self.last_key, &handle_bytes);
            self.pending_index_entry = false;
        }
        let index_contents = self.index_block.finish().to_vec();
        let compression = self.effective_compression();
        let index_handle = write_raw_block(
            &mut self.file,
            &mut self.offset,
            &index_contents,
            compression,
        )?;

        // Footer.
        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        let mut footer_bytes = Vec::new();
        footer.encode_to(&mut footer_bytes);
        self.file.write_all(&footer_bytes)?;
        self.offset += footer_bytes.len() as u64;
        self.file.flush()?;

        trace!(
            entries = self.num_entries,
            file_size = self.offset,
            "table build finished"
        );
        Ok(self.offset)
    }

    /// Abandon the build; the caller deletes the file.
    pub fn abandon(&mut self) {
        debug_assert!(!self.closed);
        self.closed = true;
    }

    /// Force everything written so far to stable storage.
    pub fn sync(&mut self) -> Result<(), TableError> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Entries added so far.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far (the final size once `finish` returns).
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    fn effective_compression(&self) -> CompressionType {
        match self.options.compression {
            // No codec is wired for snappy; fall back to raw storage so
            // the file stays readable everywhere.
            CompressionType::Snappy => CompressionType::None,
            other => other,
        }
    }

    fn write_data_block(&mut self) -> Result<BlockHandle, TableError> {
        let compression = self.effective_compression();
        let contents = self.data_block.finish().to_vec();
        self.data_block.reset();
        write_raw_block(&mut self.file, &mut self.offset, &contents, compression)
    }
}

/// Write `contents ‖ trailer` and advance `offset`; the trailer checksum
/// covers the payload followed by the compression tag.
fn write_raw_block(
    file: &mut BufWriter<File>,
    offset: &mut u64,
    contents: &[u8],
    compression: CompressionType,
) -> Result<BlockHandle, TableError> {
    let handle = BlockHandle::new(*offset, contents.len() as u64);

    let ty = compression.as_byte();
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(contents);
    hasher.update(&[ty]);
    let crc = hasher.finalize();

    file.write_all(contents)?;
    let mut trailer = [0u8; super::BLOCK_TRAILER_SIZE];
    trailer[0] = ty;
    trailer[1..].copy_from_slice(&crc.to_le_bytes());
    file.write_all(&trailer)?;

    *offset += contents.len() as u64 + super::BLOCK_TRAILER_SIZE as u64;
    Ok(handle)
}
