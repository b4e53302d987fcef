//! Sorted String Table (SSTable) Module
//!
//! Implements the **immutable**, **disk-backed** sorted table files
//! produced by memtable flushes and compactions, and the reader that
//! serves point lookups and scans from them.
//!
//! # On-disk layout
//!
//! ```text
//! [DATA_BLOCK_1][trailer]
//! [DATA_BLOCK_2][trailer]
//! ...
//! [FILTER_BLOCK][trailer]        (optional)
//! [METAINDEX_BLOCK][trailer]
//! [INDEX_BLOCK][trailer]
//! [FOOTER (48 B)]
//! ```
//!
//! - **Data blocks** — prefix-compressed entries with a restart array
//!   ([`block`]); target size `Options::block_size`.
//! - **Block trailer** — `compression_type:u8 ‖ crc32:fixed32` (5 bytes),
//!   outside the block payload.
//! - **Filter block** — per-offset-range key summaries ([`filter`]).
//! - **Metaindex block** — maps `"filter.<policy-name>"` to the filter
//!   block's handle; block-formatted like everything else.
//! - **Index block** — one entry per data block whose key is a shortened
//!   separator ≥ every key in the block and < every key in the next, with
//!   the block's [`BlockHandle`] as value.
//! - **Footer** — metaindex handle ‖ index handle ‖ zero padding ‖ magic.
//!
//! # Concurrency model
//!
//! Tables are immutable; a [`Table`] is shared behind `Arc` by the table
//! cache and iterators, and every read path is lock-free. Block loads go
//! through the shared block cache keyed by `(cache_id, block_offset)`.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod block;
pub mod builder;
pub mod filter;
pub mod iterator;

pub use builder::TableBuilder;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::File;
use std::io;
use std::sync::Arc;

use memmap2::Mmap;
use thiserror::Error;
use tracing::debug;

use crate::cache::{ShardedLruCache, new_cache_id};
use crate::comparator::{Comparator, InternalKeyComparator};
use crate::encoding::{
    EncodingError, get_fixed64, get_varint64, put_fixed64, put_varint64,
};
use crate::iterator::InternalIterator;
use crate::keys::extract_user_key;
use crate::options::{CompressionType, Options, ReadOptions};

use block::Block;
use filter::FilterBlockReader;
use iterator::TwoLevelIterator;

// ------------------------------------------------------------------------------------------------
// Format constants
// ------------------------------------------------------------------------------------------------

/// Magic number closing every table file footer.
pub const TABLE_MAGIC: u64 = 0x7374_7261_7462_6c31; // "stratbl1"

/// Encoded footer size: two max-width handles (2 × 20) padded, plus magic.
pub const FOOTER_SIZE: usize = 48;

/// Block trailer: compression tag byte + crc32.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Metaindex key prefix for filter blocks.
const FILTER_KEY_PREFIX: &str = "filter.";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by table reading and building.
///
/// Cloneable so parked iterator errors can be surfaced repeatedly through
/// `status()`.
#[derive(Debug, Clone, Error)]
pub enum TableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Wire-format decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Structural damage: bad magic, checksum mismatch, malformed block.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The file uses a feature this build cannot read.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// API misuse, e.g. out-of-order keys handed to the builder.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<io::Error> for TableError {
    fn from(err: io::Error) -> Self {
        TableError::Io(Arc::new(err))
    }
}

// ------------------------------------------------------------------------------------------------
// BlockHandle
// ------------------------------------------------------------------------------------------------

/// Location of a block within a table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    /// File offset of the block payload.
    pub offset: u64,
    /// Payload size, excluding the trailer.
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Append `offset:varint64 ‖ size:varint64`.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        put_varint64(buf, self.offset);
        put_varint64(buf, self.size);
    }

    /// Decode from the start of `buf`; returns `(handle, consumed)`.
    pub fn decode_from(buf: &[u8]) -> Result<(Self, usize), TableError> {
        let (offset, n1) = get_varint64(buf)?;
        let (size, n2) = get_varint64(&buf[n1..])?;
        Ok((Self { offset, size }, n1 + n2))
    }
}

// ------------------------------------------------------------------------------------------------
// Footer
// ------------------------------------------------------------------------------------------------

/// Fixed-size table footer: the two top-level handles plus the magic.
#[derive(Debug, Clone, Copy, Default)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    /// Append the exactly-[`FOOTER_SIZE`]-byte footer.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        self.metaindex_handle.encode_to(buf);
        self.index_handle.encode_to(buf);
        buf.resize(start + FOOTER_SIZE - 8, 0);
        put_fixed64(buf, TABLE_MAGIC);
        debug_assert_eq!(buf.len() - start, FOOTER_SIZE);
    }

    /// Decode a footer from exactly [`FOOTER_SIZE`] bytes.
    pub fn decode_from(buf: &[u8]) -> Result<Self, TableError> {
        if buf.len() < FOOTER_SIZE {
            return Err(TableError::Corruption("footer too short".into()));
        }
        let magic = get_fixed64(&buf[FOOTER_SIZE - 8..])?;
        if magic != TABLE_MAGIC {
            return Err(TableError::Corruption(
                "not a table file (bad magic)".into(),
            ));
        }
        let (metaindex_handle, n) = BlockHandle::decode_from(buf)?;
        let (index_handle, _) = BlockHandle::decode_from(&buf[n..])?;
        Ok(Self {
            metaindex_handle,
            index_handle,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Raw block I/O
// ------------------------------------------------------------------------------------------------

/// Read and validate the block at `handle`, returning its payload bytes.
pub(crate) fn read_block_bytes(
    mmap: &Mmap,
    handle: BlockHandle,
    verify_checksum: bool,
) -> Result<Vec<u8>, TableError> {
    let offset = handle.offset as usize;
    let size = handle.size as usize;
    let end = offset
        .checked_add(size)
        .and_then(|e| e.checked_add(BLOCK_TRAILER_SIZE))
        .ok_or_else(|| TableError::Corruption("block handle overflow".into()))?;
    if end > mmap.len() {
        return Err(TableError::Corruption(
            "block handle past end of file".into(),
        ));
    }

    let payload = &mmap[offset..offset + size];
    let trailer = &mmap[offset + size..end];

    if verify_checksum {
        let stored = u32::from_le_bytes([trailer[1], trailer[2], trailer[3], trailer[4]]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        hasher.update(&trailer[..1]);
        if hasher.finalize() != stored {
            return Err(TableError::Corruption("block checksum mismatch".into()));
        }
    }

    match CompressionType::from_byte(trailer[0]) {
        Some(CompressionType::None) => Ok(payload.to_vec()),
        Some(CompressionType::Snappy) => Err(TableError::NotSupported(
            "snappy-compressed block (no codec wired)".into(),
        )),
        None => Err(TableError::Corruption("unknown compression tag".into())),
    }
}

// ------------------------------------------------------------------------------------------------
// Table — immutable reader
// ------------------------------------------------------------------------------------------------

/// Cache of decoded blocks shared by all tables of one engine, keyed by
/// `(table cache id, block offset)` and charged by decoded size.
pub type BlockCache = ShardedLruCache<(u64, u64), Arc<Block>>;

/// An open, memory-mapped table file.
pub struct Table {
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    /// The comparator as a shareable trait object for block iterators.
    cmp_obj: Arc<dyn Comparator>,
    mmap: Mmap,
    /// Namespaces this table's entries in the block cache.
    cache_id: u64,
    index_block: Arc<Block>,
    metaindex_handle: BlockHandle,
    filter: Option<FilterBlockReader>,
    block_cache: Option<Arc<BlockCache>>,
}

impl Table {
    /// Open a table file: decode the footer and index block, and load the
    /// filter block when the configured policy matches.
    pub fn open(
        options: Arc<Options>,
        icmp: InternalKeyComparator,
        block_cache: Option<Arc<BlockCache>>,
        file: &File,
    ) -> Result<Self, TableError> {
        // SAFETY: table files are immutable once published (written to a
        // temporary name and renamed), and the mapping is read-only.
        let mmap = unsafe { Mmap::map(file)? };
        if mmap.len() < FOOTER_SIZE {
            return Err(TableError::Corruption(
                "file too short to be a table".into(),
            ));
        }

        let footer = Footer::decode_from(&mmap[mmap.len() - FOOTER_SIZE..])?;

        // The index block is always checksummed on open: a bad index
        // poisons every lookup, so paying the CRC once is worth it.
        let index_bytes = read_block_bytes(&mmap, footer.index_handle, true)?;
        let index_block = Arc::new(Block::new(index_bytes)?);

        let cmp_obj: Arc<dyn Comparator> = Arc::new(icmp.clone());

        let mut table = Self {
            options,
            icmp,
            cmp_obj,
            mmap,
            cache_id: new_cache_id(),
            index_block,
            metaindex_handle: footer.metaindex_handle,
            filter: None,
            block_cache,
        };
        table.read_filter(footer.metaindex_handle)?;

        debug!(
            cache_id = table.cache_id,
            file_size = table.mmap.len(),
            has_filter = table.filter.is_some(),
            "table opened"
        );
        Ok(table)
    }

    fn read_filter(&mut self, metaindex_handle: BlockHandle) -> Result<(), TableError> {
        let Some(policy) = self.options.filter_policy.clone() else {
            return Ok(());
        };

        let meta_bytes =
            read_block_bytes(&self.mmap, metaindex_handle, self.options.paranoid_checks)?;
        let meta_block = Arc::new(Block::new(meta_bytes)?);
        let mut iter = meta_block.iter(Arc::new(crate::comparator::BytewiseComparator));

        let key = format!("{FILTER_KEY_PREFIX}{}", policy.name());
        iter.seek(key.as_bytes());
        if iter.valid() && iter.key() == key.as_bytes() {
            let (handle, _) = BlockHandle::decode_from(iter.value())?;
            let filter_bytes =
                read_block_bytes(&self.mmap, handle, self.options.paranoid_checks)?;
            self.filter = Some(FilterBlockReader::new(policy, filter_bytes));
        }
        Ok(())
    }

    /// The id namespacing this table's block-cache keys.
    pub fn cache_id(&self) -> u64 {
        self.cache_id
    }

    /// Load the data block at `handle`, consulting the block cache.
    fn block_reader(
        &self,
        options: &ReadOptions,
        handle: BlockHandle,
    ) -> Result<Arc<Block>, TableError> {
        if let Some(cache) = &self.block_cache {
            let cache_key = (self.cache_id, handle.offset);
            if let Some(block) = cache.lookup(&cache_key) {
                return Ok(block);
            }
            let bytes = read_block_bytes(
                &self.mmap,
                handle,
                options.verify_checksums || self.options.paranoid_checks,
            )?;
            let block = Arc::new(Block::new(bytes)?);
            if options.fill_cache {
                cache.insert(cache_key, Arc::clone(&block), block.size());
            }
            return Ok(block);
        }

        let bytes = read_block_bytes(
            &self.mmap,
            handle,
            options.verify_checksums || self.options.paranoid_checks,
        )?;
        Ok(Arc::new(Block::new(bytes)?))
    }

    /// Point lookup: the first entry at or after `internal_key` in its
    /// candidate data block, or `None` when the index or filter excludes
    /// the key.
    pub fn internal_get(
        &self,
        options: &ReadOptions,
        internal_key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, TableError> {
        let mut index_iter = self.index_block.iter(Arc::clone(&self.cmp_obj));
        index_iter.seek(internal_key);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }

        let (handle, _) = BlockHandle::decode_from(index_iter.value())?;

        if let Some(filter) = &self.filter {
            let (user_key, _) = extract_user_key(internal_key);
            if !filter.key_may_match(handle.offset, user_key) {
                return Ok(None);
            }
        }

        let block = self.block_reader(options, handle)?;
        let mut block_iter = block.iter(Arc::clone(&self.cmp_obj));
        block_iter.seek(internal_key);
        if !block_iter.valid() {
            block_iter.status()?;
            return Ok(None);
        }
        Ok(Some((
            block_iter.key().to_vec(),
            block_iter.value().to_vec(),
        )))
    }

    /// Two-level iterator over the whole table.
    pub fn iter(self: &Arc<Self>, options: &ReadOptions) -> TwoLevelIterator {
        let table = Arc::clone(self);
        let options = options.clone();
        let index_iter = self.index_block.iter(Arc::clone(&self.cmp_obj));
        TwoLevelIterator::new(
            Box::new(index_iter),
            Box::new(move |handle_bytes| {
                let (handle, _) = BlockHandle::decode_from(handle_bytes)?;
                let block = table.block_reader(&options, handle)?;
                Ok(Box::new(block.iter(Arc::clone(&table.cmp_obj))))
            }),
        )
    }

    /// Approximate file offset where `internal_key` would live. Used for
    /// size estimation; keys past the last block map to the metaindex
    /// offset (≈ data size).
    pub fn approximate_offset_of(&self, internal_key: &[u8]) -> u64 {
        let mut index_iter = self.index_block.iter(Arc::clone(&self.cmp_obj));
        index_iter.seek(internal_key);
        if index_iter.valid() {
            if let Ok((handle, _)) = BlockHandle::decode_from(index_iter.value()) {
                return handle.offset;
            }
        }
        self.metaindex_handle.offset
    }

    /// The comparator this table was written with.
    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }
}
