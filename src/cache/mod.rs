//! In-memory caches: a sharded LRU plus the table-handle cache built on it.
//!
//! Two caches keep hot data resident:
//!
//! - the **block cache** maps `(cache_id, block_offset)` to decoded data
//!   blocks, charged by decoded size (default capacity 8 MiB);
//! - the **table cache** maps file numbers to open table readers, charged
//!   one unit each and bounded by `max_open_files` minus a reserve.
//!
//! Entries are handed out as `Arc` clones, so eviction never invalidates a
//! handle an operation is still using — the storage is freed when the last
//! reference drops.

pub mod lru;
pub mod table_cache;

pub use lru::ShardedLruCache;
pub use table_cache::TableCache;

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide cache-id allocator.
///
/// Every open table gets a distinct id to namespace its block-cache keys,
/// so block offsets from different files never collide.
pub fn new_cache_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
