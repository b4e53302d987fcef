//! # StratumDB
//!
//! An embeddable, persistent, **ordered** key-value storage engine built
//! on a leveled **Log-Structured Merge Tree (LSM-tree)**. Designed for
//! fast writes, cheap sequential scans, and crash-safe operation.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         Engine                            │
//! │  ┌────────────┐   ┌─────────────┐   ┌──────────────────┐  │
//! │  │  Active    │   │  Immutable  │   │  Tables (.ldb)   │  │
//! │  │  MemTable  │   │  MemTable   │   │  level 0 … 6     │  │
//! │  │  + WAL     │   │             │   │                  │  │
//! │  └─────┬──────┘   └──────┬──────┘   └────────┬─────────┘  │
//! │        │  rotate         │  flush            │            │
//! │        └─────────►       └─────────►         │            │
//! │                                              │            │
//! │  ┌───────────────────────────────────────────┘            │
//! │  │   Background compaction (level N → N + 1)              │
//! │  └────────────────────────────────────────────────────┐   │
//! │                                                       │   │
//! │  ┌─────────────────────────────────────────────────┐  │   │
//! │  │   VersionSet + MANIFEST (per-level file lists)  │◄─┘   │
//! │  └─────────────────────────────────────────────────┘      │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Database core — open, read, write, snapshots, iteration, compaction |
//! | [`memtable`] | Arena-backed skip list holding recently written entries |
//! | [`wal`] | Block-framed, CRC-protected write-ahead log (also the MANIFEST format) |
//! | [`sstable`] | Immutable sorted table files: blocks, filters, builder, reader |
//! | [`version`] | Per-level file metadata, MANIFEST edits, compaction picking |
//! | [`cache`] | Sharded LRU block cache and table-handle cache |
//! | [`compaction`] | Picked-compaction plans and their budgets |
//! | [`comparator`] | Key ordering contracts |
//! | [`keys`] | Internal key model: sequence numbers, tombstone tags, lookup keys |
//! | [`encoding`] | Fixed/varint wire primitives shared by every on-disk format |
//! | [`options`] | Configuration |
//! | [`iterator`] | Internal iterator contract and k-way merge |
//!
//! ## Key properties
//!
//! - **Write-ahead logging** — a write is acknowledged only after its
//!   batch is appended to the log (and fsync'd when asked), so committed
//!   data survives crashes.
//! - **Atomic batches** — a [`engine::WriteBatch`] is applied under one
//!   sequence-number range; readers observe all of it or none of it.
//! - **Snapshot reads** — a [`engine::Snapshot`] pins a sequence number;
//!   reads through it are immune to later writes and compactions.
//! - **Leveled compaction** — level 0 may overlap; deeper levels are
//!   disjoint and searched with one file probe each. A single background
//!   worker keeps level sizes within their budgets.
//! - **Bloom-filtered lookups** — optional per-table filters answer
//!   "definitely absent" before any data block is read.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use stratumdb::engine::Engine;
//! use stratumdb::options::{Options, ReadOptions, WriteOptions};
//!
//! let options = Options {
//!     create_if_missing: true,
//!     ..Options::default()
//! };
//! let db = Engine::open("/tmp/my-db", options).unwrap();
//!
//! let wo = WriteOptions::default();
//! db.put(&wo, b"hello", b"world").unwrap();
//! assert_eq!(
//!     db.get(&ReadOptions::new(), b"hello").unwrap(),
//!     Some(b"world".to_vec())
//! );
//!
//! db.delete(&wo, b"hello").unwrap();
//! assert_eq!(db.get(&ReadOptions::new(), b"hello").unwrap(), None);
//! ```

pub mod cache;
pub mod compaction;
pub mod comparator;
pub mod encoding;
pub mod engine;
pub mod iterator;
pub mod keys;
pub mod memtable;
pub mod options;
pub mod sstable;
pub mod version;
pub mod wal;

pub use engine::{Engine, EngineError, Snapshot, WriteBatch};
pub use options::{Options, ReadOptions, WriteOptions};
