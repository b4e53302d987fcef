//! # Memtable Module
//!
//! The mutable in-memory layer of the store: a skip list over
//! arena-allocated entries, keyed by internal key.
//!
//! ## Design Invariants
//!
//! - Entries are never overwritten or removed; a newer write for the same
//!   user key is a distinct entry with a higher sequence number.
//! - Ordering is internal-key order: user key ascending, sequence
//!   descending, so the first entry at or after a lookup key is the newest
//!   visible version.
//! - One writer at a time (serialized by the engine's writer queue); any
//!   number of concurrent readers.
//!
//! ## Entry encoding
//!
//! ```text
//! varint32(internal_key_len) ‖ user_key ‖ fixed64(pack(seq, type))
//! ‖ varint32(value_len) ‖ value
//! ```
//!
//! The whole entry lives in the arena; skip-list nodes hold a pointer to
//! its first byte. Memory is reclaimed when the memtable (shared as
//! `Arc<MemTable>`) drops.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod arena;
pub mod skiplist;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::Arc;

use crate::comparator::{Comparator, InternalKeyComparator};
use crate::encoding::varint_length;
use crate::iterator::InternalIterator;
use crate::keys::{
    INTERNAL_KEY_TRAILER, LookupKey, SequenceNumber, ValueType, pack_sequence_and_type,
    unpack_sequence_and_type,
};
use crate::sstable::TableError;

use arena::Arena;
use skiplist::{KeyComparator, SkipList, SkipListCursor};

// ------------------------------------------------------------------------------------------------
// Entry decoding helpers
// ------------------------------------------------------------------------------------------------

/// Decode the varint32 at `ptr` one byte at a time.
///
/// # Safety
///
/// `ptr` must address a well-formed entry: every byte read is part of the
/// entry's own length prefix, so no read leaves the allocation.
#[inline]
unsafe fn read_varint32_raw(mut ptr: *const u8) -> (u32, *const u8) {
    let mut value: u32 = 0;
    let mut shift = 0u32;
    loop {
        let byte = unsafe { *ptr };
        ptr = unsafe { ptr.add(1) };
        if byte < 0x80 {
            value |= u32::from(byte) << shift;
            return (value, ptr);
        }
        value |= u32::from(byte & 0x7f) << shift;
        shift += 7;
    }
}

/// The internal-key slice of the entry at `ptr`.
///
/// # Safety
///
/// `ptr` must address an entry produced by [`MemTable::add`] that is still
/// alive.
#[inline]
unsafe fn entry_internal_key<'a>(ptr: *const u8) -> &'a [u8] {
    let (len, data) = unsafe { read_varint32_raw(ptr) };
    unsafe { std::slice::from_raw_parts(data, len as usize) }
}

/// The value slice of the entry at `ptr`.
///
/// # Safety
///
/// As [`entry_internal_key`].
#[inline]
unsafe fn entry_value<'a>(ptr: *const u8) -> &'a [u8] {
    let (klen, data) = unsafe { read_varint32_raw(ptr) };
    let value_ptr = unsafe { data.add(klen as usize) };
    let (vlen, vdata) = unsafe { read_varint32_raw(value_ptr) };
    unsafe { std::slice::from_raw_parts(vdata, vlen as usize) }
}

// ------------------------------------------------------------------------------------------------
// Skip-list comparator over encoded entries
// ------------------------------------------------------------------------------------------------

/// Orders encoded memtable entries by their internal keys.
#[derive(Clone)]
struct EntryComparator {
    icmp: InternalKeyComparator,
}

impl KeyComparator for EntryComparator {
    unsafe fn compare_raw(&self, a: *const u8, b: *const u8) -> CmpOrdering {
        let ka = unsafe { entry_internal_key(a) };
        let kb = unsafe { entry_internal_key(b) };
        self.icmp.compare(ka, kb)
    }
}

// ------------------------------------------------------------------------------------------------
// MemTable
// ------------------------------------------------------------------------------------------------

/// Result of a memtable point lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum MemTableGet {
    /// The newest visible entry is a live value.
    Found(Vec<u8>),
    /// The newest visible entry is a tombstone.
    Deleted,
    /// This memtable holds no entry for the key at the lookup snapshot.
    Missing,
}

/// Skip-list + arena bundle holding recently written entries.
///
/// Shared as `Arc<MemTable>`: the engine holds one reference for the
/// active (or immutable) slot, plus one per in-flight reader, iterator,
/// or flush worker.
pub struct MemTable {
    icmp: InternalKeyComparator,
    arena: Arc<Arena>,
    table: SkipList<EntryComparator>,
}

impl MemTable {
    pub fn new(icmp: InternalKeyComparator) -> Self {
        let arena = Arc::new(Arena::new());
        let table = SkipList::new(
            EntryComparator { icmp: icmp.clone() },
            Arc::clone(&arena),
        );
        Self { icmp, arena, table }
    }

    /// Insert an entry.
    ///
    /// Callers must serialize writers; concurrent readers are fine. The
    /// engine's head-of-queue writer (and WAL replay during recovery) are
    /// the only callers.
    pub fn add(&self, seq: SequenceNumber, ty: ValueType, user_key: &[u8], value: &[u8]) {
        let internal_key_len = user_key.len() + INTERNAL_KEY_TRAILER;
        let encoded_len = varint_length(internal_key_len as u64)
            + internal_key_len
            + varint_length(value.len() as u64)
            + value.len();

        let entry = self.arena.alloc(encoded_len);

        // SAFETY: `entry` addresses `encoded_len` writable bytes; the
        // cursor below never runs past them.
        unsafe {
            let mut p = entry.as_ptr();
            p = write_varint32_raw(p, internal_key_len as u32);
            ptr::copy_nonoverlapping(user_key.as_ptr(), p, user_key.len());
            p = p.add(user_key.len());
            let packed = pack_sequence_and_type(seq, ty).to_le_bytes();
            ptr::copy_nonoverlapping(packed.as_ptr(), p, 8);
            p = p.add(8);
            p = write_varint32_raw(p, value.len() as u32);
            ptr::copy_nonoverlapping(value.as_ptr(), p, value.len());
            debug_assert_eq!(
                p.add(value.len()) as usize - entry.as_ptr() as usize,
                encoded_len
            );
        }

        self.table.insert(entry.as_ptr());
    }

    /// Look up the newest entry visible at the lookup key's snapshot.
    pub fn get(&self, key: &LookupKey) -> MemTableGet {
        let mut cursor = SkipListCursor::new(&self.table);
        cursor.seek(key.memtable_key().as_ptr());
        if !cursor.valid() {
            return MemTableGet::Missing;
        }

        // SAFETY: the cursor points at a live entry in our arena.
        let entry = cursor.key();
        let internal_key = unsafe { entry_internal_key(entry) };
        let user_key = &internal_key[..internal_key.len() - INTERNAL_KEY_TRAILER];
        if self
            .icmp
            .user_comparator()
            .compare(user_key, key.user_key())
            != CmpOrdering::Equal
        {
            return MemTableGet::Missing;
        }

        let mut trailer = [0u8; 8];
        trailer.copy_from_slice(&internal_key[internal_key.len() - INTERNAL_KEY_TRAILER..]);
        let (_seq, tag) = unpack_sequence_and_type(u64::from_le_bytes(trailer));
        match ValueType::from_byte(tag) {
            Some(ValueType::Value) => {
                MemTableGet::Found(unsafe { entry_value(entry) }.to_vec())
            }
            Some(ValueType::Deletion) => MemTableGet::Deleted,
            // Unreachable for entries we wrote; treat as absent.
            None => MemTableGet::Missing,
        }
    }

    /// Approximate bytes consumed by this memtable.
    pub fn approximate_memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    /// Iterator over all entries in internal-key order. The iterator keeps
    /// the memtable alive.
    pub fn iter(self: &Arc<Self>) -> MemTableIter {
        let cursor = SkipListCursor::new(&self.table);
        MemTableIter {
            _mem: Arc::clone(self),
            cursor,
            seek_scratch: Vec::new(),
        }
    }
}

/// Write a varint32 at `p`, returning the advanced cursor.
///
/// # Safety
///
/// `p` must have room for `varint_length(value)` bytes.
#[inline]
unsafe fn write_varint32_raw(mut p: *mut u8, mut value: u32) -> *mut u8 {
    while value >= 0x80 {
        unsafe {
            *p = (value as u8) | 0x80;
            p = p.add(1);
        }
        value >>= 7;
    }
    unsafe {
        *p = value as u8;
        p.add(1)
    }
}

// ------------------------------------------------------------------------------------------------
// MemTableIter
// ------------------------------------------------------------------------------------------------

/// Cursor over a memtable's entries, yielding internal keys and values.
pub struct MemTableIter {
    /// Keeps the arena (and every entry the cursor touches) alive.
    _mem: Arc<MemTable>,
    cursor: SkipListCursor<EntryComparator>,
    /// Buffer for re-encoding seek targets into memtable key format.
    seek_scratch: Vec<u8>,
}

impl InternalIterator for MemTableIter {
    fn valid(&self) -> bool {
        self.cursor.valid()
    }

    fn seek_to_first(&mut self) {
        self.cursor.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.cursor.seek_to_last();
    }

    fn seek(&mut self, target: &[u8]) {
        // Entries are length-prefixed internally; wrap the bare internal
        // key the same way before handing it to the skip list.
        self.seek_scratch.clear();
        crate::encoding::put_varint32(&mut self.seek_scratch, target.len() as u32);
        self.seek_scratch.extend_from_slice(target);
        self.cursor.seek(self.seek_scratch.as_ptr());
    }

    fn next(&mut self) {
        self.cursor.next();
    }

    fn prev(&mut self) {
        self.cursor.prev();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        // SAFETY: the cursor is valid and `self._mem` keeps the arena
        // alive; the returned slice's lifetime is tied to `&self`.
        unsafe { entry_internal_key(self.cursor.key()) }
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        unsafe { entry_value(self.cursor.key()) }
    }

    fn status(&self) -> Result<(), TableError> {
        Ok(())
    }
}
