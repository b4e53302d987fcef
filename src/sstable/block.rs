//! Data block format: prefix-compressed entries plus a restart array.
//!
//! ```text
//! entry := shared:varint32 ‖ non_shared:varint32 ‖ value_len:varint32
//!          ‖ key_delta[non_shared] ‖ value[value_len]
//! block := entry* ‖ restart_offset:fixed32 × R ‖ num_restarts:fixed32
//! ```
//!
//! `shared` counts the key bytes reused from the previous entry. Every
//! `restart_interval` entries the prefix resets (`shared = 0`) and the
//! entry's offset joins the restart array, giving seeks a binary-search
//! ladder into the block.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::encoding::{get_fixed32, get_varint32, put_fixed32, put_varint32};
use crate::iterator::InternalIterator;

use super::TableError;

// ------------------------------------------------------------------------------------------------
// BlockBuilder
// ------------------------------------------------------------------------------------------------

/// Streaming builder for one block. Keys must arrive in strictly
/// increasing order.
pub struct BlockBuilder {
    restart_interval: usize,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    /// Entries since the last restart point.
    counter: usize,
    finished: bool,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        debug_assert!(restart_interval >= 1);
        Self {
            restart_interval,
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            finished: false,
            last_key: Vec::new(),
        }
    }

    /// Append an entry. `key` must sort after every previously added key.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);

        let mut shared = 0;
        if self.counter < self.restart_interval {
            let min_len = self.last_key.len().min(key.len());
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        }
        let non_shared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, non_shared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        debug_assert_eq!(self.last_key, key);
        self.counter += 1;
    }

    /// Append the restart array and return the finished block payload.
    pub fn finish(&mut self) -> &[u8] {
        for &restart in &self.restarts {
            put_fixed32(&mut self.buffer, restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        &self.buffer
    }

    /// Bytes the finished block would occupy right now.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.finished = false;
        self.last_key.clear();
    }
}

// ------------------------------------------------------------------------------------------------
// Block
// ------------------------------------------------------------------------------------------------

/// A decoded, immutable block. Shared through `Arc` by the block cache and
/// any iterators positioned inside it.
pub struct Block {
    data: Vec<u8>,
    /// Offset of the restart array within `data`.
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    /// Take ownership of block payload bytes (trailer already stripped).
    pub fn new(data: Vec<u8>) -> Result<Self, TableError> {
        if data.len() < 4 {
            return Err(TableError::Corruption("block too small".into()));
        }
        let num_restarts = get_fixed32(&data[data.len() - 4..])?;
        let max_restarts = (data.len() as u64 - 4) / 4;
        if u64::from(num_restarts) > max_restarts {
            return Err(TableError::Corruption("bad restart count".into()));
        }
        let restart_offset = data.len() - 4 - num_restarts as usize * 4;
        Ok(Self {
            data,
            restart_offset,
            num_restarts,
        })
    }

    /// In-memory footprint used as the block-cache charge.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn restart_point(&self, index: u32) -> usize {
        let at = self.restart_offset + index as usize * 4;
        get_fixed32(&self.data[at..]).unwrap_or(0) as usize
    }

    /// Cursor over the block's entries.
    pub fn iter(self: &Arc<Self>, comparator: Arc<dyn Comparator>) -> BlockIter {
        BlockIter {
            block: Arc::clone(self),
            comparator,
            current: self.restart_offset,
            restart_index: self.num_restarts,
            key: Vec::new(),
            value_range: (0, 0),
            error: None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// BlockIter
// ------------------------------------------------------------------------------------------------

/// Decode the entry header at `offset`.
///
/// Returns `(shared, non_shared, value_len, header_len)`.
fn decode_entry_header(data: &[u8], offset: usize) -> Option<(usize, usize, usize, usize)> {
    let slice = data.get(offset..)?;
    let (shared, n1) = get_varint32(slice).ok()?;
    let (non_shared, n2) = get_varint32(&slice[n1..]).ok()?;
    let (value_len, n3) = get_varint32(&slice[n1 + n2..]).ok()?;
    let header = n1 + n2 + n3;
    if slice.len() < header + non_shared as usize + value_len as usize {
        return None;
    }
    Some((
        shared as usize,
        non_shared as usize,
        value_len as usize,
        header,
    ))
}

/// Iterator over a block's entries.
///
/// Invalid either past the ends or after a corruption, which is then
/// visible through `status()`.
pub struct BlockIter {
    block: Arc<Block>,
    comparator: Arc<dyn Comparator>,
    /// Offset of the current entry; `restart_offset` means invalid.
    current: usize,
    /// Restart block containing the current entry.
    restart_index: u32,
    /// Materialized key of the current entry (prefix decompressed).
    key: Vec<u8>,
    /// Value location within `block.data`.
    value_range: (usize, usize),
    error: Option<String>,
}

impl BlockIter {
    fn corrupt(&mut self) {
        self.error = Some("bad entry in block".into());
        self.current = self.block.restart_offset;
        self.key.clear();
        self.value_range = (0, 0);
    }

    /// Offset just past the current entry.
    fn next_entry_offset(&self) -> usize {
        self.value_range.0 + self.value_range.1
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        let offset = self.block.restart_point(index);
        // parse_next_entry picks up from the value sentinel.
        self.value_range = (offset, 0);
    }

    /// Decode the entry at `next_entry_offset`, extending `key`.
    fn parse_next_entry(&mut self) -> bool {
        let offset = self.next_entry_offset();
        if offset >= self.block.restart_offset {
            // Ran off the end.
            self.current = self.block.restart_offset;
            self.restart_index = self.block.num_restarts;
            return false;
        }

        match decode_entry_header(&self.block.data, offset) {
            Some((shared, non_shared, value_len, header)) if shared <= self.key.len() => {
                self.current = offset;
                self.key.truncate(shared);
                let delta_start = offset + header;
                self.key
                    .extend_from_slice(&self.block.data[delta_start..delta_start + non_shared]);
                self.value_range = (delta_start + non_shared, value_len);
                while self.restart_index + 1 < self.block.num_restarts
                    && self.block.restart_point(self.restart_index + 1) < self.current
                {
                    self.restart_index += 1;
                }
                true
            }
            _ => {
                self.corrupt();
                false
            }
        }
    }
}

impl InternalIterator for BlockIter {
    fn valid(&self) -> bool {
        self.error.is_none() && self.current < self.block.restart_offset
    }

    fn seek_to_first(&mut self) {
        if self.error.is_some() {
            return;
        }
        if self.block.num_restarts == 0 {
            self.corrupt();
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    fn seek_to_last(&mut self) {
        if self.error.is_some() {
            return;
        }
        if self.block.num_restarts == 0 {
            self.corrupt();
            return;
        }
        self.seek_to_restart_point(self.block.num_restarts - 1);
        // Walk forward to the final entry.
        while self.parse_next_entry() && self.next_entry_offset() < self.block.restart_offset {}
    }

    fn seek(&mut self, target: &[u8]) {
        if self.error.is_some() {
            return;
        }

        // Binary-search the restart array for the last restart whose key
        // is strictly less than the target.
        let mut left = 0u32;
        let mut right = self.block.num_restarts.saturating_sub(1);
        while left < right {
            let mid = (left + right + 1) / 2;
            let offset = self.block.restart_point(mid);
            match decode_entry_header(&self.block.data, offset) {
                Some((0, non_shared, _, header)) => {
                    let key_start = offset + header;
                    let mid_key = &self.block.data[key_start..key_start + non_shared];
                    if self.comparator.compare(mid_key, target) == Ordering::Less {
                        left = mid;
                    } else {
                        right = mid - 1;
                    }
                }
                _ => {
                    // Restart entries always have shared == 0.
                    self.corrupt();
                    return;
                }
            }
        }

        // Linear scan within the restart region.
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_entry() {
                return;
            }
            if self.comparator.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_entry();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let original = self.current;

        // Back up to the restart point before the current entry.
        while self.block.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                // Already at the first entry.
                self.current = self.block.restart_offset;
                self.restart_index = self.block.num_restarts;
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        // Scan forward until the entry just before `original`.
        while self.parse_next_entry() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        let (start, len) = self.value_range;
        &self.block.data[start..start + len]
    }

    fn status(&self) -> Result<(), TableError> {
        match &self.error {
            None => Ok(()),
            Some(reason) => Err(TableError::Corruption(reason.clone())),
        }
    }
}
