//! Filter policy contract and the per-table filter block.
//!
//! A [`FilterPolicy`] condenses a set of keys into a compact summary that
//! can answer "definitely absent" for point lookups. The built-in
//! [`BloomFilterPolicy`] targets a ~1% false-positive rate.
//!
//! # Filter block layout
//!
//! ```text
//! filter_0 ‖ filter_1 ‖ … ‖ offset_0:fixed32 … offset_n:fixed32
//! ‖ offset_array_start:fixed32 ‖ base_lg:u8
//! ```
//!
//! Filter `i` covers every key whose data block starts in file-offset
//! range `[i * 2^base_lg, (i+1) * 2^base_lg)`; `base_lg` defaults to 11
//! (one filter per 2 KiB of table).

use std::sync::Arc;

use bloomfilter::Bloom;
use tracing::warn;

use crate::encoding::{get_fixed32, put_fixed32};

/// Base-two log of the byte range covered by one filter.
pub const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// Bloom false-positive rate targeted by the built-in policy.
const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

// ------------------------------------------------------------------------------------------------
// FilterPolicy contract
// ------------------------------------------------------------------------------------------------

/// Summarizes key sets for fast negative point lookups.
///
/// Implementations must be stable: a filter produced by `create_filter`
/// must keep answering `true` from `key_may_match` for every key it was
/// built from, across process restarts.
pub trait FilterPolicy: Send + Sync {
    /// Identifies the policy; stored in the table's metaindex so readers
    /// can pair data with the right implementation.
    fn name(&self) -> &'static str;

    /// Build a summary of `keys` (user keys, unordered, may repeat).
    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8>;

    /// `false` only when `key` is definitely not in the summarized set.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

// ------------------------------------------------------------------------------------------------
// BloomFilterPolicy
// ------------------------------------------------------------------------------------------------

/// Bloom-filter policy at ~1% false positives (≈10 bits per key).
#[derive(Debug, Default, Clone, Copy)]
pub struct BloomFilterPolicy;

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "stratumdb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        let bloom: Result<Bloom<[u8]>, _> =
            Bloom::new_for_fp_rate(keys.len().max(1), BLOOM_FALSE_POSITIVE_RATE);
        match bloom {
            Ok(mut bloom) => {
                for key in keys {
                    bloom.set(key.as_slice());
                }
                bloom.as_slice().to_vec()
            }
            Err(reason) => {
                warn!(reason, "bloom construction failed; emitting empty filter");
                Vec::new()
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.is_empty() {
            // No filter → cannot exclude.
            return true;
        }
        match Bloom::<[u8]>::from_slice(filter) {
            Ok(bloom) => bloom.check(key),
            // A corrupted filter must not hide data.
            Err(_) => true,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// FilterBlockBuilder
// ------------------------------------------------------------------------------------------------

/// Accumulates keys during table construction and emits the filter block.
///
/// Call order: `(start_block add_key*)*` then `finish` once.
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    /// Keys accumulated since the last generated filter.
    keys: Vec<Vec<u8>>,
    /// Concatenated filter payloads.
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        Self {
            policy,
            keys: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Announce that a data block begins at `block_offset`; generates any
    /// filters whose ranges end before it.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    /// Register a key belonging to the currently open data block.
    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    /// Emit the complete filter block.
    pub fn finish(&mut self) -> &[u8] {
        if !self.keys.is_empty() {
            self.generate_filter();
        }

        let offset_array_start = self.result.len() as u32;
        let offsets = std::mem::take(&mut self.filter_offsets);
        for offset in &offsets {
            put_fixed32(&mut self.result, *offset);
        }
        put_fixed32(&mut self.result, offset_array_start);
        self.result.push(FILTER_BASE_LG);
        &self.result
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.keys.is_empty() {
            // Empty range: the offset repeats, yielding a zero-length
            // filter slot.
            return;
        }
        let filter = self.policy.create_filter(&self.keys);
        self.result.extend_from_slice(&filter);
        self.keys.clear();
    }
}

// ------------------------------------------------------------------------------------------------
// FilterBlockReader
// ------------------------------------------------------------------------------------------------

/// Read-side view of a filter block.
pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    /// Start of the offset array within `data`.
    offset_array_start: usize,
    num_filters: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    /// Parse filter block contents; a malformed block yields a reader
    /// that never excludes anything.
    pub fn new(policy: Arc<dyn FilterPolicy>, data: Vec<u8>) -> Self {
        let mut reader = Self {
            policy,
            data,
            offset_array_start: 0,
            num_filters: 0,
            base_lg: FILTER_BASE_LG,
        };

        // Minimum: offset_array_start (4) + base_lg (1).
        if reader.data.len() < 5 {
            reader.data.clear();
            return reader;
        }
        reader.base_lg = reader.data[reader.data.len() - 1];
        let Ok(offset_array_start) = get_fixed32(&reader.data[reader.data.len() - 5..]) else {
            reader.data.clear();
            return reader;
        };
        let offset_array_start = offset_array_start as usize;
        if offset_array_start > reader.data.len() - 5 {
            reader.data.clear();
            return reader;
        }
        reader.offset_array_start = offset_array_start;
        reader.num_filters = (reader.data.len() - 5 - offset_array_start) / 4;
        reader
    }

    /// `false` only when `key` is definitely absent from the data block
    /// starting at `block_offset`.
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            // Out of range: err on the side of presence.
            return true;
        }

        let slot = self.offset_array_start + index * 4;
        let Ok(start) = get_fixed32(&self.data[slot..]) else {
            return true;
        };
        let end = if index + 1 < self.num_filters {
            match get_fixed32(&self.data[slot + 4..]) {
                Ok(end) => end,
                Err(_) => return true,
            }
        } else {
            self.offset_array_start as u32
        };

        let (start, end) = (start as usize, end as usize);
        if start > end || end > self.offset_array_start {
            return true;
        }
        if start == end {
            // Empty filter covers no keys.
            return false;
        }
        self.policy.key_may_match(key, &self.data[start..end])
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_policy_round_trip() {
        let policy = BloomFilterPolicy;
        let keys: Vec<Vec<u8>> = (0..200).map(|i| format!("key-{i}").into_bytes()).collect();
        let filter = policy.create_filter(&keys);

        for key in &keys {
            assert!(policy.key_may_match(key, &filter));
        }

        // False positives are allowed but must be rare.
        let misses = (0..1000)
            .filter(|i| policy.key_may_match(format!("absent-{i}").as_bytes(), &filter))
            .count();
        assert!(misses < 100, "false positive rate too high: {misses}/1000");
    }

    #[test]
    fn test_empty_filter_never_panics() {
        let policy = BloomFilterPolicy;
        assert!(policy.key_may_match(b"anything", &[]));
    }

    #[test]
    fn test_filter_block_single_chunk() {
        let policy = Arc::new(BloomFilterPolicy);
        let mut builder = FilterBlockBuilder::new(policy.clone());
        builder.start_block(0);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        let block = builder.finish().to_vec();

        let reader = FilterBlockReader::new(policy, block);
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(0, b"bar"));
        assert!(!reader.key_may_match(0, b"definitely-missing-key"));
    }

    #[test]
    fn test_filter_block_multiple_ranges() {
        let policy = Arc::new(BloomFilterPolicy);
        let mut builder = FilterBlockBuilder::new(policy.clone());

        builder.start_block(0);
        builder.add_key(b"block0-key");
        // 3 * 2^11 = three filter ranges ahead.
        builder.start_block(3 * FILTER_BASE);
        builder.add_key(b"block3-key");
        let block = builder.finish().to_vec();

        let reader = FilterBlockReader::new(policy, block);
        assert!(reader.key_may_match(0, b"block0-key"));
        assert!(reader.key_may_match(3 * FILTER_BASE, b"block3-key"));

        // The empty intermediate ranges exclude everything.
        assert!(!reader.key_may_match(FILTER_BASE, b"block0-key"));
        assert!(!reader.key_may_match(2 * FILTER_BASE, b"block3-key"));
    }

    #[test]
    fn test_malformed_filter_block_is_permissive() {
        let policy = Arc::new(BloomFilterPolicy);
        let reader = FilterBlockReader::new(policy.clone(), vec![0x01, 0x02]);
        assert!(reader.key_may_match(0, b"whatever"));

        let reader = FilterBlockReader::new(policy, Vec::new());
        assert!(reader.key_may_match(1 << 20, b"whatever"));
    }
}
