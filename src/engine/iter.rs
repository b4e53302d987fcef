//! The user-facing database iterator.
//!
//! Wraps the merging iterator over (memtables + table files) and lifts
//! internal entries into user-visible ones:
//!
//! - entries with a sequence above the iterator's snapshot are invisible;
//! - only the newest visible entry per user key is surfaced;
//! - a visible tombstone hides every older entry for its user key.
//!
//! Roughly every megabyte of keys and values read, the iterator charges a
//! read sample against the files covering the current key, which can arm
//! seek-driven compaction of a file that keeps getting scanned over.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::iterator::{InternalIterator, MergingIterator};
use crate::keys::{
    ParsedInternalKey, SequenceNumber, VALUE_TYPE_FOR_SEEK, ValueType, append_internal_key,
};
use crate::version::{READ_BYTES_PERIOD, Version};

use super::{EngineError, EngineShared};

#[derive(PartialEq, Clone, Copy)]
enum Direction {
    Forward,
    Reverse,
}

/// Iterator over user keys and values at a fixed sequence snapshot.
///
/// The iterator pins the version (and through it every table file) plus
/// both memtables it reads from, so it stays valid after the engine moves
/// on — it simply keeps showing its snapshot.
pub struct DbIterator {
    shared: Arc<EngineShared>,
    version: Arc<Version>,
    ucmp: Arc<dyn Comparator>,
    iter: MergingIterator,
    sequence: SequenceNumber,

    direction: Direction,
    valid: bool,
    /// Forward: scratch for the hidden-key skip. Reverse: the current
    /// user key.
    saved_key: Vec<u8>,
    /// Reverse only: the current value.
    saved_value: Vec<u8>,
    status: Option<EngineError>,

    /// Bytes left until the next read sample.
    bytes_until_read_sampling: u64,
    rng_state: u64,
}

impl DbIterator {
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        version: Arc<Version>,
        iter: MergingIterator,
        sequence: SequenceNumber,
    ) -> Self {
        let ucmp = Arc::clone(shared.icmp.user_comparator());

        // Distinct seed per iterator so sampling points decorrelate.
        static SEED: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
        let seed = SEED.fetch_add(0x9e37_79b9_7f4a_7c15, std::sync::atomic::Ordering::Relaxed);

        let mut it = Self {
            shared,
            version,
            ucmp,
            iter,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            status: None,
            bytes_until_read_sampling: 0,
            rng_state: seed | 1,
        };
        it.bytes_until_read_sampling = it.random_compaction_period();
        it
    }

    /// True when positioned on an entry.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The current user key. Requires `valid()`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => {
                ParsedInternalKey::decode(self.iter.key())
                    .map(|p| p.user_key)
                    .unwrap_or_default()
            }
            Direction::Reverse => &self.saved_key,
        }
    }

    /// The current value. Requires `valid()`.
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.iter.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    /// First error encountered, surfaced after the iterator went invalid.
    pub fn status(&self) -> Result<(), EngineError> {
        if let Some(err) = &self.status {
            return Err(err.clone());
        }
        self.iter.status()?;
        Ok(())
    }

    /// Position on the first user key.
    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.iter.seek_to_first();
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    /// Position on the last user key.
    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.iter.seek_to_last();
        self.find_prev_user_entry();
    }

    /// Position on the first user key `>= target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        append_internal_key(
            &mut self.saved_key,
            target,
            self.sequence,
            VALUE_TYPE_FOR_SEEK,
        );
        let lookup = std::mem::take(&mut self.saved_key);
        self.iter.seek(&lookup);
        self.saved_key = lookup;
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    /// Advance to the next user key.
    pub fn next(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // The underlying iterator sits just before the entries for
            // the current key (or off the front).
            if !self.iter.valid() {
                self.iter.seek_to_first();
            } else {
                self.iter.next();
            }
            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
            // saved_key already holds the current user key to skip past.
        } else {
            // Remember the key so every older version of it is skipped.
            let user_key = self.current_user_key();
            self.saved_key.clear();
            self.saved_key.extend_from_slice(&user_key);
            self.iter.next();
            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }

        self.find_next_user_entry(true);
    }

    /// Retreat to the previous user key.
    pub fn prev(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Forward {
            // Walk backwards off the entries for the current user key.
            let user_key = self.current_user_key();
            self.saved_key.clear();
            self.saved_key.extend_from_slice(&user_key);
            loop {
                self.iter.prev();
                if !self.iter.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                let prev_user = self.parse_current().map(|p| p.user_key.to_vec());
                if let Some(prev_user) = prev_user {
                    if self.ucmp.compare(&prev_user, &self.saved_key) == Ordering::Less {
                        break;
                    }
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    fn current_user_key(&self) -> Vec<u8> {
        ParsedInternalKey::decode(self.iter.key())
            .map(|p| p.user_key.to_vec())
            .unwrap_or_default()
    }

    /// Parse the current entry, charging read samples as bytes go by.
    fn parse_current(&mut self) -> Option<ParsedInternalKey<'_>> {
        let bytes_read = (self.iter.key().len() + self.iter.value().len()) as u64;
        while self.bytes_until_read_sampling < bytes_read {
            let period = self.random_compaction_period();
            self.bytes_until_read_sampling += period;
            if self.version.record_read_sample(self.iter.key()) {
                self.shared.schedule_from_read_sample();
            }
        }
        self.bytes_until_read_sampling -= bytes_read;

        let parsed = ParsedInternalKey::decode(self.iter.key());
        if parsed.is_none() && self.status.is_none() {
            self.status = Some(EngineError::Corruption(
                "corrupted internal key in iterator".into(),
            ));
        }
        parsed
    }

    /// Skip to the newest visible, non-deleted entry at or after the
    /// current position. When `skipping`, entries for user keys at or
    /// before `saved_key` are hidden.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.direction == Direction::Forward);
        loop {
            if let Some(parsed) = self.parse_current() {
                let (sequence, value_type, user_key) =
                    (parsed.sequence, parsed.value_type, parsed.user_key.to_vec());
                if sequence <= self.sequence {
                    match value_type {
                        ValueType::Deletion => {
                            // Every older entry for this key is shadowed.
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(&user_key);
                            skipping = true;
                        }
                        ValueType::Value => {
                            let hidden = skipping
                                && self.ucmp.compare(&user_key, &self.saved_key)
                                    != Ordering::Greater;
                            if !hidden {
                                self.saved_key.clear();
                                self.valid = true;
                                return;
                            }
                        }
                    }
                }
            }
            self.iter.next();
            if !self.iter.valid() {
                break;
            }
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Position the underlying iterator just before the newest visible
    /// entry of the previous user key, materializing it into
    /// `saved_key`/`saved_value`.
    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);

        let mut value_type = ValueType::Deletion;
        if self.iter.valid() {
            loop {
                if let Some(parsed) = self.parse_current() {
                    let (sequence, entry_type, user_key) =
                        (parsed.sequence, parsed.value_type, parsed.user_key.to_vec());
                    if sequence <= self.sequence {
                        if value_type != ValueType::Deletion
                            && self.ucmp.compare(&user_key, &self.saved_key) == Ordering::Less
                        {
                            // A live entry for the key after this one is
                            // already saved; stop just before its block.
                            break;
                        }
                        value_type = entry_type;
                        if value_type == ValueType::Deletion {
                            self.saved_key.clear();
                            self.saved_value.clear();
                        } else {
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(&user_key);
                            self.saved_value.clear();
                            self.saved_value.extend_from_slice(self.iter.value());
                        }
                    }
                }
                self.iter.prev();
                if !self.iter.valid() {
                    break;
                }
            }
        }

        if value_type == ValueType::Deletion {
            // Ran off the front.
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }

    /// Uniform sample in `[0, 2 × READ_BYTES_PERIOD)` so sampling points
    /// are uncorrelated across iterators.
    fn random_compaction_period(&mut self) -> u64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        self.rng_state % (2 * READ_BYTES_PERIOD)
    }
}
