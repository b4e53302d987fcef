//! Atomic write batches.
//!
//! A batch is the unit of the write path: every `put`/`delete` call is a
//! one-record batch internally, and the group-commit leader folds queued
//! batches together before a single WAL append. The wire form doubles as
//! the WAL record payload:
//!
//! ```text
//! sequence:fixed64 ‖ count:fixed32 ‖ record*
//! record := 0x01 ‖ varstring(key) ‖ varstring(value)   (put)
//!         | 0x00 ‖ varstring(key)                      (deletion)
//! ```
//!
//! Records within a batch receive consecutive sequence numbers starting
//! at the batch's stamped sequence, so a batch is atomic by construction:
//! a snapshot either covers all of its records or none.

use crate::encoding::{
    get_fixed32, get_fixed64, get_length_prefixed_slice, put_length_prefixed_slice,
};
use crate::keys::{SequenceNumber, ValueType};
use crate::memtable::MemTable;

use super::EngineError;

/// `sequence (8) ‖ count (4)`.
pub const BATCH_HEADER_SIZE: usize = 12;

/// An ordered set of updates applied atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            rep: vec![0; BATCH_HEADER_SIZE],
        }
    }

    /// Queue an insertion or overwrite of `key`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value as u8);
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
    }

    /// Queue a deletion of `key`.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion as u8);
        put_length_prefixed_slice(&mut self.rep, key);
    }

    /// Drop all queued updates.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    /// Bytes this batch will occupy in the log.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Number of queued records.
    pub fn count(&self) -> u32 {
        get_fixed32(&self.rep[8..]).unwrap_or(0)
    }

    pub(crate) fn set_count(&mut self, count: u32) {
        self.rep[8..12].copy_from_slice(&count.to_le_bytes());
    }

    /// Sequence number stamped on the first record.
    pub(crate) fn sequence(&self) -> SequenceNumber {
        get_fixed64(&self.rep).unwrap_or(0)
    }

    pub(crate) fn set_sequence(&mut self, seq: SequenceNumber) {
        self.rep[..8].copy_from_slice(&seq.to_le_bytes());
    }

    /// The full wire form (also the WAL record payload).
    pub(crate) fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Adopt wire bytes read back from the log.
    pub(crate) fn set_contents(&mut self, contents: Vec<u8>) -> Result<(), EngineError> {
        if contents.len() < BATCH_HEADER_SIZE {
            return Err(EngineError::Corruption("log record too small".into()));
        }
        self.rep = contents;
        Ok(())
    }

    /// Append every record of `other`, keeping this batch's sequence.
    pub(crate) fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_SIZE..]);
    }

    /// Visit each record in order.
    pub fn iterate(
        &self,
        mut on_put: impl FnMut(&[u8], &[u8]),
        mut on_delete: impl FnMut(&[u8]),
    ) -> Result<(), EngineError> {
        let mut cursor = &self.rep[BATCH_HEADER_SIZE..];
        let mut found = 0u32;
        while !cursor.is_empty() {
            let tag = cursor[0];
            cursor = &cursor[1..];
            match ValueType::from_byte(tag) {
                Some(ValueType::Value) => {
                    let (key, n) = get_length_prefixed_slice(cursor)
                        .map_err(|_| EngineError::Corruption("bad WriteBatch put".into()))?;
                    cursor = &cursor[n..];
                    let (value, n) = get_length_prefixed_slice(cursor)
                        .map_err(|_| EngineError::Corruption("bad WriteBatch put".into()))?;
                    cursor = &cursor[n..];
                    on_put(key, value);
                }
                Some(ValueType::Deletion) => {
                    let (key, n) = get_length_prefixed_slice(cursor)
                        .map_err(|_| EngineError::Corruption("bad WriteBatch delete".into()))?;
                    cursor = &cursor[n..];
                    on_delete(key);
                }
                None => {
                    return Err(EngineError::Corruption(
                        "unknown WriteBatch record tag".into(),
                    ));
                }
            }
            found += 1;
        }
        if found != self.count() {
            return Err(EngineError::Corruption(
                "WriteBatch count does not match records".into(),
            ));
        }
        Ok(())
    }

    /// Apply every record to `mem`, stamping consecutive sequences from
    /// the batch header.
    pub(crate) fn insert_into(&self, mem: &MemTable) -> Result<(), EngineError> {
        let sequence = std::cell::Cell::new(self.sequence());
        self.iterate(
            |key, value| {
                mem.add(sequence.get(), ValueType::Value, key, value);
                sequence.set(sequence.get() + 1);
            },
            |key| {
                mem.add(sequence.get(), ValueType::Deletion, key, b"");
                sequence.set(sequence.get() + 1);
            },
        )
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::comparator::{BytewiseComparator, InternalKeyComparator};
    use crate::keys::{LookupKey, MAX_SEQUENCE_NUMBER};
    use crate::memtable::MemTableGet;

    fn collect(batch: &WriteBatch) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        let out = std::cell::RefCell::new(Vec::new());
        batch
            .iterate(
                |k, v| out.borrow_mut().push((k.to_vec(), Some(v.to_vec()))),
                |k| out.borrow_mut().push((k.to_vec(), None)),
            )
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_empty_batch() {
        let batch = WriteBatch::new();
        assert_eq!(batch.count(), 0);
        assert_eq!(batch.approximate_size(), BATCH_HEADER_SIZE);
        assert!(collect(&batch).is_empty());
    }

    #[test]
    fn test_put_delete_order_preserved() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.delete(b"b");
        batch.put(b"b", b"2");
        assert_eq!(batch.count(), 3);
        assert_eq!(
            collect(&batch),
            vec![
                (b"a".to_vec(), Some(b"1".to_vec())),
                (b"b".to_vec(), None),
                (b"b".to_vec(), Some(b"2".to_vec())),
            ]
        );
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut batch = WriteBatch::new();
        batch.set_sequence(777);
        batch.put(b"", b"");
        batch.put(b"key", &vec![0xab; 300]);
        batch.delete(b"gone");

        let mut decoded = WriteBatch::new();
        decoded.set_contents(batch.contents().to_vec()).unwrap();
        assert_eq!(decoded, batch);
        assert_eq!(decoded.sequence(), 777);
        assert_eq!(collect(&decoded), collect(&batch));
    }

    #[test]
    fn test_append_merges_counts() {
        let mut a = WriteBatch::new();
        a.put(b"a", b"1");
        let mut b = WriteBatch::new();
        b.delete(b"x");
        b.put(b"y", b"2");
        a.append(&b);
        assert_eq!(a.count(), 3);
        assert_eq!(
            collect(&a),
            vec![
                (b"a".to_vec(), Some(b"1".to_vec())),
                (b"x".to_vec(), None),
                (b"y".to_vec(), Some(b"2".to_vec())),
            ]
        );
    }

    #[test]
    fn test_insert_into_memtable_stamps_sequences() {
        let mem = MemTable::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)));
        let mut batch = WriteBatch::new();
        batch.set_sequence(100);
        batch.put(b"a", b"1");
        batch.put(b"k", b"v1");
        batch.delete(b"k");
        batch.insert_into(&mem).unwrap();

        assert_eq!(
            mem.get(&LookupKey::new(b"a", MAX_SEQUENCE_NUMBER)),
            MemTableGet::Found(b"1".to_vec())
        );
        // The delete at sequence 102 shadows the put at 101.
        assert_eq!(
            mem.get(&LookupKey::new(b"k", MAX_SEQUENCE_NUMBER)),
            MemTableGet::Deleted
        );
        assert_eq!(
            mem.get(&LookupKey::new(b"k", 101)),
            MemTableGet::Found(b"v1".to_vec())
        );
    }

    #[test]
    fn test_corrupt_tag_detected() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        let mut bytes = batch.contents().to_vec();
        bytes[BATCH_HEADER_SIZE] = 0x7f;
        let mut decoded = WriteBatch::new();
        decoded.set_contents(bytes).unwrap();
        assert!(decoded.iterate(|_, _| {}, |_| {}).is_err());
    }

    #[test]
    fn test_truncated_record_detected() {
        let mut batch = WriteBatch::new();
        batch.put(b"abcdef", b"123456");
        let mut bytes = batch.contents().to_vec();
        bytes.truncate(bytes.len() - 2);
        let mut decoded = WriteBatch::new();
        decoded.set_contents(bytes).unwrap();
        assert!(decoded.iterate(|_, _| {}, |_| {}).is_err());
    }
}
