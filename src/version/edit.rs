//! Version edits: the deltas recorded in the MANIFEST.
//!
//! Each edit is a set of tagged fields; unknown tags make the descriptor
//! unreadable and are treated as corruption. Field tags are part of the
//! on-disk format and must never be renumbered:
//!
//! | Field            | Tag |
//! |------------------|-----|
//! | Comparator       | 1   |
//! | LogNumber        | 2   |
//! | NextFileNumber   | 3   |
//! | LastSequence     | 4   |
//! | CompactPointer   | 5   |
//! | DeletedFile      | 6   |
//! | NewFile          | 7   |
//! | PrevLogNumber    | 9   |

use std::collections::BTreeSet;

use crate::encoding::{
    get_length_prefixed_slice, get_varint32, get_varint64, put_length_prefixed_slice,
    put_varint32, put_varint64,
};
use crate::keys::InternalKey;

use super::{NUM_LEVELS, VersionError};

const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;
const TAG_PREV_LOG_NUMBER: u32 = 9;

/// A table file added by an edit, by value (the in-memory
/// [`FileMetaData`](super::FileMetaData) carries runtime state that does
/// not persist).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
}

/// A delta over the current version's file sets and counters.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: BTreeSet<(usize, u64)>,
    pub new_files: Vec<(usize, NewFile)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Record the table `file` being added at `level`.
    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files.push((
            level,
            NewFile {
                number,
                file_size,
                smallest,
                largest,
            },
        ));
    }

    /// Record the table `number` being removed from `level`.
    pub fn remove_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    /// Serialize to the tagged wire form.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        if let Some(name) = &self.comparator_name {
            put_varint32(buf, TAG_COMPARATOR);
            put_length_prefixed_slice(buf, name.as_bytes());
        }
        if let Some(log_number) = self.log_number {
            put_varint32(buf, TAG_LOG_NUMBER);
            put_varint64(buf, log_number);
        }
        if let Some(prev_log_number) = self.prev_log_number {
            put_varint32(buf, TAG_PREV_LOG_NUMBER);
            put_varint64(buf, prev_log_number);
        }
        if let Some(next_file_number) = self.next_file_number {
            put_varint32(buf, TAG_NEXT_FILE_NUMBER);
            put_varint64(buf, next_file_number);
        }
        if let Some(last_sequence) = self.last_sequence {
            put_varint32(buf, TAG_LAST_SEQUENCE);
            put_varint64(buf, last_sequence);
        }
        for (level, key) in &self.compact_pointers {
            put_varint32(buf, TAG_COMPACT_POINTER);
            put_varint32(buf, *level as u32);
            put_length_prefixed_slice(buf, key.encoded());
        }
        for (level, number) in &self.deleted_files {
            put_varint32(buf, TAG_DELETED_FILE);
            put_varint32(buf, *level as u32);
            put_varint64(buf, *number);
        }
        for (level, file) in &self.new_files {
            put_varint32(buf, TAG_NEW_FILE);
            put_varint32(buf, *level as u32);
            put_varint64(buf, file.number);
            put_varint64(buf, file.file_size);
            put_length_prefixed_slice(buf, file.smallest.encoded());
            put_length_prefixed_slice(buf, file.largest.encoded());
        }
    }

    /// Parse the tagged wire form.
    pub fn decode_from(data: &[u8]) -> Result<Self, VersionError> {
        let mut edit = Self::default();
        let mut cursor = data;

        let bad = |what: &str| VersionError::Corruption(format!("VersionEdit: {what}"));

        while !cursor.is_empty() {
            let (tag, n) = get_varint32(cursor).map_err(|_| bad("truncated tag"))?;
            cursor = &cursor[n..];
            match tag {
                TAG_COMPARATOR => {
                    let (name, n) =
                        get_length_prefixed_slice(cursor).map_err(|_| bad("comparator name"))?;
                    edit.comparator_name = Some(
                        String::from_utf8(name.to_vec())
                            .map_err(|_| bad("comparator name not utf-8"))?,
                    );
                    cursor = &cursor[n..];
                }
                TAG_LOG_NUMBER => {
                    let (value, n) = get_varint64(cursor).map_err(|_| bad("log number"))?;
                    edit.log_number = Some(value);
                    cursor = &cursor[n..];
                }
                TAG_PREV_LOG_NUMBER => {
                    let (value, n) = get_varint64(cursor).map_err(|_| bad("prev log number"))?;
                    edit.prev_log_number = Some(value);
                    cursor = &cursor[n..];
                }
                TAG_NEXT_FILE_NUMBER => {
                    let (value, n) = get_varint64(cursor).map_err(|_| bad("next file number"))?;
                    edit.next_file_number = Some(value);
                    cursor = &cursor[n..];
                }
                TAG_LAST_SEQUENCE => {
                    let (value, n) = get_varint64(cursor).map_err(|_| bad("last sequence"))?;
                    edit.last_sequence = Some(value);
                    cursor = &cursor[n..];
                }
                TAG_COMPACT_POINTER => {
                    let (level, n) = decode_level(cursor).map_err(|_| bad("compact pointer"))?;
                    cursor = &cursor[n..];
                    let (key, n) =
                        get_length_prefixed_slice(cursor).map_err(|_| bad("compact pointer"))?;
                    edit.compact_pointers
                        .push((level, InternalKey::from_encoded(key.to_vec())));
                    cursor = &cursor[n..];
                }
                TAG_DELETED_FILE => {
                    let (level, n) = decode_level(cursor).map_err(|_| bad("deleted file"))?;
                    cursor = &cursor[n..];
                    let (number, n) = get_varint64(cursor).map_err(|_| bad("deleted file"))?;
                    edit.deleted_files.insert((level, number));
                    cursor = &cursor[n..];
                }
                TAG_NEW_FILE => {
                    let (level, n) = decode_level(cursor).map_err(|_| bad("new file"))?;
                    cursor = &cursor[n..];
                    let (number, n) = get_varint64(cursor).map_err(|_| bad("new file"))?;
                    cursor = &cursor[n..];
                    let (file_size, n) = get_varint64(cursor).map_err(|_| bad("new file"))?;
                    cursor = &cursor[n..];
                    let (smallest, n) =
                        get_length_prefixed_slice(cursor).map_err(|_| bad("new file"))?;
                    cursor = &cursor[n..];
                    let (largest, n) =
                        get_length_prefixed_slice(cursor).map_err(|_| bad("new file"))?;
                    cursor = &cursor[n..];
                    edit.new_files.push((
                        level,
                        NewFile {
                            number,
                            file_size,
                            smallest: InternalKey::from_encoded(smallest.to_vec()),
                            largest: InternalKey::from_encoded(largest.to_vec()),
                        },
                    ));
                }
                other => {
                    return Err(bad(&format!("unknown tag {other}")));
                }
            }
        }
        Ok(edit)
    }
}

/// Decode a level field and bounds-check it.
fn decode_level(buf: &[u8]) -> Result<(usize, usize), VersionError> {
    let (level, n) =
        get_varint32(buf).map_err(|_| VersionError::Corruption("truncated level".into()))?;
    let level = level as usize;
    if level >= NUM_LEVELS {
        return Err(VersionError::Corruption(format!(
            "level {level} out of range"
        )));
    }
    Ok((level, n))
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ValueType;

    fn key(user: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(user, seq, ValueType::Value)
    }

    fn round_trip(edit: &VersionEdit) -> VersionEdit {
        let mut buf = Vec::new();
        edit.encode_to(&mut buf);
        VersionEdit::decode_from(&buf).unwrap()
    }

    #[test]
    fn test_empty_edit_round_trip() {
        let edit = VersionEdit::new();
        assert_eq!(round_trip(&edit), edit);
    }

    #[test]
    fn test_full_edit_round_trip() {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some("stratumdb.BytewiseComparator".into());
        edit.log_number = Some(11);
        edit.prev_log_number = Some(9);
        edit.next_file_number = Some(42);
        edit.last_sequence = Some(7_777_777);
        edit.set_compact_pointer(1, key(b"pivot", 1000));
        edit.remove_file(2, 17);
        edit.remove_file(0, 3);
        edit.add_file(0, 18, 4096, key(b"a", 1), key(b"m", 900));
        edit.add_file(3, 19, 1 << 20, key(b"n", 901), key(b"z", 1800));

        assert_eq!(round_trip(&edit), edit);
    }

    #[test]
    fn test_many_round_trips_accumulate_nothing() {
        let mut edit = VersionEdit::new();
        for i in 0..10u64 {
            edit.add_file(
                (i % 4) as usize,
                100 + i,
                1024 * i,
                key(format!("a{i}").as_bytes(), i),
                key(format!("b{i}").as_bytes(), i + 1),
            );
        }
        let mut current = edit.clone();
        for _ in 0..4 {
            current = round_trip(&current);
        }
        assert_eq!(current, edit);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut buf = Vec::new();
        put_varint32(&mut buf, 99);
        assert!(VersionEdit::decode_from(&buf).is_err());
    }

    #[test]
    fn test_out_of_range_level_rejected() {
        let mut buf = Vec::new();
        put_varint32(&mut buf, TAG_DELETED_FILE);
        put_varint32(&mut buf, NUM_LEVELS as u32);
        put_varint64(&mut buf, 5);
        assert!(VersionEdit::decode_from(&buf).is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let mut edit = VersionEdit::new();
        edit.add_file(1, 5, 1000, key(b"a", 1), key(b"b", 2));
        let mut buf = Vec::new();
        edit.encode_to(&mut buf);
        buf.truncate(buf.len() - 3);
        assert!(VersionEdit::decode_from(&buf).is_err());
    }
}
