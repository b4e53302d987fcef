#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::comparator::{BytewiseComparator, InternalKeyComparator};
    use crate::iterator::InternalIterator;
    use crate::keys::{ParsedInternalKey, ValueType, append_internal_key};
    use crate::memtable::MemTable;

    fn filled_memtable() -> Arc<MemTable> {
        let mem = Arc::new(MemTable::new(InternalKeyComparator::new(Arc::new(
            BytewiseComparator,
        ))));
        mem.add(1, ValueType::Value, b"apple", b"1");
        mem.add(2, ValueType::Value, b"banana", b"2");
        mem.add(3, ValueType::Value, b"banana", b"2b");
        mem.add(4, ValueType::Deletion, b"cherry", b"");
        mem.add(5, ValueType::Value, b"damson", b"4");
        mem
    }

    #[test]
    fn test_forward_scan_order() {
        let mem = filled_memtable();
        let mut iter = mem.iter();
        iter.seek_to_first();

        let mut seen = Vec::new();
        while iter.valid() {
            let parsed = ParsedInternalKey::decode(iter.key()).unwrap();
            seen.push((parsed.user_key.to_vec(), parsed.sequence));
            iter.next();
        }

        // Same user key: newest sequence first.
        assert_eq!(
            seen,
            vec![
                (b"apple".to_vec(), 1),
                (b"banana".to_vec(), 3),
                (b"banana".to_vec(), 2),
                (b"cherry".to_vec(), 4),
                (b"damson".to_vec(), 5),
            ]
        );
    }

    #[test]
    fn test_seek_and_values() {
        let mem = filled_memtable();
        let mut iter = mem.iter();

        let mut target = Vec::new();
        append_internal_key(
            &mut target,
            b"banana",
            crate::keys::MAX_SEQUENCE_NUMBER,
            ValueType::Value,
        );
        iter.seek(&target);
        assert!(iter.valid());
        let parsed = ParsedInternalKey::decode(iter.key()).unwrap();
        assert_eq!(parsed.user_key, b"banana");
        assert_eq!(parsed.sequence, 3);
        assert_eq!(iter.value(), b"2b");
    }

    #[test]
    fn test_backward_scan() {
        let mem = filled_memtable();
        let mut iter = mem.iter();
        iter.seek_to_last();

        let mut seen = Vec::new();
        while iter.valid() {
            let parsed = ParsedInternalKey::decode(iter.key()).unwrap();
            seen.push(parsed.user_key.to_vec());
            iter.prev();
        }
        assert_eq!(
            seen,
            vec![
                b"damson".to_vec(),
                b"cherry".to_vec(),
                b"banana".to_vec(),
                b"banana".to_vec(),
                b"apple".to_vec(),
            ]
        );
    }

    #[test]
    fn test_tombstones_are_surfaced() {
        // The memtable iterator yields tombstones; filtering is the
        // responsibility of the user-facing iterator.
        let mem = filled_memtable();
        let mut iter = mem.iter();
        let mut target = Vec::new();
        append_internal_key(
            &mut target,
            b"cherry",
            crate::keys::MAX_SEQUENCE_NUMBER,
            ValueType::Value,
        );
        iter.seek(&target);
        let parsed = ParsedInternalKey::decode(iter.key()).unwrap();
        assert_eq!(parsed.value_type, ValueType::Deletion);
    }

    #[test]
    fn test_iterator_keeps_memtable_alive() {
        let mut iter = {
            let mem = filled_memtable();
            mem.iter()
        };
        // The original Arc is gone; the iterator still works.
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(iter.value(), b"1");
    }
}
