#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::comparator::{BytewiseComparator, InternalKeyComparator};
    use crate::keys::{LookupKey, MAX_SEQUENCE_NUMBER, ValueType};
    use crate::memtable::{MemTable, MemTableGet};

    fn new_memtable() -> MemTable {
        MemTable::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)))
    }

    #[test]
    fn test_add_and_get() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"a", b"1");
        mem.add(2, ValueType::Value, b"b", b"2");

        assert_eq!(
            mem.get(&LookupKey::new(b"a", MAX_SEQUENCE_NUMBER)),
            MemTableGet::Found(b"1".to_vec())
        );
        assert_eq!(
            mem.get(&LookupKey::new(b"b", MAX_SEQUENCE_NUMBER)),
            MemTableGet::Found(b"2".to_vec())
        );
        assert_eq!(
            mem.get(&LookupKey::new(b"c", MAX_SEQUENCE_NUMBER)),
            MemTableGet::Missing
        );
    }

    #[test]
    fn test_newest_version_wins() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"k", b"v1");
        mem.add(2, ValueType::Value, b"k", b"v2");
        mem.add(3, ValueType::Value, b"k", b"v3");

        assert_eq!(
            mem.get(&LookupKey::new(b"k", MAX_SEQUENCE_NUMBER)),
            MemTableGet::Found(b"v3".to_vec())
        );
    }

    #[test]
    fn test_snapshot_sequence_visibility() {
        let mem = new_memtable();
        mem.add(10, ValueType::Value, b"k", b"old");
        mem.add(20, ValueType::Value, b"k", b"new");

        // A lookup as of sequence 15 sees only the older write.
        assert_eq!(
            mem.get(&LookupKey::new(b"k", 15)),
            MemTableGet::Found(b"old".to_vec())
        );
        assert_eq!(
            mem.get(&LookupKey::new(b"k", 20)),
            MemTableGet::Found(b"new".to_vec())
        );
        // Before the first write: nothing visible.
        assert_eq!(mem.get(&LookupKey::new(b"k", 9)), MemTableGet::Missing);
    }

    #[test]
    fn test_deletion_shadows_value() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"k", b"v");
        mem.add(2, ValueType::Deletion, b"k", b"");

        assert_eq!(
            mem.get(&LookupKey::new(b"k", MAX_SEQUENCE_NUMBER)),
            MemTableGet::Deleted
        );
        // The older snapshot still sees the value.
        assert_eq!(
            mem.get(&LookupKey::new(b"k", 1)),
            MemTableGet::Found(b"v".to_vec())
        );
    }

    #[test]
    fn test_empty_key_and_value() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"", b"");
        assert_eq!(
            mem.get(&LookupKey::new(b"", MAX_SEQUENCE_NUMBER)),
            MemTableGet::Found(Vec::new())
        );
    }

    #[test]
    fn test_memory_usage_grows() {
        let mem = new_memtable();
        let before = mem.approximate_memory_usage();
        for i in 0..100u32 {
            mem.add(
                u64::from(i) + 1,
                ValueType::Value,
                format!("key-{i:04}").as_bytes(),
                &vec![0xab; 100],
            );
        }
        assert!(mem.approximate_memory_usage() > before);
    }

    #[test]
    fn test_concurrent_readers_during_writes() {
        let mem = Arc::new(new_memtable());
        let writer_mem = Arc::clone(&mem);

        let writer = std::thread::spawn(move || {
            for i in 0..2_000u64 {
                writer_mem.add(
                    i + 1,
                    ValueType::Value,
                    format!("key-{:06}", i).as_bytes(),
                    b"payload",
                );
            }
        });

        // Readers continuously probe while the writer inserts; every key
        // that is visible must carry the payload written for it.
        for _ in 0..4_000 {
            let probe = LookupKey::new(b"key-000100", MAX_SEQUENCE_NUMBER);
            match mem.get(&probe) {
                MemTableGet::Found(v) => assert_eq!(v, b"payload"),
                MemTableGet::Missing => {}
                MemTableGet::Deleted => panic!("no deletions were written"),
            }
        }

        writer.join().unwrap();
        assert_eq!(
            mem.get(&LookupKey::new(b"key-001999", MAX_SEQUENCE_NUMBER)),
            MemTableGet::Found(b"payload".to_vec())
        );
    }
}
