#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::engine::Engine;
    use crate::options::{Options, ReadOptions, WriteOptions};
    use crate::version::NUM_LEVELS;

    fn small_options() -> Options {
        Options {
            create_if_missing: true,
            // Small budgets so a test-sized workload exercises flush and
            // compaction.
            write_buffer_size: 32 * 1024,
            max_file_size: 64 * 1024,
            ..Options::default()
        }
    }

    fn get(db: &Engine, key: &[u8]) -> Option<Vec<u8>> {
        db.get(&ReadOptions::new(), key).unwrap()
    }

    fn value_for(i: u32) -> Vec<u8> {
        format!("value-{i}-{}", "x".repeat(100)).into_bytes()
    }

    #[test]
    fn test_flush_moves_data_to_tables() {
        let dir = TempDir::new().unwrap();
        let db = Engine::open(dir.path(), small_options()).unwrap();
        let wo = WriteOptions::default();

        db.put(&wo, b"k", b"v").unwrap();
        assert_eq!(db.num_level_files(0), 0);
        db.flush_memtable().unwrap();

        let files: usize = (0..NUM_LEVELS).map(|l| db.num_level_files(l)).sum();
        assert_eq!(files, 1);
        assert_eq!(get(&db, b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_reads_span_memtable_and_tables() {
        let dir = TempDir::new().unwrap();
        let db = Engine::open(dir.path(), small_options()).unwrap();
        let wo = WriteOptions::default();

        db.put(&wo, b"flushed", b"old").unwrap();
        db.flush_memtable().unwrap();
        db.put(&wo, b"fresh", b"new").unwrap();

        assert_eq!(get(&db, b"flushed"), Some(b"old".to_vec()));
        assert_eq!(get(&db, b"fresh"), Some(b"new".to_vec()));

        // An overwrite in the memtable shadows the flushed version.
        db.put(&wo, b"flushed", b"newer").unwrap();
        assert_eq!(get(&db, b"flushed"), Some(b"newer".to_vec()));
    }

    #[test]
    fn test_background_compaction_under_load() {
        let dir = TempDir::new().unwrap();
        let db = Engine::open(dir.path(), small_options()).unwrap();
        let wo = WriteOptions::default();

        for i in 0..3_000u32 {
            db.put(&wo, format!("key-{i:06}").as_bytes(), &value_for(i))
                .unwrap();
        }

        // Everything must remain readable through rotations, flushes,
        // and whatever compactions ran meanwhile.
        for i in (0..3_000u32).step_by(131) {
            assert_eq!(
                get(&db, format!("key-{i:06}").as_bytes()),
                Some(value_for(i)),
                "key-{i:06}"
            );
        }
    }

    #[test]
    fn test_compact_range_converges_and_preserves_content() {
        let dir = TempDir::new().unwrap();
        let db = Engine::open(dir.path(), small_options()).unwrap();
        let wo = WriteOptions::default();

        for i in 0..2_000u32 {
            db.put(&wo, format!("key-{i:06}").as_bytes(), &value_for(i))
                .unwrap();
        }
        for i in (0..2_000u32).step_by(3) {
            db.delete(&wo, format!("key-{i:06}").as_bytes()).unwrap();
        }

        db.compact_range(None, None).unwrap();
        // A second full-range compaction must be a no-op from the
        // reader's point of view.
        db.compact_range(None, None).unwrap();

        // After full compaction, level 0 is empty and no level holds
        // overlapping files (checked implicitly by reads).
        assert_eq!(db.num_level_files(0), 0);

        for i in 0..2_000u32 {
            let key = format!("key-{i:06}");
            let expected = if i % 3 == 0 { None } else { Some(value_for(i)) };
            assert_eq!(get(&db, key.as_bytes()), expected, "{key}");
        }
    }

    #[test]
    fn test_tombstones_collected_by_compaction() {
        let dir = TempDir::new().unwrap();
        let db = Engine::open(dir.path(), small_options()).unwrap();
        let wo = WriteOptions::default();

        db.put(&wo, b"doomed", b"v").unwrap();
        db.delete(&wo, b"doomed").unwrap();
        db.flush_memtable().unwrap();
        db.compact_range(None, None).unwrap();

        assert_eq!(get(&db, b"doomed"), None);

        // After compacting to the base level, the tombstone itself is
        // gone: the whole tree holds nothing.
        let mut iter = db.iter(&ReadOptions::new()).unwrap();
        iter.seek_to_first();
        assert!(!iter.valid());
    }

    #[test]
    fn test_snapshot_pins_old_versions_across_compaction() {
        let dir = TempDir::new().unwrap();
        let db = Engine::open(dir.path(), small_options()).unwrap();
        let wo = WriteOptions::default();

        db.put(&wo, b"k", b"old").unwrap();
        let snapshot = db.snapshot();
        db.put(&wo, b"k", b"new").unwrap();
        db.flush_memtable().unwrap();
        db.compact_range(None, None).unwrap();

        let at = ReadOptions {
            snapshot: Some(snapshot.sequence()),
            ..ReadOptions::new()
        };
        assert_eq!(db.get(&at, b"k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(get(&db, b"k"), Some(b"new".to_vec()));
    }

    #[test]
    fn test_approximate_size_reflects_data() {
        let dir = TempDir::new().unwrap();
        let db = Engine::open(dir.path(), small_options()).unwrap();
        let wo = WriteOptions::default();

        for i in 0..2_000u32 {
            db.put(&wo, format!("key-{i:06}").as_bytes(), &value_for(i))
                .unwrap();
        }
        db.flush_memtable().unwrap();
        db.compact_range(None, None).unwrap();

        let whole = db.approximate_size(b"key-000000", b"key-999999");
        let half = db.approximate_size(b"key-000000", b"key-001000");
        let empty = db.approximate_size(b"zzz-a", b"zzz-b");

        assert!(whole > 0);
        assert!(half < whole);
        assert_eq!(empty, 0);
    }

    #[test]
    fn test_iterators_survive_concurrent_compaction() {
        let dir = TempDir::new().unwrap();
        let db = Engine::open(dir.path(), small_options()).unwrap();
        let wo = WriteOptions::default();

        for i in 0..1_000u32 {
            db.put(&wo, format!("key-{i:06}").as_bytes(), &value_for(i))
                .unwrap();
        }
        db.flush_memtable().unwrap();

        let mut iter = db.iter(&ReadOptions::new()).unwrap();
        iter.seek_to_first();

        // Rewrite everything and compact; the iterator's version pins
        // the old table files.
        for i in 0..1_000u32 {
            db.put(&wo, format!("key-{i:06}").as_bytes(), b"rewritten")
                .unwrap();
        }
        db.compact_range(None, None).unwrap();

        let mut count = 0u32;
        while iter.valid() {
            assert_eq!(iter.value(), value_for(count).as_slice());
            count += 1;
            iter.next();
        }
        assert_eq!(count, 1_000);
        assert!(iter.status().is_ok());
    }
}
