#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::engine::{Engine, EngineError};
    use crate::options::{Options, ReadOptions, WriteOptions};

    fn options() -> Options {
        Options {
            create_if_missing: true,
            ..Options::default()
        }
    }

    fn get(db: &Engine, key: &[u8]) -> Option<Vec<u8>> {
        db.get(&ReadOptions::new(), key).unwrap()
    }

    #[test]
    fn test_open_refuses_missing_db_without_create() {
        let dir = TempDir::new().unwrap();
        let result = Engine::open(dir.path().join("db"), Options::default());
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn test_open_refuses_existing_db_with_error_if_exists() {
        let dir = TempDir::new().unwrap();
        drop(Engine::open(dir.path(), options()).unwrap());

        let strict = Options {
            error_if_exists: true,
            ..options()
        };
        assert!(matches!(
            Engine::open(dir.path(), strict),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = TempDir::new().unwrap();
        {
            let db = Engine::open(dir.path(), options()).unwrap();
            let wo = WriteOptions::default();
            for i in 0..500u32 {
                db.put(&wo, format!("key-{i:04}").as_bytes(), format!("v{i}").as_bytes())
                    .unwrap();
            }
            db.delete(&wo, b"key-0123").unwrap();
        }

        let db = Engine::open(dir.path(), options()).unwrap();
        assert_eq!(get(&db, b"key-0000"), Some(b"v0".to_vec()));
        assert_eq!(get(&db, b"key-0499"), Some(b"v499".to_vec()));
        assert_eq!(get(&db, b"key-0123"), None);
    }

    #[test]
    fn test_sync_write_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = Engine::open(dir.path(), options()).unwrap();
            db.put(&WriteOptions { sync: true }, b"durable", b"yes")
                .unwrap();
            // No clean close beyond Drop.
        }
        let db = Engine::open(dir.path(), options()).unwrap();
        assert_eq!(get(&db, b"durable"), Some(b"yes".to_vec()));
    }

    #[test]
    fn test_later_sync_covers_earlier_unsynced_writes() {
        let dir = TempDir::new().unwrap();
        {
            let db = Engine::open(dir.path(), options()).unwrap();
            db.put(&WriteOptions { sync: false }, b"k", b"v").unwrap();
            db.put(&WriteOptions { sync: true }, b"k2", b"v2").unwrap();
        }
        // The sync on k2 forces the log prefix containing k as well.
        let db = Engine::open(dir.path(), options()).unwrap();
        assert_eq!(get(&db, b"k2"), Some(b"v2".to_vec()));
        assert_eq!(get(&db, b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_reopen_across_flushes() {
        let dir = TempDir::new().unwrap();
        let small_buffer = Options {
            write_buffer_size: 16 * 1024,
            ..options()
        };
        {
            let db = Engine::open(dir.path(), small_buffer.clone()).unwrap();
            let wo = WriteOptions::default();
            // Enough data to rotate the memtable several times.
            for i in 0..2_000u32 {
                db.put(
                    &wo,
                    format!("key-{i:05}").as_bytes(),
                    vec![b'v'; 64].as_slice(),
                )
                .unwrap();
            }
            db.flush_memtable().unwrap();
        }

        let db = Engine::open(dir.path(), small_buffer).unwrap();
        for i in (0..2_000u32).step_by(97) {
            assert_eq!(
                get(&db, format!("key-{i:05}").as_bytes()),
                Some(vec![b'v'; 64]),
                "key-{i:05}"
            );
        }
    }

    #[test]
    fn test_sequence_numbers_resume_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = Engine::open(dir.path(), options()).unwrap();
            let wo = WriteOptions::default();
            db.put(&wo, b"k", b"v1").unwrap();
        }
        {
            let db = Engine::open(dir.path(), options()).unwrap();
            let wo = WriteOptions::default();
            // A write after reopen must shadow the pre-reopen one.
            db.put(&wo, b"k", b"v2").unwrap();
            assert_eq!(get(&db, b"k"), Some(b"v2".to_vec()));
        }
        let db = Engine::open(dir.path(), options()).unwrap();
        assert_eq!(get(&db, b"k"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_zero_write_buffer_forces_rotation_every_put() {
        let dir = TempDir::new().unwrap();
        let tiny = Options {
            write_buffer_size: 0,
            ..options()
        };
        let db = Engine::open(dir.path(), tiny).unwrap();
        let wo = WriteOptions::default();
        for i in 0..20u32 {
            db.put(&wo, format!("k{i}").as_bytes(), b"v").unwrap();
        }
        // Every put rotated the memtable, so data lives in table files,
        // and all of it is still readable.
        for i in 0..20u32 {
            assert_eq!(get(&db, format!("k{i}").as_bytes()), Some(b"v".to_vec()));
        }
        let total: usize = (0..crate::version::NUM_LEVELS)
            .map(|l| db.num_level_files(l))
            .sum();
        assert!(total > 0);
    }
}
