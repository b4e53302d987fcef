#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::comparator::{BytewiseComparator, InternalKeyComparator};
    use crate::keys::{InternalKey, ValueType};
    use crate::version::{FileMetaData, find_file, some_file_overlaps_range};

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn key(user: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(user, seq, ValueType::Value)
    }

    fn file(number: u64, smallest: &[u8], largest: &[u8]) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            number,
            1024,
            key(smallest, 100),
            key(largest, 50),
        ))
    }

    fn probe(user: &[u8]) -> Vec<u8> {
        key(user, crate::keys::MAX_SEQUENCE_NUMBER).encoded().to_vec()
    }

    #[test]
    fn test_find_file_empty() {
        let files = vec![];
        assert_eq!(find_file(&icmp(), &files, &probe(b"foo")), 0);
    }

    #[test]
    fn test_find_file_single() {
        let files = vec![file(1, b"p", b"q")];
        let icmp = icmp();
        assert_eq!(find_file(&icmp, &files, &probe(b"a")), 0);
        assert_eq!(find_file(&icmp, &files, &probe(b"p")), 0);
        assert_eq!(find_file(&icmp, &files, &probe(b"q")), 0);
        assert_eq!(find_file(&icmp, &files, &probe(b"z")), 1);
    }

    #[test]
    fn test_find_file_multiple() {
        let files = vec![
            file(1, b"150", b"200"),
            file(2, b"200", b"250"),
            file(3, b"300", b"350"),
            file(4, b"400", b"450"),
        ];
        let icmp = icmp();
        assert_eq!(find_file(&icmp, &files, &probe(b"100")), 0);
        assert_eq!(find_file(&icmp, &files, &probe(b"201")), 1);
        assert_eq!(find_file(&icmp, &files, &probe(b"251")), 2);
        assert_eq!(find_file(&icmp, &files, &probe(b"351")), 3);
        assert_eq!(find_file(&icmp, &files, &probe(b"451")), 4);
    }

    #[test]
    fn test_overlap_disjoint_level() {
        let files = vec![file(1, b"150", b"200"), file(2, b"300", b"350")];
        let icmp = icmp();

        // Inside the first file.
        assert!(some_file_overlaps_range(
            &icmp,
            true,
            &files,
            Some(b"160"),
            Some(b"170")
        ));
        // In the gap between files.
        assert!(!some_file_overlaps_range(
            &icmp,
            true,
            &files,
            Some(b"201"),
            Some(b"299")
        ));
        // Straddling the gap.
        assert!(some_file_overlaps_range(
            &icmp,
            true,
            &files,
            Some(b"201"),
            Some(b"300")
        ));
        // Open bounds.
        assert!(some_file_overlaps_range(&icmp, true, &files, None, Some(b"150")));
        assert!(some_file_overlaps_range(&icmp, true, &files, Some(b"350"), None));
        assert!(!some_file_overlaps_range(&icmp, true, &files, Some(b"351"), None));
        assert!(!some_file_overlaps_range(&icmp, true, &files, None, Some(b"149")));
    }

    #[test]
    fn test_overlap_level0_checks_every_file() {
        // Overlapping level-0 files: the disjoint fast path must be off.
        let files = vec![file(1, b"150", b"600"), file(2, b"400", b"500")];
        let icmp = icmp();
        assert!(some_file_overlaps_range(
            &icmp,
            false,
            &files,
            Some(b"450"),
            Some(b"470")
        ));
        assert!(!some_file_overlaps_range(
            &icmp,
            false,
            &files,
            Some(b"601"),
            Some(b"700")
        ));
    }

    #[test]
    fn test_seek_budget_scales_with_size() {
        let small = FileMetaData::new(1, 1024, key(b"a", 1), key(b"b", 2));
        let large = FileMetaData::new(2, 100 << 20, key(b"c", 3), key(b"d", 4));
        use std::sync::atomic::Ordering;
        // Small files get the floor of 100 allowed seeks.
        assert_eq!(small.allowed_seeks.load(Ordering::Relaxed), 100);
        // Large files get size / 16 KiB.
        assert_eq!(
            large.allowed_seeks.load(Ordering::Relaxed),
            (100 << 20) / 16384
        );
    }
}
