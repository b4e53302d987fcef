#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::comparator::BytewiseComparator;
    use crate::iterator::InternalIterator;
    use crate::sstable::block::{Block, BlockBuilder};

    fn build_block(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, value) in entries {
            builder.add(key, value);
        }
        Arc::new(Block::new(builder.finish().to_vec()).unwrap())
    }

    fn bytewise() -> Arc<BytewiseComparator> {
        Arc::new(BytewiseComparator)
    }

    #[test]
    fn test_empty_block() {
        let block = build_block(&[], 16);
        let mut iter = block.iter(bytewise());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
        iter.seek(b"anything");
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_scan_round_trip() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..100)
            .map(|i| {
                (
                    format!("key-{i:04}").into_bytes(),
                    format!("value-{i}").into_bytes(),
                )
            })
            .collect();
        let borrowed: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let block = build_block(&borrowed, 16);

        let mut iter = block.iter(bytewise());
        iter.seek_to_first();
        for (key, value) in &entries {
            assert!(iter.valid());
            assert_eq!(iter.key(), key.as_slice());
            assert_eq!(iter.value(), value.as_slice());
            iter.next();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_prefix_compression_is_effective() {
        // 100 keys sharing a long prefix must compress well below their
        // raw size.
        let prefix = "a-rather-long-shared-prefix-";
        let entries: Vec<Vec<u8>> = (0..100)
            .map(|i| format!("{prefix}{i:04}").into_bytes())
            .collect();
        let mut builder = BlockBuilder::new(16);
        let mut raw = 0;
        for key in &entries {
            builder.add(key, b"v");
            raw += key.len() + 1;
        }
        let finished = builder.finish().to_vec();
        assert!(
            finished.len() < raw * 2 / 3,
            "block {} bytes vs raw {}",
            finished.len(),
            raw
        );
    }

    #[test]
    fn test_seek_hits_and_gaps() {
        let block = build_block(
            &[
                (b"apple", b"1"),
                (b"banana", b"2"),
                (b"cherry", b"3"),
                (b"damson", b"4"),
            ],
            2,
        );
        let mut iter = block.iter(bytewise());

        iter.seek(b"banana");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"banana");

        // Between entries: lands on the next one.
        iter.seek(b"blueberry");
        assert_eq!(iter.key(), b"cherry");

        // Before the first.
        iter.seek(b"");
        assert_eq!(iter.key(), b"apple");

        // Past the last.
        iter.seek(b"zebra");
        assert!(!iter.valid());
    }

    #[test]
    fn test_backward_iteration() {
        let entries: Vec<Vec<u8>> = (0..37).map(|i| format!("k{i:03}").into_bytes()).collect();
        let borrowed: Vec<(&[u8], &[u8])> =
            entries.iter().map(|k| (k.as_slice(), b"v" as &[u8])).collect();
        let block = build_block(&borrowed, 4);

        let mut iter = block.iter(bytewise());
        iter.seek_to_last();
        for key in entries.iter().rev() {
            assert!(iter.valid());
            assert_eq!(iter.key(), key.as_slice());
            iter.prev();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_restart_interval_one() {
        // Every entry is a restart point: no prefix compression at all.
        let block = build_block(&[(b"aa", b"1"), (b"ab", b"2"), (b"ac", b"3")], 1);
        let mut iter = block.iter(bytewise());
        iter.seek(b"ab");
        assert_eq!(iter.key(), b"ab");
        assert_eq!(iter.value(), b"2");
    }

    #[test]
    fn test_corrupt_restart_count_rejected() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"k", b"v");
        let mut bytes = builder.finish().to_vec();
        // Claim more restarts than the block can hold.
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(Block::new(bytes).is_err());
    }

    #[test]
    fn test_empty_key_and_value_entries() {
        let block = build_block(&[(b"", b""), (b"a", b"")], 16);
        let mut iter = block.iter(bytewise());
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"");
        assert_eq!(iter.value(), b"");
        iter.next();
        assert_eq!(iter.key(), b"a");
    }
}
