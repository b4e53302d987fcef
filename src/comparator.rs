//! Key ordering contracts.
//!
//! A [`Comparator`] supplies the total order on user keys. The engine wraps
//! it in an [`InternalKeyComparator`] which extends the order over internal
//! keys: user key ascending, then packed sequence/tag descending, so the
//! newest write for a user key sorts first.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::keys::{MAX_SEQUENCE_NUMBER, ValueType, extract_user_key, pack_sequence_and_type};

/// A total order over byte-string keys.
///
/// Implementations must be consistent: `compare(a, b) == Equal` iff the keys
/// are interchangeable everywhere. The two `find_*` operations let table
/// builders shorten index keys; conservative implementations may leave their
/// argument unchanged.
pub trait Comparator: Send + Sync {
    /// Identifies the comparator for descriptor compatibility checks.
    /// Opening a database with a differently-named comparator fails.
    fn name(&self) -> &'static str;

    /// Three-way comparison of two user keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Shorten `start` in place to any key `k` with `start <= k < limit`.
    /// No-op when `start >= limit`.
    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]);

    /// Advance `key` in place to any key `k >= key`, preferably shorter.
    fn find_short_successor(&self, key: &mut Vec<u8>);
}

// ------------------------------------------------------------------------------------------------
// BytewiseComparator — the default lexicographic order
// ------------------------------------------------------------------------------------------------

/// Lexicographic byte-string order; the default user comparator.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &'static str {
        "stratumdb.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        // Find length of common prefix.
        let min_len = start.len().min(limit.len());
        let mut shared = 0;
        while shared < min_len && start[shared] == limit[shared] {
            shared += 1;
        }

        if shared >= min_len {
            // One key is a prefix of the other; no shortening possible.
            return;
        }

        let byte = start[shared];
        if byte < 0xff && byte + 1 < limit[shared] {
            start[shared] = byte + 1;
            start.truncate(shared + 1);
            debug_assert_eq!(self.compare(start, limit), Ordering::Less);
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        // Bump the first byte that can be incremented and drop the tail.
        for i in 0..key.len() {
            if key[i] != 0xff {
                key[i] += 1;
                key.truncate(i + 1);
                return;
            }
        }
        // All 0xff: leave as-is, key is its own successor bound.
    }
}

// ------------------------------------------------------------------------------------------------
// InternalKeyComparator
// ------------------------------------------------------------------------------------------------

/// Orders internal keys: user key ascending per the wrapped comparator,
/// ties broken by packed `(sequence << 8) | tag` **descending**.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        Self { user }
    }

    /// The wrapped user-key comparator.
    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }

    /// Compare only the user-key portions of two internal keys.
    pub fn compare_user_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user.compare(a, b)
    }
}

impl Comparator for InternalKeyComparator {
    fn name(&self) -> &'static str {
        "stratumdb.InternalKeyComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let (a_user, a_tag) = extract_user_key(a);
        let (b_user, b_tag) = extract_user_key(b);
        match self.user.compare(a_user, b_user) {
            Ordering::Equal => b_tag.cmp(&a_tag),
            ord => ord,
        }
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let (start_user, _) = extract_user_key(start);
        let (limit_user, _) = extract_user_key(limit);

        let mut tmp = start_user.to_vec();
        self.user.find_shortest_separator(&mut tmp, limit_user);

        if tmp.len() < start_user.len() && self.user.compare(start_user, &tmp) == Ordering::Less {
            // The user key became shorter physically but larger logically.
            // Tag it with the highest possible packed value so it still
            // sorts before every real entry for the same user key.
            let mut shortened = tmp;
            crate::encoding::put_fixed64(
                &mut shortened,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, ValueType::Value),
            );
            debug_assert_eq!(self.compare(start, &shortened), Ordering::Less);
            debug_assert_eq!(self.compare(&shortened, limit), Ordering::Less);
            *start = shortened;
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        let (user, _) = extract_user_key(key);
        let mut tmp = user.to_vec();
        self.user.find_short_successor(&mut tmp);

        if tmp.len() < user.len() && self.user.compare(user, &tmp) == Ordering::Less {
            let mut shortened = tmp;
            crate::encoding::put_fixed64(
                &mut shortened,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, ValueType::Value),
            );
            debug_assert_eq!(self.compare(key, &shortened), Ordering::Less);
            *key = shortened;
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::append_internal_key;

    fn ikey(user: &[u8], seq: u64, ty: ValueType) -> Vec<u8> {
        let mut buf = Vec::new();
        append_internal_key(&mut buf, user, seq, ty);
        buf
    }

    #[test]
    fn test_bytewise_order() {
        let c = BytewiseComparator;
        assert_eq!(c.compare(b"", b""), Ordering::Equal);
        assert_eq!(c.compare(b"a", b"b"), Ordering::Less);
        assert_eq!(c.compare(b"abc", b"ab"), Ordering::Greater);
    }

    #[test]
    fn test_bytewise_separator_shortens() {
        let c = BytewiseComparator;
        let mut start = b"abcdefghij".to_vec();
        c.find_shortest_separator(&mut start, b"abzzzz");
        assert_eq!(start, b"abd");

        // Prefix relationship: unchanged.
        let mut start = b"ab".to_vec();
        c.find_shortest_separator(&mut start, b"abcd");
        assert_eq!(start, b"ab");
    }

    #[test]
    fn test_bytewise_successor() {
        let c = BytewiseComparator;
        let mut key = b"abc".to_vec();
        c.find_short_successor(&mut key);
        assert_eq!(key, b"b");

        let mut key = vec![0xff, 0xff, 0x01];
        c.find_short_successor(&mut key);
        assert_eq!(key, vec![0xff, 0xff, 0x02]);

        let mut key = vec![0xff, 0xff];
        c.find_short_successor(&mut key);
        assert_eq!(key, vec![0xff, 0xff]);
    }

    #[test]
    fn test_internal_key_order() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));

        // Distinct user keys: user order wins.
        assert_eq!(
            icmp.compare(
                &ikey(b"a", 100, ValueType::Value),
                &ikey(b"b", 1, ValueType::Value)
            ),
            Ordering::Less
        );

        // Same user key: higher sequence sorts first.
        assert_eq!(
            icmp.compare(
                &ikey(b"k", 7, ValueType::Value),
                &ikey(b"k", 3, ValueType::Value)
            ),
            Ordering::Less
        );

        // Same user key and sequence: Value tag sorts before Deletion.
        assert_eq!(
            icmp.compare(
                &ikey(b"k", 5, ValueType::Value),
                &ikey(b"k", 5, ValueType::Deletion)
            ),
            Ordering::Less
        );
    }

    #[test]
    fn test_internal_separator_keeps_order() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let mut start = ikey(b"foobar", 44, ValueType::Value);
        let limit = ikey(b"fozzz", 11, ValueType::Value);
        let before = start.clone();
        icmp.find_shortest_separator(&mut start, &limit);
        assert!(icmp.compare(&before, &start) != Ordering::Greater);
        assert_eq!(icmp.compare(&start, &limit), Ordering::Less);
        assert!(start.len() <= before.len());
    }
}
