//! Internal iterator contract and the k-way merging iterator.
//!
//! Everything that yields internal-key entries — memtables, table files,
//! per-level file concatenations — speaks [`InternalIterator`]. The engine
//! composes them with [`MergingIterator`] for reads and compaction.

use std::cmp::Ordering;

use crate::comparator::{Comparator, InternalKeyComparator};
use crate::sstable::TableError;

/// Cursor over a sorted sequence of `(internal_key, value)` entries.
///
/// Positioning methods leave the iterator either on an entry
/// (`valid() == true`) or past either end. `key()`/`value()` may only be
/// called while valid. Errors encountered while stepping park the iterator
/// in the invalid state and surface through [`InternalIterator::status`].
pub trait InternalIterator: Send {
    fn valid(&self) -> bool;
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    /// Position on the first entry with key `>= target` (internal-key
    /// order).
    fn seek(&mut self, target: &[u8]);
    fn next(&mut self);
    fn prev(&mut self);
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    fn status(&self) -> Result<(), TableError>;
}

// ------------------------------------------------------------------------------------------------
// MergingIterator
// ------------------------------------------------------------------------------------------------

#[derive(PartialEq, Clone, Copy)]
enum Direction {
    Forward,
    Reverse,
}

/// Merges N child iterators into one sorted stream.
///
/// Children may contain overlapping keys; the merged stream yields them in
/// internal-key order (ties are served in child order, so callers place
/// newer sources first).
pub struct MergingIterator {
    comparator: InternalKeyComparator,
    children: Vec<Box<dyn InternalIterator>>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIterator {
    pub fn new(comparator: InternalKeyComparator, children: Vec<Box<dyn InternalIterator>>) -> Self {
        Self {
            comparator,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    if self.comparator.compare(child.key(), self.children[s].key())
                        == Ordering::Less
                    {
                        smallest = Some(i);
                    }
                }
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate().rev() {
            if !child.valid() {
                continue;
            }
            match largest {
                None => largest = Some(i),
                Some(l) => {
                    if self.comparator.compare(child.key(), self.children[l].key())
                        == Ordering::Greater
                    {
                        largest = Some(i);
                    }
                }
            }
        }
        self.current = largest;
    }
}

impl InternalIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.find_largest();
        self.direction = Direction::Reverse;
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn next(&mut self) {
        let current = self.current.expect("next() on invalid merging iterator");

        // After a direction change every non-current child must be
        // repositioned to the first entry past the current key.
        if self.direction != Direction::Forward {
            let pivot = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&pivot);
                if child.valid() && self.comparator.compare(&pivot, child.key()) == Ordering::Equal
                {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let current = self.current.expect("prev() on invalid merging iterator");

        if self.direction != Direction::Reverse {
            let pivot = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                // Position just before the pivot: seek lands at or past
                // it, then step back once (possibly off the front).
                child.seek(&pivot);
                if child.valid() {
                    child.prev();
                } else {
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        let current = self.current.expect("key() on invalid merging iterator");
        self.children[current].key()
    }

    fn value(&self) -> &[u8] {
        let current = self.current.expect("value() on invalid merging iterator");
        self.children[current].value()
    }

    fn status(&self) -> Result<(), TableError> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
