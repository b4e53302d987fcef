//! Probabilistic skip list over arena-allocated entries.
//!
//! ## Concurrency contract
//!
//! **One writer at a time, any number of concurrent readers.** Insertion is
//! serialized externally (by the engine's writer queue); readers traverse
//! without any lock. A writer publishes a node by storing the predecessor's
//! `next` pointer with *release* ordering; readers observe links with
//! *acquire* ordering, which also makes the node's key bytes (written
//! before publication) visible. Nodes are never removed — memory is
//! reclaimed wholesale when the owning arena drops.
//!
//! Keys are raw pointers to encoded entries in the arena; ordering is
//! supplied by a [`KeyComparator`]. Ties are impossible because memtable
//! entries embed a unique sequence number.

use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use super::arena::Arena;

/// Fixed maximum tower height.
pub const MAX_HEIGHT: usize = 12;

/// Geometric height sampling: one-in-four chance of growing a level.
const BRANCHING_FACTOR: u64 = 4;

/// Compares encoded entries addressed by raw arena pointers.
pub trait KeyComparator: Send + Sync {
    /// Three-way comparison of the entries at `a` and `b`.
    ///
    /// # Safety
    ///
    /// Both pointers must address well-formed encoded entries that stay
    /// alive for the duration of the call (arena-backed entries qualify).
    unsafe fn compare_raw(&self, a: *const u8, b: *const u8) -> CmpOrdering;
}

#[repr(C)]
struct Node {
    /// Pointer to the encoded entry in the arena; null only for the head.
    key: *const u8,

    /// Tower of forward links. Only the first `height` slots are ever
    /// used, but the full array is allocated to keep node placement
    /// simple and sound.
    next: [AtomicPtr<Node>; MAX_HEIGHT],
}

impl Node {
    #[inline]
    fn next(&self, level: usize) -> *mut Node {
        self.next[level].load(Ordering::Acquire)
    }

    #[inline]
    fn set_next(&self, level: usize, node: *mut Node) {
        self.next[level].store(node, Ordering::Release)
    }

    /// Link accessors without ordering, usable only where the writer has
    /// exclusive access to the unpublished node.
    #[inline]
    fn next_relaxed(&self, level: usize) -> *mut Node {
        self.next[level].load(Ordering::Relaxed)
    }

    #[inline]
    fn set_next_relaxed(&self, level: usize, node: *mut Node) {
        self.next[level].store(node, Ordering::Relaxed)
    }
}

/// Ordered index of arena-allocated entries.
pub struct SkipList<C: KeyComparator> {
    comparator: C,
    arena: Arc<Arena>,
    head: *mut Node,
    /// Height of the tallest tower currently in the list.
    max_height: AtomicUsize,
    /// Writer-only xorshift state for height sampling.
    rnd: AtomicU64,
}

// SAFETY: nodes live in the arena and are never freed or moved while the
// list exists; all cross-thread link traffic goes through atomics with the
// orderings documented above.
unsafe impl<C: KeyComparator> Send for SkipList<C> {}
unsafe impl<C: KeyComparator> Sync for SkipList<C> {}

impl<C: KeyComparator> SkipList<C> {
    pub fn new(comparator: C, arena: Arc<Arena>) -> Self {
        let head = Self::new_node_in(&arena, ptr::null());
        Self {
            comparator,
            arena,
            head,
            max_height: AtomicUsize::new(1),
            rnd: AtomicU64::new(0xdead_beef_cafe_f00d),
        }
    }

    /// Insert the entry at `key`.
    ///
    /// Requires external serialization of writers and that nothing equal to
    /// `key` is already present.
    pub fn insert(&self, key: *const u8) {
        let mut prev = [ptr::null_mut::<Node>(); MAX_HEIGHT];
        let existing = self.find_greater_or_equal(key, Some(&mut prev));
        debug_assert!(
            existing.is_null()
                || unsafe { self.comparator.compare_raw((*existing).key, key) }
                    != CmpOrdering::Equal,
            "duplicate skip list key"
        );

        let height = self.random_height();
        let current_max = self.max_height.load(Ordering::Relaxed);
        if height > current_max {
            for slot in prev.iter_mut().take(height).skip(current_max) {
                *slot = self.head;
            }
            // Relaxed is fine: a reader seeing the old height simply skips
            // the new upper levels, which still yields a correct search.
            self.max_height.store(height, Ordering::Relaxed);
        }

        let node = Self::new_node_in(&self.arena, key);
        for level in 0..height {
            // SAFETY: `prev[level]` is head or a published node; `node` is
            // still private to this writer.
            unsafe {
                (*node).set_next_relaxed(level, (*prev[level]).next_relaxed(level));
                (*prev[level]).set_next(level, node);
            }
        }
    }

    /// True iff an entry equal to `key` is in the list.
    pub fn contains(&self, key: *const u8) -> bool {
        let node = self.find_greater_or_equal(key, None);
        !node.is_null()
            && unsafe { self.comparator.compare_raw((*node).key, key) } == CmpOrdering::Equal
    }

    fn new_node_in(arena: &Arena, key: *const u8) -> *mut Node {
        let raw = arena.alloc_aligned(std::mem::size_of::<Node>()).as_ptr() as *mut Node;
        // SAFETY: the allocation is sized and aligned for `Node`; every
        // field is initialized before the pointer escapes.
        unsafe {
            ptr::addr_of_mut!((*raw).key).write(key);
            let next = ptr::addr_of_mut!((*raw).next);
            for level in 0..MAX_HEIGHT {
                ptr::addr_of_mut!((*next)[level]).write(AtomicPtr::new(ptr::null_mut()));
            }
        }
        raw
    }

    fn random_height(&self) -> usize {
        // Writer-only xorshift64; atomics keep the field Sync without a
        // lock.
        let mut state = self.rnd.load(Ordering::Relaxed);
        let mut height = 1;
        while height < MAX_HEIGHT {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            if state % BRANCHING_FACTOR != 0 {
                break;
            }
            height += 1;
        }
        self.rnd.store(state, Ordering::Relaxed);
        height
    }

    #[inline]
    fn key_is_after_node(&self, key: *const u8, node: *mut Node) -> bool {
        !node.is_null()
            && unsafe { self.comparator.compare_raw((*node).key, key) } == CmpOrdering::Less
    }

    /// First node whose key is `>= key`, or null. When `prev` is supplied
    /// it receives the predecessor at every level (for insertion).
    fn find_greater_or_equal(
        &self,
        key: *const u8,
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut node = self.head;
        let mut level = self.max_height.load(Ordering::Relaxed) - 1;
        loop {
            // SAFETY: `node` is head or a published node.
            let next = unsafe { (*node).next(level) };
            if self.key_is_after_node(key, next) {
                node = next;
            } else {
                if let Some(prev) = prev.as_deref_mut() {
                    prev[level] = node;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Last node whose key is `< key`; returns head if none.
    fn find_less_than(&self, key: *const u8) -> *mut Node {
        let mut node = self.head;
        let mut level = self.max_height.load(Ordering::Relaxed) - 1;
        loop {
            let next = unsafe { (*node).next(level) };
            if self.key_is_after_node(key, next) {
                node = next;
            } else if level == 0 {
                return node;
            } else {
                level -= 1;
            }
        }
    }

    /// Last node in the list; returns head when empty.
    fn find_last(&self) -> *mut Node {
        let mut node = self.head;
        let mut level = self.max_height.load(Ordering::Relaxed) - 1;
        loop {
            let next = unsafe { (*node).next(level) };
            if !next.is_null() {
                node = next;
            } else if level == 0 {
                return node;
            } else {
                level -= 1;
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Cursor
// ------------------------------------------------------------------------------------------------

/// Read cursor over a skip list.
///
/// Holds a raw pointer to the list; the owner must keep the list (and its
/// arena) alive while the cursor exists. Within the crate this is enforced
/// by the memtable iterator holding an `Arc` to the owning memtable.
pub struct SkipListCursor<C: KeyComparator> {
    list: *const SkipList<C>,
    node: *const Node,
}

unsafe impl<C: KeyComparator> Send for SkipListCursor<C> {}

impl<C: KeyComparator> SkipListCursor<C> {
    /// Create a cursor positioned nowhere.
    pub fn new(list: &SkipList<C>) -> Self {
        Self {
            list,
            node: ptr::null(),
        }
    }

    #[inline]
    fn list(&self) -> &SkipList<C> {
        // SAFETY: the owner keeps the list alive (see type docs).
        unsafe { &*self.list }
    }

    /// True when positioned on an entry.
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// The entry pointer under the cursor. Requires `valid()`.
    pub fn key(&self) -> *const u8 {
        debug_assert!(self.valid());
        unsafe { (*self.node).key }
    }

    /// Position on the first entry `>= target`.
    pub fn seek(&mut self, target: *const u8) {
        self.node = self.list().find_greater_or_equal(target, None);
    }

    /// Position on the first entry.
    pub fn seek_to_first(&mut self) {
        let list = self.list();
        self.node = unsafe { (*list.head).next(0) };
    }

    /// Position on the last entry.
    pub fn seek_to_last(&mut self) {
        let list = self.list();
        let last = list.find_last();
        self.node = if last == list.head { ptr::null() } else { last };
    }

    /// Advance to the next entry. Requires `valid()`.
    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).next(0) };
    }

    /// Retreat to the previous entry. Requires `valid()`.
    ///
    /// Implemented as a search for the last node before the current key,
    /// which avoids back links entirely.
    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        let list = self.list();
        let before = list.find_less_than(unsafe { (*self.node).key });
        self.node = if before == list.head {
            ptr::null()
        } else {
            before
        };
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
