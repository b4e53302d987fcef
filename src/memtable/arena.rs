//! Bump allocator backing the memtable.
//!
//! Allocations live for the whole memtable lifetime; there is no per-object
//! free. Memory is reclaimed wholesale when the arena drops, which is why
//! skip-list nodes and entry bytes may be handed around as raw pointers
//! while the owning memtable is referenced.

use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of a standard arena block.
const BLOCK_SIZE: usize = 4096;

/// Pointer alignment used by [`Arena::alloc_aligned`].
const ALIGN: usize = std::mem::size_of::<*mut u8>();

struct ArenaInner {
    /// Owned blocks, stored as `u64` words so every block base is
    /// pointer-aligned. Box contents never move, so pointers into a block
    /// stay valid while the arena is alive.
    blocks: Vec<Box<[u64]>>,

    /// Bump cursor into the last standard block.
    alloc_ptr: *mut u8,

    /// Bytes remaining after the cursor.
    alloc_remaining: usize,
}

/// A bump allocator composed of owned byte blocks.
///
/// # Concurrency
///
/// Allocation is serialized internally; [`Arena::memory_usage`] is readable
/// concurrently without taking the allocation lock. Returned pointers may
/// be dereferenced by concurrent readers once the allocating writer has
/// published them (the skip list's release store provides the
/// happens-before edge).
pub struct Arena {
    inner: Mutex<ArenaInner>,
    memory_usage: AtomicUsize,
}

// SAFETY: the raw cursor in `ArenaInner` is only touched under the mutex;
// block storage is heap-allocated and never moves.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ArenaInner {
                blocks: Vec::new(),
                alloc_ptr: std::ptr::null_mut(),
                alloc_remaining: 0,
            }),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Allocate `bytes` of uninitialized-but-zeroed memory.
    ///
    /// # Panics
    ///
    /// Panics on a zero-byte request; callers always have at least a one
    /// byte payload.
    pub fn alloc(&self, bytes: usize) -> NonNull<u8> {
        assert!(bytes > 0, "arena allocation must be non-empty");
        let mut inner = self.inner.lock().expect("arena mutex poisoned");

        if bytes <= inner.alloc_remaining {
            let ptr = inner.alloc_ptr;
            // SAFETY: `alloc_remaining >= bytes` keeps the cursor inside
            // the current block.
            inner.alloc_ptr = unsafe { ptr.add(bytes) };
            inner.alloc_remaining -= bytes;
            return NonNull::new(ptr).expect("arena cursor is non-null");
        }

        self.alloc_fallback(&mut inner, bytes)
    }

    /// Allocate `bytes` with pointer alignment, for in-arena structures
    /// such as skip-list nodes.
    pub fn alloc_aligned(&self, bytes: usize) -> NonNull<u8> {
        assert!(bytes > 0, "arena allocation must be non-empty");
        let mut inner = self.inner.lock().expect("arena mutex poisoned");

        let misalign = (inner.alloc_ptr as usize) & (ALIGN - 1);
        let slop = if misalign == 0 { 0 } else { ALIGN - misalign };
        let needed = bytes + slop;

        if needed <= inner.alloc_remaining {
            // SAFETY: slop + bytes fit in the current block.
            let ptr = unsafe { inner.alloc_ptr.add(slop) };
            inner.alloc_ptr = unsafe { ptr.add(bytes) };
            inner.alloc_remaining -= needed;
            return NonNull::new(ptr).expect("arena cursor is non-null");
        }

        // Fallback blocks are freshly boxed and thus already aligned for
        // any pointer-sized layout.
        self.alloc_fallback(&mut inner, bytes)
    }

    /// Current footprint: block bytes plus per-block bookkeeping overhead.
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }

    fn alloc_fallback(&self, inner: &mut ArenaInner, bytes: usize) -> NonNull<u8> {
        if bytes > BLOCK_SIZE / 4 {
            // Oversized request: dedicated block, current cursor untouched
            // so its remainder is not wasted.
            return self.new_block(inner, bytes);
        }

        // Discard the remainder and start a fresh standard block.
        let ptr = self.new_block(inner, BLOCK_SIZE);
        // SAFETY: the fresh block has BLOCK_SIZE bytes starting at `ptr`.
        inner.alloc_ptr = unsafe { ptr.as_ptr().add(bytes) };
        inner.alloc_remaining = BLOCK_SIZE - bytes;
        ptr
    }

    fn new_block(&self, inner: &mut ArenaInner, size: usize) -> NonNull<u8> {
        let words = size.div_ceil(std::mem::size_of::<u64>());
        let mut block = vec![0u64; words].into_boxed_slice();
        let ptr = NonNull::new(block.as_mut_ptr().cast::<u8>()).expect("boxed slice is non-null");
        inner.blocks.push(block);
        self.memory_usage.fetch_add(
            size + std::mem::size_of::<Box<[u64]>>(),
            Ordering::Relaxed,
        );
        ptr
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_allocations_share_a_block() {
        let arena = Arena::new();
        let a = arena.alloc(16);
        let b = arena.alloc(16);
        // Bump allocation: consecutive small requests are adjacent.
        assert_eq!(unsafe { a.as_ptr().add(16) }, b.as_ptr());
        assert!(arena.memory_usage() >= BLOCK_SIZE);
    }

    #[test]
    fn test_oversized_request_gets_dedicated_block() {
        let arena = Arena::new();
        let _cursor = arena.alloc(8);
        let before = arena.memory_usage();
        let big = BLOCK_SIZE; // > BLOCK_SIZE / 4
        let _p = arena.alloc(big);
        let after = arena.memory_usage();
        assert!(after - before >= big);

        // The small-allocation cursor was not disturbed: the next small
        // request continues in the original block.
        let a = arena.alloc(8);
        let b = arena.alloc(8);
        assert_eq!(unsafe { a.as_ptr().add(8) }, b.as_ptr());
    }

    #[test]
    fn test_aligned_allocations_are_aligned() {
        let arena = Arena::new();
        let _skew = arena.alloc(3);
        for _ in 0..8 {
            let p = arena.alloc_aligned(24);
            assert_eq!(p.as_ptr() as usize % ALIGN, 0);
        }
    }

    #[test]
    fn test_writes_via_returned_pointers() {
        let arena = Arena::new();
        let p = arena.alloc(64);
        unsafe {
            std::ptr::copy_nonoverlapping(b"hello".as_ptr(), p.as_ptr(), 5);
            assert_eq!(std::slice::from_raw_parts(p.as_ptr(), 5), b"hello");
        }
    }

    #[test]
    fn test_memory_usage_grows_monotonically() {
        let arena = Arena::new();
        let mut last = 0;
        for i in 1..200 {
            arena.alloc(i % 300 + 1);
            let usage = arena.memory_usage();
            assert!(usage >= last);
            last = usage;
        }
    }
}
