//! The core block allocator: heap initialization, first-fit search, split,
//! coalesce, and break-driven growth/shrink.
//!
//! This is deliberately the only module that understands the *algorithm*;
//! it knows nothing about `Layout` or alignment stronger than [`ALIGN`] --
//! that is the facade's job (`lib.rs`), which wraps [`RawAllocator`] in a
//! `spin::Mutex`-protected [`crate::Allocator`].

use crate::block::{header_of, payload_of, round_up, Cursor, Header, ALIGN, HEADER_SIZE, MIN_PAYLOAD};
use crate::break_source::BreakSource;
use core::ptr::{self, NonNull};

/// A first-fit, coalescing allocator over a heap grown and shrunk through a
/// [`BreakSource`].
///
/// `RawAllocator` takes `&mut self` for every operation: it performs no
/// internal locking, and assumes single-threaded access. Callers that need
/// `Sync` (such as a [`core::alloc::GlobalAlloc`] implementation) must wrap
/// it in a mutex, as [`crate::Allocator`] does with a `spin::Mutex`.
pub struct RawAllocator<B: BreakSource> {
    brk: B,
    /// The heap base, recorded on first use. `None` before the first call.
    base: Option<NonNull<Header>>,
}

// SAFETY: a `RawAllocator` is only ever touched through `&mut self`, and
// every public entry point on it is reached exclusively through the
// enclosing `spin::Mutex` guard in `lib.rs`'s `Allocator`. The `NonNull`
// it carries is never read concurrently, so shipping the whole allocator
// to another thread (when `B` itself permits it) is sound.
unsafe impl<B: BreakSource + Send> Send for RawAllocator<B> {}

impl<B: BreakSource> RawAllocator<B> {
    /// Create a new, uninitialized allocator over the given break source.
    ///
    /// Initialization (aligning the break and installing the first
    /// sentinel) is deferred until the first operation.
    pub const fn new(brk: B) -> Self {
        Self { brk, base: None }
    }

    /// Ensure the heap is initialized, returning its base address.
    ///
    /// Idempotent: the second and later calls just return the recorded
    /// base, detected by `base` already being non-null.
    fn ensure_init(&mut self) -> NonNull<Header> {
        if let Some(base) = self.base {
            return base;
        }

        let current = self.brk.current();
        let misalignment = current.as_ptr() as usize % ALIGN;
        if misalignment != 0 {
            self.brk
                .adjust((ALIGN - misalignment) as isize)
                .expect("failed to align the heap break");
        }
        // Re-read the break rather than trust the `adjust` return value:
        // `adjust` hands back the break as it was *before* the move.
        let base: NonNull<Header> = self.brk.current().cast();

        self.install_sentinel();
        self.base = Some(base);
        log::trace!("heap initialized at {:p}", base.as_ptr());
        base
    }

    /// Extend the break by `HEADER_SIZE` bytes and write a fresh sentinel
    /// into the newly exposed memory. Returns the sentinel's address.
    fn install_sentinel(&mut self) -> NonNull<Header> {
        let slot = self
            .brk
            .adjust(HEADER_SIZE as isize)
            .expect("failed to extend the heap for the sentinel");
        let header: NonNull<Header> = slot.cast();
        // SAFETY: `adjust` just handed back `HEADER_SIZE` fresh, writable
        // bytes at `slot`, so writing a `Header` there is in-bounds.
        unsafe {
            header.as_ptr().write(Header { size: 0, used: true });
        }
        header
    }

    /// Allocate `size` bytes of payload, first-fit, growing the heap if no
    /// free block is large enough.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        let base = self.ensure_init();
        let need = round_up(size + HEADER_SIZE, ALIGN);

        // SAFETY: `base` always addresses a fully initialized chain, by
        // construction of `ensure_init`.
        let mut cursor = unsafe { Cursor::new(base) };
        while let Some(block) = cursor.current() {
            // SAFETY: `block` is live, per the cursor's contract.
            let header = unsafe { block.as_ref() };
            if !header.used && header.size >= need {
                // SAFETY: `block` is live and exclusively reachable here.
                unsafe { (*block.as_ptr()).used = true };
                self.split(block, need);
                // SAFETY: `block` is a non-sentinel block that reserves
                // `HEADER_SIZE` bytes before its payload (just marked used).
                return unsafe { payload_of(block).as_ptr() };
            }
            cursor.advance();
        }

        // No free block fit; consume the sentinel and grow the break.
        let sentinel = cursor.raw();
        // SAFETY: `sentinel` is live; the loop above only stops here.
        debug_assert!(unsafe { sentinel.as_ref() }.is_sentinel());
        // SAFETY: same as above; we are about to overwrite its `size`.
        unsafe { (*sentinel.as_ptr()).size = need };
        self.brk
            .adjust((need - HEADER_SIZE) as isize)
            .expect("failed to grow the heap");
        self.install_sentinel();
        log::trace!("grew heap by {} bytes for a new block", need - HEADER_SIZE);

        // SAFETY: the former sentinel is now a regular `need`-byte block.
        unsafe { payload_of(sentinel).as_ptr() }
    }

    /// Shrink `block` down to `need` bytes if the leftover is large enough
    /// to host a block of its own, carving a new free block out of the tail.
    fn split(&mut self, block: NonNull<Header>, need: usize) {
        // SAFETY: `block` is live.
        let old = unsafe { block.as_ref() }.size;
        if need >= old {
            return;
        }
        let leftover = old - need;
        if leftover < HEADER_SIZE + MIN_PAYLOAD {
            return;
        }

        // SAFETY: `need < old`, so `block + need` lands strictly inside the
        // bytes this block owns, with at least `HEADER_SIZE` bytes to spare
        // (checked above), making it a valid place for a new header.
        let new_header: NonNull<Header> =
            unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(need).cast()) };
        // SAFETY: the memory at `new_header` is owned by this block and not
        // aliased by anything else.
        unsafe {
            new_header.as_ptr().write(Header {
                size: round_up(leftover, ALIGN),
                used: false,
            });
            (*block.as_ptr()).size = need;
        }
    }

    /// Step to the block immediately following `block`.
    ///
    /// # Safety
    /// `block` must be a live, non-sentinel header (the sentinel has no
    /// successor).
    unsafe fn following(block: NonNull<Header>) -> NonNull<Header> {
        // SAFETY: forwarded from the caller; `size` is the block's span.
        let size = unsafe { block.as_ref() }.size;
        unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(size).cast()) }
    }

    /// Merge `block` with every immediately following free block.
    fn merge_forward(&mut self, block: NonNull<Header>) {
        loop {
            // SAFETY: `block` is live and not the sentinel (checked by the
            // loop condition below before advancing further).
            let next = unsafe { Self::following(block) };
            // SAFETY: `next` is live: either a real block or the sentinel,
            // both always present in a fully initialized chain.
            if unsafe { next.as_ref() }.used {
                return;
            }
            // SAFETY: `block` and `next` are both live and distinct.
            unsafe { (*block.as_ptr()).size += next.as_ref().size };
        }
    }

    /// Merge every free block in the chain with its free successor(s).
    fn merge_all(&mut self) {
        let base = self.base.expect("heap not initialized");
        // SAFETY: `base` addresses an initialized chain.
        let mut cursor = unsafe { Cursor::new(base) };
        while let Some(block) = cursor.current() {
            // SAFETY: `block` is live.
            if !unsafe { block.as_ref() }.used {
                self.merge_forward(block);
            }
            cursor.advance();
        }
    }

    /// Retract the break past a free trailing block, if the last block in
    /// the chain is free.
    fn shrink(&mut self) {
        let base = self.base.expect("heap not initialized");
        // SAFETY: `base` addresses an initialized chain.
        let mut cursor = unsafe { Cursor::new(base) };
        let mut last = None;
        while let Some(block) = cursor.current() {
            last = Some(block);
            cursor.advance();
        }
        let Some(last) = last else {
            return; // heap contains only the sentinel
        };
        // SAFETY: `last` is live.
        if unsafe { last.as_ref() }.used {
            return;
        }
        let size = unsafe { last.as_ref() }.size;
        self.brk
            .adjust(-((size + HEADER_SIZE) as isize))
            .expect("failed to shrink the heap");
        self.install_sentinel();
        log::trace!("shrank heap by {} bytes", size + HEADER_SIZE);
    }

    /// Release a previously allocated pointer, coalescing it with its free
    /// neighbors and retracting the break if the tail of the heap is now
    /// free. A null pointer is a no-op.
    pub fn free(&mut self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        // SAFETY: by contract, `ptr` was returned by a prior `alloc`/
        // `resize` call and has not yet been released.
        let block = unsafe { header_of(ptr) };
        // SAFETY: `block` is live.
        let header = unsafe { &mut *block.as_ptr() };
        if !header.used {
            log::warn!("double free (or invalid pointer) detected in free()");
        }
        assert!(header.used, "double free or invalid pointer passed to free()");
        header.used = false;

        self.merge_all();
        self.shrink();
    }

    /// Resize a previously allocated pointer: grow in place if a following
    /// free block (after merging) is large enough, otherwise relocate.
    /// `ptr` null is equivalent to `alloc`, `size` zero is equivalent to
    /// `free`.
    pub fn resize(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        let Some(p) = NonNull::new(ptr) else {
            return self.alloc(size);
        };
        if size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }

        let need = round_up(size + HEADER_SIZE, ALIGN);
        // SAFETY: by contract, `p` was returned by a prior `alloc`/`resize`.
        let block = unsafe { header_of(p) };
        // SAFETY: `block` is live.
        let current_size = unsafe { block.as_ref() }.size;

        if need > current_size {
            self.merge_forward(block);
            self.split(block, need);
            // SAFETY: `block` is live.
            if unsafe { block.as_ref() }.size >= need {
                return ptr;
            }

            // In-place growth failed; relocate. The usable payload of the
            // old block is the only record we have of "how much data is
            // really there" -- the core keeps no external record of the
            // original request size. Copying `min(old usable payload, new
            // size)` bytes is therefore the most that can be preserved.
            // SAFETY: `block` is live.
            let old_payload = unsafe { block.as_ref() }.size - HEADER_SIZE;
            let new_ptr = self.alloc(size);
            let copy_len = old_payload.min(size);
            // SAFETY: `ptr` has at least `copy_len` readable bytes (just
            // established) and `new_ptr` was freshly allocated with at
            // least `size >= copy_len` writable bytes; the two allocations
            // never overlap.
            unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, copy_len) };
            self.free(ptr);
            return new_ptr;
        }

        // Shrink-or-equal case.
        self.split(block, need);
        self.merge_all();
        self.shrink();
        ptr
    }

    /// Allocate `nmemb * size` bytes and zero them. Does not check
    /// `nmemb * size` for overflow -- an explicit, documented limitation
    /// carried over from the original source.
    pub fn zeroed_alloc(&mut self, nmemb: usize, size: usize) -> *mut u8 {
        let ptr = self.alloc(nmemb * size);
        if !ptr.is_null() {
            // SAFETY: `alloc` guarantees at least `nmemb * size` writable
            // bytes for a non-null return.
            unsafe { ptr::write_bytes(ptr, 0, nmemb * size) };
        }
        ptr
    }

    /// Resize a previously allocated array to `nmemb * size` bytes. Same
    /// overflow caveat as [`Self::zeroed_alloc`].
    pub fn array_resize(&mut self, ptr: *mut u8, nmemb: usize, size: usize) -> *mut u8 {
        self.resize(ptr, nmemb * size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::break_source::SimulatedBreak;

    fn allocator(capacity: usize) -> RawAllocator<SimulatedBreak> {
        RawAllocator::new(SimulatedBreak::with_capacity(capacity))
    }

    /// Walk the chain from `base`, returning `(size, used)` for every
    /// non-sentinel block in order. Used by tests to assert on chain shape
    /// without reaching into allocator internals from outside the crate.
    fn chain(alloc: &mut RawAllocator<SimulatedBreak>) -> std::vec::Vec<(usize, bool)> {
        let base = alloc.ensure_init();
        let mut cursor = unsafe { Cursor::new(base) };
        let mut out = std::vec::Vec::new();
        while let Some(block) = cursor.current() {
            let header = unsafe { block.as_ref() };
            out.push((header.size, header.used));
            cursor.advance();
        }
        out
    }

    #[test]
    fn first_allocation_initializes_heap_exactly_once() {
        let mut a = allocator(4096);
        let p1 = a.alloc(8);
        assert!(!p1.is_null());
        assert_eq!(chain(&mut a), std::vec![(24, true)]);
        let base_before = a.base;
        let _ = a.alloc(8);
        assert_eq!(a.base, base_before);
    }

    #[test]
    fn zero_byte_request_yields_releasable_minimum_block() {
        let mut a = allocator(4096);
        let p = a.alloc(0);
        assert!(!p.is_null());
        // need = round_up(0 + 16, 8) = 16, but 16 < HEADER_SIZE + MIN_PAYLOAD
        // only matters for *splitting*, not for the minimum block itself.
        assert_eq!(chain(&mut a), std::vec![(16, true)]);
        a.free(p);
        assert_eq!(chain(&mut a), std::vec![]);
    }

    #[test]
    fn grow_then_release_round_trips_to_empty_chain() {
        let mut a = allocator(4096);
        let p = a.alloc(100);
        assert_eq!(chain(&mut a), std::vec![(120, true)]);
        a.free(p);
        assert_eq!(chain(&mut a), std::vec![]);
    }

    #[test]
    fn split_when_leftover_is_large_enough() {
        // `alloc`'s split never invokes `shrink`, unlike `free`/`resize`'s
        // shrink-or-equal path, so reuse a *non-trailing* free block (one
        // with a used neighbor after it) to observe the split persist.
        let mut a = allocator(4096);
        let first = a.alloc(184); // need = round_up(200, 8) = 200
        let second = a.alloc(16); // need = 32, keeps `first` from being last
        assert_eq!(chain(&mut a), std::vec![(200, true), (32, true)]);

        a.free(first);
        assert_eq!(chain(&mut a), std::vec![(200, false), (32, true)]);

        let p = a.alloc(16); // first-fit reuses the freed 200-byte block
        assert_eq!(chain(&mut a), std::vec![(32, true), (168, false), (32, true)]);

        a.free(p);
        a.free(second);
    }

    #[test]
    fn no_split_when_leftover_too_small() {
        let mut a = allocator(4096);
        let p = a.alloc(184); // block of 200
        // need for payload 160 is round_up(176, 8) = 176; leftover = 24 < 40
        let p = a.resize(p, 160);
        assert_eq!(chain(&mut a), std::vec![(200, true)]);
        a.free(p);
    }

    #[test]
    fn split_boundary_just_under_does_not_split() {
        // old = 200, need = 168, leftover = 32 < HEADER_SIZE + MIN_PAYLOAD (40).
        let mut a = allocator(4096);
        let first = a.alloc(184);
        let second = a.alloc(16);
        a.free(first);
        let p = a.alloc(152); // need = round_up(152 + 16, 8) = 168
        assert_eq!(chain(&mut a), std::vec![(200, true), (32, true)]);
        a.free(p);
        a.free(second);
    }

    #[test]
    fn split_boundary_exactly_threshold_does_split() {
        // old = 200, need = 160, leftover = 40 == HEADER_SIZE + MIN_PAYLOAD.
        let mut a = allocator(4096);
        let first = a.alloc(184);
        let second = a.alloc(16);
        a.free(first);
        let p = a.alloc(144); // need = round_up(144 + 16, 8) = 160
        assert_eq!(chain(&mut a), std::vec![(160, true), (40, false), (32, true)]);
        a.free(p);
        a.free(second);
    }

    #[test]
    fn forward_merge_on_release() {
        let mut a = allocator(4096);
        let first = a.alloc(184); // block of 200
        let second = a.alloc(16); // keeps `first` from being last-before-sentinel
        a.free(first);
        let p = a.alloc(16); // splits the freed block into {used 32, free 168}
        assert_eq!(chain(&mut a), std::vec![(32, true), (168, false), (32, true)]);

        a.free(p);
        // merge_all fuses the freed 32 back into its free neighbor.
        assert_eq!(chain(&mut a), std::vec![(200, false), (32, true)]);

        a.free(second);
        // merge_all fuses everything, then shrink retracts the break entirely.
        assert_eq!(chain(&mut a), std::vec![]);
    }

    #[test]
    fn in_place_grow_via_resize_uses_following_free_block() {
        let mut a = allocator(4096);
        let p1 = a.alloc(16); // [0,32) used
        let p2 = a.alloc(184); // [32,232) used, size 200

        // Build the scenario's precondition directly: {used[0,32), free[32,232)}.
        // Going through `free()` would immediately shrink this trailing free
        // block away, so poke the header directly instead (this is a
        // white-box test of `merge_forward`/`split`, not of `free`).
        let block2 = unsafe { header_of(NonNull::new(p2).unwrap()) };
        unsafe { (*block2.as_ptr()).used = false };
        assert_eq!(chain(&mut a), std::vec![(32, true), (200, false)]);

        let grown = a.resize(p1, 100); // need = 120
        assert_eq!(grown, p1, "growth into a free neighbor stays in place");
        assert_eq!(chain(&mut a), std::vec![(120, true), (112, false)]);
    }

    #[test]
    fn relocating_resize_copies_existing_payload() {
        let mut a = allocator(4096);
        let first = a.alloc(16); // [0,32) used, used neighbor follows
        let second = a.alloc(16); // [32,64) used
        let _ = second;
        unsafe {
            ptr::write_bytes(first, 0xAB, 16);
        }
        let grown = a.resize(first, 100);
        assert_ne!(grown, first);
        let bytes = unsafe { core::slice::from_raw_parts(grown, 16) };
        assert!(bytes.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn resize_to_current_payload_size_is_a_no_op() {
        let mut a = allocator(4096);
        let p = a.alloc(100);
        let p2 = a.resize(p, 100);
        assert_eq!(p, p2);
    }

    #[test]
    fn resize_null_is_allocate() {
        let mut a = allocator(4096);
        let p = a.resize(ptr::null_mut(), 16);
        assert!(!p.is_null());
    }

    #[test]
    fn resize_to_zero_is_release() {
        let mut a = allocator(4096);
        let p = a.alloc(16);
        let p2 = a.resize(p, 0);
        assert!(p2.is_null());
        assert_eq!(chain(&mut a), std::vec![]);
    }

    #[test]
    fn free_null_is_a_no_op() {
        let mut a = allocator(4096);
        a.free(ptr::null_mut());
    }

    #[test]
    fn release_of_only_block_retracts_to_sentinel_only() {
        let mut a = allocator(4096);
        let p = a.alloc(8);
        a.free(p);
        assert_eq!(chain(&mut a), std::vec![]);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut a = allocator(4096);
        let p = a.alloc(8);
        a.free(p);
        a.free(p);
    }

    #[test]
    fn zeroed_alloc_zeroes_payload() {
        let mut a = allocator(4096);
        let p = a.zeroed_alloc(4, 8);
        let bytes = unsafe { core::slice::from_raw_parts(p, 32) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn array_resize_computes_nmemb_times_size_and_relocates() {
        let mut a = allocator(4096);
        let first = a.alloc(16); // [0,32) used, used neighbor follows
        let second = a.alloc(16); // [32,64) used
        let _ = second;
        unsafe {
            ptr::write_bytes(first, 0xEF, 16);
        }

        // 4 * 25 = 100 bytes, too large to grow in place (neighbor is used).
        let grown = a.array_resize(first, 4, 25);
        assert_ne!(grown, first);
        let bytes = unsafe { core::slice::from_raw_parts(grown, 16) };
        assert!(bytes.iter().all(|&b| b == 0xEF));

        let block = unsafe { header_of(NonNull::new(grown).unwrap()) };
        let need = round_up(100 + HEADER_SIZE, ALIGN);
        assert_eq!(unsafe { block.as_ref() }.size, need);
    }

    #[test]
    fn every_header_and_payload_address_is_aligned() {
        let mut a = allocator(4096);
        let sizes = [1usize, 3, 7, 8, 9, 31, 100, 0, 17];
        let mut ptrs = std::vec::Vec::new();
        for &s in &sizes {
            ptrs.push(a.alloc(s));
        }
        for p in ptrs {
            assert_eq!((p as usize) % ALIGN, 0);
        }
        let base = a.base.unwrap();
        assert_eq!(base.as_ptr() as usize % ALIGN, 0);
    }

    #[test]
    fn no_two_adjacent_free_blocks_after_release() {
        let mut a = allocator(4096);
        let p1 = a.alloc(16);
        let p2 = a.alloc(16);
        let p3 = a.alloc(16);
        a.free(p1);
        a.free(p3);
        a.free(p2);
        // all three released and adjacent: merge_all must have fused them.
        assert_eq!(chain(&mut a), std::vec![]);
    }
}
