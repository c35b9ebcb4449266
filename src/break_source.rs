//! The break-adjustment primitive the core grows and shrinks the heap with.
//!
//! [`BreakSource`] abstracts "return current break" (`adjust(0)`) and
//! "advance break by delta bytes (possibly negative), return the old break"
//! (`adjust(delta)`) so the core can be driven by the real operating system
//! ([`SystemBreak`]) or, in tests, by a plain buffer ([`SimulatedBreak`])
//! without touching the process-wide break.

use crate::error::BreakError;
use std::ptr::NonNull;

/// A source of heap memory modeled after `sbrk(2)`.
///
/// # Safety
/// Implementors must return addresses that remain valid (i.e. not reused by
/// anything else) for as long as they lie below the most recently returned
/// break, and `adjust` must be atomic with respect to any other caller of
/// the same `BreakSource` (the core itself assumes single-threaded access).
pub unsafe trait BreakSource {
    /// Return the current break without moving it.
    fn current(&self) -> NonNull<u8>;

    /// Move the break by `delta` bytes (negative shrinks it) and return the
    /// break as it was *before* the adjustment.
    ///
    /// # Errors
    /// Returns [`BreakError::GrowthFailed`] if the underlying primitive
    /// refused the adjustment (address-space exhaustion for a positive
    /// `delta`).
    fn adjust(&self, delta: isize) -> Result<NonNull<u8>, BreakError>;
}

/// The real break primitive, implemented with `sbrk(2)` via `libc`.
///
/// The break is process-wide OS state; constructing more than one
/// `SystemBreak`-backed allocator in the same process is a violation of the
/// model (just like linking two libc allocators together would be).
#[cfg(unix)]
#[derive(Default)]
pub struct SystemBreak {
    _private: (),
}

#[cfg(unix)]
impl SystemBreak {
    /// Create a handle to the process's break.
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(unix)]
// SAFETY: `sbrk` is the OS-provided break primitive itself; there is
// nothing this wrapper could do to violate the trait's contract beyond
// what calling `sbrk` directly would already risk.
unsafe impl BreakSource for SystemBreak {
    fn current(&self) -> NonNull<u8> {
        // SAFETY: `sbrk(0)` only reads the current break, never fails.
        let brk = unsafe { libc::sbrk(0) };
        NonNull::new(brk.cast()).expect("sbrk(0) returned a null break")
    }

    fn adjust(&self, delta: isize) -> Result<NonNull<u8>, BreakError> {
        // SAFETY: `sbrk` with a bounded `delta` is always sound to call;
        // the kernel rejects the request rather than corrupting memory.
        let old = unsafe { libc::sbrk(delta as libc::intptr_t) };
        if old == (-1isize as *mut libc::c_void) {
            log::error!("sbrk({delta}) failed: address space exhausted");
            return Err(BreakError::GrowthFailed);
        }
        Ok(NonNull::new(old.cast()).expect("sbrk returned a null break"))
    }
}

/// A `Vec`-backed stand-in for the break, used by the test suite.
///
/// This lets the growth/shrink logic in [`crate::raw_allocator`] be
/// exercised deterministically, independent of the real process break: the
/// break is an OS resource mediated by an injected primitive so the core is
/// testable against a simulated one.
#[cfg(test)]
pub struct SimulatedBreak {
    memory: std::cell::UnsafeCell<Vec<u8>>,
}

#[cfg(test)]
impl SimulatedBreak {
    /// Create a simulated heap with `capacity` bytes of backing storage.
    ///
    /// The backing `Vec` never reallocates past `capacity`, so pointers
    /// handed out by [`BreakSource::adjust`] stay valid for the lifetime of
    /// this `SimulatedBreak` -- growing past `capacity` is treated the same
    /// way real address-space exhaustion is.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            memory: std::cell::UnsafeCell::new(Vec::with_capacity(capacity)),
        }
    }
}

#[cfg(test)]
// SAFETY: `SimulatedBreak` is only ever used single-threaded inside one
// `#[test]` at a time, the same access pattern the core assumes in
// production.
unsafe impl BreakSource for SimulatedBreak {
    fn current(&self) -> NonNull<u8> {
        // SAFETY: exclusive access is the crate's single-threaded contract.
        let memory = unsafe { &*self.memory.get() };
        let addr = memory.as_ptr() as *mut u8;
        // SAFETY: `addr` is the start of the backing `Vec`'s allocation and
        // `memory.len()` is within its bounds (one-past-the-end is valid).
        let end = unsafe { addr.add(memory.len()) };
        NonNull::new(end).expect("backing buffer base is never null")
    }

    fn adjust(&self, delta: isize) -> Result<NonNull<u8>, BreakError> {
        // SAFETY: exclusive access is the crate's single-threaded contract.
        let memory = unsafe { &mut *self.memory.get() };
        let old_len = memory.len();
        let old_addr = memory.as_ptr() as *mut u8;
        // SAFETY: same reasoning as `current` above.
        let old = unsafe { addr_plus(old_addr, old_len) };

        if delta >= 0 {
            let grow_by = delta as usize;
            if old_len + grow_by > memory.capacity() {
                log::error!("simulated break exhausted: wanted {grow_by} more bytes");
                return Err(BreakError::GrowthFailed);
            }
            memory.resize(old_len + grow_by, 0);
        } else {
            let shrink_by = (-delta) as usize;
            memory.truncate(old_len.saturating_sub(shrink_by));
        }
        Ok(old)
    }
}

/// # Safety
/// `base` must point into (or one-past-the-end of) an allocation at least
/// `offset` bytes long.
#[cfg(test)]
unsafe fn addr_plus(base: *mut u8, offset: usize) -> NonNull<u8> {
    // SAFETY: forwarded from the caller.
    let ptr = unsafe { base.add(offset) };
    NonNull::new(ptr).expect("backing buffer base is never null")
}
