//! Error types for the ambient parts of the allocator that *can* recover.
//!
//! The core itself does not raise recoverable errors: a growth failure is
//! fatal and a contract violation on release is undefined behavior. This
//! type exists at the [`crate::break_source::BreakSource`] seam so that a
//! wrapper which wants an in-band `None`/null instead of a panic has
//! something to match on.

/// The break-adjustment primitive refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BreakError {
    /// `sbrk` (or its simulated stand-in) could not grow the heap, most
    /// likely because the address space (or, in tests, the simulated
    /// buffer's capacity) is exhausted.
    #[error("could not grow the heap: address space exhausted")]
    GrowthFailed,
}
