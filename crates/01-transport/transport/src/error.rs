//! Error handling helpers for the transport crate.
//!
//! The transport layer keeps its error surface small: capacity validation,
//! allocation failures, window bounds and frame headers a peer corrupted.
//! Ring operations report backpressure through their return values instead
//! of errors.

use std::fmt;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Errors surfaced by low-level transport helpers.
pub enum TransportError {
    /// Requested ring capacity or buffer size is below the minimum or not properly aligned.
    InvalidCapacity { requested: usize, minimum: usize },
    /// Allocation of a shared region failed for the given size/alignment pair.
    AllocationFailed { size: usize, alignment: usize },
    /// A sub-window does not fit inside its parent window.
    OutOfBounds {
        offset: usize,
        len: usize,
        window: usize,
    },
    /// A frame header announces more bytes than the ring can hold.
    CorruptFrame { len: u64, capacity: usize },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::InvalidCapacity { requested, minimum } => {
                write!(
                    f,
                    "ring capacity {requested} must be at least {minimum} bytes and 8-byte aligned"
                )
            }
            TransportError::AllocationFailed { size, alignment } => {
                write!(
                    f,
                    "failed to allocate shared region of {size} bytes aligned to {alignment}"
                )
            }
            TransportError::OutOfBounds {
                offset,
                len,
                window,
            } => {
                write!(
                    f,
                    "range {offset}..{} exceeds window of {window} bytes",
                    offset.saturating_add(*len)
                )
            }
            TransportError::CorruptFrame { len, capacity } => {
                write!(f, "frame header announces {len} bytes in a ring of {capacity}")
            }
        }
    }
}

impl std::error::Error for TransportError {}
