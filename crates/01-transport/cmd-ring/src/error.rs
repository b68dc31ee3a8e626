//! Error surface of the command ring.
//!
//! Only construction is fallible. Admission stalls are backpressure, not
//! errors, and a pairing actor running ahead of the drain actor is a fatal
//! invariant violation that panics instead of returning a value.

use thiserror::Error;

/// Convenience result alias for fallible ring operations.
pub type RingResult<T, E = RingError> = Result<T, E>;

/// Errors surfaced while configuring or building a [`Ring`](crate::Ring).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    /// Capacity is zero, not a power of two, or above [`MAX_CAPACITY`](crate::MAX_CAPACITY).
    #[error("ring capacity {requested} must be a non-zero power of two no larger than {maximum}")]
    InvalidCapacity { requested: usize, maximum: usize },

    /// A configuration source could not be interpreted.
    #[error("invalid ring configuration: {0}")]
    InvalidConfig(String),
}
