//! Error types for Tallyboard.

use thiserror::Error;

/// Result type alias using Tallyboard's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Tallyboard operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Region construction rejected: bad length, misalignment, or
    /// disagreeing capacities.
    #[error("invalid region layout: {0}")]
    InvalidLayout(String),

    /// No counter ID is available for reuse. Covers both a full registry
    /// and freed IDs still inside their reuse cooldown.
    #[error("counters exhausted: no id available for reuse")]
    Exhausted,

    /// Key does not fit the key area of a metadata record.
    #[error("key length {length} exceeds maximum {max}")]
    KeyTooLong {
        /// Length of the rejected key in bytes.
        length: usize,
        /// Maximum key length the record layout allows.
        max: usize,
    },

    /// Label does not fit the label area of a metadata record.
    #[error("label length {length} exceeds maximum {max}")]
    LabelTooLong {
        /// Length of the rejected label in bytes.
        length: usize,
        /// Maximum label length the record layout allows.
        max: usize,
    },

    /// Counter ID is outside `[0, capacity)`.
    #[error("counter id {0} out of range")]
    IdOutOfRange(i32),

    /// Counter ID does not refer to an allocated counter.
    #[error("counter id {0} is not allocated")]
    NotAllocated(i32),

    /// The mapping is read-only and cannot back an allocator.
    #[error("region mapping is read-only")]
    ReadOnlyRegion,

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
