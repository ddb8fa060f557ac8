//! Error types for relocation operations
//!
//! Tracking-side desyncs (double free, duplicate base, illegal guarded
//! access) are not errors. They panic, because the table no longer
//! describes the program and nothing downstream can be trusted. Errors
//! here are the operational failures of the relocation engine: the
//! request could not be honored and the runtime state is unchanged.

use thiserror::Error;

/// Errors that can occur while moving allocations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationError {
    /// No live allocation covers the requested address
    #[error("no live allocation covers {0:#x}")]
    EntryNotFound(u64),

    /// The scheduler could not bring the world to a stop
    #[error("scheduler failed to pause the world")]
    PauseFailed,

    /// The allocation is pinned and refuses to move
    #[error("allocation at {0:#x} is pinned")]
    PinnedAllocation(u64),

    /// Source or destination range is not backed by the memory image
    #[error("range {addr:#x}+{size:#x} is outside the memory image")]
    BackingUnavailable {
        /// Start of the offending range
        addr: u64,
        /// Length of the offending range
        size: u64,
    },

    /// The destination range overlaps a live allocation
    #[error("destination {addr:#x}+{size:#x} overlaps a live allocation")]
    DestinationOverlaps {
        /// Start of the destination range
        addr: u64,
        /// Length of the destination range
        size: u64,
    },
}

/// Result type alias for relocation operations
pub type RelocResult<T> = Result<T, RelocationError>;
