//! Error types for Tactics.
//!
//! Allocation exhaustion inside `alloc` is reported through an invalid chunk,
//! not through [`Error`]. The variants here cover plan resolution, layouts,
//! configuration, and registry lookups.

use thiserror::Error;

use crate::types::TensorHandle;

/// Result type alias for Tactics operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The raw memory source could not provide the requested block.
    #[error("out of memory: requested {requested} bytes aligned to {align}")]
    OutOfMemory {
        /// Requested size in bytes.
        requested: usize,
        /// Requested alignment in bytes.
        align: usize,
    },

    /// A size/alignment pair that does not form a valid layout.
    #[error("invalid layout: size {size}, align {align}")]
    InvalidLayout {
        /// Requested size in bytes.
        size: usize,
        /// Requested alignment in bytes.
        align: usize,
    },

    /// A deferred plan's backing block comes from a parent whose own plan
    /// has not been resolved yet.
    #[error("backing block is unresolved; compute the parent allocator first")]
    UnresolvedBacking,

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No raw source registered under this name.
    #[error("allocator not registered: {0}")]
    UnknownAllocator(String),

    /// A raw source is already registered under this name.
    #[error("allocator already registered: {0}")]
    DuplicateAllocator(String),

    /// The tensor holds no buffer in this pool.
    #[error("tensor {0} has no buffer")]
    UnknownTensor(TensorHandle),
}

impl Error {
    /// Returns true if retrying with a smaller plan could succeed.
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }
}
