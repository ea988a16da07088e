//! Error surface of the fabric.
//!
//! The surface is intentionally small: allocation failures, rank validation,
//! and transport faults. Spin conditions never surface as errors, and
//! handler panics travel through the façade's failure slot rather than
//! through `Result`.

use thiserror::Error;

/// Convenience result alias for fallible fabric operations.
pub type FabricResult<T, E = FabricError> = Result<T, E>;

/// Errors surfaced by the fabric.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Allocation of a backing region failed for the given size/alignment.
    #[error("failed to allocate region of {size} bytes aligned to {alignment}")]
    AllocationFailed {
        /// Requested region length in bytes.
        size: usize,
        /// Requested alignment in bytes.
        alignment: usize,
    },

    /// A rank outside `[0, size)` was named.
    #[error("rank {rank} is not valid in a communicator of size {size}")]
    InvalidRank {
        /// The offending rank.
        rank: usize,
        /// Communicator size.
        size: usize,
    },

    /// The underlying transport reported a fault; fatal for the epoch.
    #[error("transport fault: {0}")]
    Transport(String),
}

impl FabricError {
    /// Builds a transport fault from any displayable cause.
    pub fn transport(cause: impl Into<String>) -> Self {
        FabricError::Transport(cause.into())
    }
}
