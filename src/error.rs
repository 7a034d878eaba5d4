//! MpiArrayError: unified error type for mpi-array public APIs.
//!
//! Index and shape errors are local and recoverable; `ExchangeFailed` and
//! `AssemblyFailed` indicate a cross-process protocol failure and must be
//! treated as fatal for the whole distributed operation.

use crate::indexing::Dir;
use thiserror::Error;

/// Unified error type for mpi-array operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MpiArrayError {
    /// The process count cannot be arranged into the requested grid.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),
    /// A rank, coordinate or axis outside its valid range.
    #[error("out of range: {0}")]
    OutOfRange(String),
    /// The decomposition inputs admit no consistent partition.
    #[error("invalid partition: {0}")]
    InvalidPartition(String),
    /// Axis counts (or defensively checked element counts) disagree.
    #[error("shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: usize, found: usize },
    /// A global index that falls outside this rank's interior-or-halo region.
    /// Whether it is owned elsewhere or truly out of bounds is the caller's
    /// call, via the global shape.
    #[error("global index {index:?} is not held by rank {rank}")]
    OutOfLocalRange { rank: usize, index: Vec<usize> },
    /// A halo exchange could not complete; fatal for the distributed
    /// computation, never retried automatically.
    #[error("halo exchange failed with neighbour {neighbor} on axis {axis} ({dir} side): {detail}")]
    ExchangeFailed {
        neighbor: usize,
        axis: usize,
        dir: Dir,
        detail: String,
    },
    /// A collective gather/reduce could not complete or a participant's
    /// reported shape drifted from the declared decomposition.
    #[error("assembly failed: {0}")]
    AssemblyFailed(String),
}
