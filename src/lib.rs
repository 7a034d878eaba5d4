//! # mpi-array
//!
//! mpi-array is a Rust library for multi-dimensional arrays partitioned and
//! processed across many cooperating worker processes using message passing.
//! It provides cartesian process topologies, block decomposition with ghost
//! (halo) regions, a distributed array container, a deadlock-free halo
//! exchange engine, and gather/reduce collectives, supporting both serial
//! and MPI-based distributed workflows.
//!
//! ## Features
//! - Balanced cartesian factorization of the process count with O(1)
//!   rank ↔ coordinate mapping
//! - Block partitioning with deterministic remainder placement, per-axis
//!   asymmetric halo depths and per-axis boundary policies (periodic,
//!   clamped, none)
//! - Pluggable communication backends (serial, in-process, MPI) behind a
//!   minimal non-blocking [`Communicator`](communicator::Communicator) trait
//! - Halo exchange with cached neighbour plans, receive-before-send posting
//!   order and an optional watchdog timeout
//! - Variable-size gather with defensive extent validation, and global /
//!   replica-wise reductions over a closed operator set
//!
//! ## Determinism
//!
//! Partition bounds, neighbour walks, pack/unpack orders and reduction
//! combine orders are all deterministic, so repeated runs over the same
//! inputs produce identical results.
//!
//! ## Usage
//! Add `mpi-array` as a dependency in your `Cargo.toml` and enable features
//! as needed:
//!
//! ```toml
//! [dependencies]
//! mpi-array = "0.3"
//! # Optional features:
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! Ghost cells are scratch space between exchanges: user code mutates
//! interior cells freely and calls the exchange engine before any
//! computation that reads ghost values.

// Re-export our major subsystems:
pub mod array;
pub mod collective;
pub mod communicator;
pub mod decomposition;
pub mod error;
pub mod exchange;
pub mod indexing;
pub mod topology;
pub mod wire;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::array::DistributedArray;
    pub use crate::collective::{ReduceOp, gather, reduce, reduce_replicated};
    pub use crate::communicator::{CommTag, Communicator, ExchangeTags, NoComm, RayonComm, Wait};
    #[cfg(feature = "mpi-support")]
    pub use crate::communicator::MpiComm;
    pub use crate::decomposition::{BlockDecomposition, BoundaryPolicy, DecompConfig};
    pub use crate::error::MpiArrayError;
    pub use crate::exchange::HaloExchange;
    pub use crate::indexing::{Dir, GlobalShape, IndexingExtent, LocalExtent};
    pub use crate::topology::CartTopology;
}
