//! Collective communication for tpzero
//!
//! This crate provides the pieces every worker needs to cooperate with its peers:
//! - [`Collective`]: the all-reduce / all-gather / barrier interface
//! - [`ProcessGroup`]: a named group running ring collectives over channels
//! - [`ParallelLayout`] and [`ParallelState`]: tensor-parallel and data-parallel
//!   group assignment for a global rank
//! - [`LocalCluster`]: launches one worker thread per rank and wires their groups
//!
//! # Example
//!
//! ```no_run
//! use tpzero_dist::{Collective, LocalCluster, ParallelLayout, CommError};
//!
//! let layout = ParallelLayout::new(4, 2)?;
//! let sums = LocalCluster::launch(layout, |state| {
//!     let mut value = [state.global_rank() as f32];
//!     state.dp_group().all_reduce_sum(&mut value)?;
//!     Ok::<_, CommError>(value[0])
//! })?;
//! assert_eq!(sums.len(), 4);
//! # Ok::<(), CommError>(())
//! ```

pub mod backend;
pub mod cluster;
pub mod error;
pub mod group;
pub mod topology;

pub use backend::Collective;
pub use cluster::LocalCluster;
pub use error::CommError;
pub use group::ProcessGroup;
pub use topology::{ParallelLayout, ParallelState};
