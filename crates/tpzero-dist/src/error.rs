//! Errors raised by collective operations

use thiserror::Error;

/// Errors that can occur while communicating with peers
#[derive(Debug, Error)]
pub enum CommError {
    #[error("peer disconnected from group '{group}' (local rank {rank})")]
    Disconnected { group: String, rank: usize },
    #[error("collective size mismatch in group '{group}': expected {expected} elements, got {got}")]
    SizeMismatch {
        group: String,
        expected: usize,
        got: usize,
    },
    #[error("unexpected payload type in group '{group}'")]
    PayloadType { group: String },
    #[error("invalid parallel topology: {0}")]
    InvalidTopology(String),
    #[error("failed to spawn worker for rank {rank}: {source}")]
    Spawn {
        rank: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("worker for rank {0} panicked")]
    WorkerPanicked(usize),
}
