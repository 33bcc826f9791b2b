//! Model errors

use crate::config::ConfigError;
use thiserror::Error;

/// Errors raised while building or running a model
#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("parameter '{0}' is registered twice")]
    DuplicateParameter(String),
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
    #[error("shape mismatch for '{name}': expected {expected} elements, got {got}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("flat buffer has {got} elements, registry holds {expected}")]
    FlatLength { expected: usize, got: usize },
    #[error("batch is empty")]
    EmptyBatch,
    #[error("batch row {row} has length {got}, expected {expected}")]
    RaggedBatch {
        row: usize,
        expected: usize,
        got: usize,
    },
    #[error("sequence length {len} exceeds max_position_embeddings {max}")]
    SequenceTooLong { len: usize, max: usize },
    #[error("token id {token} is outside the vocabulary ({vocab})")]
    TokenOutOfRange { token: i64, vocab: usize },
}
