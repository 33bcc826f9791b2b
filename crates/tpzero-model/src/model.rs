//! Causal language model interface

use crate::config::LlamaConfig;
use crate::error::ModelError;
use crate::param::ParamRegistry;
use crate::precision::Precision;
use serde::{Deserialize, Serialize};

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// One microbatch of tokenized sequences, all of the same length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u8>>,
    pub labels: Vec<Vec<i64>>,
}

impl Batch {
    /// Batch whose labels are the inputs and whose mask is all ones.
    pub fn from_input_ids(input_ids: Vec<Vec<u32>>) -> Self {
        let attention_mask = input_ids.iter().map(|row| vec![1; row.len()]).collect();
        let labels = input_ids
            .iter()
            .map(|row| row.iter().map(|&id| id as i64).collect())
            .collect();
        Self {
            input_ids,
            attention_mask,
            labels,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.len()
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.first().map_or(0, Vec::len)
    }
}

/// A trainable causal LM whose parameters live in a [`ParamRegistry`].
pub trait CausalLm: Send {
    fn config(&self) -> &LlamaConfig;

    fn params(&self) -> &ParamRegistry;

    fn params_mut(&mut self) -> &mut ParamRegistry;

    fn precision(&self) -> Precision;

    /// Forward and backward pass over `batch`.
    ///
    /// Gradients scaled by `loss_scale` are added to the existing gradients.
    /// Returns the unscaled mean next-token loss.
    fn forward_backward(&mut self, batch: &Batch, loss_scale: f32) -> Result<f32, ModelError>;

    /// Loss without touching gradients.
    fn loss(&self, batch: &Batch) -> Result<f32, ModelError>;
}
