//! Model construction for one rank

use crate::config::{LlamaConfig, ModelOverrides};
use crate::error::ModelError;
use crate::llama::TinyLlama;
use crate::model::CausalLm;
use crate::precision::Precision;
use tracing::info;

/// Where a model instance lives and how it is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub tp_rank: usize,
    pub tp_size: usize,
    pub precision: Precision,
    /// Initialization seed, shared by every rank.
    pub seed: u64,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            tp_rank: 0,
            tp_size: 1,
            precision: Precision::Fp32,
            seed: 12349,
        }
    }
}

/// Apply run overrides to `config` and build the model for `placement`.
pub fn build_model(
    mut config: LlamaConfig,
    overrides: &ModelOverrides,
    placement: &Placement,
) -> Result<TinyLlama, ModelError> {
    config.apply_overrides(overrides);
    config.validate()?;

    let model = TinyLlama::new(
        config,
        placement.precision,
        placement.tp_rank,
        placement.tp_size,
        placement.seed,
    )?;

    info!(
        tp_rank = placement.tp_rank,
        layers = model.config().num_hidden_layers,
        hidden = model.config().hidden_size,
        params = model.params().numel(),
        dtype = placement.precision.dtype_name(),
        sequence_parallel = model.config().sequence_parallel_enabled,
        selective_checkpoint = model.config().selective_checkpoint_enabled,
        "model built"
    );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_applies_overrides() {
        let config = LlamaConfig {
            vocab_size: 8,
            hidden_size: 4,
            num_hidden_layers: 6,
            max_position_embeddings: 16,
            ..Default::default()
        };
        let overrides = ModelOverrides {
            seq_len: 64,
            num_layers: 1,
            sequence_parallel_enabled: true,
            selective_checkpoint_enabled: true,
        };
        let model = build_model(config, &overrides, &Placement::default()).unwrap();
        assert_eq!(model.config().num_hidden_layers, 1);
        assert_eq!(model.config().max_position_embeddings, 64);
        assert!(model.config().sequence_parallel_enabled);
        assert!(!model.config().use_cache);
    }
}
