//! Model configuration
//!
//! The configuration is read from a `config.json` in the model directory, then
//! adjusted for the run with [`ModelOverrides`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while loading or validating a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read model config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse model config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid model config: {0}")]
    Invalid(String),
}

/// Llama-style decoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlamaConfig {
    /// Vocabulary size
    pub vocab_size: usize,
    /// Hidden dimension
    pub hidden_size: usize,
    /// Number of decoder blocks
    pub num_hidden_layers: usize,
    /// Longest sequence the model accepts
    pub max_position_embeddings: usize,
    /// Epsilon added inside RMSNorm
    pub rms_norm_eps: f32,
    /// Standard deviation of the weight initializer
    pub initializer_range: f32,
    /// KV cache flag (always disabled for training)
    pub use_cache: bool,
    /// Split normalization gradients across the sequence dimension of tensor-parallel ranks
    pub sequence_parallel_enabled: bool,
    /// Recompute block activations in backward instead of storing them
    pub selective_checkpoint_enabled: bool,
    /// Where the configuration came from
    #[serde(rename = "_name_or_path")]
    pub name_or_path: String,
}

impl Default for LlamaConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32000,
            hidden_size: 4096,
            num_hidden_layers: 32,
            max_position_embeddings: 4096,
            rms_norm_eps: 1e-5,
            initializer_range: 0.02,
            use_cache: true,
            sequence_parallel_enabled: false,
            selective_checkpoint_enabled: false,
            name_or_path: String::new(),
        }
    }
}

/// Run-time adjustments to a loaded configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelOverrides {
    /// Training sequence length; raises `max_position_embeddings` if needed
    pub seq_len: usize,
    /// Replacement layer count; ignored unless positive
    pub num_layers: i64,
    pub sequence_parallel_enabled: bool,
    pub selective_checkpoint_enabled: bool,
}

impl LlamaConfig {
    /// Load `config.json` from a model directory, or a JSON file given directly.
    pub fn from_pretrained(path: &Path) -> Result<Self, ConfigError> {
        let file = if path.is_dir() {
            path.join("config.json")
        } else {
            path.to_path_buf()
        };
        let content = fs::read_to_string(&file).map_err(|source| ConfigError::Io {
            path: file.clone(),
            source,
        })?;
        let mut config: LlamaConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: file.clone(),
                source,
            })?;
        if config.name_or_path.is_empty() {
            config.name_or_path = path.display().to_string();
        }
        config.validate()?;
        Ok(config)
    }

    /// Apply training overrides.
    pub fn apply_overrides(&mut self, overrides: &ModelOverrides) {
        self.use_cache = false;
        self.max_position_embeddings = self.max_position_embeddings.max(overrides.seq_len);
        if overrides.num_layers > 0 {
            self.num_hidden_layers = overrides.num_layers as usize;
        }
        if overrides.sequence_parallel_enabled {
            self.sequence_parallel_enabled = true;
        }
        if overrides.selective_checkpoint_enabled {
            self.selective_checkpoint_enabled = true;
        }
    }

    /// Check that the dimensions describe a buildable model.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vocab_size == 0 {
            return Err(ConfigError::Invalid("vocab_size must be positive".into()));
        }
        if self.hidden_size == 0 {
            return Err(ConfigError::Invalid("hidden_size must be positive".into()));
        }
        if self.num_hidden_layers == 0 {
            return Err(ConfigError::Invalid(
                "num_hidden_layers must be positive".into(),
            ));
        }
        if self.rms_norm_eps <= 0.0 {
            return Err(ConfigError::Invalid("rms_norm_eps must be positive".into()));
        }
        Ok(())
    }
}

impl fmt::Display for LlamaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string_pretty(self).map_err(|_| fmt::Error)?;
        write!(f, "LlamaConfig {json}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_only_raise_positions() {
        let mut config = LlamaConfig {
            max_position_embeddings: 4096,
            ..Default::default()
        };
        config.apply_overrides(&ModelOverrides {
            seq_len: 2048,
            num_layers: -1,
            ..Default::default()
        });
        assert_eq!(config.max_position_embeddings, 4096);
        assert_eq!(config.num_hidden_layers, 32);
        assert!(!config.use_cache);

        config.apply_overrides(&ModelOverrides {
            seq_len: 8192,
            num_layers: 4,
            sequence_parallel_enabled: true,
            selective_checkpoint_enabled: false,
        });
        assert_eq!(config.max_position_embeddings, 8192);
        assert_eq!(config.num_hidden_layers, 4);
        assert!(config.sequence_parallel_enabled);
        assert!(!config.selective_checkpoint_enabled);
    }

    #[test]
    fn test_validate_rejects_zero_dims() {
        let config = LlamaConfig {
            hidden_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
