//! Model side of tpzero
//!
//! This crate provides:
//! - [`LlamaConfig`] loading and run-time overrides
//! - [`ParamRegistry`]: parameters tagged with their parallelism role
//! - [`TinyLlama`]: a compact decoder-only causal LM with hand-written backward
//! - [`build_model`]: construction and placement for a tensor-parallel rank
//!
//! # Example
//!
//! ```no_run
//! use tpzero_model::{build_model, Batch, CausalLm, LlamaConfig, ModelOverrides, Placement};
//! use std::path::Path;
//!
//! let config = LlamaConfig::from_pretrained(Path::new("./llama-7b"))?;
//! let overrides = ModelOverrides { seq_len: 128, num_layers: 2, ..Default::default() };
//! let mut model = build_model(config, &overrides, &Placement::default())?;
//!
//! let batch = Batch::from_input_ids(vec![vec![1; 128]]);
//! let loss = model.forward_backward(&batch, 1.0)?;
//! # Ok::<(), tpzero_model::ModelError>(())
//! ```

pub mod builder;
pub mod config;
pub mod error;
pub mod llama;
pub mod model;
pub mod param;
pub mod precision;

pub use builder::{build_model, Placement};
pub use config::{ConfigError, LlamaConfig, ModelOverrides};
pub use error::ModelError;
pub use llama::TinyLlama;
pub use model::{Batch, CausalLm, IGNORE_INDEX};
pub use param::{no_weight_decay, ParallelRole, ParamRegistry, Parameter};
pub use precision::{round_to_bf16, Precision};
