//! Run context shared by every worker
//!
//! Everything a worker needs to know about the run is resolved once, before
//! any worker starts, and handed to each of them read-only.

use crate::config::{RunConfig, RunEnv};
use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use tpzero_dist::ParallelState;
use tpzero_model::{LlamaConfig, Placement, Precision};

/// Immutable inputs of one training run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: RunConfig,
    pub env: RunEnv,
    /// Architecture as loaded from `model_path`, before run overrides
    pub model_config: LlamaConfig,
}

impl RunContext {
    /// Load the model configuration named by `config.model_path`.
    pub fn new(config: RunConfig, env: RunEnv) -> Result<Self> {
        let model_config = LlamaConfig::from_pretrained(&config.model_path)
            .with_context(|| format!("Failed to load model config from {:?}", config.model_path))?;
        Ok(Self::from_parts(config, env, model_config))
    }

    pub fn from_parts(config: RunConfig, env: RunEnv, model_config: LlamaConfig) -> Self {
        Self {
            config,
            env,
            model_config,
        }
    }

    pub fn precision(&self) -> Precision {
        self.env.precision()
    }

    /// Graph-extraction mode suppresses telemetry and golden-loss checks.
    pub fn extract_graphs_only(&self) -> bool {
        self.env.extract_graphs_only
    }

    pub fn placement(&self, parallel: &ParallelState) -> Placement {
        Placement {
            tp_rank: parallel.tp_rank(),
            tp_size: parallel.tp_size(),
            precision: self.precision(),
            seed: self.config.seed,
        }
    }

    /// Parameter snapshot written to the results file at run start.
    pub fn parameters(&self, model_config: &LlamaConfig, optimizer: &str) -> Map<String, Value> {
        let model = if model_config.name_or_path.is_empty() {
            self.config.model_path.display().to_string()
        } else {
            model_config.name_or_path.clone()
        };
        let dataset = self
            .config
            .data_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.config.data_dir.display().to_string());

        let mut params = Map::new();
        params.insert("Model".into(), json!(model));
        params.insert("Model configuration".into(), json!(model_config.to_string()));
        params.insert("World size".into(), json!(self.config.world_size));
        params.insert(
            "Data parallel degree".into(),
            json!(self.config.data_parallel_size()),
        );
        params.insert("Batch size".into(), json!(self.config.batch_size));
        params.insert("Total steps".into(), json!(self.config.steps_this_run));
        params.insert("Seed".into(), json!(self.config.seed));
        params.insert("Optimizer".into(), json!(optimizer));
        params.insert("Data type".into(), json!(self.precision().dtype_name()));
        params.insert(
            "Gradient accumulation microsteps".into(),
            json!(self.config.grad_accum_usteps),
        );
        params.insert("Warmup steps".into(), json!(self.config.warmup_steps));
        params.insert("Dataset".into(), json!(dataset));
        params.insert("Environment variables".into(), json!(self.env.variables));
        params
    }
}
