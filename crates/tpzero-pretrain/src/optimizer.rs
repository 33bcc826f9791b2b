//! AdamW with weight-decay groups, dense or sharded across data-parallel ranks
//!
//! Parameters fall into two groups by name: biases and normalization gains get
//! no weight decay, everything else is decayed by [`WEIGHT_DECAY`]. The update
//! follows the HuggingFace `AdamW`: bias-corrected moments, then decoupled
//! weight decay applied after the Adam step.
//!
//! [`Zero1AdamW`] keeps moments only for this rank's shard of the flattened
//! parameter space. Its `step` averages gradients over the data-parallel
//! group, clips them, updates the local shard and all-gathers the parameters.

use crate::grads::MAX_GRAD_NORM;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tpzero_dist::{Collective, CommError, ParallelState};
use tpzero_model::{ModelError, ParamRegistry, Precision};
use tracing::debug;

/// Decay of the decayed parameter group.
pub const WEIGHT_DECAY: f32 = 0.01;

/// Errors raised by an optimizer step or state restore
#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("optimizer state is {found} but this optimizer is {expected}")]
    ShardKind {
        expected: &'static str,
        found: &'static str,
    },
    #[error("optimizer state '{name}' has {got} elements, expected {expected}")]
    StateLength {
        name: &'static str,
        expected: usize,
        got: usize,
    },
}

/// AdamW hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-6,
            weight_decay: WEIGHT_DECAY,
        }
    }
}

/// Moments of one rank, flattened in registry order.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerShard {
    pub step: u64,
    pub exp_avg: Vec<f32>,
    pub exp_avg_sq: Vec<f32>,
    /// Whether the moments cover only this rank's shard
    pub sharded: bool,
}

/// Optimizer driven by the training loop.
pub trait Optimizer: Send {
    /// Apply one update from the gradients in `params`.
    fn step(
        &mut self,
        params: &mut ParamRegistry,
        parallel: &ParallelState,
    ) -> Result<(), OptimizerError>;

    fn zero_grad(&self, params: &mut ParamRegistry) {
        params.zero_grad();
    }

    fn lr(&self) -> f32;

    fn set_lr(&mut self, lr: f32);

    /// Whether gradients are reduced inside `step`.
    fn is_sharded(&self) -> bool;

    /// State this rank must persist.
    fn save_shard(&self) -> OptimizerShard;

    fn load_shard(&mut self, shard: OptimizerShard) -> Result<(), OptimizerError>;

    /// Human-readable summary recorded with the run parameters.
    fn describe(&self) -> String;
}

/// AdamW moments over a contiguous slice of the flat parameter space.
#[derive(Debug, Clone)]
struct AdamWState {
    config: AdamWConfig,
    precision: Precision,
    step: u64,
    exp_avg: Vec<f32>,
    exp_avg_sq: Vec<f32>,
}

impl AdamWState {
    fn new(config: AdamWConfig, precision: Precision, len: usize) -> Self {
        Self {
            config,
            precision,
            step: 0,
            exp_avg: vec![0.0; len],
            exp_avg_sq: vec![0.0; len],
        }
    }

    /// Update `data` in place from `grad`; `decay[i]` selects the decayed group.
    fn update(&mut self, data: &mut [f32], grad: &[f32], decay: &[bool]) {
        self.step += 1;
        let AdamWConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;
        let t = self.step as i32;
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2 = 1.0 - beta2.powi(t);
        let step_size = lr * bias_correction2.sqrt() / bias_correction1;

        for i in 0..data.len() {
            let g = grad[i];
            let m = beta1 * self.exp_avg[i] + (1.0 - beta1) * g;
            let v = beta2 * self.exp_avg_sq[i] + (1.0 - beta2) * g * g;
            self.exp_avg[i] = m;
            self.exp_avg_sq[i] = v;

            let mut p = data[i] - step_size * m / (v.sqrt() + eps);
            if decay[i] && weight_decay > 0.0 {
                p -= lr * weight_decay * p;
            }
            data[i] = self.precision.cast_param(p);
        }
    }

    fn save(&self, sharded: bool) -> OptimizerShard {
        OptimizerShard {
            step: self.step,
            exp_avg: self.exp_avg.clone(),
            exp_avg_sq: self.exp_avg_sq.clone(),
            sharded,
        }
    }

    fn load(&mut self, shard: OptimizerShard, sharded: bool) -> Result<(), OptimizerError> {
        if shard.sharded != sharded {
            return Err(OptimizerError::ShardKind {
                expected: kind(sharded),
                found: kind(shard.sharded),
            });
        }
        let expected = self.exp_avg.len();
        for (name, got) in [
            ("exp_avg", shard.exp_avg.len()),
            ("exp_avg_sq", shard.exp_avg_sq.len()),
        ] {
            if got != expected {
                return Err(OptimizerError::StateLength {
                    name,
                    expected,
                    got,
                });
            }
        }
        self.step = shard.step;
        self.exp_avg = shard.exp_avg;
        self.exp_avg_sq = shard.exp_avg_sq;
        Ok(())
    }

    fn class_name(&self) -> &'static str {
        if self.precision.fp32_master_params() {
            "AdamW_FP32OptimParams"
        } else {
            "AdamW"
        }
    }
}

fn kind(sharded: bool) -> &'static str {
    if sharded {
        "sharded"
    } else {
        "dense"
    }
}

/// AdamW holding state for every parameter.
///
/// Gradients must already be reduced and clipped when `step` is called.
#[derive(Debug, Clone)]
pub struct AdamW {
    state: AdamWState,
    decay_mask: Vec<bool>,
}

impl AdamW {
    pub fn new(params: &ParamRegistry, config: AdamWConfig, precision: Precision) -> Self {
        Self {
            state: AdamWState::new(config, precision, params.numel()),
            decay_mask: params.flatten_decay_mask(),
        }
    }
}

impl Optimizer for AdamW {
    fn step(
        &mut self,
        params: &mut ParamRegistry,
        _parallel: &ParallelState,
    ) -> Result<(), OptimizerError> {
        let mut data = params.flatten_data();
        let grads = params.flatten_grads();
        self.state.update(&mut data, &grads, &self.decay_mask);
        params.scatter_data(&data)?;
        Ok(())
    }

    fn lr(&self) -> f32 {
        self.state.config.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.state.config.lr = lr;
    }

    fn is_sharded(&self) -> bool {
        false
    }

    fn save_shard(&self) -> OptimizerShard {
        self.state.save(false)
    }

    fn load_shard(&mut self, shard: OptimizerShard) -> Result<(), OptimizerError> {
        self.state.load(shard, false)
    }

    fn describe(&self) -> String {
        describe_groups(self.state.class_name(), &self.state.config, None)
    }
}

/// ZeRO-1 AdamW: moments partitioned across the data-parallel group.
#[derive(Debug, Clone)]
pub struct Zero1AdamW {
    state: AdamWState,
    decay_mask: Vec<bool>,
    numel: usize,
    shard_len: usize,
    dp_rank: usize,
    dp_size: usize,
    max_grad_norm: f64,
}

impl Zero1AdamW {
    /// The flat parameter space is padded to a multiple of the data-parallel
    /// degree; rank `r` owns elements `[r * shard_len, (r + 1) * shard_len)`.
    pub fn new(
        params: &ParamRegistry,
        config: AdamWConfig,
        precision: Precision,
        dp_rank: usize,
        dp_size: usize,
    ) -> Self {
        let dp_size = dp_size.max(1);
        let numel = params.numel();
        let shard_len = numel.div_ceil(dp_size);
        let mut decay_mask = params.flatten_decay_mask();
        decay_mask.resize(shard_len * dp_size, false);
        debug!(numel, shard_len, dp_rank, dp_size, "partitioned optimizer state");
        Self {
            state: AdamWState::new(config, precision, shard_len),
            decay_mask,
            numel,
            shard_len,
            dp_rank,
            dp_size,
            max_grad_norm: MAX_GRAD_NORM,
        }
    }

    pub fn shard_len(&self) -> usize {
        self.shard_len
    }

    fn shard_range(&self) -> std::ops::Range<usize> {
        let start = self.dp_rank * self.shard_len;
        start..start + self.shard_len
    }
}

impl Optimizer for Zero1AdamW {
    fn step(
        &mut self,
        params: &mut ParamRegistry,
        parallel: &ParallelState,
    ) -> Result<(), OptimizerError> {
        let dp_group = parallel.dp_group();
        let padded = self.shard_len * self.dp_size;

        let mut grads = params.flatten_grads();
        grads.resize(padded, 0.0);
        dp_group.all_reduce_sum(&mut grads)?;
        let scale = 1.0 / self.dp_size as f32;
        let range = self.shard_range();
        let mut shard_grads: Vec<f32> = grads[range.clone()].iter().map(|g| g * scale).collect();

        // Global norm from per-shard partial sums.
        let mut sq = [shard_grads
            .iter()
            .map(|&g| (g as f64) * (g as f64))
            .sum::<f64>()];
        dp_group.all_reduce_sum_f64(&mut sq)?;
        let total_norm = sq[0].sqrt();
        let clip_coef = self.max_grad_norm / (total_norm + 1e-6);
        if clip_coef < 1.0 {
            let coef = clip_coef as f32;
            shard_grads.iter_mut().for_each(|g| *g *= coef);
        }

        let mut data = params.flatten_data();
        data.resize(padded, 0.0);
        let mut shard_data = data[range.clone()].to_vec();
        self.state
            .update(&mut shard_data, &shard_grads, &self.decay_mask[range]);

        let gathered = dp_group.all_gather(&shard_data)?;
        params.scatter_data(&gathered[..self.numel])?;
        Ok(())
    }

    fn lr(&self) -> f32 {
        self.state.config.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.state.config.lr = lr;
    }

    fn is_sharded(&self) -> bool {
        true
    }

    fn save_shard(&self) -> OptimizerShard {
        self.state.save(true)
    }

    fn load_shard(&mut self, shard: OptimizerShard) -> Result<(), OptimizerError> {
        self.state.load(shard, true)
    }

    fn describe(&self) -> String {
        describe_groups(
            "NeuronZero1Optimizer",
            &self.state.config,
            Some(self.state.class_name()),
        )
    }
}

fn describe_groups(name: &str, config: &AdamWConfig, inner: Option<&str>) -> String {
    let mut out = format!("{name} (");
    if let Some(inner) = inner {
        out.push_str(&format!("\nOptimizer: {inner}"));
    }
    for (group, weight_decay) in [(0, config.weight_decay), (1, 0.0)] {
        out.push_str(&format!(
            "\nParameter Group {group}\n    betas: ({}, {})\n    eps: {}\n    lr: {}\n    weight_decay: {}",
            config.beta1, config.beta2, config.eps, config.lr, weight_decay
        ));
    }
    out.push_str("\n)");
    out
}

/// Build the optimizer selected by the run flags.
pub fn build_optimizer(
    params: &ParamRegistry,
    lr: f32,
    precision: Precision,
    use_zero_1: bool,
    parallel: &ParallelState,
) -> Box<dyn Optimizer> {
    let config = AdamWConfig {
        lr,
        ..Default::default()
    };
    if use_zero_1 {
        Box::new(Zero1AdamW::new(
            params,
            config,
            precision,
            parallel.dp_rank(),
            parallel.dp_size(),
        ))
    } else {
        Box::new(AdamW::new(params, config, precision))
    }
}
