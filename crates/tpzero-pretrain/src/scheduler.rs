//! Linear warmup / linear decay learning-rate schedule

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid scheduler state
#[derive(Debug, Error, PartialEq)]
pub enum SchedulerError {
    #[error("scheduler state has no base learning rates")]
    NoBaseRates,
    #[error("scheduler state has {base} base rates but {last} last rates")]
    RateCount { base: usize, last: usize },
    #[error("scheduler state is at negative step {0}")]
    NegativeStep(i64),
}

/// Serializable scheduler state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Initial learning rate of every parameter group
    pub base_lrs: Vec<f32>,
    /// Number of `step` calls so far
    pub last_epoch: i64,
    pub warmup_steps: usize,
    pub total_steps: usize,
    /// Learning rates after the last step
    pub last_lrs: Vec<f32>,
}

/// Linear warmup from 0 to the base rate over `warmup_steps`, then linear
/// decay to 0 at `total_steps`.
///
/// Construction evaluates step 0, so the first optimizer step runs at a
/// learning rate of zero when warmup is enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearWarmupScheduler {
    state: SchedulerState,
}

impl LinearWarmupScheduler {
    /// # Arguments
    /// * `base_lr` - Peak learning rate
    /// * `num_groups` - Number of optimizer parameter groups
    /// * `warmup_steps` - Steps of linear warmup
    /// * `total_steps` - Step at which the rate reaches zero
    pub fn new(base_lr: f32, num_groups: usize, warmup_steps: usize, total_steps: usize) -> Self {
        let base_lrs = vec![base_lr; num_groups.max(1)];
        let mut scheduler = Self {
            state: SchedulerState {
                last_lrs: base_lrs.clone(),
                base_lrs,
                last_epoch: -1,
                warmup_steps,
                total_steps,
            },
        };
        scheduler.step();
        scheduler
    }

    /// Restore from a saved state, exactly.
    pub fn from_state(state: SchedulerState) -> Result<Self, SchedulerError> {
        if state.base_lrs.is_empty() {
            return Err(SchedulerError::NoBaseRates);
        }
        if state.base_lrs.len() != state.last_lrs.len() {
            return Err(SchedulerError::RateCount {
                base: state.base_lrs.len(),
                last: state.last_lrs.len(),
            });
        }
        if state.last_epoch < 0 {
            return Err(SchedulerError::NegativeStep(state.last_epoch));
        }
        Ok(Self { state })
    }

    /// Multiplier applied to the base rate at `step`.
    pub fn lr_lambda(&self, step: usize) -> f64 {
        let warmup = self.state.warmup_steps;
        let total = self.state.total_steps;
        if step < warmup {
            return step as f64 / warmup.max(1) as f64;
        }
        let remaining = total.saturating_sub(step) as f64;
        (remaining / total.saturating_sub(warmup).max(1) as f64).max(0.0)
    }

    /// Advance one step and return the learning rate of the first group.
    pub fn step(&mut self) -> f32 {
        self.state.last_epoch += 1;
        let factor = self.lr_lambda(self.state.last_epoch as usize);
        self.state.last_lrs = self
            .state
            .base_lrs
            .iter()
            .map(|&base| (base as f64 * factor) as f32)
            .collect();
        self.lr()
    }

    pub fn lr(&self) -> f32 {
        self.state.last_lrs.first().copied().unwrap_or(0.0)
    }

    pub fn last_epoch(&self) -> i64 {
        self.state.last_epoch
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }
}
