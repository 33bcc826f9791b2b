//! Training loop controller
//!
//! Every microstep runs forward and backward on one batch and adds the scaled
//! loss to a running accumulator. Every `grad_accum_usteps` microsteps the
//! controller reduces the loss and gradients, steps the optimizer and the
//! scheduler, and schedules a log record. The record is not written right
//! away: it is queued and executed at the next flush point, so the step that
//! follows is never held up by host-side logging.

use crate::checkpoint::{CheckpointManager, CheckpointMeta};
use crate::context::RunContext;
use crate::dataset::{DataLoader, DistributedSampler, TokenizedDataset, WorkerInit};
use crate::grads::{
    allreduce_sequence_parallel_gradients, bucket_allreduce_gradients, clip_grad_norm,
    DEFAULT_BUCKET_CAP, MAX_GRAD_NORM,
};
use crate::metrics::{Metric, MetricsRecorder};
use crate::optimizer::{build_optimizer, Optimizer};
use crate::scheduler::LinearWarmupScheduler;
use crate::telemetry::{instance_type, run_dir_name, GoldenTrace, LogRecord, TelemetryLogger};
use crate::throughput::Throughput;
use anyhow::{bail, Context, Result};
use chrono::Local;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::fs;
use std::sync::Arc;
use std::time::Instant;
use tpzero_dist::{Collective, LocalCluster, ParallelLayout, ParallelState};
use tpzero_model::{build_model, Batch, CausalLm};
use tracing::{debug, info};

/// Pending log closures kept before the queue forces a drain.
pub const STEP_CLOSURE_CAPACITY: usize = 16;

/// Where the controller is in the accumulation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Running microsteps, gradients accumulating
    Accumulating,
    /// At an accumulation boundary, before the optimizer step
    Reducing,
    /// Optimizer and scheduler have stepped
    Stepped,
    /// Step budget reached
    Done,
}

/// Counters and loss accumulator of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub global_step: usize,
    pub epoch: usize,
    /// Microsteps since this run started; not restored on resume
    pub training_ustep: usize,
    pub running_loss: f64,
    pub phase: Phase,
}

impl TrainingState {
    pub fn new(global_step: usize, epoch: usize) -> Self {
        Self {
            global_step,
            epoch,
            training_ustep: 0,
            running_loss: 0.0,
            phase: Phase::Accumulating,
        }
    }

    /// Count one microstep and add its scaled loss.
    ///
    /// Returns `true` when the microstep closes an accumulation step.
    pub fn record_microstep(&mut self, scaled_loss: f64, grad_accum_usteps: usize) -> bool {
        self.training_ustep += 1;
        self.running_loss += scaled_loss;
        let boundary = self.training_ustep % grad_accum_usteps == 0;
        self.phase = if boundary {
            Phase::Reducing
        } else {
            Phase::Accumulating
        };
        boundary
    }

    /// Take the accumulated loss and reset the accumulator.
    pub fn take_running_loss(&mut self) -> f64 {
        std::mem::take(&mut self.running_loss)
    }

    /// Advance the global step. Returns `true` once the budget is reached.
    pub fn complete_step(&mut self, steps_this_run: usize) -> bool {
        self.global_step += 1;
        let done = self.global_step >= steps_this_run;
        self.phase = if done { Phase::Done } else { Phase::Stepped };
        done
    }
}

/// Deferred work, run with the lead worker's services.
pub type StepClosure<C> = Box<dyn FnOnce(&mut C) -> Result<()>>;

/// Bounded queue of deferred step closures.
///
/// Closures run in enqueue order when the queue is drained. Pushing onto a
/// full queue drains it first.
pub struct StepClosureQueue<C> {
    pending: VecDeque<StepClosure<C>>,
    capacity: usize,
}

impl<C> StepClosureQueue<C> {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn push(&mut self, services: &mut C, closure: StepClosure<C>) -> Result<()> {
        if self.pending.len() >= self.capacity {
            self.drain(services)?;
        }
        self.pending.push_back(closure);
        Ok(())
    }

    /// Run every pending closure. Stops at the first failure.
    pub fn drain(&mut self, services: &mut C) -> Result<()> {
        while let Some(closure) = self.pending.pop_front() {
            closure(services)?;
        }
        Ok(())
    }
}

impl<C> std::fmt::Debug for StepClosureQueue<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepClosureQueue")
            .field("pending", &self.pending.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Host-side services owned by the lead worker.
#[derive(Debug)]
pub struct LeadServices {
    pub metrics: MetricsRecorder,
    pub throughput: Throughput,
    /// Absent in graph-extraction mode
    pub telemetry: Option<TelemetryLogger>,
    /// Every record logged so far
    pub records: Vec<LogRecord>,
    started: Instant,
}

impl LeadServices {
    /// Create the output directory, the telemetry run and the results file.
    pub fn start(ctx: &RunContext, parallel: &ParallelState) -> Result<Self> {
        let config = &ctx.config;
        fs::create_dir_all(&config.output_dir).with_context(|| {
            format!("Failed to create output directory: {:?}", config.output_dir)
        })?;

        let telemetry = if ctx.extract_graphs_only() {
            None
        } else {
            let golden = GoldenTrace::load(&config.golden_steploss, config.golden_rtol)?;
            let name = run_dir_name(
                Local::now(),
                ctx.precision().dtype_name(),
                parallel.dp_size(),
                config,
                &instance_type(ctx.env.hostname.as_deref()),
            );
            Some(TelemetryLogger::new(
                config.output_dir.join(name),
                &config.to_pretty_json(),
                golden,
            )?)
        };

        Ok(Self {
            metrics: MetricsRecorder::new(config.metrics_file.clone()),
            throughput: Throughput::new(
                config.batch_size,
                parallel.dp_size(),
                config.grad_accum_usteps,
                config.throughput_window,
                config.logging_interval,
            ),
            telemetry,
            records: Vec::new(),
            started: Instant::now(),
        })
    }

    fn throughputs(&self) -> &[f64] {
        self.telemetry
            .as_ref()
            .map(TelemetryLogger::throughputs)
            .unwrap_or_default()
    }
}

/// What a worker reports when its run ends.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub global_rank: usize,
    pub global_step: usize,
    pub epoch: usize,
    pub training_ustep: usize,
    /// Data-parallel mean loss of the last accumulation step
    pub final_loss: f64,
    /// Log records written by the lead worker; empty elsewhere
    pub records: Vec<LogRecord>,
}

/// Drives one worker's model through the run.
pub struct Trainer<'a, M: CausalLm> {
    ctx: &'a RunContext,
    parallel: &'a ParallelState,
    model: M,
    optimizer: Box<dyn Optimizer>,
    scheduler: LinearWarmupScheduler,
    checkpoints: CheckpointManager,
    state: TrainingState,
    lead: Option<LeadServices>,
    closures: StepClosureQueue<LeadServices>,
    last_loss: Option<f64>,
}

impl<'a, M: CausalLm> Trainer<'a, M> {
    /// Build the optimizer and scheduler, and resume from the output directory
    /// when requested.
    pub fn new(
        ctx: &'a RunContext,
        parallel: &'a ParallelState,
        mut model: M,
        lead: Option<LeadServices>,
    ) -> Result<Self> {
        let config = &ctx.config;
        let mut optimizer = build_optimizer(
            model.params(),
            config.lr,
            ctx.precision(),
            config.use_zero_1,
            parallel,
        );
        optimizer.zero_grad(model.params_mut());

        let checkpoints = CheckpointManager::new(config.output_dir.clone());
        let (state, scheduler) = if config.resume_ckpt {
            let meta = checkpoints
                .load(
                    model.params_mut(),
                    optimizer.as_mut(),
                    parallel,
                    config.use_zero_1,
                )
                .context("Failed to resume from checkpoint")?;
            let scheduler = LinearWarmupScheduler::from_state(meta.scheduler)?;
            (TrainingState::new(meta.global_step, meta.epoch), scheduler)
        } else {
            let scheduler =
                LinearWarmupScheduler::new(config.lr, 2, config.warmup_steps, config.max_steps);
            (TrainingState::new(0, 0), scheduler)
        };
        optimizer.set_lr(scheduler.lr());

        Ok(Self {
            ctx,
            parallel,
            model,
            optimizer,
            scheduler,
            checkpoints,
            state,
            lead,
            closures: StepClosureQueue::new(STEP_CLOSURE_CAPACITY),
            last_loss: None,
        })
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn scheduler(&self) -> &LinearWarmupScheduler {
        &self.scheduler
    }

    pub fn lead(&self) -> Option<&LeadServices> {
        self.lead.as_ref()
    }

    /// Forward and backward on one batch; returns `true` at an accumulation boundary.
    pub fn microstep(&mut self, batch: &Batch) -> Result<bool> {
        let accum = self.ctx.config.grad_accum_usteps;
        let loss = self
            .model
            .forward_backward(batch, 1.0 / accum as f32)
            .context("Forward/backward failed")?;
        let scaled = loss as f64 / accum as f64;
        Ok(self.state.record_microstep(scaled, accum))
    }

    /// Reduce, step and schedule logging. Returns `true` once the budget is reached.
    pub fn accumulation_step(&mut self) -> Result<bool> {
        let ctx = self.ctx;
        let parallel = self.parallel;
        let config = &ctx.config;
        self.flush()?;

        let dp_group = parallel.dp_group();
        let mut loss = [self.state.take_running_loss() / dp_group.size() as f64];
        dp_group.all_reduce_sum_f64(&mut loss)?;
        let step_loss = loss[0];
        self.last_loss = Some(step_loss);

        if self.model.config().sequence_parallel_enabled {
            allreduce_sequence_parallel_gradients(self.model.params_mut(), parallel.tp_group())?;
        }
        if !self.optimizer.is_sharded() {
            bucket_allreduce_gradients(self.model.params_mut(), dp_group, DEFAULT_BUCKET_CAP)?;
            clip_grad_norm(self.model.params_mut(), MAX_GRAD_NORM);
        }
        self.optimizer
            .step(self.model.params_mut(), parallel)
            .context("Optimizer step failed")?;

        let grad_norm = (config.print_grad_norm && parallel.is_root())
            .then(|| self.model.params().grad_norm());

        self.optimizer.zero_grad(self.model.params_mut());
        let lr = self.scheduler.step();
        self.optimizer.set_lr(lr);
        let done = self.state.complete_step(config.steps_this_run);

        if self.state.global_step % config.logging_interval == 0 {
            self.schedule_log(step_loss, lr as f64, grad_norm)?;
        }
        if done {
            self.flush()?;
        }
        Ok(done)
    }

    fn schedule_log(
        &mut self,
        step_loss: f64,
        learning_rate: f64,
        grad_norm: Option<f64>,
    ) -> Result<()> {
        let Some(lead) = self.lead.as_mut() else {
            return Ok(());
        };
        let epoch = self.state.epoch;
        let step = self.state.global_step;
        self.closures.push(
            lead,
            Box::new(move |services: &mut LeadServices| -> Result<()> {
                let Some(telemetry) = services.telemetry.as_mut() else {
                    return Ok(());
                };
                let record = LogRecord {
                    epoch,
                    step,
                    step_loss,
                    learning_rate,
                    throughput: services.throughput.get_throughput(),
                    grad_norm,
                };
                telemetry.log(&record)?;
                services.records.push(record);
                Ok(())
            }),
        )
    }

    /// Run every deferred closure.
    pub fn flush(&mut self) -> Result<()> {
        match self.lead.as_mut() {
            Some(lead) => self.closures.drain(lead),
            None => Ok(()),
        }
    }

    /// One pass over the data. Returns `true` once the budget is reached.
    ///
    /// Microsteps left over at the end of the epoch keep their gradients and
    /// count toward the first accumulation step of the next epoch.
    pub fn train_epoch(&mut self, loader: &mut DataLoader) -> Result<bool> {
        if loader.is_empty() {
            bail!(
                "data loader yields no batches (batch_size={}, {} data-parallel ranks)",
                loader.batch_size(),
                self.parallel.dp_size()
            );
        }
        let mut done = false;
        for batch in loader.epoch(self.state.epoch) {
            if self.microstep(&batch)? && self.accumulation_step()? {
                done = true;
                break;
            }
        }
        self.flush()?;
        Ok(done)
    }

    /// Train until the step budget is reached, then save a checkpoint.
    pub fn run(mut self, loader: &mut DataLoader) -> Result<RunSummary> {
        loop {
            if self.parallel.is_root() {
                info!(
                    "Epoch {} begin {}",
                    self.state.epoch,
                    Local::now().format("%a %b %e %H:%M:%S %Y")
                );
            }
            let done = self.train_epoch(loader)?;
            self.record_epoch()?;
            if done {
                self.record_final()?;
                let meta = CheckpointMeta::new(
                    self.state.global_step,
                    self.state.epoch,
                    self.scheduler.state().clone(),
                    self.parallel,
                    self.ctx.config.use_zero_1,
                );
                self.checkpoints
                    .save(&meta, self.model.params(), self.optimizer.as_ref(), self.parallel)
                    .context("Failed to save checkpoint")?;
                break;
            }
            self.state.epoch += 1;
        }

        Ok(RunSummary {
            global_rank: self.parallel.global_rank(),
            global_step: self.state.global_step,
            epoch: self.state.epoch,
            training_ustep: self.state.training_ustep,
            final_loss: self.last_loss.unwrap_or_default(),
            records: self.lead.map(|lead| lead.records).unwrap_or_default(),
        })
    }

    fn additional_data(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("Epoch".into(), json!(self.state.epoch));
        data.insert("Global step".into(), json!(self.state.global_step));
        data.insert("Microstep".into(), json!(self.state.training_ustep));
        data
    }

    fn record_epoch(&mut self) -> Result<()> {
        let additional = self.additional_data();
        let final_loss = self.last_loss.unwrap_or_default();
        let Some(lead) = self.lead.as_ref().filter(|lead| lead.telemetry.is_some()) else {
            return Ok(());
        };
        let throughput = lead.throughputs().last().copied().unwrap_or(0.0);
        info!(
            "Epoch {} step {} end {} loss {} perf {} seq/sec (at train microstep {} time {:.3}s from beginning)",
            self.state.epoch,
            self.state.global_step,
            Local::now().format("%a %b %e %H:%M:%S %Y"),
            final_loss,
            throughput,
            self.state.training_ustep,
            lead.started.elapsed().as_secs_f64()
        );
        lead.metrics.store_metrics(&[
            Metric::new("Loss", final_loss, "", additional.clone()),
            Metric::new("Throughput", throughput, "seq/s", additional),
        ])
    }

    fn record_final(&mut self) -> Result<()> {
        let additional = self.additional_data();
        let final_loss = self.last_loss.unwrap_or_default();
        let Some(lead) = self.lead.as_ref().filter(|lead| lead.telemetry.is_some()) else {
            return Ok(());
        };
        let throughputs = lead.throughputs();
        let average = if throughputs.is_empty() {
            0.0
        } else {
            round4(throughputs.iter().sum::<f64>() / throughputs.len() as f64)
        };
        let peak = throughputs.iter().copied().fold(0.0, f64::max);
        let minutes = round4(lead.started.elapsed().as_secs_f64() / 60.0);
        lead.metrics.store_metrics(&[
            Metric::new("Final loss", final_loss, "", additional.clone()),
            Metric::new("Time to train", minutes, "minutes", additional.clone()),
            Metric::new("Average throughput", average, "seq/s", additional.clone()),
            Metric::new("Peak throughput", peak, "seq/s", additional),
        ])
    }
}

fn round4(value: f64) -> f64 {
    (value * 1e4).round() / 1e4
}

/// Train one worker of the run.
pub fn train(
    ctx: &RunContext,
    dataset: Arc<TokenizedDataset>,
    parallel: &ParallelState,
) -> Result<RunSummary> {
    let config = &ctx.config;
    let model = build_model(
        ctx.model_config.clone(),
        &config.model_overrides(),
        &ctx.placement(parallel),
    )
    .context("Failed to build model")?;

    let lead = if parallel.is_root() {
        Some(LeadServices::start(ctx, parallel)?)
    } else {
        None
    };
    let trainer = Trainer::new(ctx, parallel, model, lead)?;

    if let Some(lead) = trainer.lead() {
        info!("--------TRAINING CONFIG----------");
        info!("{}", config.to_pretty_json());
        info!("--------MODEL CONFIG----------");
        info!("{}", trainer.model().config());
        info!("---------------------------------");
        lead.metrics.store_parameters(
            ctx.parameters(trainer.model().config(), &trainer.optimizer().describe()),
        )?;
    }

    // Each rank runs a single in-process loader worker, so every rank shuffles
    // with worker 0's seed and the permutation stays shared.
    let worker_init = WorkerInit::new(config.seed);
    let mut sampler = DistributedSampler::new(parallel.dp_size(), parallel.dp_rank());
    if config.shuffle {
        sampler = sampler.with_shuffle(worker_init.worker_seed(0));
    }
    let mut loader = DataLoader::new(dataset, sampler, config.batch_size);
    debug!(
        rank = parallel.global_rank(),
        batches = loader.len(),
        "data loader ready"
    );
    trainer.run(&mut loader)
}

/// Check preconditions, then launch one worker per rank and train.
///
/// Returns every worker's summary in global-rank order.
pub fn run(ctx: &RunContext) -> Result<Vec<RunSummary>> {
    let config = &ctx.config;
    let layout = ParallelLayout::new(config.world_size, config.tensor_parallel_size)?;
    let dataset = Arc::new(
        TokenizedDataset::load_from_disk(&config.data_dir, config.seq_len)
            .context("Failed to load training data")?,
    );

    LocalCluster::launch(layout, |parallel| -> Result<RunSummary> {
        let summary = train(ctx, Arc::clone(&dataset), &parallel)?;
        parallel.rendezvous()?;
        Ok(summary)
    })
}
