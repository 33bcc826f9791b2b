//! Tensor-parallel / ZeRO-1 pretraining driver
//!
//! This crate implements the pretraining controller: it parses the run
//! configuration, provisions data for each data-parallel rank, drives the
//! microstep / accumulation-step loop with its gradient reductions, and
//! records telemetry, metrics and checkpoints.

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod dataset;
pub mod grads;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod telemetry;
pub mod throughput;
pub mod train;

pub use config::{RunConfig, RunEnv, TrainArgs};
pub use context::RunContext;
pub use train::{run, train, RunSummary};
