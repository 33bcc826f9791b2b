//! Tensor-parallel / ZeRO-1 pretraining of a Llama-style causal LM
//!
//! # Usage
//!
//! ```bash
//! tpzero-pretrain \
//!   --model_path ./llama-7b \
//!   --data_dir ./wikicorpus_llama_tokenized \
//!   --max_steps 10000 \
//!   --tensor_parallel_size 2 \
//!   [--world_size 4] \
//!   [--use_zero_1] \
//!   [--sequence_parallel_enabled] \
//!   [--resume_ckpt]
//! ```
//!
//! Without `WORLD_SIZE` in the environment, `--world_size` local workers are
//! started (one per tensor-parallel rank by default).

use anyhow::{Context, Result};
use clap::Parser;
use tpzero_pretrain::{run, RunConfig, RunContext, RunEnv, TrainArgs};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();

    let args = TrainArgs::parse();
    let env = RunEnv::capture()?.with_precision_switches(args.use_mix_precision);
    let config = RunConfig::from_args(args, &env).context("Invalid run configuration")?;
    let ctx = RunContext::new(config, env)?;

    let summaries = run(&ctx)?;
    if let Some(lead) = summaries.first() {
        info!(
            "Training finished at global step {} (epoch {}, final loss {:.4})",
            lead.global_step, lead.epoch, lead.final_loss
        );
    }
    Ok(())
}
