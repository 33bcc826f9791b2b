//! Run configuration for pretraining
//!
//! Command-line flags are parsed once into [`TrainArgs`], combined with the
//! captured environment ([`RunEnv`]) and validated into an immutable
//! [`RunConfig`] that every component reads from.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tpzero_model::{ModelOverrides, Precision};

/// Tensor-parallel / ZeRO-1 pretraining of a Llama-style causal LM
#[derive(Parser, Debug, Clone)]
#[command(name = "tpzero-pretrain")]
#[command(about = "Tensor-parallel / ZeRO-1 pretraining of a Llama-style causal LM", long_about = None)]
pub struct TrainArgs {
    /// Model weight and config path
    #[arg(long = "model_path", value_name = "PATH")]
    pub model_path: PathBuf,

    /// Pre-tokenized dataset directory
    #[arg(long = "data_dir", value_name = "PATH")]
    pub data_dir: PathBuf,

    /// Directory for checkpoints and logs
    #[arg(long = "output_dir", value_name = "PATH", default_value = "./output")]
    pub output_dir: PathBuf,

    /// Training metrics results file
    #[arg(long = "metrics_file", value_name = "PATH", default_value = "results.json")]
    pub metrics_file: PathBuf,

    /// Worker batch size
    #[arg(long = "batch_size", default_value_t = 8)]
    pub batch_size: usize,

    /// Maximum total accumulation-steps to run
    #[arg(long = "max_steps")]
    pub max_steps: usize,

    /// Exit early at this many steps instead of max_steps; -1 for no early exit
    #[arg(long = "steps_this_run", default_value_t = -1, allow_hyphen_values = true)]
    pub steps_this_run: i64,

    /// Random seed; worker seed is this value + worker id
    #[arg(long = "seed", default_value_t = 12349)]
    pub seed: u64,

    /// Learning rate
    #[arg(long = "lr", default_value_t = 4e-4)]
    pub lr: f32,

    /// Number of warmup accumulation-steps for the learning rate
    #[arg(long = "warmup_steps", default_value_t = 2000)]
    pub warmup_steps: usize,

    /// Gradient accumulation micro-steps per accumulation-step
    #[arg(long = "grad_accum_usteps", default_value_t = 64)]
    pub grad_accum_usteps: usize,

    /// Print the global gradient norm with every log line
    #[arg(long = "print_grad_norm")]
    pub print_grad_norm: bool,

    /// Resume from the checkpoint in output_dir
    #[arg(long = "resume_ckpt")]
    pub resume_ckpt: bool,

    /// Tensor parallel size
    #[arg(long = "tensor_parallel_size", default_value_t = 2)]
    pub tensor_parallel_size: usize,

    /// Sequence length
    #[arg(long = "seq_len", default_value_t = 2048)]
    pub seq_len: usize,

    /// Use mixed precision (bf16 compute, fp32 optimizer parameters)
    #[arg(long = "use_mix_precision")]
    pub use_mix_precision: bool,

    /// Shard optimizer state across data-parallel ranks (ZeRO-1)
    #[arg(long = "use_zero_1")]
    pub use_zero_1: bool,

    /// Override number of layers for this model
    #[arg(long = "num_layers", default_value_t = -1, allow_hyphen_values = true)]
    pub num_layers: i64,

    /// Enable sequence parallel
    #[arg(long = "sequence_parallel_enabled")]
    pub sequence_parallel_enabled: bool,

    /// Enable selective checkpoint
    #[arg(long = "selective_checkpoint_enabled")]
    pub selective_checkpoint_enabled: bool,

    /// Accumulation-steps between log records
    #[arg(long = "logging_interval", default_value_t = 1)]
    pub logging_interval: usize,

    /// Number of local workers when WORLD_SIZE is not set
    #[arg(long = "world_size")]
    pub world_size: Option<usize>,

    /// Reference step-loss trace, one value per line
    #[arg(long = "golden_steploss", value_name = "PATH", default_value = "golden_steploss.txt")]
    pub golden_steploss: PathBuf,

    /// Relative tolerance for the golden step-loss check
    #[arg(long = "golden_rtol", default_value_t = 0.23)]
    pub golden_rtol: f64,

    /// Throughput moving-average window, in accumulation-steps
    #[arg(long = "throughput_window", default_value_t = 10)]
    pub throughput_window: usize,

    /// Shuffle sample order every epoch, seeded from --seed
    #[arg(long = "shuffle")]
    pub shuffle: bool,
}

/// Environment captured once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEnv {
    /// `WORLD_SIZE`, when launched by an external launcher
    pub world_size: Option<usize>,
    /// `XLA_USE_BF16` is present
    pub use_bf16: bool,
    /// `XLA_DOWNCAST_BF16` is present
    pub downcast_bf16: bool,
    /// `NEURON_EXTRACT_GRAPHS_ONLY` is set and non-empty
    pub extract_graphs_only: bool,
    pub hostname: Option<String>,
    /// Every `NEURON*` / `XLA*` variable
    pub variables: BTreeMap<String, String>,
}

impl RunEnv {
    /// Capture from the process environment.
    pub fn capture() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Build from an explicit list of variables.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let all: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let world_size = match all.get("WORLD_SIZE").filter(|v| !v.is_empty()) {
            Some(value) => Some(
                value
                    .parse::<usize>()
                    .with_context(|| format!("WORLD_SIZE is not a number: {value:?}"))?,
            ),
            None => None,
        };

        let variables = all
            .iter()
            .filter(|(k, _)| k.starts_with("NEURON") || k.starts_with("XLA"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            world_size,
            use_bf16: all.contains_key("XLA_USE_BF16"),
            downcast_bf16: all.contains_key("XLA_DOWNCAST_BF16"),
            extract_graphs_only: all
                .get("NEURON_EXTRACT_GRAPHS_ONLY")
                .is_some_and(|v| !v.is_empty()),
            hostname: all.get("HOSTNAME").cloned(),
            variables,
        })
    }

    /// Record the precision switches a run always turns on.
    ///
    /// Stochastic rounding is enabled, and either `XLA_DOWNCAST_BF16`
    /// (mixed precision) or `XLA_USE_BF16` is set. The switches live in the
    /// snapshot only; the process environment is left untouched.
    pub fn with_precision_switches(mut self, use_mix_precision: bool) -> Self {
        self.variables
            .insert("NEURON_RT_STOCHASTIC_ROUNDING_EN".into(), "1".into());
        if use_mix_precision {
            self.variables.insert("XLA_DOWNCAST_BF16".into(), "1".into());
            self.downcast_bf16 = true;
        } else {
            self.variables.insert("XLA_USE_BF16".into(), "1".into());
            self.use_bf16 = true;
        }
        self
    }

    pub fn precision(&self) -> Precision {
        Precision::from_flags(self.use_bf16, self.downcast_bf16)
    }
}

/// Validated, immutable run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model_path: PathBuf,
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub metrics_file: PathBuf,
    pub batch_size: usize,
    pub max_steps: usize,
    /// Step budget of this run (`max_steps` unless ending early)
    pub steps_this_run: usize,
    pub seed: u64,
    pub lr: f32,
    pub warmup_steps: usize,
    pub grad_accum_usteps: usize,
    pub print_grad_norm: bool,
    pub resume_ckpt: bool,
    pub world_size: usize,
    pub tensor_parallel_size: usize,
    pub seq_len: usize,
    pub use_mix_precision: bool,
    pub use_zero_1: bool,
    pub num_layers: i64,
    pub sequence_parallel_enabled: bool,
    pub selective_checkpoint_enabled: bool,
    pub logging_interval: usize,
    pub golden_steploss: PathBuf,
    pub golden_rtol: f64,
    pub throughput_window: usize,
    pub shuffle: bool,
}

impl RunConfig {
    /// Resolve defaults and check the flags describe a runnable job.
    ///
    /// `WORLD_SIZE` from the environment wins over `--world_size`; without
    /// either, one worker per tensor-parallel rank is started.
    pub fn from_args(args: TrainArgs, env: &RunEnv) -> Result<Self> {
        let steps_this_run = if args.steps_this_run < 0 {
            args.max_steps
        } else {
            args.steps_this_run as usize
        };
        let world_size = env
            .world_size
            .or(args.world_size)
            .unwrap_or(args.tensor_parallel_size);

        let config = Self {
            model_path: args.model_path,
            data_dir: args.data_dir,
            output_dir: args.output_dir,
            metrics_file: args.metrics_file,
            batch_size: args.batch_size,
            max_steps: args.max_steps,
            steps_this_run,
            seed: args.seed,
            lr: args.lr,
            warmup_steps: args.warmup_steps,
            grad_accum_usteps: args.grad_accum_usteps,
            print_grad_norm: args.print_grad_norm,
            resume_ckpt: args.resume_ckpt,
            world_size,
            tensor_parallel_size: args.tensor_parallel_size,
            seq_len: args.seq_len,
            use_mix_precision: args.use_mix_precision,
            use_zero_1: args.use_zero_1,
            num_layers: args.num_layers,
            sequence_parallel_enabled: args.sequence_parallel_enabled,
            selective_checkpoint_enabled: args.selective_checkpoint_enabled,
            logging_interval: args.logging_interval,
            golden_steploss: args.golden_steploss,
            golden_rtol: args.golden_rtol,
            throughput_window: args.throughput_window,
            shuffle: args.shuffle,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        if self.grad_accum_usteps == 0 {
            bail!("grad_accum_usteps must be positive");
        }
        if self.logging_interval == 0 {
            bail!("logging_interval must be positive");
        }
        if self.max_steps == 0 || self.steps_this_run == 0 {
            bail!("max_steps and steps_this_run must be positive");
        }
        if self.seq_len < 2 {
            bail!("seq_len must be at least 2, got {}", self.seq_len);
        }
        if self.tensor_parallel_size == 0 || self.world_size == 0 {
            bail!("tensor_parallel_size and world_size must be positive");
        }
        if self.world_size % self.tensor_parallel_size != 0 {
            bail!(
                "world size {} is not divisible by tensor_parallel_size {}",
                self.world_size,
                self.tensor_parallel_size
            );
        }
        if self.golden_rtol.is_nan() || self.golden_rtol < 0.0 {
            bail!("golden_rtol must be non-negative");
        }
        Ok(())
    }

    /// Data-parallel degree.
    pub fn data_parallel_size(&self) -> usize {
        self.world_size / self.tensor_parallel_size
    }

    pub fn model_overrides(&self) -> ModelOverrides {
        ModelOverrides {
            seq_len: self.seq_len,
            num_layers: self.num_layers,
            sequence_parallel_enabled: self.sequence_parallel_enabled,
            selective_checkpoint_enabled: self.selective_checkpoint_enabled,
        }
    }

    /// Pretty JSON for the startup banner and telemetry.
    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> TrainArgs {
        let mut argv = vec![
            "tpzero-pretrain",
            "--model_path",
            "./model",
            "--data_dir",
            "./data",
            "--max_steps",
            "100",
        ];
        argv.extend_from_slice(extra);
        TrainArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.output_dir, PathBuf::from("./output"));
        assert_eq!(args.metrics_file, PathBuf::from("results.json"));
        assert_eq!(args.batch_size, 8);
        assert_eq!(args.seed, 12349);
        assert_eq!(args.lr, 4e-4);
        assert_eq!(args.warmup_steps, 2000);
        assert_eq!(args.grad_accum_usteps, 64);
        assert_eq!(args.tensor_parallel_size, 2);
        assert_eq!(args.seq_len, 2048);
        assert_eq!(args.num_layers, -1);
        assert_eq!(args.logging_interval, 1);
        assert_eq!(args.steps_this_run, -1);
        assert_eq!(args.golden_rtol, 0.23);
        assert!(!args.use_zero_1);
    }

    #[test]
    fn test_steps_this_run_defaults_to_max_steps() {
        let config = RunConfig::from_args(parse(&[]), &RunEnv::default()).unwrap();
        assert_eq!(config.steps_this_run, 100);

        let config =
            RunConfig::from_args(parse(&["--steps_this_run", "7"]), &RunEnv::default()).unwrap();
        assert_eq!(config.steps_this_run, 7);
    }

    #[test]
    fn test_world_size_resolution() {
        let config = RunConfig::from_args(parse(&[]), &RunEnv::default()).unwrap();
        assert_eq!(config.world_size, 2);
        assert_eq!(config.data_parallel_size(), 1);

        let config =
            RunConfig::from_args(parse(&["--world_size", "8"]), &RunEnv::default()).unwrap();
        assert_eq!(config.data_parallel_size(), 4);

        let env = RunEnv::from_vars([("WORLD_SIZE", "4")]).unwrap();
        let config = RunConfig::from_args(parse(&["--world_size", "8"]), &env).unwrap();
        assert_eq!(config.world_size, 4);
    }

    #[test]
    fn test_indivisible_world_rejected() {
        assert!(RunConfig::from_args(parse(&["--world_size", "3"]), &RunEnv::default()).is_err());
    }

    #[test]
    fn test_env_capture() {
        let env = RunEnv::from_vars([
            ("NEURON_CC_FLAGS", "--model-type transformer"),
            ("XLA_DOWNCAST_BF16", ""),
            ("NEURON_EXTRACT_GRAPHS_ONLY", ""),
            ("HOSTNAME", "trn1-node"),
            ("PATH", "/usr/bin"),
        ])
        .unwrap();
        assert!(env.downcast_bf16);
        assert!(!env.use_bf16);
        assert!(!env.extract_graphs_only);
        assert_eq!(env.hostname.as_deref(), Some("trn1-node"));
        assert_eq!(env.variables.len(), 3);
        assert_eq!(env.precision(), Precision::MixedBf16);

        assert!(RunEnv::from_vars([("WORLD_SIZE", "many")]).is_err());
    }

    #[test]
    fn test_precision_switches() {
        let env = RunEnv::default().with_precision_switches(false);
        assert_eq!(env.precision(), Precision::Bf16);
        assert_eq!(env.variables["NEURON_RT_STOCHASTIC_ROUNDING_EN"], "1");
        assert_eq!(env.variables["XLA_USE_BF16"], "1");

        let env = RunEnv::default().with_precision_switches(true);
        assert_eq!(env.precision(), Precision::MixedBf16);
        assert!(!env.variables.contains_key("XLA_USE_BF16"));
    }
}
