//! Step telemetry: log lines, scalar series and golden-loss validation
//!
//! Scalars are appended as JSON lines (`{tag, value, step, wall_time}`) to
//! `scalars.jsonl` inside a per-run directory whose name encodes the main
//! hyperparameters, so runs can be told apart at a glance.

use crate::config::RunConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const IMDS_ENDPOINT: &str = "http://169.254.169.254";
const IMDS_TIMEOUT: Duration = Duration::from_millis(250);

/// A logged step loss outside the tolerance of the reference trace
#[derive(Debug, Clone, PartialEq, Error)]
#[error("step {step}: loss {actual} is not within rtol {rtol} of golden value {expected}")]
pub struct GoldenMismatch {
    pub step: usize,
    pub actual: f64,
    pub expected: f64,
    pub rtol: f64,
}

/// Reference step losses, one per accumulation step starting at step 1.
#[derive(Debug, Clone, PartialEq)]
pub struct GoldenTrace {
    values: Vec<f64>,
    rtol: f64,
}

impl GoldenTrace {
    pub fn new(values: Vec<f64>, rtol: f64) -> Self {
        Self { values, rtol }
    }

    /// Read a trace file, one float per line. A missing file yields `None`.
    pub fn load(path: &Path, rtol: f64) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read golden step loss file: {path:?}"))?;
        let values = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .enumerate()
            .map(|(i, line)| {
                line.parse::<f64>()
                    .with_context(|| format!("{path:?} line {}: not a number: {line:?}", i + 1))
            })
            .collect::<Result<Vec<_>>>()?;
        info!(
            "Read {} golden step loss values from {}",
            values.len(),
            path.display()
        );
        Ok(Some(Self::new(values, rtol)))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Compare the loss of 1-based `step` with its reference value.
    ///
    /// Steps beyond the trace (and step 0) always pass.
    pub fn check(&self, step: usize, actual: f64) -> Result<(), GoldenMismatch> {
        let Some(&expected) = step.checked_sub(1).and_then(|i| self.values.get(i)) else {
            return Ok(());
        };
        if (actual - expected).abs() <= self.rtol * expected.abs() {
            Ok(())
        } else {
            Err(GoldenMismatch {
                step,
                actual,
                expected,
                rtol: self.rtol,
            })
        }
    }
}

/// What gets logged after an accumulation step.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub epoch: usize,
    pub step: usize,
    pub step_loss: f64,
    pub learning_rate: f64,
    pub throughput: f64,
    pub grad_norm: Option<f64>,
}

#[derive(Serialize)]
struct ScalarEvent<'a> {
    tag: &'a str,
    value: f64,
    step: usize,
    wall_time: f64,
}

#[derive(Serialize)]
struct TextEvent<'a> {
    tag: &'a str,
    text: &'a str,
    step: usize,
    wall_time: f64,
}

/// Lead-worker telemetry sink.
#[derive(Debug)]
pub struct TelemetryLogger {
    run_dir: PathBuf,
    scalars: LineWriter<File>,
    throughputs: Vec<f64>,
    golden: Option<GoldenTrace>,
}

impl TelemetryLogger {
    /// Create the run directory and record the run configuration as text.
    pub fn new(run_dir: PathBuf, config_text: &str, golden: Option<GoldenTrace>) -> Result<Self> {
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create telemetry directory: {run_dir:?}"))?;

        let text_path = run_dir.join("text.jsonl");
        let event = TextEvent {
            tag: "run_config",
            text: config_text,
            step: 0,
            wall_time: wall_time(),
        };
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        append(&text_path, line.as_bytes())?;

        let scalars_path = run_dir.join("scalars.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&scalars_path)
            .with_context(|| format!("Failed to open {scalars_path:?}"))?;

        debug!(run_dir = %run_dir.display(), "telemetry initialized");
        Ok(Self {
            run_dir,
            scalars: LineWriter::new(file),
            throughputs: Vec::new(),
            golden,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Every throughput logged so far, in order.
    pub fn throughputs(&self) -> &[f64] {
        &self.throughputs
    }

    pub fn golden(&self) -> Option<&GoldenTrace> {
        self.golden.as_ref()
    }

    /// Print the step line, append the scalar series and run the golden check.
    pub fn log(&mut self, record: &LogRecord) -> Result<()> {
        let grad_norm_msg = record
            .grad_norm
            .map(|norm| format!("grad-norm : {norm}"))
            .unwrap_or_default();
        info!(
            "LOG {} - ({}, {}) step_loss : {:.4} learning_rate : {} throughput : {:.2} {}",
            Local::now().format("%a %b %e %H:%M:%S %Y"),
            record.epoch,
            record.step,
            record.step_loss,
            scientific(record.learning_rate),
            record.throughput,
            grad_norm_msg
        );

        self.scalar("step loss", record.step_loss, record.step)?;
        self.scalar("learning rate", record.learning_rate, record.step)?;
        self.scalar("throughput", record.throughput, record.step)?;
        if let Some(norm) = record.grad_norm {
            self.scalar("grad-norm", norm, record.step)?;
        }
        self.throughputs.push(record.throughput);

        if let Some(golden) = &self.golden {
            golden.check(record.step, record.step_loss)?;
        }
        Ok(())
    }

    fn scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let event = ScalarEvent {
            tag,
            value,
            step,
            wall_time: wall_time(),
        };
        serde_json::to_writer(&mut self.scalars, &event)?;
        self.scalars
            .write_all(b"\n")
            .with_context(|| format!("Failed to write scalars in {:?}", self.run_dir))?;
        Ok(())
    }
}

/// Directory name for a run's telemetry.
pub fn run_dir_name(
    started: DateTime<Local>,
    dtype: &str,
    data_parallel_size: usize,
    config: &RunConfig,
    instance: &str,
) -> String {
    format!(
        "neuron_tblogs_{}_{}_w{}_lr{}_bs{}_acc{}_warmup{}_max{}_xlaTrue_{}",
        started.format("%m%d%y_%H%M"),
        dtype,
        data_parallel_size,
        config.lr,
        config.batch_size,
        config.grad_accum_usteps,
        config.warmup_steps,
        config.max_steps,
        instance
    )
}

/// Instance type from the EC2 metadata service, else the hostname, else `"unknown"`.
pub fn instance_type(hostname: Option<&str>) -> String {
    instance_type_from(IMDS_ENDPOINT, hostname)
}

/// Same as [`instance_type`], against the metadata service at `endpoint`.
pub fn instance_type_from(endpoint: &str, hostname: Option<&str>) -> String {
    match query_imds(endpoint) {
        Ok(instance) if !instance.is_empty() => instance,
        Ok(_) => fallback_instance(hostname),
        Err(e) => {
            debug!("instance metadata unavailable: {e}");
            fallback_instance(hostname)
        }
    }
}

fn fallback_instance(hostname: Option<&str>) -> String {
    hostname
        .filter(|h| !h.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// IMDSv2: fetch a session token, then the instance type.
fn query_imds(endpoint: &str) -> Result<String, ureq::Error> {
    let agent = ureq::AgentBuilder::new().timeout(IMDS_TIMEOUT).build();
    let token = agent
        .put(&format!("{endpoint}/latest/api/token"))
        .set("X-aws-ec2-metadata-token-ttl-seconds", "21600")
        .call()?
        .into_string()?;
    let instance = agent
        .get(&format!("{endpoint}/latest/meta-data/instance-type"))
        .set("X-aws-ec2-metadata-token", token.trim())
        .call()?
        .into_string()?;
    Ok(instance.trim().to_string())
}

/// `1.23e-04` style, two exponent digits as printf writes them.
fn scientific(value: f64) -> String {
    let formatted = format!("{value:.2e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => formatted,
    }
}

fn wall_time() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

fn append(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {path:?}"))?;
    file.write_all(bytes)
        .with_context(|| format!("Failed to write {path:?}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scientific_matches_printf() {
        assert_eq!(scientific(4e-4), "4.00e-04");
        assert_eq!(scientific(0.0), "0.00e+00");
        assert_eq!(scientific(1.5e12), "1.50e+12");
    }

    #[test]
    fn test_fallback_instance() {
        assert_eq!(fallback_instance(Some("node-7")), "node-7");
        assert_eq!(fallback_instance(Some("")), "unknown");
        assert_eq!(fallback_instance(None), "unknown");
    }

    #[test]
    fn test_golden_bounds() {
        let golden = GoldenTrace::new(vec![2.0], 0.25);
        assert!(golden.check(1, 2.5).is_ok());
        assert!(golden.check(1, 1.5).is_ok());
        assert!(golden.check(1, 2.51).is_err());
        assert!(golden.check(0, 100.0).is_ok());
        assert!(golden.check(2, 100.0).is_ok());
    }
}
