//! Pre-tokenized dataset, data-parallel sampler and batch loader
//!
//! A dataset directory holds `*.jsonl` files, read in lexicographic order,
//! with one sample per line:
//!
//! ```json
//! {"input_ids": [1, 2, 3], "attention_mask": [1, 1, 1], "labels": [1, 2, 3]}
//! ```
//!
//! `attention_mask` defaults to all ones and `labels` to `input_ids`.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tpzero_model::Batch;
use tracing::info;

/// Errors raised while loading a dataset
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("ERROR: Data directory {0:?} doesn't exist!")]
    MissingDirectory(PathBuf),
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path:?} line {line}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path:?} line {line}: sample has {got} tokens, expected seq_len {expected}")]
    SequenceLength {
        path: PathBuf,
        line: usize,
        expected: usize,
        got: usize,
    },
    #[error("{path:?} line {line}: attention_mask or labels length differs from input_ids")]
    Ragged { path: PathBuf, line: usize },
    #[error("no *.jsonl files found in {0:?}")]
    NoShards(PathBuf),
}

#[derive(Debug, Deserialize)]
struct RawSample {
    input_ids: Vec<u32>,
    #[serde(default)]
    attention_mask: Option<Vec<u8>>,
    #[serde(default)]
    labels: Option<Vec<i64>>,
}

/// One tokenized training sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u8>,
    pub labels: Vec<i64>,
}

impl Sample {
    /// Sample with a full mask and labels equal to the inputs.
    pub fn from_input_ids(input_ids: Vec<u32>) -> Self {
        let attention_mask = vec![1; input_ids.len()];
        let labels = input_ids.iter().map(|&id| id as i64).collect();
        Self {
            input_ids,
            attention_mask,
            labels,
        }
    }
}

/// All samples of a dataset, in file order.
#[derive(Debug, Clone, Default)]
pub struct TokenizedDataset {
    samples: Vec<Sample>,
}

impl TokenizedDataset {
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Load every `*.jsonl` shard in `dir`; every sample must be `seq_len` long.
    pub fn load_from_disk(dir: &Path, seq_len: usize) -> Result<Self, DatasetError> {
        if !dir.is_dir() {
            return Err(DatasetError::MissingDirectory(dir.to_path_buf()));
        }
        let io_err = |source| DatasetError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut shards = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("jsonl") {
                shards.push(path);
            }
        }
        if shards.is_empty() {
            return Err(DatasetError::NoShards(dir.to_path_buf()));
        }
        shards.sort();

        let mut samples = Vec::new();
        for shard in &shards {
            load_shard(shard, seq_len, &mut samples)?;
        }
        info!(
            dir = %dir.display(),
            shards = shards.len(),
            samples = samples.len(),
            "loaded tokenized dataset"
        );
        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }
}

fn load_shard(path: &Path, seq_len: usize, out: &mut Vec<Sample>) -> Result<(), DatasetError> {
    let content = fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    for (i, text) in content.lines().enumerate() {
        if text.trim().is_empty() {
            continue;
        }
        let line = i + 1;
        let raw: RawSample = serde_json::from_str(text).map_err(|source| DatasetError::Parse {
            path: path.to_path_buf(),
            line,
            source,
        })?;

        let len = raw.input_ids.len();
        if len != seq_len {
            return Err(DatasetError::SequenceLength {
                path: path.to_path_buf(),
                line,
                expected: seq_len,
                got: len,
            });
        }
        let attention_mask = raw.attention_mask.unwrap_or_else(|| vec![1; len]);
        let labels = raw
            .labels
            .unwrap_or_else(|| raw.input_ids.iter().map(|&id| id as i64).collect());
        if attention_mask.len() != len || labels.len() != len {
            return Err(DatasetError::Ragged {
                path: path.to_path_buf(),
                line,
            });
        }
        out.push(Sample {
            input_ids: raw.input_ids,
            attention_mask,
            labels,
        });
    }
    Ok(())
}

/// Plain seeding configuration handed to each loader worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerInit {
    pub seed: u64,
}

impl WorkerInit {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Seed for loader worker `worker_id`.
    pub fn worker_seed(&self, worker_id: usize) -> u64 {
        self.seed.wrapping_add(worker_id as u64)
    }
}

/// Splits dataset indices across data-parallel ranks.
///
/// With `drop_last`, every rank gets `len / num_replicas` indices:
/// `rank, rank + R, rank + 2R, ...` over the (optionally shuffled) index list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedSampler {
    num_replicas: usize,
    rank: usize,
    shuffle: Option<u64>,
    epoch: usize,
}

impl DistributedSampler {
    pub fn new(num_replicas: usize, rank: usize) -> Self {
        let num_replicas = num_replicas.max(1);
        Self {
            num_replicas,
            rank: rank % num_replicas,
            shuffle: None,
            epoch: 0,
        }
    }

    /// Shuffle indices with a permutation derived from `seed` and the epoch.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = Some(seed);
        self
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Indices this rank sees per epoch.
    pub fn num_samples(&self, len: usize) -> usize {
        len / self.num_replicas
    }

    pub fn indices(&self, len: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..len).collect();
        if let Some(seed) = self.shuffle {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(self.epoch as u64));
            order.shuffle(&mut rng);
        }
        let total = self.num_samples(len) * self.num_replicas;
        order
            .into_iter()
            .take(total)
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }
}

/// Fixed-size batches over this rank's share of a dataset.
///
/// The trailing partial batch is dropped.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<TokenizedDataset>,
    sampler: DistributedSampler,
    batch_size: usize,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<TokenizedDataset>,
        sampler: DistributedSampler,
        batch_size: usize,
    ) -> Self {
        Self {
            dataset,
            sampler,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        self.sampler.num_samples(self.dataset.len()) / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batches of `epoch`, in sampler order.
    pub fn epoch(&mut self, epoch: usize) -> Batches<'_> {
        self.sampler.set_epoch(epoch);
        let indices = self.sampler.indices(self.dataset.len());
        Batches {
            dataset: &self.dataset,
            indices,
            batch_size: self.batch_size,
            position: 0,
        }
    }
}

/// Iterator over one epoch of batches.
#[derive(Debug)]
pub struct Batches<'a> {
    dataset: &'a TokenizedDataset,
    indices: Vec<usize>,
    batch_size: usize,
    position: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let end = self.position + self.batch_size;
        if end > self.indices.len() {
            return None;
        }
        let mut batch = Batch {
            input_ids: Vec::with_capacity(self.batch_size),
            attention_mask: Vec::with_capacity(self.batch_size),
            labels: Vec::with_capacity(self.batch_size),
        };
        for &index in &self.indices[self.position..end] {
            let sample = self.dataset.get(index)?;
            batch.input_ids.push(sample.input_ids.clone());
            batch.attention_mask.push(sample.attention_mask.clone());
            batch.labels.push(sample.labels.clone());
        }
        self.position = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.indices.len() - self.position) / self.batch_size;
        (remaining, Some(remaining))
    }
}
