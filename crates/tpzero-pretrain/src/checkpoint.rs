//! Checkpoint save/load
//!
//! A checkpoint directory holds one common snapshot plus per-rank tensor files:
//!
//! ```text
//! checkpoint.json                             step, epoch, scheduler, layout
//! model/tp_rank_XX.safetensors                weights of each tensor-parallel rank
//! optim/dp_rank_XX_tp_rank_YY.safetensors     optimizer state of every rank
//! ```
//!
//! The optimizer state is partitioned when ZeRO-1 is enabled, so no rank
//! holds all of it and every rank writes its own file. Resuming requires the
//! same parallel degrees and the same optimizer kind as the saving run.

use crate::optimizer::{Optimizer, OptimizerError, OptimizerShard};
use crate::scheduler::SchedulerState;
use safetensors::tensor::TensorView;
use safetensors::{serialize_to_file, Dtype, SafeTensorError, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tpzero_dist::{CommError, ParallelState};
use tpzero_model::{ModelError, ParamRegistry};
use tracing::info;

/// Checkpoint format version for compatibility checking
pub const CHECKPOINT_VERSION: &str = "1.0.0";

const COMMON_FILE: &str = "checkpoint.json";
const EXP_AVG: &str = "exp_avg";
const EXP_AVG_SQ: &str = "exp_avg_sq";

/// Errors raised while saving or restoring a checkpoint
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid checkpoint snapshot {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid tensor file {path:?}: {source}")]
    SafeTensors {
        path: PathBuf,
        #[source]
        source: SafeTensorError,
    },
    #[error("tensor file {path:?}: {reason}")]
    Tensor { path: PathBuf, reason: String },
    #[error("checkpoint file missing: {0:?}")]
    Missing(PathBuf),
    #[error("checkpoint version mismatch: expected {expected}, got {found}")]
    Version { expected: String, found: String },
    #[error("checkpoint was saved with {what} {saved}, this run uses {current}")]
    Layout {
        what: &'static str,
        saved: usize,
        current: usize,
    },
    #[error("checkpoint was saved with use_zero_1={saved}, this run uses use_zero_1={current}")]
    ZeroMismatch { saved: bool, current: bool },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
    #[error(transparent)]
    Comm(#[from] CommError),
}

/// Common snapshot shared by all ranks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub version: String,
    pub global_step: usize,
    pub epoch: usize,
    pub scheduler: SchedulerState,
    pub tensor_parallel_size: usize,
    pub data_parallel_size: usize,
    pub use_zero_1: bool,
}

impl CheckpointMeta {
    pub fn new(
        global_step: usize,
        epoch: usize,
        scheduler: SchedulerState,
        parallel: &ParallelState,
        use_zero_1: bool,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION.to_string(),
            global_step,
            epoch,
            scheduler,
            tensor_parallel_size: parallel.tp_size(),
            data_parallel_size: parallel.dp_size(),
            use_zero_1,
        }
    }
}

/// Reads and writes checkpoints under one directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn common_path(&self) -> PathBuf {
        self.dir.join(COMMON_FILE)
    }

    pub fn model_path(&self, tp_rank: usize) -> PathBuf {
        self.dir
            .join("model")
            .join(format!("tp_rank_{tp_rank:02}.safetensors"))
    }

    pub fn optim_path(&self, dp_rank: usize, tp_rank: usize) -> PathBuf {
        self.dir
            .join("optim")
            .join(format!("dp_rank_{dp_rank:02}_tp_rank_{tp_rank:02}.safetensors"))
    }

    /// Every file a checkpoint of this layout consists of.
    pub fn expected_files(&self, tp_size: usize, dp_size: usize) -> Vec<PathBuf> {
        let mut files = vec![self.common_path()];
        files.extend((0..tp_size).map(|tp| self.model_path(tp)));
        for dp in 0..dp_size {
            files.extend((0..tp_size).map(|tp| self.optim_path(dp, tp)));
        }
        files
    }

    /// Save this rank's part of a checkpoint, then wait for every other rank.
    ///
    /// The lead worker writes the common snapshot, data-parallel rank 0 of each
    /// tensor-parallel rank writes the weights, and every rank writes its
    /// optimizer state.
    pub fn save(
        &self,
        meta: &CheckpointMeta,
        params: &ParamRegistry,
        optimizer: &dyn Optimizer,
        parallel: &ParallelState,
    ) -> Result<(), CheckpointError> {
        if parallel.is_root() {
            let path = self.common_path();
            create_parent(&path)?;
            let json = serde_json::to_string_pretty(meta).map_err(|source| {
                CheckpointError::Json {
                    path: path.clone(),
                    source,
                }
            })?;
            fs::write(&path, json).map_err(|source| CheckpointError::Io {
                path: path.clone(),
                source,
            })?;
        }

        if parallel.dp_rank() == 0 {
            let path = self.model_path(parallel.tp_rank());
            let tensors: Vec<(String, Vec<usize>, Vec<u8>)> = params
                .state_dict()
                .into_iter()
                .map(|(name, shape, data)| (name, shape, to_bytes(&data)))
                .collect();
            let metadata = HashMap::from([("step".to_string(), meta.global_step.to_string())]);
            write_tensors(&path, &tensors, metadata)?;
        }

        let shard = optimizer.save_shard();
        let path = self.optim_path(parallel.dp_rank(), parallel.tp_rank());
        let tensors = vec![
            (
                EXP_AVG.to_string(),
                vec![shard.exp_avg.len()],
                to_bytes(&shard.exp_avg),
            ),
            (
                EXP_AVG_SQ.to_string(),
                vec![shard.exp_avg_sq.len()],
                to_bytes(&shard.exp_avg_sq),
            ),
        ];
        let metadata = HashMap::from([
            ("step".to_string(), shard.step.to_string()),
            ("dp_rank".to_string(), parallel.dp_rank().to_string()),
            ("dp_size".to_string(), parallel.dp_size().to_string()),
            ("tp_rank".to_string(), parallel.tp_rank().to_string()),
            ("sharded".to_string(), shard.sharded.to_string()),
        ]);
        write_tensors(&path, &tensors, metadata)?;

        parallel.rendezvous()?;
        if parallel.is_root() {
            info!(
                "Saved checkpoint at global step {} to {}",
                meta.global_step,
                self.dir.display()
            );
        }
        Ok(())
    }

    /// Read and validate the common snapshot against the current layout.
    pub fn load_meta(
        &self,
        parallel: &ParallelState,
        use_zero_1: bool,
    ) -> Result<CheckpointMeta, CheckpointError> {
        let path = self.common_path();
        if !path.exists() {
            return Err(CheckpointError::Missing(path));
        }
        let text = fs::read_to_string(&path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        let meta: CheckpointMeta =
            serde_json::from_str(&text).map_err(|source| CheckpointError::Json {
                path: path.clone(),
                source,
            })?;

        if meta.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Version {
                expected: CHECKPOINT_VERSION.to_string(),
                found: meta.version,
            });
        }
        if meta.tensor_parallel_size != parallel.tp_size() {
            return Err(CheckpointError::Layout {
                what: "tensor_parallel_size",
                saved: meta.tensor_parallel_size,
                current: parallel.tp_size(),
            });
        }
        if meta.data_parallel_size != parallel.dp_size() {
            return Err(CheckpointError::Layout {
                what: "data_parallel_size",
                saved: meta.data_parallel_size,
                current: parallel.dp_size(),
            });
        }
        if meta.use_zero_1 != use_zero_1 {
            return Err(CheckpointError::ZeroMismatch {
                saved: meta.use_zero_1,
                current: use_zero_1,
            });
        }
        Ok(meta)
    }

    /// Restore weights and this rank's optimizer state.
    ///
    /// Fails before touching `params` if any file of the checkpoint is missing.
    pub fn load(
        &self,
        params: &mut ParamRegistry,
        optimizer: &mut dyn Optimizer,
        parallel: &ParallelState,
        use_zero_1: bool,
    ) -> Result<CheckpointMeta, CheckpointError> {
        let meta = self.load_meta(parallel, use_zero_1)?;
        for file in self.expected_files(parallel.tp_size(), parallel.dp_size()) {
            if !file.exists() {
                return Err(CheckpointError::Missing(file));
            }
        }

        let path = self.model_path(parallel.tp_rank());
        let buffer = read_file(&path)?;
        let tensors = deserialize(&path, &buffer)?;
        let mut weights = HashMap::new();
        for param in params.iter() {
            weights.insert(param.name.clone(), read_f32(&path, &tensors, &param.name)?);
        }
        params.load_state_dict(&weights)?;

        let path = self.optim_path(parallel.dp_rank(), parallel.tp_rank());
        let buffer = read_file(&path)?;
        let (_, header) =
            SafeTensors::read_metadata(&buffer).map_err(|source| CheckpointError::SafeTensors {
                path: path.clone(),
                source,
            })?;
        let info = header.metadata().clone().unwrap_or_default();
        let dp_rank: usize = parse_field(&path, &info, "dp_rank")?;
        let dp_size: usize = parse_field(&path, &info, "dp_size")?;
        if dp_rank != parallel.dp_rank() || dp_size != parallel.dp_size() {
            return Err(CheckpointError::Tensor {
                path,
                reason: format!(
                    "shard of dp rank {dp_rank}/{dp_size} cannot be loaded by dp rank {}/{}",
                    parallel.dp_rank(),
                    parallel.dp_size()
                ),
            });
        }
        let tensors = deserialize(&path, &buffer)?;
        let shard = OptimizerShard {
            step: parse_field(&path, &info, "step")?,
            exp_avg: read_f32(&path, &tensors, EXP_AVG)?,
            exp_avg_sq: read_f32(&path, &tensors, EXP_AVG_SQ)?,
            sharded: parse_field(&path, &info, "sharded")?,
        };
        optimizer.load_shard(shard)?;

        if parallel.is_root() {
            info!(
                "Resumed from checkpoint {} at global step {}, epoch {}",
                self.dir.display(),
                meta.global_step,
                meta.epoch
            );
        }
        Ok(meta)
    }
}

fn create_parent(path: &Path) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

fn write_tensors(
    path: &Path,
    tensors: &[(String, Vec<usize>, Vec<u8>)],
    metadata: HashMap<String, String>,
) -> Result<(), CheckpointError> {
    create_parent(path)?;
    let st_err = |source| CheckpointError::SafeTensors {
        path: path.to_path_buf(),
        source,
    };
    let views = tensors
        .iter()
        .map(|(name, shape, bytes)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes).map(|view| (name.as_str(), view))
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(st_err)?;
    serialize_to_file(views, Some(metadata), path).map_err(st_err)
}

fn read_file(path: &Path) -> Result<Vec<u8>, CheckpointError> {
    fs::read(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn deserialize<'a>(path: &Path, buffer: &'a [u8]) -> Result<SafeTensors<'a>, CheckpointError> {
    SafeTensors::deserialize(buffer).map_err(|source| CheckpointError::SafeTensors {
        path: path.to_path_buf(),
        source,
    })
}

fn read_f32(path: &Path, tensors: &SafeTensors<'_>, name: &str) -> Result<Vec<f32>, CheckpointError> {
    let view = tensors
        .tensor(name)
        .map_err(|source| CheckpointError::SafeTensors {
            path: path.to_path_buf(),
            source,
        })?;
    if view.dtype() != Dtype::F32 {
        return Err(CheckpointError::Tensor {
            path: path.to_path_buf(),
            reason: format!("tensor '{name}' has dtype {:?}, expected F32", view.dtype()),
        });
    }
    Ok(from_bytes(view.data()))
}

fn parse_field<T: std::str::FromStr>(
    path: &Path,
    metadata: &HashMap<String, String>,
    key: &str,
) -> Result<T, CheckpointError> {
    metadata
        .get(key)
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| CheckpointError::Tensor {
            path: path.to_path_buf(),
            reason: format!("missing or invalid metadata field '{key}'"),
        })
}

fn to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let manager = CheckpointManager::new("/ckpt");
        assert_eq!(
            manager.optim_path(3, 1),
            PathBuf::from("/ckpt/optim/dp_rank_03_tp_rank_01.safetensors")
        );
        assert_eq!(
            manager.model_path(0),
            PathBuf::from("/ckpt/model/tp_rank_00.safetensors")
        );
        // common + 2 model + 2*3 optim
        assert_eq!(manager.expected_files(2, 3).len(), 9);
    }

    #[test]
    fn test_bytes_are_bit_exact() {
        let values = [0.1f32, -3.5e-20, f32::MAX, 0.0];
        let restored = from_bytes(&to_bytes(&values));
        let bits: Vec<u32> = restored.iter().map(|v| v.to_bits()).collect();
        let expected: Vec<u32> = values.iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits, expected);
    }
}
