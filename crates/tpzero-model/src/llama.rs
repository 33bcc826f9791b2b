//! Compact decoder-only causal LM
//!
//! Architecture, per token:
//!
//! ```text
//! h_0     = embed[x]
//! h_{l+1} = h_l + W_l · (rmsnorm(h_l) ⊙ g_l)      for each block l
//! z       = rmsnorm(h_L) ⊙ g_f
//! logits  = U · z + b
//! ```
//!
//! trained with shifted next-token cross-entropy. Forward and backward are
//! written out by hand; gradients accumulate into the registry so several
//! microsteps can be summed before an optimizer step.
//!
//! Every tensor-parallel rank holds a full replica. With sequence parallelism
//! enabled, a rank accumulates normalization-gain gradients only for the
//! positions in its contiguous slice of the sequence, which is why those gains
//! are registered as [`ParallelRole::SequenceParallel`].

use crate::config::LlamaConfig;
use crate::error::ModelError;
use crate::model::{Batch, CausalLm, IGNORE_INDEX};
use crate::param::{ParallelRole, ParamRegistry, Parameter};
use crate::precision::Precision;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Registry slots of each weight.
#[derive(Debug, Clone)]
struct Slots {
    embed: usize,
    blocks: Vec<BlockSlots>,
    final_norm: usize,
    head_weight: usize,
    head_bias: usize,
}

#[derive(Debug, Clone, Copy)]
struct BlockSlots {
    norm: usize,
    proj: usize,
}

/// Saved RMSNorm state for one vector.
#[derive(Debug, Clone)]
struct NormCache {
    /// Normalized input, before the gain.
    unit: Vec<f32>,
    inv_rms: f32,
    /// Output after the gain.
    out: Vec<f32>,
}

/// Activations of one token kept for backward.
#[derive(Debug)]
struct TokenTrace {
    /// Block inputs h_0 .. h_L.
    hidden: Vec<Vec<f32>>,
    /// Per-block norm caches; `None` under selective checkpointing.
    blocks: Vec<Option<NormCache>>,
    final_norm: NormCache,
}

/// Reference causal LM.
#[derive(Debug, Clone)]
pub struct TinyLlama {
    config: LlamaConfig,
    params: ParamRegistry,
    precision: Precision,
    tp_rank: usize,
    tp_size: usize,
    slots: Slots,
}

impl TinyLlama {
    /// Create a model with seeded initialization.
    ///
    /// The seed must be the same on every rank so replicas start identical.
    pub fn new(
        config: LlamaConfig,
        precision: Precision,
        tp_rank: usize,
        tp_size: usize,
        seed: u64,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        let hidden = config.hidden_size;
        let vocab = config.vocab_size;
        let mut rng = StdRng::seed_from_u64(seed);
        // Uniform(-a, a) has standard deviation a / sqrt(3).
        let bound = config.initializer_range * 3f32.sqrt();
        let mut init = |n: usize| -> Vec<f32> {
            (0..n)
                .map(|_| precision.cast_param(rng.random_range(-bound..=bound)))
                .collect()
        };

        let mut params = ParamRegistry::new();
        let embed = params.register(Parameter::new(
            "model.embed_tokens.weight",
            vec![vocab, hidden],
            init(vocab * hidden),
            ParallelRole::Replicated,
        )?)?;

        let mut blocks = Vec::with_capacity(config.num_hidden_layers);
        for layer in 0..config.num_hidden_layers {
            let norm = params.register(Parameter::new(
                format!("model.layers.{layer}.input_norm.weight"),
                vec![hidden],
                vec![1.0; hidden],
                ParallelRole::SequenceParallel,
            )?)?;
            let proj = params.register(Parameter::new(
                format!("model.layers.{layer}.mlp.proj.weight"),
                vec![hidden, hidden],
                init(hidden * hidden),
                ParallelRole::Replicated,
            )?)?;
            blocks.push(BlockSlots { norm, proj });
        }

        let final_norm = params.register(Parameter::new(
            "model.norm.weight",
            vec![hidden],
            vec![1.0; hidden],
            ParallelRole::SequenceParallel,
        )?)?;
        let head_weight = params.register(Parameter::new(
            "lm_head.weight",
            vec![vocab, hidden],
            init(vocab * hidden),
            ParallelRole::Replicated,
        )?)?;
        let head_bias = params.register(Parameter::new(
            "lm_head.bias",
            vec![vocab],
            vec![0.0; vocab],
            ParallelRole::Replicated,
        )?)?;

        Ok(Self {
            config,
            params,
            precision,
            tp_rank,
            tp_size: tp_size.max(1),
            slots: Slots {
                embed,
                blocks,
                final_norm,
                head_weight,
                head_bias,
            },
        })
    }

    pub fn tp_rank(&self) -> usize {
        self.tp_rank
    }

    pub fn tp_size(&self) -> usize {
        self.tp_size
    }

    fn check_batch(&self, batch: &Batch) -> Result<(), ModelError> {
        let seq_len = batch.seq_len();
        if batch.batch_size() == 0 || seq_len == 0 {
            return Err(ModelError::EmptyBatch);
        }
        if seq_len > self.config.max_position_embeddings {
            return Err(ModelError::SequenceTooLong {
                len: seq_len,
                max: self.config.max_position_embeddings,
            });
        }
        let rows = batch.batch_size();
        if batch.attention_mask.len() != rows || batch.labels.len() != rows {
            return Err(ModelError::RaggedBatch {
                row: rows.min(batch.attention_mask.len()).min(batch.labels.len()),
                expected: rows,
                got: batch.attention_mask.len().min(batch.labels.len()),
            });
        }
        let vocab = self.config.vocab_size;
        for row in 0..rows {
            for len in [
                batch.input_ids[row].len(),
                batch.attention_mask[row].len(),
                batch.labels[row].len(),
            ] {
                if len != seq_len {
                    return Err(ModelError::RaggedBatch {
                        row,
                        expected: seq_len,
                        got: len,
                    });
                }
            }
            if let Some(&token) = batch.input_ids[row].iter().find(|&&t| t as usize >= vocab) {
                return Err(ModelError::TokenOutOfRange {
                    token: token as i64,
                    vocab,
                });
            }
            if let Some(&label) = batch.labels[row]
                .iter()
                .find(|&&l| l != IGNORE_INDEX && (l < 0 || l as usize >= vocab))
            {
                return Err(ModelError::TokenOutOfRange { token: label, vocab });
            }
        }
        Ok(())
    }

    /// Positions contributing to the loss: (row, position, target).
    ///
    /// Position `t` predicts the label at `t + 1`.
    fn targets(batch: &Batch) -> Vec<(usize, usize, usize)> {
        let mut out = Vec::new();
        for (row, labels) in batch.labels.iter().enumerate() {
            for t in 0..labels.len().saturating_sub(1) {
                let label = labels[t + 1];
                if label == IGNORE_INDEX || batch.attention_mask[row][t + 1] == 0 {
                    continue;
                }
                out.push((row, t, label as usize));
            }
        }
        out
    }

    /// Whether position `t` belongs to this rank's sequence slice.
    fn owns_position(&self, t: usize, seq_len: usize) -> bool {
        if !self.config.sequence_parallel_enabled || self.tp_size == 1 {
            return true;
        }
        t * self.tp_size / seq_len == self.tp_rank
    }

    fn rms_norm(&self, h: &[f32], gain_slot: usize) -> NormCache {
        let gain = &self.params.slot(gain_slot).data;
        let mean_sq = h.iter().map(|&x| x * x).sum::<f32>() / h.len() as f32;
        let inv_rms = 1.0 / (mean_sq + self.config.rms_norm_eps).sqrt();
        let unit: Vec<f32> = h.iter().map(|&x| x * inv_rms).collect();
        let out = unit
            .iter()
            .zip(gain)
            .map(|(&u, &g)| self.precision.cast_activation(u * g))
            .collect();
        NormCache { unit, inv_rms, out }
    }

    fn forward_token(&self, token: usize) -> TokenTrace {
        let hidden = self.config.hidden_size;
        let embed = &self.params.slot(self.slots.embed).data;
        let mut h = embed[token * hidden..(token + 1) * hidden].to_vec();
        let mut hiddens = Vec::with_capacity(self.slots.blocks.len() + 1);
        let mut caches = Vec::with_capacity(self.slots.blocks.len());

        for block in &self.slots.blocks {
            let cache = self.rms_norm(&h, block.norm);
            let weight = &self.params.slot(block.proj).data;
            let mut next = h.clone();
            for (i, out) in next.iter_mut().enumerate() {
                let row = &weight[i * hidden..(i + 1) * hidden];
                *out += row.iter().zip(&cache.out).map(|(w, n)| w * n).sum::<f32>();
            }
            hiddens.push(h);
            caches.push((!self.config.selective_checkpoint_enabled).then_some(cache));
            h = next;
        }

        let final_norm = self.rms_norm(&h, self.slots.final_norm);
        hiddens.push(h);
        TokenTrace {
            hidden: hiddens,
            blocks: caches,
            final_norm,
        }
    }

    fn logits(&self, z: &[f32]) -> Vec<f32> {
        let hidden = self.config.hidden_size;
        let weight = &self.params.slot(self.slots.head_weight).data;
        let bias = &self.params.slot(self.slots.head_bias).data;
        bias.iter()
            .enumerate()
            .map(|(v, &b)| {
                let row = &weight[v * hidden..(v + 1) * hidden];
                b + row.iter().zip(z).map(|(w, x)| w * x).sum::<f32>()
            })
            .collect()
    }

    /// Cross-entropy of `logits` against `target`, plus the softmax.
    fn cross_entropy(logits: &[f32], target: usize) -> (f32, Vec<f32>) {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        let loss = sum.ln() + max - logits[target];
        (loss, exps.into_iter().map(|e| e / sum).collect())
    }

    /// Backward through an RMSNorm; returns the gradient w.r.t. its input.
    fn norm_backward(
        &self,
        gain_slot: usize,
        cache: &NormCache,
        d_out: &[f32],
        accumulate_gain: bool,
        grads: &mut [Vec<f32>],
    ) -> Vec<f32> {
        let gain = &self.params.slot(gain_slot).data;
        if accumulate_gain {
            for ((g, &d), &u) in grads[gain_slot].iter_mut().zip(d_out).zip(&cache.unit) {
                *g += d * u;
            }
        }
        let d_unit: Vec<f32> = d_out.iter().zip(gain).map(|(d, g)| d * g).collect();
        let dot = d_unit
            .iter()
            .zip(&cache.unit)
            .map(|(d, u)| d * u)
            .sum::<f32>()
            / d_unit.len() as f32;
        d_unit
            .iter()
            .zip(&cache.unit)
            .map(|(&d, &u)| cache.inv_rms * (d - u * dot))
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn backward_token(
        &self,
        token: usize,
        owns_position: bool,
        target: usize,
        trace: &TokenTrace,
        mut d_logits: Vec<f32>,
        coeff: f32,
        grads: &mut [Vec<f32>],
    ) {
        let hidden = self.config.hidden_size;
        let slots = &self.slots;

        d_logits[target] -= 1.0;
        d_logits.iter_mut().for_each(|d| *d *= coeff);

        // LM head
        let z = &trace.final_norm.out;
        let head = &self.params.slot(slots.head_weight).data;
        let mut d_z = vec![0.0f32; hidden];
        for (v, &d) in d_logits.iter().enumerate() {
            if d == 0.0 {
                continue;
            }
            grads[slots.head_bias][v] += d;
            let row = &head[v * hidden..(v + 1) * hidden];
            let grad_row = &mut grads[slots.head_weight][v * hidden..(v + 1) * hidden];
            for j in 0..hidden {
                grad_row[j] += d * z[j];
                d_z[j] += row[j] * d;
            }
        }

        let mut d_h =
            self.norm_backward(slots.final_norm, &trace.final_norm, &d_z, owns_position, grads);

        for (layer, block) in slots.blocks.iter().enumerate().rev() {
            let recomputed;
            let cache = match &trace.blocks[layer] {
                Some(cache) => cache,
                None => {
                    recomputed = self.rms_norm(&trace.hidden[layer], block.norm);
                    &recomputed
                }
            };

            let weight = &self.params.slot(block.proj).data;
            let mut d_n = vec![0.0f32; hidden];
            for (i, &d) in d_h.iter().enumerate() {
                if d == 0.0 {
                    continue;
                }
                let row = &weight[i * hidden..(i + 1) * hidden];
                let grad_row = &mut grads[block.proj][i * hidden..(i + 1) * hidden];
                for j in 0..hidden {
                    grad_row[j] += d * cache.out[j];
                    d_n[j] += row[j] * d;
                }
            }

            let d_norm_in = self.norm_backward(block.norm, cache, &d_n, owns_position, grads);
            for (d, extra) in d_h.iter_mut().zip(d_norm_in) {
                *d += extra;
            }
        }

        let embed_row = &mut grads[slots.embed][token * hidden..(token + 1) * hidden];
        for (g, d) in embed_row.iter_mut().zip(&d_h) {
            *g += d;
        }
    }
}

impl CausalLm for TinyLlama {
    fn config(&self) -> &LlamaConfig {
        &self.config
    }

    fn params(&self) -> &ParamRegistry {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamRegistry {
        &mut self.params
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn forward_backward(&mut self, batch: &Batch, loss_scale: f32) -> Result<f32, ModelError> {
        self.check_batch(batch)?;
        let targets = Self::targets(batch);
        if targets.is_empty() {
            return Ok(0.0);
        }

        let seq_len = batch.seq_len();
        let coeff = loss_scale / targets.len() as f32;
        let mut grads: Vec<Vec<f32>> = self.params.iter().map(|p| vec![0.0; p.numel()]).collect();
        let mut total = 0.0f64;

        for &(row, t, target) in &targets {
            let token = batch.input_ids[row][t] as usize;
            let trace = self.forward_token(token);
            let logits = self.logits(&trace.final_norm.out);
            let (loss, probs) = Self::cross_entropy(&logits, target);
            total += loss as f64;
            self.backward_token(
                token,
                self.owns_position(t, seq_len),
                target,
                &trace,
                probs,
                coeff,
                &mut grads,
            );
        }

        for (param, grad) in self.params.iter_mut().zip(grads) {
            for (acc, g) in param.grad.iter_mut().zip(grad) {
                *acc += g;
            }
        }

        Ok((total / targets.len() as f64) as f32)
    }

    fn loss(&self, batch: &Batch) -> Result<f32, ModelError> {
        self.check_batch(batch)?;
        let targets = Self::targets(batch);
        if targets.is_empty() {
            return Ok(0.0);
        }
        let total: f64 = targets
            .iter()
            .map(|&(row, t, target)| {
                let trace = self.forward_token(batch.input_ids[row][t] as usize);
                let logits = self.logits(&trace.final_norm.out);
                Self::cross_entropy(&logits, target).0 as f64
            })
            .sum();
        Ok((total / targets.len() as f64) as f32)
    }
}
