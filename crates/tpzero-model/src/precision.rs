//! Numeric precision modes

use serde::{Deserialize, Serialize};

/// Compute and storage precision of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Precision {
    /// Everything in f32.
    #[default]
    Fp32,
    /// Activations and parameters rounded to bfloat16.
    Bf16,
    /// bfloat16 activations with f32 master parameters.
    MixedBf16,
}

impl Precision {
    /// Resolve from the `XLA_USE_BF16` / `XLA_DOWNCAST_BF16` switches.
    ///
    /// `XLA_USE_BF16` wins when both are set.
    pub fn from_flags(use_bf16: bool, downcast_bf16: bool) -> Self {
        if use_bf16 {
            Precision::Bf16
        } else if downcast_bf16 {
            Precision::MixedBf16
        } else {
            Precision::Fp32
        }
    }

    /// Short dtype label used in run names and parameter snapshots.
    pub fn dtype_name(&self) -> &'static str {
        match self {
            Precision::Fp32 => "float32",
            Precision::Bf16 | Precision::MixedBf16 => "bfloat16",
        }
    }

    pub fn cast_activation(&self, x: f32) -> f32 {
        match self {
            Precision::Fp32 => x,
            Precision::Bf16 | Precision::MixedBf16 => round_to_bf16(x),
        }
    }

    /// Rounding applied to parameters after every update.
    pub fn cast_param(&self, x: f32) -> f32 {
        match self {
            Precision::Bf16 => round_to_bf16(x),
            Precision::Fp32 | Precision::MixedBf16 => x,
        }
    }

    /// Whether the optimizer keeps f32 master copies of bf16 parameters.
    pub fn fp32_master_params(&self) -> bool {
        matches!(self, Precision::MixedBf16)
    }
}

/// Round an f32 to the nearest bfloat16 value (ties to even), returned as f32.
pub fn round_to_bf16(x: f32) -> f32 {
    if x.is_nan() {
        return x;
    }
    let bits = x.to_bits();
    let rounding_bias = 0x7fff + ((bits >> 16) & 1);
    f32::from_bits(bits.wrapping_add(rounding_bias) & 0xffff_0000)
}
