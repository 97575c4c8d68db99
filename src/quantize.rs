//! Quantization: producers for both kernel operands
//!
//! - Weights: FP32 → ternary `{-1, 0, +1}` with an absmean scale
//!   (BitNet b1.58), packed straight into i2_s.
//! - Activations: FP32 → int8 with an absmax/127 scale and the code sum the
//!   fused kernels use for zero-point correction.

use crate::codec::PackedTernary;
use crate::error::{KernelError, Result};

/// Below this magnitude a row of activations quantizes to all zeros.
pub const ACTIVATION_EPSILON: f32 = 1e-5;

/// Longest activation row whose code sum is guaranteed to fit in `i32`
/// (`|q| ≤ 128`).
pub const MAX_ACTIVATIONS: usize = i32::MAX as usize / 128;

fn check_activation_len(len: usize) -> Result<()> {
    if len > MAX_ACTIVATIONS {
        return Err(KernelError::ActivationsTooLong { len, max: MAX_ACTIVATIONS });
    }
    Ok(())
}

// ============================================================================
// Activations
// ============================================================================

/// Quantize a row of activations into `dst`, returning `(scale, sum)`.
///
/// `scale = max|x| / 127`, `dst[i] = round_half_even(x[i] / scale)` clamped
/// to `[-128, 127]`, `sum = Σ dst[i]`. When `max|x| < 1e-5` the codes, scale
/// and sum are all zero, which the fused kernels turn into an all-zero output.
///
/// Rows longer than [`MAX_ACTIVATIONS`] are rejected.
pub fn quantize_activations(src: &[f32], dst: &mut [i8]) -> Result<(f32, i32)> {
    check_activation_len(src.len())?;
    if dst.len() != src.len() {
        return Err(KernelError::LengthMismatch {
            buffer: "dst",
            expected: src.len(),
            actual: dst.len(),
        });
    }
    Ok(quantize_into(src, dst))
}

fn quantize_into(src: &[f32], dst: &mut [i8]) -> (f32, i32) {
    let max_abs = src.iter().fold(0.0f32, |m, x| m.max(x.abs()));
    if max_abs < ACTIVATION_EPSILON {
        dst.fill(0);
        return (0.0, 0);
    }

    let scale = max_abs / 127.0;
    let inv = 1.0 / f64::from(scale);
    let mut sum = 0i64;
    for (q, &x) in dst.iter_mut().zip(src) {
        *q = (f64::from(x) * inv).round_ties_even().clamp(-128.0, 127.0) as i8;
        sum += i64::from(*q);
    }
    // Callers bound the length by MAX_ACTIVATIONS
    (scale, sum as i32)
}

/// Owned int8 activation vector: `(codes, scale, sum)`.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantizedActivations {
    codes: Vec<i8>,
    scale: f32,
    sum: i32,
}

impl QuantizedActivations {
    /// Quantize an f32 slice (at most [`MAX_ACTIVATIONS`] long)
    pub fn quantize(src: &[f32]) -> Result<Self> {
        check_activation_len(src.len())?;
        let mut codes = vec![0i8; src.len()];
        let (scale, sum) = quantize_into(src, &mut codes);
        Ok(Self { codes, scale, sum })
    }

    /// Wrap codes produced elsewhere; the sum is recomputed.
    pub fn from_codes(codes: Vec<i8>, scale: f32) -> Result<Self> {
        check_activation_len(codes.len())?;
        let sum = codes.iter().map(|&q| i32::from(q)).sum();
        Ok(Self { codes, scale, sum })
    }

    /// Int8 codes
    #[inline]
    pub fn codes(&self) -> &[i8] { &self.codes }

    /// Dequantization scale (`x ≈ code · scale`)
    #[inline]
    pub fn scale(&self) -> f32 { self.scale }

    /// Activation scale as the fused kernels take it (`q ≈ x · act_scale`):
    /// the reciprocal of [`scale`](Self::scale), zero for an all-zero row.
    #[inline]
    pub fn act_scale(&self) -> f32 {
        if self.scale == 0.0 { 0.0 } else { 1.0 / self.scale }
    }

    /// Sum of codes
    #[inline]
    pub fn sum(&self) -> i32 { self.sum }

    /// Number of elements
    #[inline]
    pub fn len(&self) -> usize { self.codes.len() }

    /// True if empty
    #[inline]
    pub fn is_empty(&self) -> bool { self.codes.is_empty() }

    /// Dequantize into `dst` (DPS)
    pub fn dequantize_to(&self, dst: &mut [f32]) {
        debug_assert_eq!(dst.len(), self.codes.len());
        for (out, &q) in dst.iter_mut().zip(&self.codes) {
            *out = f32::from(q) * self.scale;
        }
    }
}

// ============================================================================
// Weights
// ============================================================================

/// Quantization statistics
#[derive(Clone, Debug, Default)]
pub struct QuantStats {
    /// Number of +1 weights
    pub plus_count: usize,
    /// Number of -1 weights
    pub minus_count: usize,
    /// Number of 0 weights
    pub zero_count: usize,
    /// Original weight range (min, max)
    pub original_range: (f32, f32),
    /// Absmean scale factor
    pub scale: f32,
    /// Mean absolute error after quantization
    pub mae: f32,
}

impl QuantStats {
    /// Fraction of zero weights
    pub fn sparsity(&self) -> f32 {
        let total = self.plus_count + self.minus_count + self.zero_count;
        if total == 0 {
            0.0
        } else {
            self.zero_count as f32 / total as f32
        }
    }

    /// Entropy of the ternary distribution in bits (at most log2(3) ≈ 1.58)
    pub fn effective_bits(&self) -> f32 {
        let total = self.plus_count + self.minus_count + self.zero_count;
        if total == 0 {
            return 0.0;
        }
        [self.plus_count, self.minus_count, self.zero_count]
            .iter()
            .filter(|&&n| n > 0)
            .map(|&n| {
                let p = n as f32 / total as f32;
                -p * p.log2()
            })
            .sum()
    }
}

/// Quantize column-major FP32 weights to a packed i2_s tensor.
///
/// 1. `γ = mean(|W|)` (floored at 1e-8)
/// 2. `W_t = clamp(round(W / γ), -1, 1)`
///
/// Never emits the reserved code.
pub fn quantize_weights(weights: &[f32], rows: usize, cols: usize) -> Result<(PackedTernary, QuantStats)> {
    let expected = rows
        .checked_mul(cols)
        .filter(|&n| n > 0)
        .ok_or(KernelError::InvalidDimension { rows, cols })?;
    if weights.len() != expected {
        return Err(KernelError::LengthMismatch { buffer: "weights", expected, actual: weights.len() });
    }

    let sum_abs: f32 = weights.iter().map(|w| w.abs()).sum();
    let scale = (sum_abs / weights.len() as f32).max(1e-8);

    let mut stats = QuantStats {
        scale,
        original_range: (f32::INFINITY, f32::NEG_INFINITY),
        ..Default::default()
    };
    let mut mae_sum = 0.0f32;
    let mut values = vec![0i8; weights.len()];

    for (t, &w) in values.iter_mut().zip(weights) {
        stats.original_range.0 = stats.original_range.0.min(w);
        stats.original_range.1 = stats.original_range.1.max(w);

        *t = (w / scale).round().clamp(-1.0, 1.0) as i8;
        match *t {
            1 => stats.plus_count += 1,
            -1 => stats.minus_count += 1,
            _ => stats.zero_count += 1,
        }
        mae_sum += (w - f32::from(*t) * scale).abs();
    }
    stats.mae = mae_sum / weights.len() as f32;

    let packed = PackedTernary::from_ternary(&values, rows, cols, scale)?;
    Ok((packed, stats))
}
