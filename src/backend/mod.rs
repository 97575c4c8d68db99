//! Kernel Backends: scalar reference and vectorized implementations
//!
//! Every backend implements the same four contracts (forward, transposed,
//! and their fused int8 counterparts) over a [`PackedMatrix`](crate::codec::PackedMatrix)
//! and a destination window starting at a given row/column offset.
//!
//! | Backend  | Forward / transposed            | Fused int8                       |
//! |----------|---------------------------------|----------------------------------|
//! | `scalar` | per-element `locate` reference  | per-element integer accumulation |
//! | `lanes`  | 8-wide `[f32; 8]` lanes, tables | unpack to `[i8; 128]`, i16 dot   |
//! | `avx2`   | 256-bit loads, shift/mask, FMA  | `_mm256_madd_epi16` dot          |
//!
//! Capability detection runs once and is cached; call sites never branch
//! on `cfg` themselves.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::KernelError;

pub(crate) mod lanes;
pub(crate) mod scalar;

#[cfg(all(target_arch = "x86_64", feature = "simd"))]
pub(crate) mod avx2;

/// Available kernel implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Per-element reference kernels
    Scalar,
    /// Portable 8-wide lane kernels
    Lanes,
    /// x86_64 AVX2 + FMA kernels
    Avx2,
}

static DETECTED: OnceLock<Backend> = OnceLock::new();

impl Backend {
    /// All backends, slowest first
    pub const ALL: [Backend; 3] = [Backend::Scalar, Backend::Lanes, Backend::Avx2];

    /// Lowercase name, as accepted by [`FromStr`].
    pub const fn name(self) -> &'static str {
        match self {
            Backend::Scalar => "scalar",
            Backend::Lanes => "lanes",
            Backend::Avx2 => "avx2",
        }
    }

    /// Whether the running CPU (and this build) can execute the backend.
    pub fn is_available(self) -> bool {
        match self {
            Backend::Scalar | Backend::Lanes => true,
            Backend::Avx2 => avx2_supported(),
        }
    }

    /// Fastest available backend (cached after the first call).
    pub fn detect() -> Backend {
        *DETECTED.get_or_init(|| {
            if avx2_supported() {
                Backend::Avx2
            } else {
                Backend::Lanes
            }
        })
    }

    /// Every backend this CPU can run, slowest first.
    pub fn available() -> Vec<Backend> {
        Self::ALL.into_iter().filter(|b| b.is_available()).collect()
    }
}

#[cfg(all(target_arch = "x86_64", feature = "simd"))]
fn avx2_supported() -> bool {
    is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
}

#[cfg(not(all(target_arch = "x86_64", feature = "simd")))]
fn avx2_supported() -> bool {
    false
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Self::ALL
            .into_iter()
            .find(|b| b.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| KernelError::UnknownBackend(s.to_string()))
    }
}

// ============================================================================
// Fused output scaling
// ============================================================================

/// Zero-point correction and output scale shared by every fused kernel.
///
/// `out = (Σ code·q − act_sum) · weight_scale / act_scale`, where raw codes
/// `{0, 1, 2}` stand for `{−1, 0, +1}`: `Σ (code − 1)·q = Σ code·q − Σ q`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FusedScale {
    act_sum: i32,
    scale: f32,
}

impl FusedScale {
    /// A zero activation scale forces the output scale to zero.
    #[inline]
    pub(crate) fn new(weight_scale: f32, act_scale: f32, act_sum: i32) -> Self {
        let scale = if act_scale == 0.0 { 0.0 } else { weight_scale / act_scale };
        Self { act_sum, scale }
    }

    /// Finalize one integer dot product of raw codes against activations.
    ///
    /// Dots are `i64`: at up to 3 · 128 per term an `i32` sum is only good
    /// for about 5.6M terms.
    #[inline(always)]
    pub(crate) fn finish(self, dot: i64) -> f32 {
        (dot - i64::from(self.act_sum)) as f32 * self.scale
    }
}

/// Reserved code `11` breaks the correction algebra; producers never emit it.
#[inline(always)]
pub(crate) fn debug_check_code(code: u8) {
    debug_assert!(code != 0b11, "reserved i2_s code 11 in fused kernel input");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_roundtrip() {
        for backend in Backend::ALL {
            assert_eq!(backend.name().parse::<Backend>().unwrap(), backend);
            assert_eq!(backend.to_string(), backend.name());
        }
        assert_eq!(" AVX2 ".parse::<Backend>().unwrap(), Backend::Avx2);
    }

    #[test]
    fn test_unknown_name() {
        let err = "neon".parse::<Backend>().unwrap_err();
        assert_eq!(err, KernelError::UnknownBackend("neon".into()));
    }

    #[test]
    fn test_detect_is_available() {
        let detected = Backend::detect();
        assert!(detected.is_available(), "detected {detected} must be runnable");
        assert_ne!(detected, Backend::Scalar, "detection never picks the reference");
        assert_eq!(Backend::detect(), detected, "detection is cached");
    }

    #[test]
    fn test_fused_scale() {
        let fused = FusedScale::new(0.5, 0.25, 10);
        assert_eq!(fused.finish(14), 8.0);
        assert_eq!(fused.finish(10), 0.0);

        let degenerate = FusedScale::new(0.5, 0.0, 3);
        assert_eq!(degenerate.finish(i64::MAX), 0.0);
        assert_eq!(degenerate.finish(-7), 0.0);
    }

    #[test]
    fn test_fused_scale_extreme_sum_no_overflow() {
        let fused = FusedScale::new(1.0, 1.0, i32::MIN);
        assert_eq!(fused.finish(i64::from(i32::MAX)), (i64::from(i32::MAX) - i64::from(i32::MIN)) as f32);

        // Past the i32 range, e.g. 2^24 terms of 2 · 127
        let dot = 254 * (1i64 << 24);
        assert_eq!(FusedScale::new(1.0, 1.0, 0).finish(dot), dot as f32);
    }

    #[test]
    fn test_available_always_has_portable() {
        let available = Backend::available();
        assert!(available.contains(&Backend::Scalar));
        assert!(available.contains(&Backend::Lanes));
        assert_eq!(available.contains(&Backend::Avx2), Backend::Avx2.is_available());
    }
}
