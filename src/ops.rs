//! i2_s MatVec: public kernel surface and backend dispatch
//!
//! All kernels use Destination Passing Style (DPS):
//! - `dst` is caller-owned and fully overwritten, never accumulated into
//! - scratch lives on the stack; no heap allocation on the hot path
//!
//! | Operation     | `dst`  | input         | result                                  |
//! |---------------|--------|---------------|-----------------------------------------|
//! | `matvec`      | rows   | `vec: cols`   | `scale · W · vec`                       |
//! | `matvec_t`    | cols   | `vec: rows`   | `scale · Wᵀ · vec`                      |
//! | `matvec_i8`   | rows   | `qvec: cols`  | `(Σ code·q − act_sum) · ws / as`        |
//! | `matvec_t_i8` | cols   | `qvec: rows`  | same, transposed                        |
//!
//! The free functions run on [`Kernels::global`]; build a [`Kernels`] from a
//! [`KernelConfig`] to pin a backend.

use std::sync::OnceLock;

use tracing::{debug, trace, warn};

use crate::backend::{lanes, scalar, Backend, FusedScale};
use crate::codec::{PackedMatrix, PackedTernary};
use crate::config::{BackendChoice, KernelConfig};
use crate::error::{KernelError, Result};
use crate::quantize::QuantizedActivations;

#[cfg(all(target_arch = "x86_64", feature = "simd"))]
use crate::backend::avx2;

#[inline]
fn check_len(buffer: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(KernelError::LengthMismatch { buffer, expected, actual })
    }
}

/// `start..start + len` must lie within `0..total`.
#[inline]
fn check_window(buffer: &'static str, start: usize, len: usize, total: usize) -> Result<()> {
    match start.checked_add(len) {
        Some(end) if end <= total => Ok(()),
        _ => Err(KernelError::LengthMismatch {
            buffer,
            expected: total.saturating_sub(start),
            actual: len,
        }),
    }
}

// ============================================================================
// Kernels: resolved backend + options
// ============================================================================

/// Kernel dispatcher bound to one backend.
///
/// Only constructible with a backend the running CPU supports, which is what
/// makes the intrinsic paths sound to call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Kernels {
    backend: Backend,
    skip_zero_inputs: bool,
}

static GLOBAL: OnceLock<Kernels> = OnceLock::new();

impl Kernels {
    /// Resolve a configuration.
    ///
    /// Fails with [`KernelError::BackendUnavailable`] if a pinned backend
    /// cannot run here.
    pub fn new(config: KernelConfig) -> Result<Self> {
        let backend = match config.backend {
            BackendChoice::Auto => Backend::detect(),
            BackendChoice::Fixed(b) if b.is_available() => b,
            BackendChoice::Fixed(b) => return Err(KernelError::BackendUnavailable(b)),
        };
        Ok(Self { backend, skip_zero_inputs: config.skip_zero_inputs })
    }

    /// Shorthand for a pinned backend with default options.
    pub fn with_backend(backend: Backend) -> Result<Self> {
        Self::new(KernelConfig::default().with_backend(backend))
    }

    /// Fastest backend, default options.
    pub fn detected() -> Self {
        Self { backend: Backend::detect(), skip_zero_inputs: true }
    }

    /// Process-wide dispatcher configured from the environment on first use.
    ///
    /// An unusable environment falls back to [`Kernels::detected`].
    pub fn global() -> &'static Kernels {
        GLOBAL.get_or_init(|| {
            let kernels = KernelConfig::from_env().and_then(Kernels::new).unwrap_or_else(|err| {
                warn!(%err, "ignoring i2_s kernel configuration from environment");
                Kernels::detected()
            });
            debug!(
                backend = %kernels.backend,
                detected = %Backend::detect(),
                skip_zero_inputs = kernels.skip_zero_inputs,
                "i2_s kernels initialised"
            );
            kernels
        })
    }

    /// Backend in use
    #[inline]
    pub fn backend(&self) -> Backend { self.backend }

    /// Whether the forward kernels skip zero inputs
    #[inline]
    pub fn skip_zero_inputs(&self) -> bool { self.skip_zero_inputs }

    // ------------------------------------------------------------------------
    // Whole-matrix entry points
    // ------------------------------------------------------------------------

    /// `dst = scale · W · vec` (`dst: rows`, `vec: cols`).
    pub fn matvec(&self, dst: &mut [f32], packed: &[u8], rows: usize, cols: usize, vec: &[f32], scale: f32) -> Result<()> {
        let m = PackedMatrix::new(packed, rows, cols)?;
        check_len("dst", rows, dst.len())?;
        self.matvec_rows(dst, m, vec, scale, 0)
    }

    /// `dst = scale · Wᵀ · vec` (`dst: cols`, `vec: rows`).
    pub fn matvec_t(&self, dst: &mut [f32], packed: &[u8], rows: usize, cols: usize, vec: &[f32], scale: f32) -> Result<()> {
        let m = PackedMatrix::new(packed, rows, cols)?;
        check_len("dst", cols, dst.len())?;
        self.matvec_t_cols(dst, m, vec, scale, 0)
    }

    /// Fused forward against int8 activations (`dst: rows`, `qvec: cols`).
    ///
    /// `act_scale == 0` yields an all-zero `dst`.
    #[allow(clippy::too_many_arguments)]
    pub fn matvec_i8(
        &self,
        dst: &mut [f32],
        packed: &[u8],
        rows: usize,
        cols: usize,
        qvec: &[i8],
        weight_scale: f32,
        act_scale: f32,
        act_sum: i32,
    ) -> Result<()> {
        let m = PackedMatrix::new(packed, rows, cols)?;
        check_len("dst", rows, dst.len())?;
        self.matvec_i8_rows(dst, m, qvec, (weight_scale, act_scale, act_sum), 0)
    }

    /// Fused transposed against int8 activations (`dst: cols`, `qvec: rows`).
    #[allow(clippy::too_many_arguments)]
    pub fn matvec_t_i8(
        &self,
        dst: &mut [f32],
        packed: &[u8],
        rows: usize,
        cols: usize,
        qvec: &[i8],
        weight_scale: f32,
        act_scale: f32,
        act_sum: i32,
    ) -> Result<()> {
        let m = PackedMatrix::new(packed, rows, cols)?;
        check_len("dst", cols, dst.len())?;
        self.matvec_t_i8_cols(dst, m, qvec, (weight_scale, act_scale, act_sum), 0)
    }

    // ------------------------------------------------------------------------
    // Windowed entry points (one task of a partitioned call)
    // ------------------------------------------------------------------------

    /// Forward matvec for rows `row_start..row_start + dst.len()`.
    pub fn matvec_rows(&self, dst: &mut [f32], m: PackedMatrix<'_>, vec: &[f32], scale: f32, row_start: usize) -> Result<()> {
        check_len("vec", m.cols(), vec.len())?;
        check_window("dst", row_start, dst.len(), m.rows())?;
        self.run_matvec(m, vec, scale, dst, row_start);
        Ok(())
    }

    /// Transposed matvec for columns `col_start..col_start + dst.len()`.
    pub fn matvec_t_cols(&self, dst: &mut [f32], m: PackedMatrix<'_>, vec: &[f32], scale: f32, col_start: usize) -> Result<()> {
        check_len("vec", m.rows(), vec.len())?;
        check_window("dst", col_start, dst.len(), m.cols())?;
        self.run_matvec_t(m, vec, scale, dst, col_start);
        Ok(())
    }

    /// Fused forward for rows `row_start..row_start + dst.len()`.
    ///
    /// `fused` is `(weight_scale, act_scale, act_sum)` or
    /// `(weight_scale, &QuantizedActivations)`.
    pub fn matvec_i8_rows(
        &self,
        dst: &mut [f32],
        m: PackedMatrix<'_>,
        qvec: &[i8],
        fused: impl Into<FusedArgs>,
        row_start: usize,
    ) -> Result<()> {
        check_len("qvec", m.cols(), qvec.len())?;
        check_window("dst", row_start, dst.len(), m.rows())?;
        self.run_matvec_i8(m, qvec, fused.into().0, dst, row_start);
        Ok(())
    }

    /// Fused transposed for columns `col_start..col_start + dst.len()`.
    pub fn matvec_t_i8_cols(
        &self,
        dst: &mut [f32],
        m: PackedMatrix<'_>,
        qvec: &[i8],
        fused: impl Into<FusedArgs>,
        col_start: usize,
    ) -> Result<()> {
        check_len("qvec", m.rows(), qvec.len())?;
        check_window("dst", col_start, dst.len(), m.cols())?;
        self.run_matvec_t_i8(m, qvec, fused.into().0, dst, col_start);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Dispatch (arguments already validated)
    // ------------------------------------------------------------------------

    fn run_matvec(&self, m: PackedMatrix<'_>, vec: &[f32], scale: f32, dst: &mut [f32], row_start: usize) {
        trace!(backend = %self.backend, rows = m.rows(), cols = m.cols(), row_start, len = dst.len(), "matvec");
        let skip = self.skip_zero_inputs;
        match self.backend {
            Backend::Scalar => scalar::matvec(m, vec, scale, dst, row_start),
            Backend::Lanes => lanes::matvec(m, vec, scale, dst, row_start, skip),
            // SAFETY: `Kernels` only holds Avx2 after a successful CPU check
            #[cfg(all(target_arch = "x86_64", feature = "simd"))]
            Backend::Avx2 => unsafe { avx2::matvec(m, vec, scale, dst, row_start, skip) },
            #[cfg(not(all(target_arch = "x86_64", feature = "simd")))]
            Backend::Avx2 => lanes::matvec(m, vec, scale, dst, row_start, skip),
        }
    }

    fn run_matvec_t(&self, m: PackedMatrix<'_>, vec: &[f32], scale: f32, dst: &mut [f32], col_start: usize) {
        trace!(backend = %self.backend, rows = m.rows(), cols = m.cols(), col_start, len = dst.len(), "matvec_t");
        match self.backend {
            Backend::Scalar => scalar::matvec_t(m, vec, scale, dst, col_start),
            Backend::Lanes => lanes::matvec_t(m, vec, scale, dst, col_start),
            // SAFETY: see run_matvec
            #[cfg(all(target_arch = "x86_64", feature = "simd"))]
            Backend::Avx2 => unsafe { avx2::matvec_t(m, vec, scale, dst, col_start) },
            #[cfg(not(all(target_arch = "x86_64", feature = "simd")))]
            Backend::Avx2 => lanes::matvec_t(m, vec, scale, dst, col_start),
        }
    }

    fn run_matvec_i8(&self, m: PackedMatrix<'_>, qvec: &[i8], fused: FusedScale, dst: &mut [f32], row_start: usize) {
        trace!(backend = %self.backend, rows = m.rows(), cols = m.cols(), row_start, len = dst.len(), "matvec_i8");
        match self.backend {
            Backend::Scalar => scalar::matvec_i8(m, qvec, fused, dst, row_start),
            Backend::Lanes => lanes::matvec_i8(m, qvec, fused, dst, row_start),
            // SAFETY: see run_matvec
            #[cfg(all(target_arch = "x86_64", feature = "simd"))]
            Backend::Avx2 => unsafe { avx2::matvec_i8(m, qvec, fused, dst, row_start) },
            #[cfg(not(all(target_arch = "x86_64", feature = "simd")))]
            Backend::Avx2 => lanes::matvec_i8(m, qvec, fused, dst, row_start),
        }
    }

    fn run_matvec_t_i8(&self, m: PackedMatrix<'_>, qvec: &[i8], fused: FusedScale, dst: &mut [f32], col_start: usize) {
        trace!(backend = %self.backend, rows = m.rows(), cols = m.cols(), col_start, len = dst.len(), "matvec_t_i8");
        match self.backend {
            Backend::Scalar => scalar::matvec_t_i8(m, qvec, fused, dst, col_start),
            Backend::Lanes => lanes::matvec_t_i8(m, qvec, fused, dst, col_start),
            // SAFETY: see run_matvec
            #[cfg(all(target_arch = "x86_64", feature = "simd"))]
            Backend::Avx2 => unsafe { avx2::matvec_t_i8(m, qvec, fused, dst, col_start) },
            #[cfg(not(all(target_arch = "x86_64", feature = "simd")))]
            Backend::Avx2 => lanes::matvec_t_i8(m, qvec, fused, dst, col_start),
        }
    }
}

/// Scales and zero-point for the windowed fused entry points.
///
/// Build from `(weight_scale, act_scale, act_sum)` or from
/// `(weight_scale, &QuantizedActivations)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FusedArgs(FusedScale);

impl From<(f32, f32, i32)> for FusedArgs {
    fn from((weight_scale, act_scale, act_sum): (f32, f32, i32)) -> Self {
        FusedArgs(FusedScale::new(weight_scale, act_scale, act_sum))
    }
}

impl From<(f32, &QuantizedActivations)> for FusedArgs {
    fn from((weight_scale, acts): (f32, &QuantizedActivations)) -> Self {
        FusedArgs(FusedScale::new(weight_scale, acts.act_scale(), acts.sum()))
    }
}

// ============================================================================
// Partitioned execution (rayon)
// ============================================================================

#[cfg(feature = "parallel")]
mod parallel {
    use rayon::prelude::*;

    use super::*;
    use crate::codec::BLOCK_ELEMS;

    /// Row window per task; whole blocks when the matrix is block aligned so
    /// every window keeps the fast path.
    pub(super) fn row_chunk(m: &PackedMatrix<'_>) -> usize {
        let tasks = rayon::current_num_threads().max(1);
        if m.is_block_aligned() {
            m.blocks_per_col().div_ceil(tasks).max(1) * BLOCK_ELEMS
        } else {
            m.rows().div_ceil(tasks).max(1)
        }
    }

    pub(super) fn col_chunk(m: &PackedMatrix<'_>) -> usize {
        m.cols().div_ceil(rayon::current_num_threads().max(1)).max(1)
    }

    impl Kernels {
        /// [`Kernels::matvec`] split into disjoint row windows on rayon.
        pub fn par_matvec(&self, dst: &mut [f32], packed: &[u8], rows: usize, cols: usize, vec: &[f32], scale: f32) -> Result<()> {
            let m = PackedMatrix::new(packed, rows, cols)?;
            check_len("dst", rows, dst.len())?;
            check_len("vec", cols, vec.len())?;
            let chunk = row_chunk(&m);
            dst.par_chunks_mut(chunk)
                .enumerate()
                .for_each(|(i, window)| self.run_matvec(m, vec, scale, window, i * chunk));
            Ok(())
        }

        /// [`Kernels::matvec_t`] split into disjoint column windows on rayon.
        pub fn par_matvec_t(&self, dst: &mut [f32], packed: &[u8], rows: usize, cols: usize, vec: &[f32], scale: f32) -> Result<()> {
            let m = PackedMatrix::new(packed, rows, cols)?;
            check_len("dst", cols, dst.len())?;
            check_len("vec", rows, vec.len())?;
            let chunk = col_chunk(&m);
            dst.par_chunks_mut(chunk)
                .enumerate()
                .for_each(|(i, window)| self.run_matvec_t(m, vec, scale, window, i * chunk));
            Ok(())
        }

        /// [`Kernels::matvec_i8`] split into disjoint row windows on rayon.
        #[allow(clippy::too_many_arguments)]
        pub fn par_matvec_i8(
            &self,
            dst: &mut [f32],
            packed: &[u8],
            rows: usize,
            cols: usize,
            qvec: &[i8],
            weight_scale: f32,
            act_scale: f32,
            act_sum: i32,
        ) -> Result<()> {
            let m = PackedMatrix::new(packed, rows, cols)?;
            check_len("dst", rows, dst.len())?;
            check_len("qvec", cols, qvec.len())?;
            let fused = FusedScale::new(weight_scale, act_scale, act_sum);
            let chunk = row_chunk(&m);
            dst.par_chunks_mut(chunk)
                .enumerate()
                .for_each(|(i, window)| self.run_matvec_i8(m, qvec, fused, window, i * chunk));
            Ok(())
        }

        /// [`Kernels::matvec_t_i8`] split into disjoint column windows on rayon.
        #[allow(clippy::too_many_arguments)]
        pub fn par_matvec_t_i8(
            &self,
            dst: &mut [f32],
            packed: &[u8],
            rows: usize,
            cols: usize,
            qvec: &[i8],
            weight_scale: f32,
            act_scale: f32,
            act_sum: i32,
        ) -> Result<()> {
            let m = PackedMatrix::new(packed, rows, cols)?;
            check_len("dst", cols, dst.len())?;
            check_len("qvec", rows, qvec.len())?;
            let fused = FusedScale::new(weight_scale, act_scale, act_sum);
            let chunk = col_chunk(&m);
            dst.par_chunks_mut(chunk)
                .enumerate()
                .for_each(|(i, window)| self.run_matvec_t_i8(m, qvec, fused, window, i * chunk));
            Ok(())
        }
    }
}

// ============================================================================
// Free functions on the global dispatcher
// ============================================================================

/// `dst = scale · W · vec` on [`Kernels::global`].
#[inline]
pub fn matvec(dst: &mut [f32], packed: &[u8], rows: usize, cols: usize, vec: &[f32], scale: f32) -> Result<()> {
    Kernels::global().matvec(dst, packed, rows, cols, vec, scale)
}

/// `dst = scale · Wᵀ · vec` on [`Kernels::global`].
#[inline]
pub fn matvec_t(dst: &mut [f32], packed: &[u8], rows: usize, cols: usize, vec: &[f32], scale: f32) -> Result<()> {
    Kernels::global().matvec_t(dst, packed, rows, cols, vec, scale)
}

/// Fused forward on [`Kernels::global`].
#[allow(clippy::too_many_arguments)]
#[inline]
pub fn matvec_i8(
    dst: &mut [f32],
    packed: &[u8],
    rows: usize,
    cols: usize,
    qvec: &[i8],
    weight_scale: f32,
    act_scale: f32,
    act_sum: i32,
) -> Result<()> {
    Kernels::global().matvec_i8(dst, packed, rows, cols, qvec, weight_scale, act_scale, act_sum)
}

/// Fused transposed on [`Kernels::global`].
#[allow(clippy::too_many_arguments)]
#[inline]
pub fn matvec_t_i8(
    dst: &mut [f32],
    packed: &[u8],
    rows: usize,
    cols: usize,
    qvec: &[i8],
    weight_scale: f32,
    act_scale: f32,
    act_sum: i32,
) -> Result<()> {
    Kernels::global().matvec_t_i8(dst, packed, rows, cols, qvec, weight_scale, act_scale, act_sum)
}

/// Fused forward of an owned tensor against owned activations (DPS).
pub fn matvec_quantized(dst: &mut [f32], weights: &PackedTernary, acts: &QuantizedActivations) -> Result<()> {
    check_len("dst", weights.rows(), dst.len())?;
    Kernels::global().matvec_i8_rows(dst, weights.as_matrix(), acts.codes(), (weights.scale(), acts), 0)
}
