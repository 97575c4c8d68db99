//! Vector Backend B: AVX2 + FMA kernels (x86_64)
//!
//! Exploits the block layout directly: one 32-byte load per block, then four
//! `srli_epi16` + mask passes yield the lane-groups `[0,32) [32,64) [64,96)
//! [96,128)` as 32 raw codes each. Float kernels map codes to `{-1, 0, +1}`
//! with a `shuffle_epi8` table (reserved `11` → 0) and accumulate with
//! `_mm256_fmadd_ps`; fused kernels widen codes and activations to i16 and
//! reduce with `_mm256_madd_epi16`.
//!
//! Summation order (transposed): four 8-wide accumulators, accumulator `k`
//! covering group-positions `8k..8k+8` of every group and block; combined as
//! `(a0+a1)+(a2+a3)` then reduced horizontally.
//!
//! Rows not a multiple of 128 fall back to 8-wide gathers over
//! [`locate`](crate::codec::locate) (float) or the scalar path (fused).

use core::arch::x86_64::*;

use super::{scalar, FusedScale};
use crate::codec::{PackedMatrix, BLOCK_ELEMS, CODE_WEIGHTS, GROUP_ELEMS};

const LANES: usize = 8;

/// Columns per i32 accumulation run in the fused forward kernel. Each column
/// adds at most `3 · 128` to a lane.
const FUSED_COL_RUN: usize = 4096;

/// Blocks per i32 accumulation run in the fused transposed kernel. Each block
/// adds at most `128 · 3 · 128` across the lanes.
const FUSED_BLOCK_RUN: usize = 4096;

// ============================================================================
// Block decode
// ============================================================================

#[inline(always)]
unsafe fn load_block(bytes: &[u8]) -> __m256i {
    debug_assert!(bytes.len() >= 32);
    _mm256_loadu_si256(bytes.as_ptr() as *const __m256i)
}

#[inline(always)]
unsafe fn group_codes<const SHIFT: i32>(raw: __m256i) -> __m256i {
    // 16-bit shifts leak neighbour bits only above bit 1 of each byte
    _mm256_and_si256(_mm256_srli_epi16::<SHIFT>(raw), _mm256_set1_epi8(0b11))
}

/// Raw codes of all four lane-groups, group order.
#[inline(always)]
unsafe fn block_codes(raw: __m256i) -> [__m256i; 4] {
    [
        group_codes::<6>(raw),
        group_codes::<4>(raw),
        group_codes::<2>(raw),
        group_codes::<0>(raw),
    ]
}

/// Codes → signed weights. Reserved `11` reads as zero.
#[inline(always)]
unsafe fn code_weights(codes: __m256i) -> __m256i {
    let lut = _mm256_setr_epi8(
        -1, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        -1, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    );
    _mm256_shuffle_epi8(lut, codes)
}

/// 32 signed bytes → four `__m256` of eight floats, byte order.
#[inline(always)]
unsafe fn widen_f32(w: __m256i) -> [__m256; 4] {
    let lo = _mm256_castsi256_si128(w);
    let hi = _mm256_extracti128_si256::<1>(w);
    [
        _mm256_cvtepi32_ps(_mm256_cvtepi8_epi32(lo)),
        _mm256_cvtepi32_ps(_mm256_cvtepi8_epi32(_mm_srli_si128::<8>(lo))),
        _mm256_cvtepi32_ps(_mm256_cvtepi8_epi32(hi)),
        _mm256_cvtepi32_ps(_mm256_cvtepi8_epi32(_mm_srli_si128::<8>(hi))),
    ]
}

/// Float weights of a whole block: `[group][gp / 8]`.
#[inline(always)]
unsafe fn block_weights(bytes: &[u8]) -> [[__m256; 4]; 4] {
    let [g0, g1, g2, g3] = block_codes(load_block(bytes));
    [
        widen_f32(code_weights(g0)),
        widen_f32(code_weights(g1)),
        widen_f32(code_weights(g2)),
        widen_f32(code_weights(g3)),
    ]
}

#[inline(always)]
unsafe fn debug_check_codes(codes: __m256i) {
    debug_assert!(
        _mm256_movemask_epi8(_mm256_cmpeq_epi8(codes, _mm256_set1_epi8(0b11))) == 0,
        "reserved i2_s code 11 in fused kernel input"
    );
}

// ============================================================================
// Reductions
// ============================================================================

#[inline(always)]
unsafe fn hsum_ps(v: __m256) -> f32 {
    let hi = _mm256_extractf128_ps::<1>(v);
    let lo = _mm256_castps256_ps128(v);
    let sum128 = _mm_add_ps(lo, hi);
    let sum64 = _mm_add_ps(sum128, _mm_movehl_ps(sum128, sum128));
    let sum32 = _mm_add_ss(sum64, _mm_shuffle_ps::<1>(sum64, sum64));
    _mm_cvtss_f32(sum32)
}

#[inline(always)]
unsafe fn hsum_epi32(v: __m256i) -> i32 {
    let sum128 = _mm_add_epi32(_mm256_castsi256_si128(v), _mm256_extracti128_si256::<1>(v));
    let sum64 = _mm_add_epi32(sum128, _mm_shuffle_epi32::<0b01_00_11_10>(sum128));
    let sum32 = _mm_add_epi32(sum64, _mm_shuffle_epi32::<0b10_11_00_01>(sum64));
    _mm_cvtsi128_si32(sum32)
}

/// `Σ codes[i] · q[i]` over 32 elements: i8 → i16 widen, `madd_epi16` into
/// eight i32 lanes.
#[inline(always)]
unsafe fn dot32(codes: __m256i, q: __m256i) -> __m256i {
    let c_lo = _mm256_cvtepi8_epi16(_mm256_castsi256_si128(codes));
    let c_hi = _mm256_cvtepi8_epi16(_mm256_extracti128_si256::<1>(codes));
    let q_lo = _mm256_cvtepi8_epi16(_mm256_castsi256_si128(q));
    let q_hi = _mm256_cvtepi8_epi16(_mm256_extracti128_si256::<1>(q));
    _mm256_add_epi32(_mm256_madd_epi16(c_lo, q_lo), _mm256_madd_epi16(c_hi, q_hi))
}

// ============================================================================
// Float kernels
// ============================================================================

/// Forward matvec over `dst.len()` rows starting at `row_start`.
///
/// # Safety
/// The CPU must support AVX2 and FMA.
#[target_feature(enable = "avx2,fma")]
pub(crate) unsafe fn matvec(
    m: PackedMatrix<'_>,
    vec: &[f32],
    scale: f32,
    dst: &mut [f32],
    row_start: usize,
    skip_zero: bool,
) {
    let Some(blocks) = m.block_range(row_start, dst.len()) else {
        return matvec_strided(m, vec, scale, dst, row_start);
    };

    for (b, window) in blocks.zip(dst.chunks_exact_mut(BLOCK_ELEMS)) {
        // acc[g * 4 + k] holds rows g*32 + 8k .. +8 of this block
        let mut acc = [_mm256_setzero_ps(); BLOCK_ELEMS / LANES];
        for (col, &x) in vec.iter().enumerate() {
            if skip_zero && x == 0.0 {
                continue;
            }
            let v = _mm256_set1_ps(x);
            let weights = block_weights(m.block(col, b));
            for (g, group) in weights.iter().enumerate() {
                for (k, &w) in group.iter().enumerate() {
                    let slot = &mut acc[g * 4 + k];
                    *slot = _mm256_fmadd_ps(w, v, *slot);
                }
            }
        }
        let s = _mm256_set1_ps(scale);
        for (k, a) in acc.iter().enumerate() {
            _mm256_storeu_ps(window.as_mut_ptr().add(k * LANES), _mm256_mul_ps(*a, s));
        }
    }
}

#[target_feature(enable = "avx2,fma")]
unsafe fn matvec_strided(m: PackedMatrix<'_>, vec: &[f32], scale: f32, dst: &mut [f32], row_start: usize) {
    let full = vec.len() - vec.len() % LANES;
    let mut w = [0.0f32; LANES];
    for (i, out) in dst.iter_mut().enumerate() {
        let row = row_start + i;
        let mut acc = _mm256_setzero_ps();
        let mut c0 = 0;
        while c0 < full {
            for (k, slot) in w.iter_mut().enumerate() {
                *slot = CODE_WEIGHTS[m.code_at(row, c0 + k) as usize];
            }
            let x = _mm256_loadu_ps(vec.as_ptr().add(c0));
            acc = _mm256_fmadd_ps(_mm256_loadu_ps(w.as_ptr()), x, acc);
            c0 += LANES;
        }
        let mut sum = hsum_ps(acc);
        for (col, &x) in vec.iter().enumerate().skip(full) {
            sum += CODE_WEIGHTS[m.code_at(row, col) as usize] * x;
        }
        *out = sum * scale;
    }
}

/// Transposed matvec over `dst.len()` columns starting at `col_start`.
///
/// # Safety
/// The CPU must support AVX2 and FMA.
#[target_feature(enable = "avx2,fma")]
pub(crate) unsafe fn matvec_t(m: PackedMatrix<'_>, vec: &[f32], scale: f32, dst: &mut [f32], col_start: usize) {
    if !m.is_block_aligned() {
        return matvec_t_strided(m, vec, scale, dst, col_start);
    }

    for (j, out) in dst.iter_mut().enumerate() {
        let col = col_start + j;
        let mut acc = [_mm256_setzero_ps(); 4];
        for (b, xs) in vec.chunks_exact(BLOCK_ELEMS).enumerate() {
            let weights = block_weights(m.block(col, b));
            for (g, group) in weights.iter().enumerate() {
                for (k, &w) in group.iter().enumerate() {
                    let x = _mm256_loadu_ps(xs.as_ptr().add(g * GROUP_ELEMS + k * LANES));
                    acc[k] = _mm256_fmadd_ps(w, x, acc[k]);
                }
            }
        }
        let sum = _mm256_add_ps(_mm256_add_ps(acc[0], acc[1]), _mm256_add_ps(acc[2], acc[3]));
        *out = hsum_ps(sum) * scale;
    }
}

#[target_feature(enable = "avx2,fma")]
unsafe fn matvec_t_strided(m: PackedMatrix<'_>, vec: &[f32], scale: f32, dst: &mut [f32], col_start: usize) {
    let full = vec.len() - vec.len() % LANES;
    let mut w = [0.0f32; LANES];
    for (j, out) in dst.iter_mut().enumerate() {
        let col = col_start + j;
        let mut acc = _mm256_setzero_ps();
        let mut r0 = 0;
        while r0 < full {
            for (k, slot) in w.iter_mut().enumerate() {
                *slot = CODE_WEIGHTS[m.code_at(r0 + k, col) as usize];
            }
            let x = _mm256_loadu_ps(vec.as_ptr().add(r0));
            acc = _mm256_fmadd_ps(_mm256_loadu_ps(w.as_ptr()), x, acc);
            r0 += LANES;
        }
        let mut sum = hsum_ps(acc);
        for (row, &x) in vec.iter().enumerate().skip(full) {
            sum += CODE_WEIGHTS[m.code_at(row, col) as usize] * x;
        }
        *out = sum * scale;
    }
}

// ============================================================================
// Fused int8 kernels
// ============================================================================

/// Fused forward: 128 running i32 sums per row block, each column's
/// activation broadcast with `_mm256_mullo_epi32`; the i32 sums are folded
/// into i64 every [`FUSED_COL_RUN`] columns.
///
/// # Safety
/// The CPU must support AVX2 and FMA.
#[target_feature(enable = "avx2,fma")]
pub(crate) unsafe fn matvec_i8(
    m: PackedMatrix<'_>,
    qvec: &[i8],
    fused: FusedScale,
    dst: &mut [f32],
    row_start: usize,
) {
    let Some(blocks) = m.block_range(row_start, dst.len()) else {
        return scalar::matvec_i8(m, qvec, fused, dst, row_start);
    };

    let mut run = [0i32; BLOCK_ELEMS];
    for (b, window) in blocks.zip(dst.chunks_exact_mut(BLOCK_ELEMS)) {
        let mut dots = [0i64; BLOCK_ELEMS];
        for (r, qs) in qvec.chunks(FUSED_COL_RUN).enumerate() {
            let mut acc = [_mm256_setzero_si256(); BLOCK_ELEMS / LANES];
            for (i, &q) in qs.iter().enumerate() {
                if q == 0 {
                    continue;
                }
                let col = r * FUSED_COL_RUN + i;
                let qv = _mm256_set1_epi32(i32::from(q));
                for (g, &codes) in block_codes(load_block(m.block(col, b))).iter().enumerate() {
                    debug_check_codes(codes);
                    let lo = _mm256_castsi256_si128(codes);
                    let hi = _mm256_extracti128_si256::<1>(codes);
                    let parts = [
                        _mm256_cvtepu8_epi32(lo),
                        _mm256_cvtepu8_epi32(_mm_srli_si128::<8>(lo)),
                        _mm256_cvtepu8_epi32(hi),
                        _mm256_cvtepu8_epi32(_mm_srli_si128::<8>(hi)),
                    ];
                    for (k, &c32) in parts.iter().enumerate() {
                        let slot = &mut acc[g * 4 + k];
                        *slot = _mm256_add_epi32(*slot, _mm256_mullo_epi32(c32, qv));
                    }
                }
            }
            for (k, a) in acc.iter().enumerate() {
                _mm256_storeu_si256(run.as_mut_ptr().add(k * LANES) as *mut __m256i, *a);
            }
            for (dot, &part) in dots.iter_mut().zip(run.iter()) {
                *dot += i64::from(part);
            }
        }
        for (out, &dot) in window.iter_mut().zip(dots.iter()) {
            *out = fused.finish(dot);
        }
    }
}

/// Fused transposed: per column, each block's four code groups dotted against
/// the matching 32 activations via [`dot32`].
///
/// # Safety
/// The CPU must support AVX2 and FMA.
#[target_feature(enable = "avx2,fma")]
pub(crate) unsafe fn matvec_t_i8(
    m: PackedMatrix<'_>,
    qvec: &[i8],
    fused: FusedScale,
    dst: &mut [f32],
    col_start: usize,
) {
    if !m.is_block_aligned() {
        return scalar::matvec_t_i8(m, qvec, fused, dst, col_start);
    }

    for (j, out) in dst.iter_mut().enumerate() {
        let col = col_start + j;
        let mut dot = 0i64;
        for (r, qs) in qvec.chunks(BLOCK_ELEMS * FUSED_BLOCK_RUN).enumerate() {
            let mut acc = _mm256_setzero_si256();
            for (i, q) in qs.chunks_exact(BLOCK_ELEMS).enumerate() {
                let b = r * FUSED_BLOCK_RUN + i;
                for (g, &codes) in block_codes(load_block(m.block(col, b))).iter().enumerate() {
                    debug_check_codes(codes);
                    let qg = _mm256_loadu_si256(q.as_ptr().add(g * GROUP_ELEMS) as *const __m256i);
                    acc = _mm256_add_epi32(acc, dot32(codes, qg));
                }
            }
            dot += i64::from(hsum_epi32(acc));
        }
        *out = fused.finish(dot);
    }
}
