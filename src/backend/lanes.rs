//! Vector Backend A: portable 8-wide lane kernels
//!
//! Written over `[f32; 8]` / `[i32; 8]` arrays so the compiler can map each
//! lane operation onto whatever vector unit the target has. Block decode
//! goes through the compile-time [`BYTE_WEIGHTS`] / [`BYTE_CODES`] tables.
//!
//! Block fast paths (rows a multiple of 128):
//! - forward: per 128-row block, a stack accumulator of 128 floats; each
//!   column's 32 bytes decode into four lane-groups added at +0/+32/+64/+96
//! - transposed: per column, eight lane accumulators indexed by `gp % 8`
//!
//! Otherwise rows/columns are walked 8 elements at a time with per-element
//! [`locate`](crate::codec::locate) gathers.
//!
//! Summation order (transposed): lane `k` collects every element whose
//! group-position is `≡ k (mod 8)`; lanes combine as
//! `((l0+l4)+(l1+l5)) + ((l2+l6)+(l3+l7))`.

use super::{debug_check_code, scalar, FusedScale};
use crate::codec::{
    PackedMatrix, BLOCK_BYTES, BLOCK_ELEMS, BYTE_CODES, BYTE_WEIGHTS, CODE_WEIGHTS, GROUPS,
    GROUP_ELEMS,
};

/// Lane width
pub(crate) const LANES: usize = 8;

#[inline(always)]
fn hsum(acc: [f32; LANES]) -> f32 {
    ((acc[0] + acc[4]) + (acc[1] + acc[5])) + ((acc[2] + acc[6]) + (acc[3] + acc[7]))
}

/// Weights of lane-group `group` for eight consecutive bytes.
#[inline(always)]
fn decode_lane(bytes: &[u8], group: usize) -> [f32; LANES] {
    let mut lane = [0.0f32; LANES];
    for (w, &b) in lane.iter_mut().zip(bytes) {
        *w = BYTE_WEIGHTS[b as usize][group];
    }
    lane
}

/// Unpack one 32-byte block into its 128 raw codes, element order.
#[inline(always)]
pub(crate) fn unpack_block(bytes: &[u8], out: &mut [i8; BLOCK_ELEMS]) {
    for (gp, &b) in bytes.iter().enumerate().take(BLOCK_BYTES) {
        let codes = BYTE_CODES[b as usize];
        for (g, &code) in codes.iter().enumerate() {
            debug_check_code(code);
            out[g * GROUP_ELEMS + gp] = code as i8;
        }
    }
}

/// Widening dot product over 128 elements: i8 × i8 → i16 products, paired
/// into i32 lanes, then reduced. One block never exceeds `128 · 3 · 128`.
#[inline(always)]
pub(crate) fn dot_i8(codes: &[i8; BLOCK_ELEMS], q: &[i8]) -> i32 {
    let mut acc = [0i32; LANES];
    for (a, b) in codes.chunks_exact(2 * LANES).zip(q.chunks_exact(2 * LANES)) {
        for k in 0..LANES {
            let lo = i16::from(a[2 * k]) * i16::from(b[2 * k]);
            let hi = i16::from(a[2 * k + 1]) * i16::from(b[2 * k + 1]);
            acc[k] += i32::from(lo) + i32::from(hi);
        }
    }
    acc.iter().sum()
}

// ============================================================================
// Float kernels
// ============================================================================

/// Forward matvec over `dst.len()` rows starting at `row_start`.
pub(crate) fn matvec(
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
        let mut acc = [0.0f32; BLOCK_ELEMS];
        for (col, &x) in vec.iter().enumerate() {
            if skip_zero && x == 0.0 {
                continue;
            }
            let bytes = m.block(col, b);
            for (chunk_idx, chunk) in bytes.chunks_exact(LANES).enumerate() {
                let gp = chunk_idx * LANES;
                for g in 0..GROUPS {
                    let lane = decode_lane(chunk, g);
                    let out = &mut acc[g * GROUP_ELEMS + gp..][..LANES];
                    for k in 0..LANES {
                        out[k] += lane[k] * x;
                    }
                }
            }
        }
        for (out, &sum) in window.iter_mut().zip(acc.iter()) {
            *out = sum * scale;
        }
    }
}

fn matvec_strided(m: PackedMatrix<'_>, vec: &[f32], scale: f32, dst: &mut [f32], row_start: usize) {
    let full = vec.len() - vec.len() % LANES;
    for (i, out) in dst.iter_mut().enumerate() {
        let row = row_start + i;
        let mut acc = [0.0f32; LANES];
        for (c0, xs) in (0..full).step_by(LANES).zip(vec.chunks_exact(LANES)) {
            for k in 0..LANES {
                acc[k] += CODE_WEIGHTS[m.code_at(row, c0 + k) as usize] * xs[k];
            }
        }
        let mut sum = hsum(acc);
        for (col, &x) in vec.iter().enumerate().skip(full) {
            sum += CODE_WEIGHTS[m.code_at(row, col) as usize] * x;
        }
        *out = sum * scale;
    }
}

/// Transposed matvec over `dst.len()` columns starting at `col_start`.
pub(crate) fn matvec_t(m: PackedMatrix<'_>, vec: &[f32], scale: f32, dst: &mut [f32], col_start: usize) {
    if !m.is_block_aligned() {
        return matvec_t_strided(m, vec, scale, dst, col_start);
    }

    for (j, out) in dst.iter_mut().enumerate() {
        let col = col_start + j;
        let mut acc = [0.0f32; LANES];
        for (b, xs) in vec.chunks_exact(BLOCK_ELEMS).enumerate() {
            let bytes = m.block(col, b);
            for (chunk_idx, chunk) in bytes.chunks_exact(LANES).enumerate() {
                let gp = chunk_idx * LANES;
                for g in 0..GROUPS {
                    let lane = decode_lane(chunk, g);
                    let x = &xs[g * GROUP_ELEMS + gp..][..LANES];
                    for k in 0..LANES {
                        acc[k] += lane[k] * x[k];
                    }
                }
            }
        }
        *out = hsum(acc) * scale;
    }
}

fn matvec_t_strided(m: PackedMatrix<'_>, vec: &[f32], scale: f32, dst: &mut [f32], col_start: usize) {
    let full = vec.len() - vec.len() % LANES;
    for (j, out) in dst.iter_mut().enumerate() {
        let col = col_start + j;
        let mut acc = [0.0f32; LANES];
        for (r0, xs) in (0..full).step_by(LANES).zip(vec.chunks_exact(LANES)) {
            for k in 0..LANES {
                acc[k] += CODE_WEIGHTS[m.code_at(r0 + k, col) as usize] * xs[k];
            }
        }
        let mut sum = hsum(acc);
        for (row, &x) in vec.iter().enumerate().skip(full) {
            sum += CODE_WEIGHTS[m.code_at(row, col) as usize] * x;
        }
        *out = sum * scale;
    }
}

// ============================================================================
// Fused int8 kernels
// ============================================================================

/// Fused forward: per 128-row block, 128 running i64 sums; each column's
/// activation is broadcast across the block's codes.
pub(crate) fn matvec_i8(m: PackedMatrix<'_>, qvec: &[i8], fused: FusedScale, dst: &mut [f32], row_start: usize) {
    let Some(blocks) = m.block_range(row_start, dst.len()) else {
        return scalar::matvec_i8(m, qvec, fused, dst, row_start);
    };

    for (b, window) in blocks.zip(dst.chunks_exact_mut(BLOCK_ELEMS)) {
        let mut acc = [0i64; BLOCK_ELEMS];
        for (col, &q) in qvec.iter().enumerate() {
            if q == 0 {
                continue;
            }
            let q = i64::from(q);
            for (gp, &byte) in m.block(col, b).iter().enumerate() {
                let codes = BYTE_CODES[byte as usize];
                for (g, &code) in codes.iter().enumerate() {
                    debug_check_code(code);
                    acc[g * GROUP_ELEMS + gp] += i64::from(code) * q;
                }
            }
        }
        for (out, &dot) in window.iter_mut().zip(acc.iter()) {
            *out = fused.finish(dot);
        }
    }
}

/// Fused transposed: per column, unpack each block to `[i8; 128]` and take a
/// widening dot product against the matching activations.
pub(crate) fn matvec_t_i8(m: PackedMatrix<'_>, qvec: &[i8], fused: FusedScale, dst: &mut [f32], col_start: usize) {
    if !m.is_block_aligned() {
        return scalar::matvec_t_i8(m, qvec, fused, dst, col_start);
    }

    let mut codes = [0i8; BLOCK_ELEMS];
    for (j, out) in dst.iter_mut().enumerate() {
        let col = col_start + j;
        let mut dot = 0i64;
        for (b, q) in qvec.chunks_exact(BLOCK_ELEMS).enumerate() {
            unpack_block(m.block(col, b), &mut codes);
            dot += i64::from(dot_i8(&codes, q));
        }
        *out = fused.finish(dot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{locate, PackedTernary};
    use crate::Code;

    fn pattern(rows: usize, cols: usize) -> PackedTernary {
        PackedTernary::from_fn(rows, cols, 0.75, |r, c| Code::from_bits(((r * 7 + c * 3) % 3) as u8))
            .unwrap()
    }

    #[test]
    fn test_unpack_block_matches_locate() {
        let bytes: Vec<u8> = (0..32u8)
            .map(|i| {
                let c = |g: u8| (i + g) % 3;
                (c(0) << 6) | (c(1) << 4) | (c(2) << 2) | c(3)
            })
            .collect();
        let mut codes = [0i8; BLOCK_ELEMS];
        unpack_block(&bytes, &mut codes);
        for (idx, &code) in codes.iter().enumerate() {
            assert_eq!(code as u8, locate(&bytes, idx), "element {idx}");
        }
    }

    #[test]
    fn test_dot_i8() {
        let mut codes = [0i8; BLOCK_ELEMS];
        let mut q = [0i8; BLOCK_ELEMS];
        for i in 0..BLOCK_ELEMS {
            codes[i] = (i % 3) as i8;
            q[i] = if i % 2 == 0 { -128 } else { 127 };
        }
        let expected: i32 = codes.iter().zip(&q).map(|(&a, &b)| i32::from(a) * i32::from(b)).sum();
        assert_eq!(dot_i8(&codes, &q), expected);
    }

    #[test]
    fn test_block_paths_match_reference() {
        let t = pattern(256, 5);
        let m = t.as_matrix();
        let x: Vec<f32> = (0..5).map(|i| i as f32 - 1.5).collect();

        let mut fast = vec![f32::NAN; 256];
        let mut reference = vec![0.0f32; 256];
        matvec(m, &x, 0.75, &mut fast, 0, true);
        scalar::matvec(m, &x, 0.75, &mut reference, 0);
        for (r, (a, b)) in fast.iter().zip(&reference).enumerate() {
            assert!((a - b).abs() < 1e-5, "row {r}: {a} vs {b}");
        }

        let xt: Vec<f32> = (0..256).map(|i| ((i % 11) as f32 - 5.0) * 0.25).collect();
        let mut fast = vec![f32::NAN; 5];
        let mut reference = vec![0.0f32; 5];
        matvec_t(m, &xt, 0.75, &mut fast, 0);
        scalar::matvec_t(m, &xt, 0.75, &mut reference, 0);
        for (c, (a, b)) in fast.iter().zip(&reference).enumerate() {
            assert!((a - b).abs() < 1e-4, "col {c}: {a} vs {b}");
        }
    }

    #[test]
    fn test_strided_paths_match_reference() {
        let t = pattern(37, 19);
        let m = t.as_matrix();
        let x: Vec<f32> = (0..19).map(|i| (i as f32).sin()).collect();
        let mut fast = vec![f32::NAN; 37];
        let mut reference = vec![0.0f32; 37];
        matvec(m, &x, 0.75, &mut fast, 0, true);
        scalar::matvec(m, &x, 0.75, &mut reference, 0);
        for (r, (a, b)) in fast.iter().zip(&reference).enumerate() {
            assert!((a - b).abs() < 1e-5, "row {r}: {a} vs {b}");
        }

        let xt: Vec<f32> = (0..37).map(|i| (i as f32).cos()).collect();
        let mut fast = vec![f32::NAN; 19];
        let mut reference = vec![0.0f32; 19];
        matvec_t(m, &xt, 0.75, &mut fast, 0);
        scalar::matvec_t(m, &xt, 0.75, &mut reference, 0);
        for (c, (a, b)) in fast.iter().zip(&reference).enumerate() {
            assert!((a - b).abs() < 1e-5, "col {c}: {a} vs {b}");
        }
    }

    #[test]
    fn test_unaligned_window_of_aligned_matrix() {
        let t = pattern(256, 3);
        let m = t.as_matrix();
        let x = [1.0f32, -2.0, 0.5];
        let mut window = vec![f32::NAN; 100];
        let mut reference = vec![0.0f32; 100];
        matvec(m, &x, 1.0, &mut window, 64, true);
        scalar::matvec(m, &x, 1.0, &mut reference, 64);
        assert_eq!(window, reference);
    }

    #[test]
    fn test_fused_block_paths_exact() {
        let t = pattern(384, 7);
        let m = t.as_matrix();
        let fused = FusedScale::new(1.0, 1.0, 0);

        let q: Vec<i8> = (0..7).map(|i| (i * 37 - 100) as i8).collect();
        let mut fast = vec![0.0f32; 384];
        let mut reference = vec![0.0f32; 384];
        matvec_i8(m, &q, fused, &mut fast, 0);
        scalar::matvec_i8(m, &q, fused, &mut reference, 0);
        assert_eq!(fast, reference, "fused forward");

        let qt: Vec<i8> = (0..384).map(|i| ((i * 13) % 256) as u8 as i8).collect();
        let mut fast = vec![0.0f32; 7];
        let mut reference = vec![0.0f32; 7];
        matvec_t_i8(m, &qt, fused, &mut fast, 0);
        scalar::matvec_t_i8(m, &qt, fused, &mut reference, 0);
        assert_eq!(fast, reference, "fused transposed");
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "reserved i2_s code 11")]
    fn test_fused_block_path_rejects_reserved_code() {
        let t = PackedTernary::from_packed(vec![0xFF; 32], 128, 1, 1.0).unwrap();
        let mut y = vec![0.0f32; 128];
        matvec_i8(t.as_matrix(), &[1], FusedScale::new(1.0, 1.0, 1), &mut y, 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "reserved i2_s code 11")]
    fn test_fused_t_block_path_rejects_reserved_code() {
        let t = PackedTernary::from_packed(vec![0xFF; 32], 128, 1, 1.0).unwrap();
        let mut y = [0.0f32; 1];
        matvec_t_i8(t.as_matrix(), &[1; 128], FusedScale::new(1.0, 1.0, 128), &mut y, 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "reserved i2_s code 11")]
    fn test_fused_unaligned_rejects_reserved_code() {
        let t = PackedTernary::from_packed(vec![0xFF; 32], 5, 1, 1.0).unwrap();
        let mut y = [0.0f32; 5];
        matvec_i8(t.as_matrix(), &[1], FusedScale::new(1.0, 1.0, 1), &mut y, 0);
    }

    #[test]
    fn test_forward_scale_applied_once() {
        // scale = inf: rows with a zero sum become NaN, exactly like the reference,
        // whether or not zero inputs are skipped
        let t = pattern(128, 2);
        let m = t.as_matrix();
        let x = [0.0f32, 1.0];
        let mut reference = vec![0.0f32; 128];
        scalar::matvec(m, &x, f32::INFINITY, &mut reference, 0);
        for skip in [true, false] {
            let mut fast = vec![0.0f32; 128];
            matvec(m, &x, f32::INFINITY, &mut fast, 0, skip);
            for (r, (a, b)) in fast.iter().zip(&reference).enumerate() {
                assert!(a == b || (a.is_nan() && b.is_nan()), "skip {skip} row {r}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_fused_forward_many_columns() {
        // 128 x 3000, i64 block accumulators against the reference
        let t = pattern(128, 3000);
        let q: Vec<i8> = (0..3000).map(|i| if i % 2 == 0 { 127 } else { -128 }).collect();
        let fused = FusedScale::new(1.0, 1.0, 7);
        let mut fast = vec![0.0f32; 128];
        let mut reference = vec![0.0f32; 128];
        matvec_i8(t.as_matrix(), &q, fused, &mut fast, 0);
        scalar::matvec_i8(t.as_matrix(), &q, fused, &mut reference, 0);
        assert_eq!(fast, reference);
    }
}
