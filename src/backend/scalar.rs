//! Scalar reference kernels
//!
//! Per-element [`locate`](crate::codec::locate) decode, no layout assumptions.
//! Every other backend is tested against these.
//!
//! Summation order: one running `f32` sum per output, indices ascending,
//! scale applied once at the end.

use super::{debug_check_code, FusedScale};
use crate::codec::{PackedMatrix, CODE_WEIGHTS};

/// `dst[i] = scale · Σ_c W[row_start + i, c] · vec[c]`
pub(crate) fn matvec(m: PackedMatrix<'_>, vec: &[f32], scale: f32, dst: &mut [f32], row_start: usize) {
    for (i, out) in dst.iter_mut().enumerate() {
        let row = row_start + i;
        let mut sum = 0.0f32;
        for (col, &x) in vec.iter().enumerate() {
            sum += CODE_WEIGHTS[m.code_at(row, col) as usize] * x;
        }
        *out = sum * scale;
    }
}

/// `dst[j] = scale · Σ_r W[r, col_start + j] · vec[r]`
pub(crate) fn matvec_t(m: PackedMatrix<'_>, vec: &[f32], scale: f32, dst: &mut [f32], col_start: usize) {
    for (j, out) in dst.iter_mut().enumerate() {
        let col = col_start + j;
        let mut sum = 0.0f32;
        for (row, &x) in vec.iter().enumerate() {
            sum += CODE_WEIGHTS[m.code_at(row, col) as usize] * x;
        }
        *out = sum * scale;
    }
}

/// Fused forward: raw codes against int8 activations, corrected per row.
pub(crate) fn matvec_i8(m: PackedMatrix<'_>, qvec: &[i8], fused: FusedScale, dst: &mut [f32], row_start: usize) {
    for (i, out) in dst.iter_mut().enumerate() {
        let row = row_start + i;
        let mut dot = 0i64;
        for (col, &q) in qvec.iter().enumerate() {
            let code = m.code_at(row, col);
            debug_check_code(code);
            dot += i64::from(code) * i64::from(q);
        }
        *out = fused.finish(dot);
    }
}

/// Fused transposed: raw codes against int8 activations, corrected per column.
pub(crate) fn matvec_t_i8(m: PackedMatrix<'_>, qvec: &[i8], fused: FusedScale, dst: &mut [f32], col_start: usize) {
    for (j, out) in dst.iter_mut().enumerate() {
        let col = col_start + j;
        let mut dot = 0i64;
        for (row, &q) in qvec.iter().enumerate() {
            let code = m.code_at(row, col);
            debug_check_code(code);
            dot += i64::from(code) * i64::from(q);
        }
        *out = fused.finish(dot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PackedTernary;

    #[test]
    fn test_small_forward_and_transposed() {
        // W (2x3) = [[1, 0, 1], [-1, 1, 0]], column-major
        let t = PackedTernary::from_ternary(&[1, -1, 0, 1, 1, 0], 2, 3, 2.0).unwrap();
        let mut y = [f32::NAN; 2];
        matvec(t.as_matrix(), &[1.0, 2.0, 3.0], 2.0, &mut y, 0);
        assert_eq!(y, [8.0, 2.0], "W·x scaled by 2");

        let mut yt = [f32::NAN; 3];
        matvec_t(t.as_matrix(), &[1.0, 2.0], 2.0, &mut yt, 0);
        assert_eq!(yt, [-2.0, 4.0, 2.0], "Wᵀ·x scaled by 2");
    }

    #[test]
    fn test_window_offsets() {
        let t = PackedTernary::from_ternary(&[1, -1, 0, 1, 1, 0], 2, 3, 1.0).unwrap();
        let mut tail = [0.0f32; 1];
        matvec(t.as_matrix(), &[1.0, 2.0, 3.0], 1.0, &mut tail, 1);
        assert_eq!(tail, [1.0], "row 1 only");

        let mut cols = [0.0f32; 2];
        matvec_t(t.as_matrix(), &[1.0, 2.0], 1.0, &mut cols, 1);
        assert_eq!(cols, [2.0, 1.0], "columns 1..3");
    }

    #[test]
    fn test_reserved_code_reads_zero() {
        let t = PackedTernary::from_packed(vec![0xFF; 32], 4, 1, 1.0).unwrap();
        let mut y = [f32::NAN; 4];
        matvec(t.as_matrix(), &[5.0], 1.0, &mut y, 0);
        assert_eq!(y, [0.0; 4]);
    }

    #[test]
    fn test_fused_matches_float() {
        let t = PackedTernary::from_ternary(&[1, -1, 0, 1, 1, 0], 2, 3, 0.5).unwrap();
        let q = [3i8, -2, 7];
        let sum = q.iter().map(|&v| i32::from(v)).sum();
        let mut fused = [0.0f32; 2];
        matvec_i8(t.as_matrix(), &q, FusedScale::new(0.5, 0.25, sum), &mut fused, 0);

        let x: Vec<f32> = q.iter().map(|&v| f32::from(v)).collect();
        let mut float = [0.0f32; 2];
        matvec(t.as_matrix(), &x, 2.0, &mut float, 0);
        assert_eq!(fused, float, "fused forward equals float with scale ws/as");

        let q = [4i8, -9];
        let sum = -5;
        let mut fused = [0.0f32; 3];
        matvec_t_i8(t.as_matrix(), &q, FusedScale::new(1.0, 1.0, sum), &mut fused, 0);
        assert_eq!(fused, [13.0, -9.0, 4.0], "fused transposed");
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "reserved i2_s code 11")]
    fn test_fused_rejects_reserved_code() {
        let t = PackedTernary::from_packed(vec![0xFF; 32], 4, 1, 1.0).unwrap();
        let mut y = [0.0f32; 4];
        matvec_i8(t.as_matrix(), &[1], FusedScale::new(1.0, 1.0, 1), &mut y, 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "reserved i2_s code 11")]
    fn test_fused_t_rejects_reserved_code() {
        let t = PackedTernary::from_packed(vec![0xFF; 32], 4, 1, 1.0).unwrap();
        let mut y = [0.0f32; 1];
        matvec_t_i8(t.as_matrix(), &[1, 2, 3, 4], FusedScale::new(1.0, 1.0, 10), &mut y, 0);
    }
}
