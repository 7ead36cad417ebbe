use ndarray::{Array2, ArrayView, ArrayView2, Axis, Dimension, Zip};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Cholesky, Determinant, Inverse, UPLO};

/// Direct inverse of a square matrix.
pub fn invert(matrix: ArrayView2<f64>) -> Result<Array2<f64>, LinalgError> {
    matrix.inv()
}

/// Log-determinant of a matrix expected to be positive definite.
///
/// Returns `-inf` when the determinant is not strictly positive or when the
/// factorization fails, so that scores of infeasible points compare below
/// every feasible one.
pub fn fast_log_det(matrix: ArrayView2<f64>) -> f64 {
    match matrix.sln_det() {
        Ok((sign, log_abs)) if sign > 0.0 && log_abs.is_finite() => log_abs,
        _ => f64::NEG_INFINITY,
    }
}

/// Largest absolute entry of `matrix - matrix^T`.
pub fn symmetry_defect(matrix: ArrayView2<f64>) -> f64 {
    max_abs_difference(matrix, matrix.t())
}

/// Symmetric (within `tolerance`) and positive definite.
pub fn is_spd(matrix: ArrayView2<f64>, tolerance: f64) -> bool {
    if matrix.nrows() != matrix.ncols() || symmetry_defect(matrix) > tolerance {
        return false;
    }
    matrix.cholesky(UPLO::Lower).is_ok()
}

/// `full` with row and column `excluded` removed.
pub fn principal_submatrix(full: ArrayView2<f64>, excluded: usize) -> Array2<f64> {
    let keep: Vec<usize> = (0..full.nrows()).filter(|&i| i != excluded).collect();
    full.select(Axis(0), &keep).select(Axis(1), &keep)
}

pub fn max_abs_difference<D: Dimension>(a: ArrayView<f64, D>, b: ArrayView<f64, D>) -> f64 {
    Zip::from(&a)
        .and(&b)
        .fold(0.0_f64, |acc, &x, &y| acc.max((x - y).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn log_det_of_diagonal_matrix() {
        let m = array![[2.0, 0.0], [0.0, 3.0]];
        assert_abs_diff_eq!(fast_log_det(m.view()), 6.0_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn log_det_of_indefinite_matrix_is_negative_infinity() {
        let m = array![[0.0, 1.0], [1.0, 0.0]];
        assert_eq!(fast_log_det(m.view()), f64::NEG_INFINITY);
    }

    #[test]
    fn submatrix_drops_requested_row_and_column() {
        let m = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]];
        assert_eq!(principal_submatrix(m.view(), 1), array![[1.0, 3.0], [7.0, 9.0]]);
        assert_eq!(principal_submatrix(m.view(), 0), array![[5.0, 6.0], [8.0, 9.0]]);
    }

    #[test]
    fn spd_detection() {
        assert!(is_spd(array![[2.0, 0.5], [0.5, 1.0]].view(), 1e-12));
        assert!(!is_spd(array![[1.0, 2.0], [2.0, 1.0]].view(), 1e-12));
        assert!(!is_spd(array![[2.0, 0.5], [0.4, 1.0]].view(), 1e-12));
    }
}
