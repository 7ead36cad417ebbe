//! # Likelihood, Objective and Duality Gap
//!
//! The solver minimizes
//!
//! ```text
//! alpha * sum_{i != j} ||omega[i, j, :]||_2  -  sum_k w_k (-tr(S_k omega_k) + logdet(omega_k))
//! ```
//!
//! where `w` are normalized sample weights. This module evaluates the two
//! terms, a dual-feasible lower bound on the optimum (yielding an upper bound
//! on the suboptimality of a candidate), and the critical alpha above which
//! the optimum is diagonal.

use crate::covariance::normalize_weights;
use crate::matrix::{fast_log_det, invert, is_spd, symmetry_defect};
use crate::solver::SolverError;
use ndarray::{Array2, Array3, ArrayView1, ArrayView3, Axis};

/// Cap on the identity mixing factor of the fallback dual point. Any value in
/// `(0, 1)` keeps the point feasible.
const FALLBACK_DUAL_MIXING_CAP: f64 = 0.05;
const DEBUG_SYMMETRY_TOLERANCE: f64 = 1e-7;
const DEBUG_SPD_TOLERANCE: f64 = 1e-7;

/// Scores of a precision stack against a covariance stack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupSparseScores {
    /// Weighted Gaussian log-likelihood, without the penalty.
    pub log_likelihood: f64,
    /// Penalized objective minimized by the solver.
    pub objective: f64,
    /// Upper bound on `objective - optimum`; vanishes at the optimum.
    pub duality_gap: Option<f64>,
}

/// Regularization values bracketing the sparsity of the solution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlphaBounds {
    /// Smallest alpha for which every precision matrix is diagonal.
    pub alpha_max: f64,
    /// Largest alpha for which no off-diagonal coefficient is zeroed.
    pub alpha_min: f64,
}

/// Euclidean norm across subjects of every `(i, j)` entry.
pub fn cross_subject_norms(stack: ArrayView3<f64>) -> Array2<f64> {
    stack.mapv(|v| v * v).sum_axis(Axis(2)).mapv(f64::sqrt)
}

/// `sum_k w_k * (-tr(S_k P_k) + logdet(P_k))`.
///
/// A precision slice with a non-positive determinant contributes `-inf`.
pub fn log_likelihood(
    precisions: ArrayView3<f64>,
    weights: ArrayView1<f64>,
    covariances: ArrayView3<f64>,
) -> f64 {
    precisions
        .axis_iter(Axis(2))
        .zip(covariances.axis_iter(Axis(2)))
        .zip(weights.iter())
        .map(|((precision, covariance), &weight)| {
            let trace = (&covariance * &precision).sum();
            weight * (fast_log_det(precision) - trace)
        })
        .sum()
}

/// Computes the log-likelihood, the objective and optionally the duality gap.
///
/// `weights` must sum to one. With `debug`, intermediate matrices are checked
/// for symmetry and positive definiteness.
pub fn group_sparse_scores(
    precisions: ArrayView3<f64>,
    weights: ArrayView1<f64>,
    covariances: ArrayView3<f64>,
    alpha: f64,
    duality_gap: bool,
    debug: bool,
) -> Result<GroupSparseScores, SolverError> {
    if precisions.shape() != covariances.shape() {
        return Err(SolverError::ShapeMismatch(format!(
            "precisions have shape {:?} but covariances have shape {:?}",
            precisions.shape(),
            covariances.shape()
        )));
    }
    if weights.len() != covariances.shape()[2] {
        return Err(SolverError::ShapeMismatch(format!(
            "{} weights for {} subjects",
            weights.len(),
            covariances.shape()[2]
        )));
    }

    let log_lik = log_likelihood(precisions, weights, covariances);
    let norms = cross_subject_norms(precisions);
    let off_diagonal_norm = norms.sum() - norms.diag().sum();
    let objective = alpha * off_diagonal_norm - log_lik;

    let duality_gap = if duality_gap {
        let dual = dual_objective(precisions, weights, covariances, alpha, debug)?;
        Some(objective - dual)
    } else {
        None
    };

    Ok(GroupSparseScores {
        log_likelihood: log_lik,
        objective,
        duality_gap,
    })
}

fn dual_objective(
    precisions: ArrayView3<f64>,
    weights: ArrayView1<f64>,
    covariances: ArrayView3<f64>,
    alpha: f64,
    debug: bool,
) -> Result<f64, SolverError> {
    let n_features = covariances.shape()[0];
    let mut candidate = Array3::<f64>::zeros(covariances.raw_dim());

    for (k, ((precision, covariance), &weight)) in precisions
        .axis_iter(Axis(2))
        .zip(covariances.axis_iter(Axis(2)))
        .zip(weights.iter())
        .enumerate()
    {
        let inverse = invert(precision)?;
        if debug && !is_spd(inverse.view(), DEBUG_SPD_TOLERANCE) {
            return Err(SolverError::DebugCheckFailed(format!(
                "inverse of precision matrix {k} is not symmetric positive definite"
            )));
        }
        let mut slice = candidate.index_axis_mut(Axis(2), k);
        slice.assign(&((&inverse - &covariance) * weight));
        if debug && symmetry_defect(slice.view()) > DEBUG_SYMMETRY_TOLERANCE {
            return Err(SolverError::DebugCheckFailed(format!(
                "dual candidate for subject {k} is not symmetric"
            )));
        }
    }

    // Projection onto the feasible set: every cross-subject norm at most
    // alpha, zero diagonal. The zero diagonal keeps the gap non-negative.
    let norms = cross_subject_norms(candidate.view());
    for ((i, j), &norm) in norms.indexed_iter() {
        if i == j {
            candidate.slice_mut(ndarray::s![i, j, ..]).fill(0.0);
        } else if norm > alpha {
            let scale = alpha / norm;
            candidate
                .slice_mut(ndarray::s![i, j, ..])
                .mapv_inplace(|v| v * scale);
        }
    }

    let mut dual = 0.0;
    for ((covariance, feasible), &weight) in covariances
        .axis_iter(Axis(2))
        .zip(candidate.axis_iter(Axis(2)))
        .zip(weights.iter())
    {
        let shifted = &covariance + &(&feasible / weight);
        dual += weight * (n_features as f64 + fast_log_det(shifted.view()));
    }

    if dual.is_finite() {
        return Ok(dual);
    }

    // Some shifted covariance was not positive definite. Fall back to a
    // point mixed with the identity, which is always feasible; the bound is
    // looser but finite.
    log::debug!("Dual point is infeasible; falling back to an identity-mixed dual point.");
    for (k, (covariance, &weight)) in covariances
        .axis_iter(Axis(2))
        .zip(weights.iter())
        .enumerate()
    {
        let mut slice = candidate.index_axis_mut(Axis(2), k);
        slice.assign(&(&covariance * -weight));
        slice.diag_mut().fill(0.0);
    }
    let largest_norm = cross_subject_norms(candidate.view())
        .iter()
        .fold(0.0_f64, |acc, &v| acc.max(v));
    let gamma = (alpha / largest_norm).min(FALLBACK_DUAL_MIXING_CAP);
    let identity = Array2::<f64>::eye(n_features);

    let mut fallback = 0.0;
    for (covariance, &weight) in covariances.axis_iter(Axis(2)).zip(weights.iter()) {
        let mixed = &covariance * (1.0 - gamma) + &identity * gamma;
        fallback += weight * (n_features as f64 + fast_log_det(mixed.view()));
    }
    Ok(fallback)
}

/// Critical regularization values of a covariance stack.
///
/// Above `alpha_max` every precision matrix returned by the solver is
/// diagonal; below `alpha_min` none of the off-diagonal coefficients is
/// zeroed. `alpha_min` is 0 when every off-diagonal covariance vanishes.
/// `n_samples` can have an arbitrary sum.
pub fn compute_alpha_max(
    covariances: ArrayView3<f64>,
    n_samples: ArrayView1<f64>,
) -> Result<AlphaBounds, SolverError> {
    if n_samples.len() != covariances.shape()[2] {
        return Err(SolverError::ShapeMismatch(format!(
            "{} sample counts for {} subjects",
            n_samples.len(),
            covariances.shape()[2]
        )));
    }
    let weights = normalize_weights(n_samples)?;

    let mut scaled = covariances.to_owned();
    for (mut slice, &weight) in scaled.axis_iter_mut(Axis(2)).zip(weights.iter()) {
        slice *= weight;
        slice.diag_mut().fill(0.0);
    }

    let norms = cross_subject_norms(scaled.view());
    let alpha_max = norms.iter().fold(0.0_f64, |acc, &v| acc.max(v));
    let alpha_min = norms
        .iter()
        .filter(|&&v| v > 0.0)
        .fold(f64::INFINITY, |acc, &v| acc.min(v));

    Ok(AlphaBounds {
        alpha_max,
        alpha_min: if alpha_min.is_finite() { alpha_min } else { 0.0 },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    fn stack(slices: &[Array2<f64>]) -> Array3<f64> {
        let n = slices[0].nrows();
        let mut out = Array3::zeros((n, n, slices.len()));
        for (k, slice) in slices.iter().enumerate() {
            out.index_axis_mut(Axis(2), k).assign(slice);
        }
        out
    }

    #[test]
    fn log_likelihood_of_known_matrices() {
        let covariances = stack(&[array![[2.0, 0.5], [0.5, 1.0]]]);
        let precisions = stack(&[array![[1.0, 0.0], [0.0, 2.0]]]);
        let weights = Array1::from_elem(1, 1.0);
        let expected = -(2.0 + 2.0) + 2.0_f64.ln();
        assert_abs_diff_eq!(
            log_likelihood(precisions.view(), weights.view(), covariances.view()),
            expected,
            epsilon = 1e-12
        );
    }

    #[test]
    fn objective_adds_off_diagonal_group_norm() {
        let covariances = stack(&[Array2::eye(2), Array2::eye(2)]);
        let precisions = stack(&[
            array![[1.0, 0.3], [0.3, 1.0]],
            array![[1.0, 0.4], [0.4, 1.0]],
        ]);
        let weights = array![0.5, 0.5];
        let scores = group_sparse_scores(
            precisions.view(),
            weights.view(),
            covariances.view(),
            2.0,
            false,
            false,
        )
        .unwrap();
        // Both off-diagonal entries have a cross-subject norm of 0.5.
        assert_abs_diff_eq!(scores.objective, 2.0 * 1.0 - scores.log_likelihood, epsilon = 1e-12);
        assert!(scores.duality_gap.is_none());
    }

    #[test]
    fn duality_gap_vanishes_at_unpenalized_optimum() {
        let covariance = array![[1.0, 0.2, 0.1], [0.2, 1.0, 0.3], [0.1, 0.3, 1.0]];
        let precision = invert(covariance.view()).unwrap();
        let covariances = stack(&[covariance]);
        let precisions = stack(&[precision]);
        let weights = Array1::from_elem(1, 1.0);
        let scores = group_sparse_scores(
            precisions.view(),
            weights.view(),
            covariances.view(),
            0.0,
            true,
            true,
        )
        .unwrap();
        assert_abs_diff_eq!(scores.duality_gap.unwrap(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn duality_gap_is_positive_away_from_optimum() {
        let covariances = stack(&[array![[1.0, 0.6], [0.6, 1.0]]]);
        let precisions = stack(&[Array2::eye(2)]);
        let weights = Array1::from_elem(1, 1.0);
        let scores = group_sparse_scores(
            precisions.view(),
            weights.view(),
            covariances.view(),
            0.1,
            true,
            false,
        )
        .unwrap();
        assert!(scores.duality_gap.unwrap() > 0.0);
    }

    #[test]
    fn alpha_bounds_follow_weighted_off_diagonal_norms() {
        let covariances = stack(&[
            array![[1.0, 0.5, 0.0], [0.5, 1.0, 0.1], [0.0, 0.1, 1.0]],
            array![[1.0, 0.5, 0.0], [0.5, 1.0, 0.1], [0.0, 0.1, 1.0]],
        ]);
        let bounds = compute_alpha_max(covariances.view(), array![10.0, 10.0].view()).unwrap();
        let norm = |v: f64| (2.0 * (0.5 * v) * (0.5 * v)).sqrt();
        assert_abs_diff_eq!(bounds.alpha_max, norm(0.5), epsilon = 1e-12);
        assert_abs_diff_eq!(bounds.alpha_min, norm(0.1), epsilon = 1e-12);
    }

    #[test]
    fn alpha_min_is_zero_for_diagonal_covariances() {
        let covariances = stack(&[Array2::eye(3)]);
        let bounds = compute_alpha_max(covariances.view(), array![5.0].view()).unwrap();
        assert_eq!(bounds.alpha_max, 0.0);
        assert_eq!(bounds.alpha_min, 0.0);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let covariances = stack(&[Array2::eye(2)]);
        let precisions = stack(&[Array2::eye(2), Array2::eye(2)]);
        let weights = Array1::from_elem(1, 1.0);
        assert!(
            group_sparse_scores(
                precisions.view(),
                weights.view(),
                covariances.view(),
                0.1,
                false,
                false
            )
            .is_err()
        );
    }
}
