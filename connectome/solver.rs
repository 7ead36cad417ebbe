//! # Group-Sparse Block Coordinate Descent
//!
//! Minimizes the group-lasso penalized negative log-likelihood of a stack of
//! precision matrices (see [`crate::scores`]) following Honorio & Samaras,
//! "Multi-Task Learning of Gaussian Graphical Models", ICML 2010.
//!
//! One sweep visits every feature `p`. For each, the off-diagonal column
//! `omega[:, p, k]` of every subject is optimized one coordinate at a time
//! while the rest of the matrix stays fixed. The coordinate problem couples
//! subjects only through the group penalty and reduces to a scalar equation
//! in a Lagrange-like multiplier `gamma`, solved by Newton-Raphson.
//!
//! The diagonal entry is then recovered in closed form from the inverse of the
//! submatrix without feature `p`, which [`SubmatrixWorkspace`] keeps current
//! as `p` advances.

use crate::covariance::{CovarianceError, check_diagonal_normalization, normalize_weights};
use crate::matrix::{is_spd, max_abs_difference, symmetry_defect};
use crate::probe::{ProbeDecision, ProbeState, SolverProbe};
use crate::submatrix::SubmatrixWorkspace;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView3, Axis};
use ndarray_linalg::error::LinalgError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const NEWTON_MAX_STEPS: usize = 100;
const NEWTON_STEP_TOLERANCE: f64 = 1.5e-8;
/// A final Newton step larger than this is reported as non-convergence.
const NEWTON_DIVERGENCE_THRESHOLD: f64 = 0.1;
const DEBUG_SPD_TOLERANCE: f64 = 1e-10;
/// Largest asymmetry accepted in a caller-supplied starting point, relative
/// to its largest entry.
const INIT_SYMMETRY_TOLERANCE: f64 = 1e-8;

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Regularization parameter alpha must be a non-negative finite number. You provided: {0}")]
    InvalidAlpha(f64),

    #[error("Tolerance must be a non-negative finite number. You provided: {0}")]
    InvalidTolerance(f64),

    #[error("The maximum number of iterations must be at least 1.")]
    InvalidMaxIter,

    #[error("At least 2 features are required to estimate a precision matrix, found {0}.")]
    TooFewFeatures(usize),

    #[error("Array shapes are inconsistent: {0}")]
    ShapeMismatch(String),

    #[error(transparent)]
    Covariance(#[from] CovarianceError),

    #[error("The precision submatrix of subject {subject} could not be inverted: {source}")]
    SingularSubmatrix { subject: usize, source: LinalgError },

    #[error("The excluded feature can only advance by one, requested {from} -> {to}.")]
    InvalidSlide { from: usize, to: usize },

    #[error("A linear algebra operation failed: {0}")]
    Linalg(#[from] LinalgError),

    #[error(
        "The initial precision matrix of subject {subject} is not symmetric (largest asymmetry {defect:.3e})."
    )]
    AsymmetricInitialPrecision { subject: usize, defect: f64 },

    #[error("The variance of feature {feature} in subject {subject} is not strictly positive.")]
    NonPositiveVariance { feature: usize, subject: usize },

    #[error("Internal consistency check failed: {0}")]
    DebugCheckFailed(String),
}

/// Iteration control for one solver invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    /// Maximum number of full sweeps over the features.
    pub max_iter: usize,
    /// Stop once the largest absolute change over a sweep falls below this.
    /// `None` runs exactly `max_iter` sweeps (unless a probe stops earlier).
    pub tol: Option<f64>,
    /// Run internal consistency checks after every step. Slow.
    pub debug: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iter: 50,
            tol: Some(1e-3),
            debug: false,
        }
    }
}

impl SolverOptions {
    pub fn validate(&self) -> Result<(), SolverError> {
        if self.max_iter == 0 {
            return Err(SolverError::InvalidMaxIter);
        }
        if let Some(tol) = self.tol {
            if !(tol.is_finite() && tol >= 0.0) {
                return Err(SolverError::InvalidTolerance(tol));
            }
        }
        Ok(())
    }
}

/// Why the sweep loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    ToleranceReached,
    ProbeInterrupted,
    MaxIterationsReached,
}

#[derive(Debug, Clone)]
pub struct SolverOutcome {
    /// Shape `[n_features, n_features, n_subjects]`.
    pub precisions: Array3<f64>,
    pub stop: StopReason,
    /// Number of completed sweeps.
    pub iterations: usize,
    /// Largest absolute change over the last sweep whose variation was
    /// measured. `None` if a probe stopped the first sweep.
    pub last_variation: Option<f64>,
}

pub fn check_alpha(alpha: f64) -> Result<(), SolverError> {
    if alpha.is_finite() && alpha >= 0.0 {
        Ok(())
    } else {
        Err(SolverError::InvalidAlpha(alpha))
    }
}

/// Estimates group-sparse precision matrices from a covariance stack.
///
/// `covariances` has shape `[n_features, n_features, n_subjects]` and should
/// have a unit diagonal; `n_samples` holds one positive count per subject
/// with an arbitrary sum. `precisions_init`, when given, is used as the
/// starting point and should be symmetric positive definite. Symmetry is
/// always checked on entry. Positive definiteness is only verified with
/// `options.debug`; otherwise an indefinite start either fails to invert a
/// submatrix (`SingularSubmatrix`) or yields precisions that are not
/// positive definite.
///
/// The probe, if any, is called once before the first sweep (its decision is
/// ignored) and after every sweep.
pub fn solve(
    covariances: ArrayView3<f64>,
    n_samples: ArrayView1<f64>,
    alpha: f64,
    options: &SolverOptions,
    precisions_init: Option<Array3<f64>>,
    mut probe: Option<&mut dyn SolverProbe>,
) -> Result<SolverOutcome, SolverError> {
    check_alpha(alpha)?;
    options.validate()?;

    let shape = covariances.shape();
    let (n_features, n_subjects) = (shape[0], shape[2]);
    if shape[1] != n_features {
        return Err(SolverError::ShapeMismatch(format!(
            "covariance matrices must be square, found {}x{}",
            shape[0], shape[1]
        )));
    }
    if n_samples.len() != n_subjects {
        return Err(SolverError::ShapeMismatch(format!(
            "{} sample counts for {} subjects",
            n_samples.len(),
            n_subjects
        )));
    }
    if n_features < 2 {
        return Err(SolverError::TooFewFeatures(n_features));
    }

    let weights = normalize_weights(n_samples)?;
    check_diagonal_normalization(covariances);
    check_variances(covariances)?;

    let mut omega = initial_precisions(covariances, precisions_init)?;
    let mut workspace = SubmatrixWorkspace::initialize(omega.view(), options.debug)?;
    let mut descent = CoordinateDescent::new(covariances.view(), weights.view(), alpha, options.debug);
    let mut previous = omega.clone();

    if let Some(probe) = probe.as_deref_mut() {
        probe.inspect(&ProbeState {
            covariances: covariances.view(),
            weights: weights.view(),
            alpha,
            max_iter: options.max_iter,
            tol: options.tol,
            iteration: None,
            precisions: omega.view(),
            previous: None,
        });
    }

    let mut stop = StopReason::MaxIterationsReached;
    let mut iterations = 0;
    let mut last_variation = None;

    for iteration in 0..options.max_iter {
        log::debug!(
            "Sweep {} of {} (alpha = {:.4e}), last variation: {:?}",
            iteration + 1,
            options.max_iter,
            alpha,
            last_variation
        );
        previous.assign(&omega);

        for p in 0..n_features {
            if p > 0 {
                workspace.slide(omega.view(), p)?;
            } else if iteration > 0 {
                workspace.reset(omega.view())?;
            }
            descent.update_feature(&mut omega, &workspace, p)?;
        }
        iterations = iteration + 1;

        if let Some(probe) = probe.as_deref_mut() {
            let decision = probe.inspect(&ProbeState {
                covariances: covariances.view(),
                weights: weights.view(),
                alpha,
                max_iter: options.max_iter,
                tol: options.tol,
                iteration: Some(iteration),
                precisions: omega.view(),
                previous: Some(previous.view()),
            });
            if decision == ProbeDecision::Stop {
                log::debug!("Probe interrupted the solver after sweep {}.", iteration + 1);
                stop = StopReason::ProbeInterrupted;
                break;
            }
        }

        let variation = max_abs_difference(previous.view(), omega.view());
        last_variation = Some(variation);
        if let Some(tol) = options.tol {
            if variation < tol {
                log::debug!(
                    "Tolerance reached after sweep {} (variation {:.3e} < {:.3e}).",
                    iteration + 1,
                    variation,
                    tol
                );
                stop = StopReason::ToleranceReached;
                break;
            }
        }
    }

    if options.tol.is_some() && stop == StopReason::MaxIterationsReached {
        log::warn!(
            "Maximum number of iterations ({}) reached without getting to the requested tolerance level.",
            options.max_iter
        );
    }

    Ok(SolverOutcome {
        precisions: omega,
        stop,
        iterations,
        last_variation,
    })
}

fn check_variances(covariances: ArrayView3<f64>) -> Result<(), SolverError> {
    for (subject, slice) in covariances.axis_iter(Axis(2)).enumerate() {
        if let Some(feature) = slice
            .diag()
            .iter()
            .position(|&variance| !(variance > 0.0 && variance.is_finite()))
        {
            return Err(SolverError::NonPositiveVariance { feature, subject });
        }
    }
    Ok(())
}

/// Inverse of each covariance diagonal, or a copy of the supplied stack.
fn initial_precisions(
    covariances: ArrayView3<f64>,
    precisions_init: Option<Array3<f64>>,
) -> Result<Array3<f64>, SolverError> {
    match precisions_init {
        Some(init) => {
            if init.shape() != covariances.shape() {
                return Err(SolverError::ShapeMismatch(format!(
                    "initial precisions have shape {:?} but covariances have shape {:?}",
                    init.shape(),
                    covariances.shape()
                )));
            }
            for (subject, slice) in init.axis_iter(Axis(2)).enumerate() {
                let scale = slice.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
                let defect = symmetry_defect(slice);
                if !(defect <= INIT_SYMMETRY_TOLERANCE * scale) {
                    return Err(SolverError::AsymmetricInitialPrecision { subject, defect });
                }
            }
            Ok(init)
        }
        None => {
            let mut omega = Array3::zeros(covariances.raw_dim());
            for (mut slice, covariance) in omega
                .axis_iter_mut(Axis(2))
                .zip(covariances.axis_iter(Axis(2)))
            {
                slice.diag_mut().assign(&covariance.diag().mapv(|v| 1.0 / v));
            }
            Ok(omega)
        }
    }
}

/// Scratch buffers and fixed inputs of the per-feature update.
struct CoordinateDescent<'a> {
    covariances: ArrayView3<'a, f64>,
    weights: ArrayView1<'a, f64>,
    alpha: f64,
    debug: bool,
    /// `y[k, :]`: column `p` of `omega_k` without entry `p`.
    y: Array2<f64>,
    /// `u[k, :]`: column `p` of `cov_k` without entry `p`.
    u: Array2<f64>,
    c: Array1<f64>,
    q: Array1<f64>,
}

impl<'a> CoordinateDescent<'a> {
    fn new(
        covariances: ArrayView3<'a, f64>,
        weights: ArrayView1<'a, f64>,
        alpha: f64,
        debug: bool,
    ) -> Self {
        let n_features = covariances.shape()[0];
        let n_subjects = covariances.shape()[2];
        Self {
            covariances,
            weights,
            alpha,
            debug,
            y: Array2::zeros((n_subjects, n_features - 1)),
            u: Array2::zeros((n_subjects, n_features - 1)),
            c: Array1::zeros(n_subjects),
            q: Array1::zeros(n_subjects),
        }
    }

    /// Optimizes row and column `p` of every precision matrix. The workspace
    /// must currently exclude feature `p`.
    fn update_feature(
        &mut self,
        omega: &mut Array3<f64>,
        workspace: &SubmatrixWorkspace,
        p: usize,
    ) -> Result<(), SolverError> {
        let n_features = omega.shape()[0];
        let n_subjects = omega.shape()[2];
        let alpha2 = self.alpha * self.alpha;

        for k in 0..n_subjects {
            for (slot, j) in (0..n_features).filter(|&j| j != p).enumerate() {
                self.y[[k, slot]] = omega[[j, p, k]];
                self.u[[k, slot]] = self.covariances[[j, p, k]];
            }
        }

        for m in 0..n_features - 1 {
            for k in 0..n_subjects {
                let inverse = workspace.inverse(k);
                let cross: f64 = (0..n_features - 1)
                    .filter(|&j| j != m)
                    .map(|j| inverse[[j, m]] * self.y[[k, j]])
                    .sum();
                self.c[k] =
                    -self.weights[k] * (self.covariances[[p, p, k]] * cross + self.u[[k, m]]);
            }

            if self.c.dot(&self.c).sqrt() <= self.alpha {
                self.y.column_mut(m).fill(0.0);
                continue;
            }

            for k in 0..n_subjects {
                self.q[k] =
                    self.weights[k] * self.covariances[[p, p, k]] * workspace.inverse(k)[[m, m]];
            }
            if self.debug {
                if let Some(k) = self.q.iter().position(|&v| v <= 0.0) {
                    return Err(SolverError::DebugCheckFailed(format!(
                        "non-positive curvature {:.3e} for subject {k} at feature {p}, coordinate {m}",
                        self.q[k]
                    )));
                }
            }

            if self.alpha == 0.0 {
                // Limit of the penalized update as gamma grows without bound.
                for k in 0..n_subjects {
                    self.y[[k, m]] = self.c[k] / self.q[k];
                }
                continue;
            }

            let gamma = newton_multiplier(self.c.view(), self.q.view(), alpha2);
            if self.debug && gamma < 0.0 {
                return Err(SolverError::DebugCheckFailed(format!(
                    "negative multiplier {gamma:.3e} at feature {p}, coordinate {m}"
                )));
            }
            for k in 0..n_subjects {
                self.y[[k, m]] = gamma * self.c[k] / (1.0 + gamma * self.q[k]);
            }
        }

        for k in 0..n_subjects {
            for (slot, j) in (0..n_features).filter(|&j| j != p).enumerate() {
                omega[[j, p, k]] = self.y[[k, slot]];
                omega[[p, j, k]] = self.y[[k, slot]];
            }
            let y = self.y.row(k);
            omega[[p, p, k]] =
                1.0 / self.covariances[[p, p, k]] + y.dot(&workspace.inverse(k).dot(&y));

            if self.debug && !is_spd(omega.index_axis(Axis(2), k), DEBUG_SPD_TOLERANCE) {
                return Err(SolverError::DebugCheckFailed(format!(
                    "precision matrix of subject {k} is not symmetric positive definite after updating feature {p}"
                )));
            }
        }
        Ok(())
    }
}

/// Solves `alpha^2 = sum_k c_k^2 / (1 + gamma q_k)^2` for `gamma` by
/// Newton-Raphson started at zero.
fn newton_multiplier(c: ArrayView1<f64>, q: ArrayView1<f64>, alpha2: f64) -> f64 {
    let mut gamma = 0.0;
    let mut step = 0.0_f64;
    for _ in 0..NEWTON_MAX_STEPS {
        let mut value = 0.0;
        let mut derivative = 0.0;
        for (&ck, &qk) in c.iter().zip(q.iter()) {
            let cc = ck * ck;
            let a = 1.0 + gamma * qk;
            let a2 = a * a;
            value += cc / a2;
            derivative += 2.0 * cc * qk / (a2 * a);
        }
        if derivative == 0.0 {
            log::warn!("Newton-Raphson derivative was zero.");
            break;
        }
        step = -(alpha2 - value) / derivative;
        gamma += step;
        if step.abs() < NEWTON_STEP_TOLERANCE {
            break;
        }
    }
    if step.abs() > NEWTON_DIVERGENCE_THRESHOLD {
        log::warn!(
            "Newton-Raphson step did not converge. This may indicate a badly conditioned system."
        );
    }
    gamma
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::{CovarianceOptions, empirical_covariances};
    use crate::scores::compute_alpha_max;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn random_subjects(n_subjects: usize, n_samples: usize, n_features: usize) -> Vec<Array2<f64>> {
        let mut rng = StdRng::seed_from_u64(11);
        (0..n_subjects)
            .map(|_| {
                Array2::from_shape_fn((n_samples, n_features), |_| {
                    rng.sample::<f64, _>(StandardNormal)
                })
            })
            .collect()
    }

    fn standardized(subjects: &[Array2<f64>]) -> (Array3<f64>, Array1<f64>) {
        let result = empirical_covariances(subjects, CovarianceOptions::standardized()).unwrap();
        (result.covariances, result.n_samples)
    }

    #[test]
    fn newton_multiplier_solves_scalar_equation() {
        let c = array![1.0, -2.0, 0.5];
        let q = array![0.3, 0.7, 1.1];
        let alpha2 = 0.25;
        let gamma = newton_multiplier(c.view(), q.view(), alpha2);
        let residual: f64 = c
            .iter()
            .zip(q.iter())
            .map(|(&ck, &qk)| ck * ck / ((1.0 + gamma * qk) * (1.0 + gamma * qk)))
            .sum();
        assert!(gamma > 0.0);
        assert_abs_diff_eq!(residual, alpha2, epsilon = 1e-8);
    }

    #[test]
    fn identity_covariances_converge_immediately() {
        let mut covariances = Array3::zeros((3, 3, 2));
        for k in 0..2 {
            covariances
                .index_axis_mut(Axis(2), k)
                .assign(&Array2::eye(3));
        }
        let outcome = solve(
            covariances.view(),
            array![10.0, 20.0].view(),
            0.1,
            &SolverOptions::default(),
            None,
            None,
        )
        .unwrap();
        assert_eq!(outcome.stop, StopReason::ToleranceReached);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.last_variation, Some(0.0));
        assert_eq!(outcome.precisions, covariances);
    }

    #[test]
    fn alpha_above_alpha_max_yields_diagonal_precisions() {
        let subjects = random_subjects(3, 30, 5);
        let (covariances, n_samples) = standardized(&subjects);
        let bounds = compute_alpha_max(covariances.view(), n_samples.view()).unwrap();
        let outcome = solve(
            covariances.view(),
            n_samples.view(),
            bounds.alpha_max * 1.01,
            &SolverOptions::default(),
            None,
            None,
        )
        .unwrap();
        for ((i, j, k), &value) in outcome.precisions.indexed_iter() {
            if i == j {
                assert_abs_diff_eq!(value, 1.0 / covariances[[i, i, k]], epsilon = 1e-12);
            } else {
                assert_eq!(value, 0.0);
            }
        }
    }

    #[test]
    fn sparsity_pattern_is_shared_across_subjects() {
        let subjects = random_subjects(4, 40, 6);
        let (covariances, n_samples) = standardized(&subjects);
        let bounds = compute_alpha_max(covariances.view(), n_samples.view()).unwrap();
        let alpha = 0.5 * (bounds.alpha_max + bounds.alpha_min);
        let options = SolverOptions {
            max_iter: 30,
            tol: Some(1e-6),
            debug: true,
        };
        let outcome = solve(covariances.view(), n_samples.view(), alpha, &options, None, None)
            .unwrap();
        let precisions = &outcome.precisions;
        let mut zeros = 0;
        for i in 0..6 {
            for j in 0..6 {
                let zero_count = (0..4).filter(|&k| precisions[[i, j, k]] == 0.0).count();
                assert!(zero_count == 0 || zero_count == 4, "entry ({i}, {j}) is partially zero");
                if zero_count == 4 {
                    zeros += 1;
                }
            }
        }
        assert!(zeros > 0);
    }

    #[test]
    fn probe_is_primed_then_called_after_every_sweep() {
        let subjects = random_subjects(2, 25, 4);
        let (covariances, n_samples) = standardized(&subjects);
        let mut seen = Vec::new();
        let mut probe = |state: &ProbeState<'_>| {
            seen.push((state.iteration, state.previous.is_some()));
            if state.iteration == Some(1) {
                ProbeDecision::Stop
            } else {
                ProbeDecision::Continue
            }
        };
        let options = SolverOptions {
            max_iter: 10,
            tol: None,
            debug: false,
        };
        let outcome = solve(
            covariances.view(),
            n_samples.view(),
            0.01,
            &options,
            None,
            Some(&mut probe),
        )
        .unwrap();
        assert_eq!(outcome.stop, StopReason::ProbeInterrupted);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(seen, vec![(None, false), (Some(0), true), (Some(1), true)]);
    }

    #[test]
    fn without_tolerance_every_sweep_runs() {
        let subjects = random_subjects(2, 25, 4);
        let (covariances, n_samples) = standardized(&subjects);
        let options = SolverOptions {
            max_iter: 3,
            tol: None,
            debug: false,
        };
        let outcome =
            solve(covariances.view(), n_samples.view(), 0.05, &options, None, None).unwrap();
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.stop, StopReason::MaxIterationsReached);
        assert!(outcome.last_variation.is_some());
    }

    #[test]
    fn warm_start_from_solution_converges_in_one_sweep() {
        let subjects = random_subjects(2, 60, 4);
        let (covariances, n_samples) = standardized(&subjects);
        let options = SolverOptions {
            max_iter: 200,
            tol: Some(1e-10),
            debug: false,
        };
        let cold = solve(covariances.view(), n_samples.view(), 0.05, &options, None, None).unwrap();
        let warm = solve(
            covariances.view(),
            n_samples.view(),
            0.05,
            &SolverOptions {
                tol: Some(1e-6),
                ..options
            },
            Some(cold.precisions.clone()),
            None,
        )
        .unwrap();
        assert_eq!(warm.iterations, 1);
        assert!(max_abs_difference(cold.precisions.view(), warm.precisions.view()) < 1e-6);
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        let covariances = Array3::from_shape_fn((2, 2, 1), |(i, j, _)| if i == j { 1.0 } else { 0.0 });
        let n_samples = array![5.0];
        let options = SolverOptions::default();
        assert!(matches!(
            solve(covariances.view(), n_samples.view(), -1.0, &options, None, None),
            Err(SolverError::InvalidAlpha(_))
        ));
        assert!(matches!(
            solve(covariances.view(), n_samples.view(), f64::NAN, &options, None, None),
            Err(SolverError::InvalidAlpha(_))
        ));
        let no_sweeps = SolverOptions {
            max_iter: 0,
            ..options
        };
        assert!(matches!(
            solve(covariances.view(), n_samples.view(), 0.1, &no_sweeps, None, None),
            Err(SolverError::InvalidMaxIter)
        ));
        assert!(matches!(
            solve(covariances.view(), array![1.0, 2.0].view(), 0.1, &options, None, None),
            Err(SolverError::ShapeMismatch(_))
        ));
        assert!(matches!(
            solve(
                covariances.view(),
                n_samples.view(),
                0.1,
                &options,
                Some(Array3::zeros((3, 3, 1))),
                None
            ),
            Err(SolverError::ShapeMismatch(_))
        ));
        let single = Array3::from_elem((1, 1, 1), 1.0);
        assert!(matches!(
            solve(single.view(), n_samples.view(), 0.1, &options, None, None),
            Err(SolverError::TooFewFeatures(1))
        ));
    }

    #[test]
    fn zero_variance_is_rejected() {
        let mut covariances = Array3::zeros((2, 2, 1));
        covariances[[0, 0, 0]] = 1.0;
        assert!(matches!(
            solve(
                covariances.view(),
                array![3.0].view(),
                0.1,
                &SolverOptions::default(),
                None,
                None
            ),
            Err(SolverError::NonPositiveVariance {
                feature: 1,
                subject: 0
            })
        ));
    }

    fn identity_stack(n_features: usize, n_subjects: usize) -> Array3<f64> {
        let mut stack = Array3::zeros((n_features, n_features, n_subjects));
        for k in 0..n_subjects {
            stack
                .index_axis_mut(Axis(2), k)
                .assign(&Array2::eye(n_features));
        }
        stack
    }

    #[test]
    fn indefinite_start_fails_the_debug_checks() {
        let covariances = identity_stack(3, 2);
        // Feature 0's submatrix [[1, 2], [2, 1]] inverts but is indefinite.
        let indefinite = array![[1.0, 0.0, 0.0], [0.0, 1.0, 2.0], [0.0, 2.0, 1.0]];
        let mut init = Array3::zeros((3, 3, 2));
        for k in 0..2 {
            init.index_axis_mut(Axis(2), k).assign(&indefinite);
        }
        let options = SolverOptions {
            max_iter: 5,
            tol: Some(1e-6),
            debug: true,
        };
        let result = solve(
            covariances.view(),
            array![10.0, 12.0].view(),
            0.1,
            &options,
            Some(init),
            None,
        );
        assert!(
            matches!(result, Err(SolverError::DebugCheckFailed(_))),
            "unexpected result {result:?}"
        );
    }

    #[test]
    fn asymmetric_start_is_rejected() {
        let covariances = identity_stack(3, 2);
        let mut init = identity_stack(3, 2);
        init[[0, 2, 1]] = 0.3;
        let result = solve(
            covariances.view(),
            array![10.0, 12.0].view(),
            0.1,
            &SolverOptions::default(),
            Some(init),
            None,
        );
        match result {
            Err(SolverError::AsymmetricInitialPrecision { subject, defect }) => {
                assert_eq!(subject, 1);
                assert_abs_diff_eq!(defect, 0.3, epsilon = 1e-15);
            }
            other => panic!("expected an asymmetric start error, got {other:?}"),
        }
    }

    #[test]
    fn symmetric_start_within_rounding_is_accepted() {
        let covariances = identity_stack(3, 1);
        let mut init = identity_stack(3, 1);
        init[[0, 1, 0]] = 1e-12;
        let outcome = solve(
            covariances.view(),
            array![10.0].view(),
            0.1,
            &SolverOptions::default(),
            Some(init),
            None,
        )
        .unwrap();
        assert_eq!(outcome.precisions.shape(), &[3, 3, 1]);
    }

    #[test]
    fn negative_sample_count_is_rejected() {
        let covariances = identity_stack(3, 2);
        assert!(matches!(
            solve(
                covariances.view(),
                array![5.0, -1.0].view(),
                0.1,
                &SolverOptions::default(),
                None,
                None
            ),
            Err(SolverError::Covariance(
                CovarianceError::InvalidSampleCount { subject: 1, .. }
            ))
        ));
        assert!(matches!(
            compute_alpha_max(covariances.view(), array![5.0, -1.0].view()),
            Err(SolverError::Covariance(
                CovarianceError::InvalidSampleCount { subject: 1, .. }
            ))
        ));
    }
}
