//! # Empirical Covariance Stacks
//!
//! Converts a group of per-subject signal matrices (`[n_samples, n_features]`)
//! into a stack of symmetric covariance matrices laid out as
//! `[n_features, n_features, n_subjects]`, along with the raw sample count of
//! every subject. The stack is the only view of the data the solver ever sees.

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use thiserror::Error;

/// Largest tolerated distance between a covariance diagonal entry and 1.0
/// before the input is reported as non-standardized.
const DIAGONAL_NORMALIZATION_TOLERANCE: f64 = 0.1;

/// Errors raised while building covariance stacks or sample weights.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CovarianceError {
    #[error("At least one subject is required to compute covariance matrices.")]
    NoSubjects,

    #[error("All subjects must have the same number of features. Found feature counts: {0:?}")]
    FeatureCountMismatch(Vec<usize>),

    #[error("Subject {subject} contains no samples.")]
    EmptySubject { subject: usize },

    #[error("Subject {subject} has a sample count of {count}; counts must be positive and finite.")]
    InvalidSampleCount { subject: usize, count: f64 },
}

/// How the raw signals are treated before their covariance is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CovarianceOptions {
    /// Skip mean removal; signals are assumed to be centered already.
    pub assume_centered: bool,
    /// Scale every column to unit variance first (yields correlation matrices).
    pub standardize: bool,
}

impl CovarianceOptions {
    pub fn standardized() -> Self {
        Self {
            assume_centered: false,
            standardize: true,
        }
    }
}

/// A covariance stack together with the number of samples behind each slice.
#[derive(Debug, Clone)]
pub struct EmpiricalCovariances {
    /// Shape `[n_features, n_features, n_subjects]`.
    pub covariances: Array3<f64>,
    /// Raw sample count per subject. Not normalized.
    pub n_samples: Array1<f64>,
}

impl EmpiricalCovariances {
    pub fn n_features(&self) -> usize {
        self.covariances.shape()[0]
    }

    pub fn n_subjects(&self) -> usize {
        self.covariances.shape()[2]
    }
}

/// Computes the empirical covariance matrix of every subject.
///
/// Each matrix is symmetrized by averaging it with its transpose, which keeps
/// floating-point asymmetry out of the solver.
pub fn empirical_covariances(
    subjects: &[Array2<f64>],
    options: CovarianceOptions,
) -> Result<EmpiricalCovariances, CovarianceError> {
    let first = subjects.first().ok_or(CovarianceError::NoSubjects)?;
    let n_features = first.ncols();

    let feature_counts: Vec<usize> = subjects.iter().map(|subject| subject.ncols()).collect();
    if feature_counts.iter().any(|&count| count != n_features) {
        return Err(CovarianceError::FeatureCountMismatch(feature_counts));
    }

    let mut covariances = Array3::zeros((n_features, n_features, subjects.len()));
    for (k, subject) in subjects.iter().enumerate() {
        if subject.nrows() == 0 {
            return Err(CovarianceError::EmptySubject { subject: k });
        }

        let covariance = if options.standardize {
            let scaled = standardize_columns(subject.view(), k);
            subject_covariance(scaled.view(), options.assume_centered)
        } else {
            subject_covariance(subject.view(), options.assume_centered)
        };

        let mut slice = covariances.index_axis_mut(Axis(2), k);
        slice.assign(&covariance);
        slice += &covariance.t();
        slice *= 0.5;
    }

    let n_samples = subjects
        .iter()
        .map(|subject| subject.nrows() as f64)
        .collect::<Array1<f64>>();

    Ok(EmpiricalCovariances {
        covariances,
        n_samples,
    })
}

/// Maximum-likelihood covariance (divides by `n_samples`, not `n_samples - 1`).
fn subject_covariance(signals: ArrayView2<f64>, assume_centered: bool) -> Array2<f64> {
    let n = signals.nrows() as f64;
    if assume_centered {
        return signals.t().dot(&signals) / n;
    }
    let mean = signals.sum_axis(Axis(0)) / n;
    let centered = &signals - &mean;
    centered.t().dot(&centered) / n
}

fn standardize_columns(signals: ArrayView2<f64>, subject: usize) -> Array2<f64> {
    let mut deviations = signals.std_axis(Axis(0), 0.0);
    let mut constant_columns = 0usize;
    deviations.mapv_inplace(|sd| {
        if sd > 0.0 && sd.is_finite() {
            sd
        } else {
            constant_columns += 1;
            1.0
        }
    });
    if constant_columns > 0 {
        log::warn!(
            "Subject {} has {} constant signal(s); they are left unscaled during standardization.",
            subject,
            constant_columns
        );
    }
    &signals / &deviations
}

/// Rescales sample counts so they sum to one.
///
/// The solver's per-feature update is only numerically stable with normalized
/// weights, so this is recomputed on every solver call.
pub fn normalize_weights(n_samples: ArrayView1<f64>) -> Result<Array1<f64>, CovarianceError> {
    if n_samples.is_empty() {
        return Err(CovarianceError::NoSubjects);
    }
    if let Some((subject, &count)) = n_samples
        .iter()
        .enumerate()
        .find(|&(_, &count)| !(count.is_finite() && count > 0.0))
    {
        return Err(CovarianceError::InvalidSampleCount { subject, count });
    }
    let total = n_samples.sum();
    Ok(n_samples.mapv(|count| count / total))
}

/// Returns `false` (after logging a warning) when any covariance diagonal
/// entry is further than 0.1 from one.
pub fn check_diagonal_normalization(covariances: ArrayView3<f64>) -> bool {
    let normalized = covariances.axis_iter(Axis(2)).all(|slice| {
        slice
            .diag()
            .iter()
            .all(|&value| (value - 1.0).abs() <= DIAGONAL_NORMALIZATION_TOLERANCE)
    });
    if !normalized {
        log::warn!(
            "Input signals do not all have unit variance. This can lead to numerical instability."
        );
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn two_subjects() -> Vec<Array2<f64>> {
        vec![
            array![[1.0, 2.0, 0.5], [2.0, 1.0, 1.5], [3.0, 4.0, -0.5], [0.0, 1.0, 2.5]],
            array![[0.5, -1.0, 2.0], [1.5, 0.0, 1.0], [-0.5, 2.0, 0.0]],
        ]
    }

    #[test]
    fn covariance_matches_manual_computation() {
        let subjects = two_subjects();
        let result = empirical_covariances(&subjects, CovarianceOptions::default()).unwrap();
        assert_eq!(result.covariances.shape(), &[3, 3, 2]);
        assert_eq!(result.n_samples, array![4.0, 3.0]);

        let x = &subjects[0];
        let n = x.nrows() as f64;
        for i in 0..3 {
            for j in 0..3 {
                let mean_i = x.column(i).sum() / n;
                let mean_j = x.column(j).sum() / n;
                let expected = x
                    .column(i)
                    .iter()
                    .zip(x.column(j).iter())
                    .map(|(a, b)| (a - mean_i) * (b - mean_j))
                    .sum::<f64>()
                    / n;
                assert_abs_diff_eq!(result.covariances[[i, j, 0]], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn covariance_slices_are_exactly_symmetric() {
        let result =
            empirical_covariances(&two_subjects(), CovarianceOptions::default()).unwrap();
        for k in 0..result.n_subjects() {
            let slice = result.covariances.index_axis(Axis(2), k);
            for i in 0..3 {
                for j in 0..3 {
                    assert_eq!(slice[[i, j]], slice[[j, i]]);
                }
            }
        }
    }

    #[test]
    fn standardization_yields_unit_diagonal() {
        let result =
            empirical_covariances(&two_subjects(), CovarianceOptions::standardized()).unwrap();
        for k in 0..result.n_subjects() {
            for i in 0..result.n_features() {
                assert_abs_diff_eq!(result.covariances[[i, i, k]], 1.0, epsilon = 1e-12);
            }
        }
        assert!(check_diagonal_normalization(result.covariances.view()));
    }

    #[test]
    fn assume_centered_skips_mean_removal() {
        let subjects = vec![array![[1.0, 1.0], [1.0, 1.0]]];
        let options = CovarianceOptions {
            assume_centered: true,
            standardize: false,
        };
        let result = empirical_covariances(&subjects, options).unwrap();
        assert_abs_diff_eq!(result.covariances[[0, 1, 0]], 1.0, epsilon = 1e-12);

        let centered = empirical_covariances(&subjects, CovarianceOptions::default()).unwrap();
        assert_abs_diff_eq!(centered.covariances[[0, 1, 0]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn mismatched_feature_counts_are_rejected() {
        let subjects = vec![Array2::zeros((4, 3)), Array2::zeros((4, 2))];
        let err = empirical_covariances(&subjects, CovarianceOptions::default()).unwrap_err();
        assert_eq!(err, CovarianceError::FeatureCountMismatch(vec![3, 2]));
    }

    #[test]
    fn empty_subject_list_is_rejected() {
        let err = empirical_covariances(&[], CovarianceOptions::default()).unwrap_err();
        assert_eq!(err, CovarianceError::NoSubjects);
    }

    #[test]
    fn weights_sum_to_one() {
        let weights = normalize_weights(array![10.0, 30.0].view()).unwrap();
        assert_abs_diff_eq!(weights[0], 0.25, epsilon = 1e-15);
        assert_abs_diff_eq!(weights[1], 0.75, epsilon = 1e-15);
        assert!(normalize_weights(array![0.0, 0.0].view()).is_err());
    }

    #[test]
    fn every_sample_count_must_be_positive_and_finite() {
        assert_eq!(
            normalize_weights(array![5.0, -1.0].view()).unwrap_err(),
            CovarianceError::InvalidSampleCount {
                subject: 1,
                count: -1.0
            }
        );
        assert_eq!(
            normalize_weights(array![0.0, 3.0].view()).unwrap_err(),
            CovarianceError::InvalidSampleCount {
                subject: 0,
                count: 0.0
            }
        );
        assert!(matches!(
            normalize_weights(array![4.0, f64::INFINITY].view()),
            Err(CovarianceError::InvalidSampleCount { subject: 1, .. })
        ));
        assert!(matches!(
            normalize_weights(array![f64::NAN].view()),
            Err(CovarianceError::InvalidSampleCount { subject: 0, .. })
        ));
        assert_eq!(
            normalize_weights(ndarray::Array1::<f64>::zeros(0).view()).unwrap_err(),
            CovarianceError::NoSubjects
        );
    }

    #[test]
    fn unnormalized_diagonal_is_reported() {
        let result =
            empirical_covariances(&two_subjects(), CovarianceOptions::default()).unwrap();
        assert!(!check_diagonal_normalization(result.covariances.view()));
    }
}
