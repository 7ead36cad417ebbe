//! Solves along a sequence of regularization values, each fit warm-started
//! from the previous one.

use crate::covariance::{CovarianceOptions, empirical_covariances, normalize_weights};
use crate::estimate::EstimationError;
use crate::probe::{SolverProbe, reborrow};
use crate::scores::log_likelihood;
use crate::solver::{SolverOptions, solve};
use ndarray::{Array2, Array3};

#[derive(Debug, Clone)]
pub struct PathResult {
    /// One precision stack per alpha, in the order the alphas were given.
    pub precisions: Vec<Array3<f64>>,
    /// Log-likelihood of every precision stack on the test subjects, when
    /// test subjects were supplied.
    pub scores: Option<Vec<f64>>,
}

/// Estimates group-sparse precisions for every value in `alphas`.
///
/// Covariances of both training and test subjects are standardized. Alphas
/// are best given in decreasing order, where warm starts help the most. The
/// probe, if any, is shared by every fit of the path.
pub fn group_sparse_covariance_path(
    train_subjects: &[Array2<f64>],
    alphas: &[f64],
    test_subjects: Option<&[Array2<f64>]>,
    options: &SolverOptions,
    precisions_init: Option<Array3<f64>>,
    mut probe: Option<&mut dyn SolverProbe>,
) -> Result<PathResult, EstimationError> {
    if alphas.is_empty() {
        return Err(EstimationError::EmptyAlphaGrid);
    }

    let train = empirical_covariances(train_subjects, CovarianceOptions::standardized())?;
    let test = test_subjects
        .map(|subjects| empirical_covariances(subjects, CovarianceOptions::standardized()))
        .transpose()?;
    if let Some(test) = &test {
        if test.covariances.shape() != train.covariances.shape() {
            return Err(EstimationError::InvalidSubjects(format!(
                "test covariances have shape {:?} but training covariances have shape {:?}",
                test.covariances.shape(),
                train.covariances.shape()
            )));
        }
    }
    // Test scores reuse the training weights.
    let weights = normalize_weights(train.n_samples.view())?;

    let mut precisions = Vec::with_capacity(alphas.len());
    let mut scores = test.as_ref().map(|_| Vec::with_capacity(alphas.len()));
    let mut init = precisions_init;

    for &alpha in alphas {
        let outcome = solve(
            train.covariances.view(),
            train.n_samples.view(),
            alpha,
            options,
            init.take(),
            reborrow(&mut probe),
        )?;
        log::debug!(
            "alpha = {:.4e}: {:?} after {} sweep(s)",
            alpha,
            outcome.stop,
            outcome.iterations
        );

        if let (Some(test), Some(scores)) = (&test, scores.as_mut()) {
            scores.push(log_likelihood(
                outcome.precisions.view(),
                weights.view(),
                test.covariances.view(),
            ));
        }

        init = Some(outcome.precisions.clone());
        precisions.push(outcome.precisions);
    }

    Ok(PathResult { precisions, scores })
}
