//! # Estimator Front-Ends
//!
//! [`GroupSparseCovariance`] fits a fixed alpha; [`GroupSparseCovarianceCV`]
//! selects alpha by cross-validation first. Both take a validated
//! [`SubjectSet`] and hand back a [`PrecisionModel`] ready to be saved.

use crate::config::{ConfigError, CrossValidationConfig, GroupSparseConfig};
use crate::covariance::{
    CovarianceError, CovarianceOptions, EmpiricalCovariances, empirical_covariances,
};
use crate::cv::{CrossValidationResult, cross_validate};
use crate::folds::{FoldSplitter, KFold};
use crate::model::PrecisionModel;
use crate::probe::SolverProbe;
use crate::progress::{CvProgressObserver, NoopCvProgress};
use crate::solver::{SolverError, SolverOptions, SolverOutcome, solve};
use ndarray::{Array2, Array3};
use thiserror::Error;

/// A comprehensive error type for the estimation process.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Covariance computation failed: {0}")]
    Covariance(#[from] CovarianceError),

    #[error("The group-sparse solver failed: {0}")]
    Solver(#[from] SolverError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid subject data: {0}")]
    InvalidSubjects(String),

    #[error("Invalid cross-validation folds: {0}")]
    InvalidFolds(String),

    #[error("The regularization path needs at least one alpha value.")]
    EmptyAlphaGrid,

    #[error("Failed to build the worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Signal matrices of a group of subjects, validated once.
///
/// Every subject has at least 2 samples (rows) and 2 features (columns),
/// all subjects share the same number of features, and every value is finite.
#[derive(Debug, Clone)]
pub struct SubjectSet {
    subjects: Vec<Array2<f64>>,
}

impl SubjectSet {
    pub fn new(subjects: Vec<Array2<f64>>) -> Result<Self, EstimationError> {
        let first = subjects.first().ok_or_else(|| {
            EstimationError::InvalidSubjects("at least one subject is required".to_string())
        })?;
        let n_features = first.ncols();

        for (index, subject) in subjects.iter().enumerate() {
            if subject.nrows() < 2 || subject.ncols() < 2 {
                return Err(EstimationError::InvalidSubjects(format!(
                    "subject {} has shape {}x{}; at least 2 samples and 2 features are required",
                    index,
                    subject.nrows(),
                    subject.ncols()
                )));
            }
            if subject.ncols() != n_features {
                return Err(EstimationError::InvalidSubjects(format!(
                    "subject {} has {} features but subject 0 has {}",
                    index,
                    subject.ncols(),
                    n_features
                )));
            }
            if subject.iter().any(|value| !value.is_finite()) {
                return Err(EstimationError::InvalidSubjects(format!(
                    "subject {index} contains non-finite values"
                )));
            }
        }
        Ok(Self { subjects })
    }

    pub fn subjects(&self) -> &[Array2<f64>] {
        &self.subjects
    }

    pub fn n_subjects(&self) -> usize {
        self.subjects.len()
    }

    pub fn n_features(&self) -> usize {
        self.subjects[0].ncols()
    }
}

impl TryFrom<Vec<Array2<f64>>> for SubjectSet {
    type Error = EstimationError;

    fn try_from(subjects: Vec<Array2<f64>>) -> Result<Self, Self::Error> {
        Self::new(subjects)
    }
}

impl TryFrom<Array2<f64>> for SubjectSet {
    type Error = EstimationError;

    fn try_from(subject: Array2<f64>) -> Result<Self, Self::Error> {
        Self::new(vec![subject])
    }
}

/// Computes the (non-standardized) covariances of `subjects` and estimates
/// their group-sparse precision matrices at a fixed `alpha`.
pub fn group_sparse_covariance(
    subjects: &SubjectSet,
    alpha: f64,
    options: &SolverOptions,
    precisions_init: Option<Array3<f64>>,
    probe: Option<&mut dyn SolverProbe>,
) -> Result<(EmpiricalCovariances, SolverOutcome), EstimationError> {
    let covariances = empirical_covariances(subjects.subjects(), CovarianceOptions::default())?;
    let outcome = solve(
        covariances.covariances.view(),
        covariances.n_samples.view(),
        alpha,
        options,
        precisions_init,
        probe,
    )?;
    Ok((covariances, outcome))
}

/// Group-sparse estimator at a fixed regularization value.
#[derive(Debug, Clone, Default)]
pub struct GroupSparseCovariance {
    pub config: GroupSparseConfig,
}

impl GroupSparseCovariance {
    pub fn new(config: GroupSparseConfig) -> Self {
        Self { config }
    }

    pub fn fit(&self, subjects: &SubjectSet) -> Result<PrecisionModel, EstimationError> {
        self.config.validate()?;
        log::info!(
            "Computing covariance and precision matrices for {} subjects ({} features), alpha = {}.",
            subjects.n_subjects(),
            subjects.n_features(),
            self.config.alpha
        );
        let (covariances, outcome) = group_sparse_covariance(
            subjects,
            self.config.alpha,
            &self.config.solver_options(),
            None,
            None,
        )?;
        log::info!(
            "Solver finished after {} sweep(s): {:?}.",
            outcome.iterations,
            outcome.stop
        );
        Ok(PrecisionModel::from_fixed_alpha(
            self.config.alpha,
            covariances,
            outcome,
        ))
    }
}

/// Group-sparse estimator whose alpha is chosen by cross-validation.
#[derive(Debug, Clone, Default)]
pub struct GroupSparseCovarianceCV {
    pub config: CrossValidationConfig,
}

impl GroupSparseCovarianceCV {
    pub fn new(config: CrossValidationConfig) -> Self {
        Self { config }
    }

    /// Cross-validates with contiguous K-fold splits.
    pub fn fit(&self, subjects: &SubjectSet) -> Result<CrossValidationResult, EstimationError> {
        self.config.validate()?;
        self.fit_with(
            subjects,
            &KFold::new(self.config.cv_folds),
            &mut NoopCvProgress,
        )
    }

    /// Cross-validates with a custom splitter, reporting progress.
    pub fn fit_with(
        &self,
        subjects: &SubjectSet,
        splitter: &dyn FoldSplitter,
        progress: &mut dyn CvProgressObserver,
    ) -> Result<CrossValidationResult, EstimationError> {
        cross_validate(subjects, &self.config, splitter, progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::StopReason;
    use ndarray::array;

    #[test]
    fn single_matrix_becomes_one_subject() {
        let set = SubjectSet::try_from(array![[1.0, 2.0], [3.0, 5.0], [0.0, 1.0]]).unwrap();
        assert_eq!(set.n_subjects(), 1);
        assert_eq!(set.n_features(), 2);
    }

    #[test]
    fn subject_validation() {
        assert!(SubjectSet::new(Vec::new()).is_err());
        assert!(SubjectSet::try_from(Array2::<f64>::zeros((1, 3))).is_err());
        assert!(SubjectSet::try_from(Array2::<f64>::zeros((5, 1))).is_err());
        assert!(SubjectSet::new(vec![Array2::zeros((5, 3)), Array2::zeros((5, 4))]).is_err());
        assert!(SubjectSet::try_from(array![[1.0, f64::NAN], [0.0, 1.0]]).is_err());
    }

    #[test]
    fn fixed_alpha_fit_keeps_raw_covariances() {
        let subject = array![
            [1.0, 2.0, 0.5],
            [2.0, 1.0, 1.5],
            [3.0, 4.0, -0.5],
            [0.0, 1.0, 2.5],
            [1.5, 0.5, 0.0]
        ];
        let set = SubjectSet::try_from(subject.clone()).unwrap();
        let model = GroupSparseCovariance::default().fit(&set).unwrap();
        let raw = empirical_covariances(&[subject], CovarianceOptions::default()).unwrap();
        assert_eq!(model.covariances, raw.covariances);
        assert_eq!(model.alpha, 0.1);
        assert!(model.cv.is_none());
        assert_ne!(model.stop, StopReason::ProbeInterrupted);
    }

    #[test]
    fn invalid_configuration_is_reported_before_fitting() {
        let set = SubjectSet::try_from(array![[1.0, 2.0], [3.0, 5.0], [0.0, 1.0]]).unwrap();
        let estimator = GroupSparseCovariance::new(GroupSparseConfig {
            alpha: -1.0,
            ..GroupSparseConfig::default()
        });
        assert!(matches!(
            estimator.fit(&set),
            Err(EstimationError::Config(ConfigError::Invalid(_)))
        ));
    }
}
