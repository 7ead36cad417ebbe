use crate::covariance::EmpiricalCovariances;
use crate::cv::CrossValidationResult;
use crate::solver::{SolverOutcome, StopReason};
use ndarray::{Array1, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Subject {subject} is out of range; the model holds {n_subjects} subjects.")]
    SubjectOutOfRange { subject: usize, n_subjects: usize },
    #[error("The model file is inconsistent: {0}")]
    Inconsistent(String),
}

/// Record of the cross-validated alpha search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvSummary {
    pub best_index: usize,
    /// Evaluated alphas, in decreasing order.
    pub alphas: Vec<f64>,
    /// Mean held-out log-likelihood of every alpha.
    pub scores: Vec<f64>,
}

/// The fitted model artifact, saved to and loaded from TOML.
///
/// Scalar fields come first so the TOML document keeps its plain values
/// above the array tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecisionModel {
    pub alpha: f64,
    pub n_features: usize,
    pub n_subjects: usize,
    pub stop: StopReason,
    pub iterations: usize,
    /// Column names of the input signals, when they were known.
    #[serde(default)]
    pub feature_names: Option<Vec<String>>,
    /// Raw sample count per subject.
    pub n_samples: Array1<f64>,
    /// Shape `[n_features, n_features, n_subjects]`.
    pub covariances: Array3<f64>,
    /// Shape `[n_features, n_features, n_subjects]`.
    pub precisions: Array3<f64>,
    #[serde(default)]
    pub cv: Option<CvSummary>,
}

impl PrecisionModel {
    pub fn from_fixed_alpha(
        alpha: f64,
        covariances: EmpiricalCovariances,
        outcome: SolverOutcome,
    ) -> Self {
        Self {
            alpha,
            n_features: covariances.n_features(),
            n_subjects: covariances.n_subjects(),
            stop: outcome.stop,
            iterations: outcome.iterations,
            feature_names: None,
            n_samples: covariances.n_samples,
            covariances: covariances.covariances,
            precisions: outcome.precisions,
            cv: None,
        }
    }

    pub fn from_cross_validation(result: CrossValidationResult) -> Self {
        let cv = CvSummary {
            best_index: result.best_index,
            alphas: result.cv_alphas(),
            scores: result.cv_scores(),
        };
        Self {
            alpha: result.alpha,
            n_features: result.covariances.n_features(),
            n_subjects: result.covariances.n_subjects(),
            stop: result.final_stop,
            iterations: result.final_iterations,
            feature_names: None,
            n_samples: result.covariances.n_samples,
            covariances: result.covariances.covariances,
            precisions: result.precisions,
            cv: Some(cv),
        }
    }

    pub fn with_feature_names(mut self, names: Vec<String>) -> Self {
        self.feature_names = Some(names);
        self
    }

    pub fn precision(&self, subject: usize) -> Result<ArrayView2<'_, f64>, ModelError> {
        if subject >= self.n_subjects {
            return Err(ModelError::SubjectOutOfRange {
                subject,
                n_subjects: self.n_subjects,
            });
        }
        Ok(self.precisions.index_axis(Axis(2), subject))
    }

    /// Number of feature pairs `i < j` connected in the shared support.
    pub fn edge_count(&self) -> usize {
        let n = self.n_features;
        (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .filter(|&(i, j)| {
                (0..self.n_subjects).any(|k| self.precisions[[i, j, k]] != 0.0)
            })
            .count()
    }

    /// Saves the model to a file in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a model from a TOML file and checks its shapes.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: Self = toml::from_str(&toml_string)?;
        model.check_shapes()?;
        Ok(model)
    }

    fn check_shapes(&self) -> Result<(), ModelError> {
        let expected = [self.n_features, self.n_features, self.n_subjects];
        if self.covariances.shape() != expected || self.precisions.shape() != expected {
            return Err(ModelError::Inconsistent(format!(
                "expected stacks of shape {:?}, found covariances {:?} and precisions {:?}",
                expected,
                self.covariances.shape(),
                self.precisions.shape()
            )));
        }
        if self.n_samples.len() != self.n_subjects {
            return Err(ModelError::Inconsistent(format!(
                "{} sample counts for {} subjects",
                self.n_samples.len(),
                self.n_subjects
            )));
        }
        if let Some(names) = &self.feature_names {
            if names.len() != self.n_features {
                return Err(ModelError::Inconsistent(format!(
                    "{} feature names for {} features",
                    names.len(),
                    self.n_features
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    fn model() -> PrecisionModel {
        let mut precisions = Array3::zeros((3, 3, 2));
        let mut covariances = Array3::zeros((3, 3, 2));
        for k in 0..2 {
            for i in 0..3 {
                precisions[[i, i, k]] = 1.0 + k as f64;
                covariances[[i, i, k]] = 1.0;
            }
            precisions[[0, 2, k]] = -0.25;
            precisions[[2, 0, k]] = -0.25;
        }
        PrecisionModel {
            alpha: 0.1,
            n_features: 3,
            n_subjects: 2,
            stop: StopReason::ToleranceReached,
            iterations: 4,
            feature_names: None,
            n_samples: array![20.0, 30.0],
            covariances,
            precisions,
            cv: None,
        }
    }

    #[test]
    fn save_then_load_restores_the_model() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.toml");
        let original = model()
            .with_feature_names(vec!["a".into(), "b".into(), "c".into()]);
        let original = PrecisionModel {
            cv: Some(CvSummary {
                best_index: 1,
                alphas: vec![0.5, 0.1],
                scores: vec![-3.0, -2.5],
            }),
            ..original
        };
        original.save(&path).unwrap();
        let loaded = PrecisionModel::load(&path).unwrap();
        assert_eq!(loaded.precisions, original.precisions);
        assert_eq!(loaded.covariances, original.covariances);
        assert_eq!(loaded.n_samples, original.n_samples);
        assert_eq!(loaded.stop, StopReason::ToleranceReached);
        assert_eq!(loaded.feature_names, original.feature_names);
        assert_eq!(loaded.cv, original.cv);
    }

    #[test]
    fn inconsistent_files_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        let broken = PrecisionModel {
            n_features: 4,
            ..model()
        };
        broken.save(&path).unwrap();
        assert!(matches!(
            PrecisionModel::load(&path),
            Err(ModelError::Inconsistent(_))
        ));
    }

    #[test]
    fn edges_follow_the_shared_support() {
        assert_eq!(model().edge_count(), 1);
    }

    #[test]
    fn precision_lookup_checks_subject_index() {
        let model = model();
        assert_eq!(model.precision(1).unwrap()[[0, 0]], 2.0);
        assert!(matches!(
            model.precision(2),
            Err(ModelError::SubjectOutOfRange { subject: 2, n_subjects: 2 })
        ));
    }
}
