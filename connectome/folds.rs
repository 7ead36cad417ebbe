//! Train/test splits of a single subject's samples.

use crate::estimate::EstimationError;
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

/// Sample indices of one split. `train` and `test` are disjoint and cover
/// every sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

impl Fold {
    pub fn train_rows(&self, signals: &Array2<f64>) -> Array2<f64> {
        signals.select(Axis(0), &self.train)
    }

    pub fn test_rows(&self, signals: &Array2<f64>) -> Array2<f64> {
        signals.select(Axis(0), &self.test)
    }
}

/// Produces the folds of one subject. Folds of different subjects are paired
/// by position, so a splitter must yield the same number of folds for every
/// subject it accepts.
pub trait FoldSplitter {
    fn split(&self, n_samples: usize) -> Result<Vec<Fold>, EstimationError>;
}

/// Contiguous, unshuffled K-fold splitting.
///
/// The first `n_samples % n_splits` folds hold one extra test sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KFold {
    pub n_splits: usize,
}

impl Default for KFold {
    fn default() -> Self {
        Self { n_splits: 5 }
    }
}

impl KFold {
    pub fn new(n_splits: usize) -> Self {
        Self { n_splits }
    }
}

impl FoldSplitter for KFold {
    fn split(&self, n_samples: usize) -> Result<Vec<Fold>, EstimationError> {
        if self.n_splits < 2 {
            return Err(EstimationError::InvalidFolds(format!(
                "at least 2 folds are required, got {}",
                self.n_splits
            )));
        }
        if n_samples < self.n_splits {
            return Err(EstimationError::InvalidFolds(format!(
                "cannot split {} samples into {} folds",
                n_samples, self.n_splits
            )));
        }

        let base = n_samples / self.n_splits;
        let extra = n_samples % self.n_splits;
        let mut folds = Vec::with_capacity(self.n_splits);
        let mut start = 0;
        for fold in 0..self.n_splits {
            let size = base + usize::from(fold < extra);
            let stop = start + size;
            folds.push(Fold {
                train: (0..start).chain(stop..n_samples).collect(),
                test: (start..stop).collect(),
            });
            start = stop;
        }
        Ok(folds)
    }
}
