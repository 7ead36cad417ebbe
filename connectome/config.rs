//! Estimator settings, loadable from TOML.
//!
//! Every field has a default, so a configuration file only needs the values
//! it overrides. Settings are validated once, before any data is touched.

use crate::solver::SolverOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings of a single group-sparse fit at a fixed alpha.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSparseConfig {
    /// Regularization parameter. With standardized signals, sensible values
    /// lie in `[0, 1]`; zero means no regularization.
    pub alpha: f64,
    pub tol: Option<f64>,
    pub max_iter: usize,
    pub debug: bool,
}

impl Default for GroupSparseConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            tol: Some(1e-3),
            max_iter: 10,
            debug: false,
        }
    }
}

impl GroupSparseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_non_negative("alpha", self.alpha)?;
        check_tolerance("tol", self.tol)?;
        check_iterations("max_iter", self.max_iter)
    }

    pub fn solver_options(&self) -> SolverOptions {
        SolverOptions {
            max_iter: self.max_iter,
            tol: self.tol,
            debug: self.debug,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }
}

/// Candidate regularization values for cross-validation.
///
/// A count builds a log-spaced grid from the data and refines it; an explicit
/// list is evaluated exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AlphaGrid {
    Count(usize),
    Explicit(Vec<f64>),
}

impl Default for AlphaGrid {
    fn default() -> Self {
        AlphaGrid::Count(4)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossValidationConfig {
    pub alphas: AlphaGrid,
    /// Number of grid refinement rounds. Ignored for explicit grids.
    pub n_refinements: usize,
    /// Number of contiguous folds per subject.
    pub cv_folds: usize,
    /// Tolerance used while fitting the folds.
    pub tol_cv: Option<f64>,
    /// Sweep limit used while fitting the folds.
    pub max_iter_cv: usize,
    /// Tolerance of the final fit at the selected alpha.
    pub tol: Option<f64>,
    /// Sweep limit of the final fit at the selected alpha.
    pub max_iter: usize,
    /// Worker threads for fold evaluation. `None` uses every core.
    pub n_jobs: Option<usize>,
    pub debug: bool,
    /// Stop each fold fit once its held-out likelihood decreases.
    pub early_stopping: bool,
}

impl Default for CrossValidationConfig {
    fn default() -> Self {
        Self {
            alphas: AlphaGrid::default(),
            n_refinements: 4,
            cv_folds: 5,
            tol_cv: Some(1e-2),
            max_iter_cv: 50,
            tol: Some(1e-3),
            max_iter: 100,
            n_jobs: Some(1),
            debug: false,
            early_stopping: true,
        }
    }
}

impl CrossValidationConfig {
    /// Full validation, including the fold count used by the default
    /// contiguous splitter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_search()?;
        if self.cv_folds < 2 {
            return Err(ConfigError::Invalid(format!(
                "cv_folds must be at least 2, got {}",
                self.cv_folds
            )));
        }
        Ok(())
    }

    /// Validates the grid search and solver settings only. `cv_folds` is not
    /// read when a caller supplies its own splitter.
    pub fn validate_search(&self) -> Result<(), ConfigError> {
        match &self.alphas {
            AlphaGrid::Count(0) => {
                return Err(ConfigError::Invalid(
                    "the alpha grid must contain at least one value".to_string(),
                ));
            }
            AlphaGrid::Count(_) => {}
            AlphaGrid::Explicit(values) => {
                if values.is_empty() {
                    return Err(ConfigError::Invalid(
                        "the explicit alpha list is empty".to_string(),
                    ));
                }
                for &alpha in values {
                    check_non_negative("alphas", alpha)?;
                }
            }
        }
        if self.n_refinements == 0 {
            return Err(ConfigError::Invalid(
                "n_refinements must be at least 1".to_string(),
            ));
        }
        check_tolerance("tol_cv", self.tol_cv)?;
        check_tolerance("tol", self.tol)?;
        check_iterations("max_iter_cv", self.max_iter_cv)?;
        check_iterations("max_iter", self.max_iter)?;
        if self.n_jobs == Some(0) {
            return Err(ConfigError::Invalid(
                "n_jobs must be at least 1 when given".to_string(),
            ));
        }
        Ok(())
    }

    /// Explicit grids are evaluated in a single round.
    pub fn effective_refinements(&self) -> usize {
        match self.alphas {
            AlphaGrid::Count(_) => self.n_refinements,
            AlphaGrid::Explicit(_) => 1,
        }
    }

    pub fn n_threads(&self) -> usize {
        self.n_jobs.unwrap_or_else(num_cpus::get)
    }

    pub fn fold_solver_options(&self) -> SolverOptions {
        SolverOptions {
            max_iter: self.max_iter_cv,
            tol: self.tol_cv,
            debug: self.debug,
        }
    }

    pub fn final_solver_options(&self) -> SolverOptions {
        SolverOptions {
            max_iter: self.max_iter,
            tol: self.tol,
            debug: self.debug,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }
}

fn check_non_negative(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{name} must be a non-negative finite number, got {value}"
        )))
    }
}

fn check_tolerance(name: &str, value: Option<f64>) -> Result<(), ConfigError> {
    match value {
        Some(tol) => check_non_negative(name, tol),
        None => Ok(()),
    }
}

fn check_iterations(name: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Invalid(format!("{name} must be at least 1")))
    } else {
        Ok(())
    }
}
