#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
pub mod covariance;
pub mod cv;
pub mod data;
pub mod estimate;
pub mod folds;
pub mod matrix;
pub mod model;
pub mod path;
pub mod probe;
pub mod progress;
pub mod scores;
pub mod solver;
pub mod submatrix;

pub use config::{AlphaGrid, CrossValidationConfig, GroupSparseConfig};
pub use covariance::{EmpiricalCovariances, empirical_covariances};
pub use cv::CrossValidationResult;
pub use estimate::{
    EstimationError, GroupSparseCovariance, GroupSparseCovarianceCV, SubjectSet,
    group_sparse_covariance,
};
pub use model::PrecisionModel;
pub use path::group_sparse_covariance_path;
pub use scores::{compute_alpha_max, group_sparse_scores};
pub use solver::{SolverError, SolverOptions, SolverOutcome, StopReason};
