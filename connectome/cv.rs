//! # Cross-Validated Selection of Alpha
//!
//! Every subject is split into folds independently (subjects may differ in
//! length); fold `i` of every subject together forms the `i`-th train/test
//! pair. Each refinement round evaluates a regularization path per fold, in
//! parallel, averages the held-out log-likelihoods per alpha and merges them
//! into a cumulative path sorted by decreasing alpha. The grid of the next
//! round is log-spaced between the neighbours of the best entry. Finally the
//! solver is refitted on the full data at the selected alpha.

use crate::config::{AlphaGrid, CrossValidationConfig};
use crate::covariance::{CovarianceOptions, EmpiricalCovariances, empirical_covariances};
use crate::estimate::{EstimationError, SubjectSet};
use crate::folds::FoldSplitter;
use crate::path::group_sparse_covariance_path;
use crate::probe::{EarlyStopProbe, SolverProbe};
use crate::progress::{CvProgressObserver, CvProgressStage};
use crate::scores::compute_alpha_max;
use crate::solver::{SolverOptions, StopReason, solve};
use itertools::izip;
use ndarray::{Array2, Array3};
use rayon::prelude::*;

/// Scores at or above this are treated as non-finite when selecting alpha.
const IMPLAUSIBLE_SCORE: f64 = 0.1 / f64::EPSILON;
/// Lower end of the initial grid, relative to the critical alpha.
const GRID_SPAN: f64 = 1e-2;

/// One evaluated alpha of the cumulative path.
#[derive(Debug, Clone)]
pub struct PathEntry {
    pub alpha: f64,
    /// Mean of `fold_scores`.
    pub score: f64,
    pub fold_scores: Vec<f64>,
    /// Precision stack fitted on the training part of every fold.
    pub fold_precisions: Vec<Array3<f64>>,
}

#[derive(Debug, Clone)]
pub struct CrossValidationResult {
    /// Selected regularization parameter.
    pub alpha: f64,
    /// Index of the selected entry in `path`.
    pub best_index: usize,
    /// Every evaluated alpha, sorted by decreasing alpha.
    pub path: Vec<PathEntry>,
    /// Covariances of the full (non-standardized) subjects.
    pub covariances: EmpiricalCovariances,
    /// Precisions refitted on the full data at `alpha`.
    pub precisions: Array3<f64>,
    pub final_stop: StopReason,
    pub final_iterations: usize,
}

impl CrossValidationResult {
    pub fn cv_alphas(&self) -> Vec<f64> {
        self.path.iter().map(|entry| entry.alpha).collect()
    }

    pub fn cv_scores(&self) -> Vec<f64> {
        self.path.iter().map(|entry| entry.score).collect()
    }
}

/// Train and test signals of every subject for one fold index.
struct FoldData {
    train: Vec<Array2<f64>>,
    test: Vec<Array2<f64>>,
}

struct FoldPath {
    precisions: Vec<Array3<f64>>,
    scores: Vec<f64>,
}

pub fn cross_validate(
    subjects: &SubjectSet,
    config: &CrossValidationConfig,
    splitter: &dyn FoldSplitter,
    progress: &mut dyn CvProgressObserver,
) -> Result<CrossValidationResult, EstimationError> {
    config.validate_search()?;
    let signals = subjects.subjects();
    let full = empirical_covariances(signals, CovarianceOptions::default())?;
    let folds = build_folds(signals, splitter)?;
    log::info!(
        "Cross-validating over {} folds of {} subjects ({} features).",
        folds.len(),
        subjects.n_subjects(),
        subjects.n_features()
    );

    let mut alphas = match &config.alphas {
        AlphaGrid::Explicit(values) => values.clone(),
        AlphaGrid::Count(count) => {
            let bounds = compute_alpha_max(full.covariances.view(), full.n_samples.view())?;
            if bounds.alpha_max <= 0.0 {
                return Err(EstimationError::InvalidSubjects(
                    "every off-diagonal covariance is zero, so no alpha grid can be derived"
                        .to_string(),
                ));
            }
            let mut grid = log_grid(GRID_SPAN * bounds.alpha_max, bounds.alpha_max, *count);
            grid.reverse();
            grid
        }
    };

    let n_refinements = config.effective_refinements();
    let options = config.fold_solver_options();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.n_threads())
        .build()?;

    let mut path: Vec<PathEntry> = Vec::new();
    let mut best_index = 0;
    let mut warm_start: Option<Vec<Array3<f64>>> = None;

    progress.on_stage_start(CvProgressStage::GridRefinement, n_refinements);
    for round in 0..n_refinements {
        let fold_paths = pool.install(|| {
            folds
                .par_iter()
                .enumerate()
                .map(|(i, fold)| {
                    // Warm starts are useless with early stopping.
                    let init = if config.early_stopping {
                        None
                    } else {
                        warm_start.as_ref().map(|stacks| stacks[i].clone())
                    };
                    evaluate_fold(fold, &alphas, &options, init, config.early_stopping)
                })
                .collect::<Result<Vec<_>, EstimationError>>()
        })?;

        path.extend(merge_fold_paths(&alphas, fold_paths));
        path.sort_by(|a, b| b.alpha.total_cmp(&a.alpha));

        let (best, last_finite) = select_best_index(&path);
        best_index = best;
        log::info!(
            "Refinement {} of {}: best alpha {:.4e} (score {:.6e}) among {} evaluated.",
            round + 1,
            n_refinements,
            path[best].alpha,
            path[best].score,
            path.len()
        );

        if round + 1 < n_refinements {
            let (upper, lower, warm_index) = refinement_bounds(&path, best, last_finite);
            let grid = log_grid(upper, lower, alphas.len() + 2);
            alphas = grid[1..grid.len() - 1].to_vec();
            warm_start = Some(path[warm_index].fold_precisions.clone());
        }
        progress.on_stage_advance(CvProgressStage::GridRefinement, round + 1);
    }
    progress.on_stage_finish(CvProgressStage::GridRefinement);

    let alpha = path[best_index].alpha;
    log::info!("Final optimization at alpha = {:.4e}.", alpha);
    progress.on_stage_start(CvProgressStage::FinalFit, 1);
    let outcome = solve(
        full.covariances.view(),
        full.n_samples.view(),
        alpha,
        &config.final_solver_options(),
        None,
        None,
    )?;
    progress.on_stage_advance(CvProgressStage::FinalFit, 1);
    progress.on_stage_finish(CvProgressStage::FinalFit);

    Ok(CrossValidationResult {
        alpha,
        best_index,
        path,
        covariances: full,
        precisions: outcome.precisions,
        final_stop: outcome.stop,
        final_iterations: outcome.iterations,
    })
}

fn build_folds(
    signals: &[Array2<f64>],
    splitter: &dyn FoldSplitter,
) -> Result<Vec<FoldData>, EstimationError> {
    let per_subject = signals
        .iter()
        .map(|subject| splitter.split(subject.nrows()))
        .collect::<Result<Vec<_>, _>>()?;

    let n_folds = per_subject.first().map_or(0, Vec::len);
    if n_folds == 0 {
        return Err(EstimationError::InvalidFolds(
            "the splitter produced no folds".to_string(),
        ));
    }
    if let Some(subject) = per_subject.iter().position(|folds| folds.len() != n_folds) {
        return Err(EstimationError::InvalidFolds(format!(
            "subject {} has {} folds but subject 0 has {}",
            subject,
            per_subject[subject].len(),
            n_folds
        )));
    }

    Ok((0..n_folds)
        .map(|i| FoldData {
            train: signals
                .iter()
                .zip(&per_subject)
                .map(|(subject, folds)| folds[i].train_rows(subject))
                .collect(),
            test: signals
                .iter()
                .zip(&per_subject)
                .map(|(subject, folds)| folds[i].test_rows(subject))
                .collect(),
        })
        .collect())
}

fn evaluate_fold(
    fold: &FoldData,
    alphas: &[f64],
    options: &SolverOptions,
    init: Option<Array3<f64>>,
    early_stopping: bool,
) -> Result<FoldPath, EstimationError> {
    let mut probe = if early_stopping {
        Some(EarlyStopProbe::new(&fold.test)?)
    } else {
        None
    };
    let result = group_sparse_covariance_path(
        &fold.train,
        alphas,
        Some(fold.test.as_slice()),
        options,
        init,
        probe.as_mut().map(|probe| probe as &mut dyn SolverProbe),
    )?;
    let scores = result
        .scores
        .unwrap_or_else(|| vec![f64::NAN; alphas.len()]);
    Ok(FoldPath {
        precisions: result.precisions,
        scores,
    })
}

/// Regroups per-fold paths into one entry per alpha.
fn merge_fold_paths(alphas: &[f64], fold_paths: Vec<FoldPath>) -> Vec<PathEntry> {
    let mut precisions: Vec<Vec<Array3<f64>>> = vec![Vec::new(); alphas.len()];
    let mut scores: Vec<Vec<f64>> = vec![Vec::new(); alphas.len()];
    for fold_path in fold_paths {
        for (j, (stack, score)) in fold_path
            .precisions
            .into_iter()
            .zip(fold_path.scores)
            .enumerate()
        {
            precisions[j].push(stack);
            scores[j].push(score);
        }
    }

    izip!(alphas, precisions, scores)
        .map(|(&alpha, fold_precisions, fold_scores)| PathEntry {
            alpha,
            score: fold_scores.iter().sum::<f64>() / fold_scores.len() as f64,
            fold_scores,
            fold_precisions,
        })
        .collect()
}

/// Returns `(best, last_finite)`.
///
/// Scans in path order (decreasing alpha) with a `>=` update, so among equal
/// scores the later entry, with the smaller alpha, wins. Implausibly large
/// scores count as NaN and never win. Falls back to index 0 when no score is
/// comparable.
fn select_best_index(path: &[PathEntry]) -> (usize, usize) {
    let mut best_score = f64::NEG_INFINITY;
    let mut best = 0;
    let mut last_finite = 0;
    for (index, entry) in path.iter().enumerate() {
        let score = if entry.score >= IMPLAUSIBLE_SCORE {
            f64::NAN
        } else {
            entry.score
        };
        if score.is_finite() {
            last_finite = index;
        }
        if score >= best_score {
            best_score = score;
            best = index;
        }
    }
    (best, last_finite)
}

/// Returns `(upper, lower, warm_start_index)` for the next grid.
fn refinement_bounds(path: &[PathEntry], best: usize, last_finite: usize) -> (f64, f64, usize) {
    let last = path.len() - 1;
    if best == 0 && last > 0 {
        // The largest alpha with non-zero coefficients; no need to go back.
        (path[0].alpha, path[1].alpha, 0)
    } else if best == last_finite && best != last {
        // Models below this alpha did not converge; refine at the boundary.
        (path[best].alpha, path[best + 1].alpha, best)
    } else if best == last {
        (path[best].alpha, GRID_SPAN * path[best].alpha, best)
    } else {
        (path[best - 1].alpha, path[best + 1].alpha, best - 1)
    }
}

/// `num` values evenly spaced on a log scale from `start` to `stop`, both
/// included.
fn log_grid(start: f64, stop: f64, num: usize) -> Vec<f64> {
    let (low, high) = (start.log10(), stop.log10());
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (high - low) / (num - 1) as f64;
            (0..num)
                .map(|i| 10f64.powf(low + step * i as f64))
                .collect()
        }
    }
}
