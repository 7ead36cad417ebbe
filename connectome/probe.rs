//! Hooks invoked by the solver between sweeps.
//!
//! A probe sees the complete solver state once before the first sweep and once
//! after every sweep, and may ask the solver to stop. Probes run synchronously
//! on the solver's thread; nothing is delivered asynchronously.

use crate::covariance::{CovarianceError, CovarianceOptions, empirical_covariances};
use crate::matrix::max_abs_difference;
use crate::scores::{group_sparse_scores, log_likelihood};
use ndarray::{Array2, Array3, ArrayView1, ArrayView3};

/// Snapshot of the solver handed to a probe.
#[derive(Debug, Clone, Copy)]
pub struct ProbeState<'a> {
    pub covariances: ArrayView3<'a, f64>,
    /// Sample weights, already normalized to sum to one.
    pub weights: ArrayView1<'a, f64>,
    pub alpha: f64,
    pub max_iter: usize,
    pub tol: Option<f64>,
    /// `None` before the first sweep, otherwise the index of the sweep that
    /// just completed.
    pub iteration: Option<usize>,
    pub precisions: ArrayView3<'a, f64>,
    /// Precisions at the start of the sweep. `None` before the first sweep.
    pub previous: Option<ArrayView3<'a, f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDecision {
    Continue,
    Stop,
}

pub trait SolverProbe {
    fn inspect(&mut self, state: &ProbeState<'_>) -> ProbeDecision;
}

impl<F> SolverProbe for F
where
    F: FnMut(&ProbeState<'_>) -> ProbeDecision,
{
    fn inspect(&mut self, state: &ProbeState<'_>) -> ProbeDecision {
        self(state)
    }
}

/// Reborrows an optional probe for a single solver call, so the same probe can
/// be handed to several consecutive fits.
pub fn reborrow<'a>(
    probe: &'a mut Option<&mut dyn SolverProbe>,
) -> Option<&'a mut dyn SolverProbe> {
    match probe {
        Some(probe) => Some(&mut **probe),
        None => None,
    }
}

/// Stops the solver as soon as the log-likelihood on held-out data decreases
/// from one call to the next.
///
/// Within a regularization path the same probe is reused for every alpha; the
/// priming call made before each fit only records the starting score.
#[derive(Debug, Clone)]
pub struct EarlyStopProbe {
    test_covariances: Array3<f64>,
    last_log_likelihood: Option<f64>,
}

impl EarlyStopProbe {
    /// Builds the probe from held-out subjects. Their covariances are not
    /// standardized.
    pub fn new(test_subjects: &[Array2<f64>]) -> Result<Self, CovarianceError> {
        let test = empirical_covariances(test_subjects, CovarianceOptions::default())?;
        Ok(Self::from_covariances(test.covariances))
    }

    pub fn from_covariances(test_covariances: Array3<f64>) -> Self {
        Self {
            test_covariances,
            last_log_likelihood: None,
        }
    }

    pub fn last_log_likelihood(&self) -> Option<f64> {
        self.last_log_likelihood
    }
}

impl SolverProbe for EarlyStopProbe {
    fn inspect(&mut self, state: &ProbeState<'_>) -> ProbeDecision {
        let score = log_likelihood(
            state.precisions,
            state.weights,
            self.test_covariances.view(),
        );
        if let (Some(iteration), Some(last)) = (state.iteration, self.last_log_likelihood) {
            if last > score {
                log::debug!(
                    "Log-likelihood on test set is decreasing. Stopping at iteration {}",
                    iteration
                );
                return ProbeDecision::Stop;
            }
        }
        self.last_log_likelihood = Some(score);
        ProbeDecision::Continue
    }
}

/// One row of a [`ConvergenceTrace`].
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    pub iteration: Option<usize>,
    pub log_likelihood: f64,
    pub objective: f64,
    pub duality_gap: Option<f64>,
    /// Largest absolute change since the previous sweep.
    pub max_variation: Option<f64>,
}

/// Records scores and duality gaps at every probe call. Never stops the solver.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceTrace {
    records: Vec<TraceRecord>,
}

impl ConvergenceTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&TraceRecord> {
        self.records.last()
    }
}

impl SolverProbe for ConvergenceTrace {
    fn inspect(&mut self, state: &ProbeState<'_>) -> ProbeDecision {
        match group_sparse_scores(
            state.precisions,
            state.weights,
            state.covariances,
            state.alpha,
            true,
            false,
        ) {
            Ok(scores) => {
                let max_variation = state
                    .previous
                    .map(|previous| max_abs_difference(previous, state.precisions));
                log::debug!(
                    "iteration {:?}: objective {:.6e}, duality gap {:?}",
                    state.iteration,
                    scores.objective,
                    scores.duality_gap
                );
                self.records.push(TraceRecord {
                    iteration: state.iteration,
                    log_likelihood: scores.log_likelihood,
                    objective: scores.objective,
                    duality_gap: scores.duality_gap,
                    max_variation,
                });
            }
            Err(err) => {
                log::warn!(
                    "Could not score precisions at iteration {:?}: {}",
                    state.iteration,
                    err
                );
            }
        }
        ProbeDecision::Continue
    }
}
