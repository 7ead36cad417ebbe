use std::fmt;

/// Stages reported during cross-validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CvProgressStage {
    GridRefinement,
    FinalFit,
}

impl CvProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::GridRefinement => "alpha grid refinement",
            Self::FinalFit => "final fit at the selected alpha",
        }
    }
}

impl fmt::Display for CvProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress of a cross-validated fit.
///
/// Called only from the thread driving the fit, never from fold workers.
pub trait CvProgressObserver {
    fn on_stage_start(&mut self, stage: CvProgressStage, total_steps: usize) {
        let _ = (stage, total_steps);
    }
    fn on_stage_advance(&mut self, stage: CvProgressStage, completed_steps: usize) {
        let _ = (stage, completed_steps);
    }
    fn on_stage_finish(&mut self, stage: CvProgressStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopCvProgress;

impl CvProgressObserver for NoopCvProgress {}
