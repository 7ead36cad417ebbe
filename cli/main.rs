#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use connectome::config::{AlphaGrid, CrossValidationConfig, GroupSparseConfig};
use connectome::data::load_subjects;
use connectome::estimate::{GroupSparseCovariance, GroupSparseCovarianceCV, SubjectSet};
use connectome::folds::KFold;
use connectome::model::PrecisionModel;
use connectome::progress::{CvProgressObserver, CvProgressStage};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Args)]
pub struct FitArgs {
    /// Signal files, one per subject (comma-separated, or tab-separated with a .tsv extension)
    #[arg(value_name = "SUBJECT_FILE", required = true)]
    pub subjects: Vec<PathBuf>,

    /// TOML file with estimator settings; flags below override its values
    #[arg(long, value_name = "TOML")]
    pub config: Option<PathBuf>,

    /// Regularization parameter
    #[arg(long)]
    pub alpha: Option<f64>,

    /// Convergence tolerance on the largest change over a sweep
    #[arg(long)]
    pub tol: Option<f64>,

    /// Maximum number of sweeps
    #[arg(long)]
    pub max_iter: Option<usize>,

    /// Run internal consistency checks during optimization (slow)
    #[arg(long)]
    pub debug: bool,

    /// Where to write the fitted model
    #[arg(long, default_value = "precision_model.toml")]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct CvArgs {
    /// Signal files, one per subject (comma-separated, or tab-separated with a .tsv extension)
    #[arg(value_name = "SUBJECT_FILE", required = true)]
    pub subjects: Vec<PathBuf>,

    /// TOML file with cross-validation settings; flags below override its values
    #[arg(long, value_name = "TOML")]
    pub config: Option<PathBuf>,

    /// Number of log-spaced alphas in the data-driven initial grid
    #[arg(long, conflicts_with = "alphas")]
    pub n_alphas: Option<usize>,

    /// Explicit comma-separated alphas, evaluated in a single round
    #[arg(long, value_delimiter = ',')]
    pub alphas: Option<Vec<f64>>,

    /// Number of grid refinement rounds
    #[arg(long)]
    pub n_refinements: Option<usize>,

    /// Number of contiguous folds per subject
    #[arg(long)]
    pub cv_folds: Option<usize>,

    /// Tolerance while fitting the folds
    #[arg(long)]
    pub tol_cv: Option<f64>,

    /// Maximum number of sweeps while fitting the folds
    #[arg(long)]
    pub max_iter_cv: Option<usize>,

    /// Tolerance of the final fit
    #[arg(long)]
    pub tol: Option<f64>,

    /// Maximum number of sweeps of the final fit
    #[arg(long)]
    pub max_iter: Option<usize>,

    /// Worker threads for fold evaluation
    #[arg(long, conflicts_with = "all_cores")]
    pub n_jobs: Option<usize>,

    /// Evaluate folds on every available core
    #[arg(long)]
    pub all_cores: bool,

    /// Let every fold fit run to convergence instead of stopping once the held-out likelihood drops
    #[arg(long)]
    pub no_early_stopping: bool,

    /// Run internal consistency checks during optimization (slow)
    #[arg(long)]
    pub debug: bool,

    /// Where to write the fitted model
    #[arg(long, default_value = "precision_model.toml")]
    pub output: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "connectome",
    about = "Group-sparse precision matrix estimation across subjects",
    long_about = "Estimates inverse covariance matrices that share one sparsity pattern across \
                 subjects, at a fixed regularization value or with the value chosen by \
                 cross-validation."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit group-sparse precisions at a fixed alpha
    #[command(about = "Fit at a fixed alpha (outputs: precision_model.toml)")]
    Fit(FitArgs),

    /// Select alpha by cross-validation, then fit
    #[command(about = "Cross-validate alpha and fit (outputs: precision_model.toml)")]
    Cv(CvArgs),

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

/// Renders refinement rounds as a progress bar on interactive terminals.
struct BarProgress {
    bar: Option<ProgressBar>,
}

impl BarProgress {
    fn new() -> Self {
        Self { bar: None }
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

impl CvProgressObserver for BarProgress {
    fn on_stage_start(&mut self, stage: CvProgressStage, total_steps: usize) {
        self.bar = Some(create_progress_bar(total_steps as u64, stage.describe()));
    }

    fn on_stage_advance(&mut self, stage: CvProgressStage, completed_steps: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(completed_steps as u64);
            bar.set_message(format!("{stage}"));
        }
    }

    fn on_stage_finish(&mut self, stage: CvProgressStage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("{stage} done"));
        }
    }
}

fn load_subject_set(
    paths: &[PathBuf],
) -> Result<(Vec<String>, SubjectSet), Box<dyn std::error::Error>> {
    println!("Loading {} subject file(s)...", paths.len());
    let (feature_names, signals) = load_subjects(paths)?;
    let subjects = SubjectSet::new(signals)?;
    println!(
        "Loaded {} subjects with {} features each.",
        subjects.n_subjects(),
        subjects.n_features()
    );
    Ok((feature_names, subjects))
}

fn report(model: &PrecisionModel, output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    model.save(output)?;
    let n = model.n_features;
    println!(
        "alpha = {:.6e}; {} of {} feature pairs connected; solver stopped after {} sweep(s) ({:?}).",
        model.alpha,
        model.edge_count(),
        n * (n - 1) / 2,
        model.iterations,
        model.stop
    );
    println!("Model written to {}", output.display());
    Ok(())
}

pub fn fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => GroupSparseConfig::load(path)?,
        None => GroupSparseConfig::default(),
    };
    if let Some(alpha) = args.alpha {
        config.alpha = alpha;
    }
    if let Some(tol) = args.tol {
        config.tol = Some(tol);
    }
    if let Some(max_iter) = args.max_iter {
        config.max_iter = max_iter;
    }
    config.debug |= args.debug;
    config.validate()?;

    let (feature_names, subjects) = load_subject_set(&args.subjects)?;
    let model = GroupSparseCovariance::new(config)
        .fit(&subjects)?
        .with_feature_names(feature_names);
    report(&model, &args.output)
}

pub fn cv(args: CvArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => CrossValidationConfig::load(path)?,
        None => CrossValidationConfig::default(),
    };
    if let Some(values) = args.alphas {
        config.alphas = AlphaGrid::Explicit(values);
    }
    if let Some(count) = args.n_alphas {
        config.alphas = AlphaGrid::Count(count);
    }
    if let Some(n_refinements) = args.n_refinements {
        config.n_refinements = n_refinements;
    }
    if let Some(cv_folds) = args.cv_folds {
        config.cv_folds = cv_folds;
    }
    if let Some(tol_cv) = args.tol_cv {
        config.tol_cv = Some(tol_cv);
    }
    if let Some(max_iter_cv) = args.max_iter_cv {
        config.max_iter_cv = max_iter_cv;
    }
    if let Some(tol) = args.tol {
        config.tol = Some(tol);
    }
    if let Some(max_iter) = args.max_iter {
        config.max_iter = max_iter;
    }
    if args.all_cores {
        config.n_jobs = None;
    } else if let Some(n_jobs) = args.n_jobs {
        config.n_jobs = Some(n_jobs);
    }
    if args.no_early_stopping {
        config.early_stopping = false;
    }
    config.debug |= args.debug;
    config.validate()?;

    let (feature_names, subjects) = load_subject_set(&args.subjects)?;
    println!(
        "Cross-validating with {} folds on {} thread(s).",
        config.cv_folds,
        config.n_threads()
    );
    let splitter = KFold::new(config.cv_folds);
    let mut progress = BarProgress::new();
    let result =
        GroupSparseCovarianceCV::new(config).fit_with(&subjects, &splitter, &mut progress)?;

    for (alpha, score) in result.cv_alphas().iter().zip(result.cv_scores()) {
        println!("  alpha {:>12.6e}  mean held-out log-likelihood {:>14.6e}", alpha, score);
    }
    let model = PrecisionModel::from_cross_validation(result).with_feature_names(feature_names);
    report(&model, &args.output)
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let build_timestamp: u64 = env!("CONNECTOME_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("connectome {}", version);
    if build_timestamp > 0 {
        println!("Built at unix time {}", build_timestamp);
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Fit(args)) => fit(args),
        Some(Commands::Cv(args)) => cv(args),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {e}");
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
