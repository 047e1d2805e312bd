//! Pipeline CLI
//!
//! Loads the declarative experiment configuration, then runs the full
//! labelled-fraction sweep with leave-one-user-out cross-validation.
//! Outputs land under the working directory: trained model artifacts,
//! per-fold results summaries, aggregate performance files and the
//! per-fraction CSV tables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use har_ssl::config::RunConfig;
use har_ssl::dataset::loader::JsonDatasetProvider;
use har_ssl::dataset::transforms::default_transforms;
use har_ssl::model::prototype::PrototypeModelService;
use har_ssl::pipeline::{run_sweep, SweepOptions};
use har_ssl::utils::logging::{init_logging, LogLevel};
use har_ssl::DEFAULT_WINDOW_SIZE;

/// Semi-supervised HAR training pipeline
#[derive(Parser, Debug)]
#[command(name = "har_ssl")]
#[command(about = "Semi-supervised training pipeline for human activity recognition")]
struct Cli {
    /// Path to the experiment configuration JSON
    #[arg(short, long, default_value = "configs/self_har.json")]
    config: PathBuf,

    /// Labelled dataset (JSON per-user recordings)
    #[arg(long)]
    labelled_dataset_path: PathBuf,

    /// Unlabelled dataset used for self-supervision and self-training
    #[arg(long)]
    unlabelled_dataset_path: PathBuf,

    /// Directory for trained models, training logs and result summaries
    #[arg(short, long, default_value = "run")]
    working_directory: PathBuf,

    /// The size of the sliding window, in samples
    #[arg(long, default_value_t = DEFAULT_WINDOW_SIZE)]
    window_size: usize,

    /// Cap on the number of unlabelled windows kept in the pool
    #[arg(long)]
    max_unlabelled_windows: Option<usize>,

    /// Times the labelled train windows are appended to the pool
    #[arg(long, default_value_t = 1)]
    labelled_repeat: usize,

    /// Labelled-data fractions to sweep, comma separated
    #[arg(long, value_delimiter = ',', default_value = "0.5")]
    fractions: Vec<f64>,

    /// Log verbosity (debug|info|warn|error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn print_banner() {
    println!(
        "{}",
        r#"
╔══════════════════════════════════════════════════════════════════╗
║   HAR Semi-Supervised Training Pipeline                          ║
║   Self-supervision + teacher-student training on sensor windows  ║
╚══════════════════════════════════════════════════════════════════╝
"#
        .cyan()
    );
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.parse().unwrap_or(LogLevel::Info));

    print_banner();

    let run_config = RunConfig::load(&cli.config)
        .with_context(|| format!("failed to load run config {:?}", cli.config))?;
    println!(
        "{}",
        format!(
            "Loaded run '{}' with {} experiments",
            run_config.tag,
            run_config.experiment_configs.len()
        )
        .cyan()
    );

    let provider = JsonDatasetProvider::new();
    let service = PrototypeModelService::new(cli.working_directory.join("models"));
    let options = SweepOptions {
        labelled_dataset_path: cli.labelled_dataset_path,
        unlabelled_dataset_path: cli.unlabelled_dataset_path,
        working_dir: cli.working_directory,
        window_size: cli.window_size,
        max_unlabelled_windows: cli.max_unlabelled_windows,
        labelled_repeat: cli.labelled_repeat,
        fractions: cli.fractions,
        transforms: default_transforms(),
    };

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}").context("invalid progress template")?,
    );
    spinner.set_message("running fraction sweep...");
    spinner.enable_steady_tick(Duration::from_millis(120));

    let artifacts = run_sweep(&run_config, &service, &provider, &options)?;

    spinner.finish_and_clear();
    println!();
    println!(
        "{}",
        format!("Finished {} folds.", artifacts.folds_run).green().bold()
    );
    println!("  Labelled summary:   {}", artifacts.labelled_csv.display());
    println!("  Unlabelled summary: {}", artifacts.unlabelled_csv.display());

    Ok(())
}
