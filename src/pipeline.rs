//! Sweep Pipeline
//!
//! The outer loops of a run: for each labelled-data fraction, iterate a
//! leave-one-user-out cross-validation over the labelled dataset's
//! users, execute the experiment list per fold, and thread an explicit
//! accumulator through the folds. Each fraction writes its aggregate
//! performance files; the sweep closes with the per-fraction CSV tables.
//!
//! The labelled fraction shrinks the training split by growing the
//! validation split (`validation_fraction = 1 - fraction`), so a sweep
//! point reflects how much labelled data the training stage saw.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::config::RunConfig;
use crate::dataset::transforms::Transform;
use crate::dataset::{DatasetProvider, PrepareRequest, UserSplit};
use crate::error::{PipelineError, Result};
use crate::model::ModelService;
use crate::report::{
    write_performance_file, write_results_summary, PerformanceAccumulator, SweepRow, SweepTable,
};
use crate::training::dispatcher::{ExperimentRunner, FoldInfo, RunnerOptions};

/// Everything a sweep needs beyond the run config
#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub labelled_dataset_path: PathBuf,
    pub unlabelled_dataset_path: PathBuf,
    /// Output root: per-fraction directories plus the sweep CSVs
    pub working_dir: PathBuf,
    pub window_size: usize,
    pub max_unlabelled_windows: Option<usize>,
    pub labelled_repeat: usize,
    /// Labelled-data fractions to sweep (e.g. 0.1 ..= 0.9)
    pub fractions: Vec<f64>,
    /// Transformation tasks for the self-supervised stages
    pub transforms: Vec<Transform>,
}

/// Paths of the sweep-level output tables
#[derive(Debug, Clone)]
pub struct SweepArtifacts {
    pub labelled_csv: PathBuf,
    pub unlabelled_csv: PathBuf,
    pub folds_run: usize,
}

/// Run the full fraction × fold sweep
pub fn run_sweep<M, D>(
    run_config: &RunConfig,
    model_service: &M,
    dataset_provider: &D,
    options: &SweepOptions,
) -> Result<SweepArtifacts>
where
    M: ModelService,
    D: DatasetProvider + ?Sized,
{
    run_config.validate()?;
    if options.fractions.is_empty() {
        return Err(PipelineError::Config(
            "no labelled-data fractions to sweep".to_string(),
        ));
    }

    let users = dataset_provider.list_users(&options.labelled_dataset_path)?;
    if users.is_empty() {
        return Err(PipelineError::Data(format!(
            "labelled dataset {:?} contains no users",
            options.labelled_dataset_path
        )));
    }
    info!(users = users.len(), fractions = options.fractions.len(), "starting sweep");

    let runner = ExperimentRunner::new(
        model_service,
        dataset_provider,
        RunnerOptions {
            unlabelled_dataset_path: options.unlabelled_dataset_path.clone(),
            window_size: options.window_size,
            max_unlabelled_windows: options.max_unlabelled_windows,
            labelled_repeat: options.labelled_repeat,
        },
    );

    let reporting_index = run_config.labelled_eval_experiments.first().copied();
    let mut labelled_table = SweepTable::new();
    let mut unlabelled_table = SweepTable::new();
    let mut folds_run = 0usize;

    for &fraction in &options.fractions {
        let fraction_dir = options
            .working_dir
            .join(format!("labelled_data_percentage_{:.1}", fraction));
        let mut accumulator = PerformanceAccumulator::new(
            users.len(),
            run_config.labelled_eval_experiments.clone(),
        );

        for (fold_index, user) in users.iter().enumerate() {
            info!(
                fraction,
                fold = fold_index,
                user = %user,
                "preparing leave-one-user-out fold"
            );
            let labelled = dataset_provider.prepare(
                &options.labelled_dataset_path,
                &PrepareRequest {
                    window_size: options.window_size,
                    user_split: UserSplit::HoldOutUser(fold_index),
                    validation_fraction: 1.0 - fraction,
                    label_map_override: None,
                },
            )?;

            // Each fold runs on its own copy of the experiment list; the
            // mutated copy is persisted as the fold's run record.
            let mut configs = run_config.experiment_configs.clone();
            let fold = FoldInfo {
                fold: fold_index,
                held_out_user: user.clone(),
                labelled_fraction: fraction,
            };

            let outcome = runner.run_fold(
                &mut configs,
                &labelled,
                &options.transforms,
                &run_config.labelled_eval_experiments,
                &run_config.tag,
                &fold,
            )?;
            if let Some(aborted_at) = outcome.aborted_at {
                warn!(
                    fraction,
                    fold = fold_index,
                    experiment = aborted_at,
                    "fold aborted on missing dependency; continuing with next fold"
                );
            }

            let summary_path =
                fraction_dir.join(format!("{}_{}_results_summary.txt", run_config.tag, user));
            write_results_summary(&summary_path, &configs)?;

            accumulator.add_fold(fold_index, &outcome);
            folds_run += 1;
        }

        let summary = accumulator.finalize();
        write_performance_file(
            &fraction_dir.join("performance_labelled_dataset.txt"),
            &summary.labelled,
        )?;
        write_performance_file(
            &fraction_dir.join("performance_unlabelled_dataset.txt"),
            &summary.unlabelled,
        )?;
        write_performance_file(
            &fraction_dir.join("performance_per_fold.txt"),
            &summary.per_fold,
        )?;

        if let Some(index) = reporting_index {
            if let Some(metrics) = summary.labelled.get(&index) {
                labelled_table.push(SweepRow::new(fraction, metrics));
            }
            if let Some(metrics) = summary.unlabelled.get(&index) {
                unlabelled_table.push(SweepRow::new(fraction, metrics));
            }
        }
    }

    let labelled_csv = options.working_dir.join("F1_labelled_data.csv");
    let unlabelled_csv = options.working_dir.join("F1_unlabelled_data.csv");
    labelled_table.write_csv(&labelled_csv)?;
    unlabelled_table.write_csv(&unlabelled_csv)?;
    info!(folds = folds_run, "sweep complete");

    Ok(SweepArtifacts {
        labelled_csv,
        unlabelled_csv,
        folds_run,
    })
}
