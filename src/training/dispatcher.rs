//! Experiment Dispatcher
//!
//! The orchestration core: walks the ordered experiment list of one
//! cross-validation fold, resolves each step's dependency on a previous
//! step's artifact, dispatches to the matching training or evaluation
//! flow, and writes artifact paths and evaluation results back into the
//! configs. The mutated config list is the fold's run record.
//!
//! The unlabelled pool is materialised lazily on first use and cached
//! for the remainder of the fold. A missing teacher artifact aborts the
//! remaining experiments of the fold; a missing evaluation target only
//! skips the evaluation step itself.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{error, info, warn};

use crate::config::{ArtifactKind, ExperimentConfig, ExperimentType, RunConfig};
use crate::dataset::multitask::{create_transform_dataset, train_val_split_xy, MultiTaskDataset};
use crate::dataset::transforms::Transform;
use crate::dataset::{
    build_unlabelled_pool, DatasetBundle, DatasetProvider, PoolOptions, UnlabelledCache,
    UnlabelledPool,
};
use crate::error::{PipelineError, Result};
use crate::model::{
    ClassifierHead, FitRequest, FreezeMode, HarHeadSpec, ModelService, OptimizerSpec,
    TrainTargets, FINE_TUNE_FREEZE_LAYERS, FULL_HEAD_UNITS,
};
use crate::training::pseudo_label::{select_top_samples, PseudoLabelOptions};
use crate::training::scheduler::LrSchedule;
use crate::utils::metrics::{argmax_rows, EvalReport};

/// Validation share held out of multi-task and pseudo-label training sets
pub const PRE_TRAIN_VAL_FRACTION: f64 = 0.10;

/// Seed for the deterministic pre-training splits
pub const PRE_TRAIN_SPLIT_SEED: u64 = 42;

/// Run-wide dispatcher options, shared by every fold
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Path handed to the dataset provider for the unlabelled dataset
    pub unlabelled_dataset_path: PathBuf,
    pub window_size: usize,
    /// Cap on the unlabelled pool size
    pub max_unlabelled_windows: Option<usize>,
    /// Times the labelled train windows are appended to the pool
    pub labelled_repeat: usize,
}

/// Identity of the fold being executed, carried into logs and errors
#[derive(Debug, Clone)]
pub struct FoldInfo {
    pub fold: usize,
    pub held_out_user: String,
    pub labelled_fraction: f64,
}

/// Pooled prediction lists for a designated experiment index
#[derive(Debug, Clone, Default)]
pub struct PooledPredictions {
    pub y_true: Vec<usize>,
    pub y_pred: Vec<usize>,
}

/// Everything one fold produced for the aggregator
#[derive(Debug, Clone, Default)]
pub struct FoldOutcome {
    /// Set when a missing dependency aborted the fold at this experiment
    pub aborted_at: Option<usize>,
    /// Held-out test-split evaluations, by experiment index
    pub labelled_evals: BTreeMap<usize, EvalReport>,
    /// Unlabelled-pool evaluations, by experiment index
    pub unlabelled_evals: BTreeMap<usize, EvalReport>,
    /// Pooled true/pred lists for the designated experiment indices
    pub pooled: BTreeMap<usize, PooledPredictions>,
}

/// A resolved dependency: the previous step's persisted artifact
#[derive(Debug, Clone)]
struct PreviousArtifact {
    path: PathBuf,
    kind: ArtifactKind,
}

/// The experiment dispatcher for one run
pub struct ExperimentRunner<'a, M: ModelService, D: DatasetProvider + ?Sized> {
    model_service: &'a M,
    dataset_provider: &'a D,
    options: RunnerOptions,
}

impl<'a, M: ModelService, D: DatasetProvider + ?Sized> ExperimentRunner<'a, M, D> {
    pub fn new(model_service: &'a M, dataset_provider: &'a D, options: RunnerOptions) -> Self {
        Self {
            model_service,
            dataset_provider,
            options,
        }
    }

    /// Execute every experiment of one fold, in order.
    ///
    /// `configs` is mutated in place: resolved defaults, artifact paths
    /// and evaluation results are written back as the steps execute.
    pub fn run_fold(
        &self,
        configs: &mut [ExperimentConfig],
        labelled: &DatasetBundle,
        transforms: &[Transform],
        designated_eval_indices: &[usize],
        file_tag: &str,
        fold: &FoldInfo,
    ) -> Result<FoldOutcome> {
        let run_stamp = ExperimentConfig::timestamp_tag();
        let mut cache = UnlabelledCache::new();
        let mut outcome = FoldOutcome::default();

        for i in 0..configs.len() {
            let experiment_type = configs[i].experiment_type();
            if experiment_type == ExperimentType::None {
                continue;
            }

            info!(
                experiment = i,
                fold = fold.fold,
                user = %fold.held_out_user,
                fraction = fold.labelled_fraction,
                "starting experiment: {}",
                experiment_type
            );

            let previous = self.previous_artifact(configs, i)?;
            let tag = format!("{}_{}_{}", run_stamp, file_tag, configs[i].tag());

            if experiment_type == ExperimentType::EvalHar {
                self.run_eval_har(&mut configs[i], i, previous, labelled, &mut outcome)?;
                continue;
            }

            let step_result = match experiment_type {
                ExperimentType::TransformTrain => self.run_transform_train(
                    &mut configs[i],
                    previous,
                    labelled,
                    transforms,
                    &mut cache,
                    &tag,
                ),
                ExperimentType::HarFullTrain
                | ExperimentType::HarFullFineTune
                | ExperimentType::HarLinearTrain => self.run_har_train(
                    &mut configs[i],
                    experiment_type,
                    previous,
                    labelled,
                    &tag,
                ),
                ExperimentType::SelfTraining | ExperimentType::SelfHar => self
                    .run_self_training(
                        &mut configs[i],
                        i,
                        experiment_type,
                        previous,
                        labelled,
                        transforms,
                        &mut cache,
                        &tag,
                    ),
                ExperimentType::None | ExperimentType::EvalHar => unreachable!(),
            };

            match step_result {
                Ok(()) => {}
                Err(PipelineError::MissingDependency { experiment, reason }) => {
                    // Later steps consume the missing student; abandon the fold.
                    error!(
                        experiment,
                        fold = fold.fold,
                        fraction = fold.labelled_fraction,
                        "aborting fold: {}",
                        reason
                    );
                    outcome.aborted_at = Some(experiment);
                    break;
                }
                Err(other) => return Err(other),
            }

            if configs[i].eval_har() {
                self.evaluate_trained_artifact(
                    configs,
                    i,
                    labelled,
                    &mut cache,
                    designated_eval_indices,
                    &mut outcome,
                )?;
            }
        }

        Ok(outcome)
    }

    /// Resolve step `index`'s dependency to a concrete artifact, if any.
    ///
    /// `None` covers both "no dependency configured" and "dependency
    /// configured but the step never produced an artifact"; callers
    /// that require an artifact treat `None` as a missing dependency.
    fn previous_artifact(
        &self,
        configs: &mut [ExperimentConfig],
        index: usize,
    ) -> Result<Option<PreviousArtifact>> {
        let Some(previous_index) = RunConfig::resolve_previous(configs, index)? else {
            return Ok(None);
        };
        let previous = &configs[previous_index];
        Ok(previous.peek_trained_model_path().map(|path| PreviousArtifact {
            path: path.to_path_buf(),
            kind: previous.peek_trained_model_type(),
        }))
    }

    /// Load a HAR-capable model from an artifact, extracting the HAR
    /// sub-model from composite multi-task artifacts.
    fn load_har_model(&self, artifact: &PreviousArtifact) -> Result<M::Model> {
        match artifact.kind {
            ArtifactKind::HarModel => self.model_service.load(&artifact.path),
            ArtifactKind::TransformWithHarModel => {
                let loaded = self.model_service.load(&artifact.path)?;
                self.model_service.extract_har_head(&loaded)
            }
            other => Err(PipelineError::ArtifactKindMismatch {
                expected: "har_model or transform_with_har_model",
                found: other,
            }),
        }
    }

    fn unlabelled_pool<'c>(
        &self,
        cache: &'c mut UnlabelledCache,
        labelled: &DatasetBundle,
    ) -> Result<&'c UnlabelledPool> {
        let provider = self.dataset_provider;
        let options = PoolOptions {
            labelled_repeat: self.options.labelled_repeat,
            max_windows: self.options.max_unlabelled_windows,
        };
        let path = &self.options.unlabelled_dataset_path;
        let window_size = self.options.window_size;
        cache.get_or_populate(|| {
            build_unlabelled_pool(provider, path, window_size, labelled, &options)
        })
    }

    /// `eval_har` experiment: evaluate a previous step's HAR artifact on
    /// the held-out test split. Skips (logged) when the artifact was
    /// never produced.
    fn run_eval_har(
        &self,
        config: &mut ExperimentConfig,
        index: usize,
        previous: Option<PreviousArtifact>,
        labelled: &DatasetBundle,
        outcome: &mut FoldOutcome,
    ) -> Result<()> {
        let Some(previous) = previous else {
            error!(experiment = index, "evaluation model does not exist; skipping eval_har");
            return Ok(());
        };
        let model = self.load_har_model(&previous)?;
        let batch_size = config.batch_size();
        let pred = self
            .model_service
            .predict(&model, &labelled.test.x, batch_size)?;
        let report = EvalReport::from_probabilities(&pred, &labelled.test.y)?;
        info!(
            experiment = index,
            f1_macro = report.f1_macro,
            kappa = report.kappa,
            "eval_har complete"
        );
        outcome.labelled_evals.insert(index, report.clone());
        config.eval_results = Some(report);
        Ok(())
    }

    /// Self-supervised multi-task pretraining over the unlabelled pool
    fn run_transform_train(
        &self,
        config: &mut ExperimentConfig,
        previous: Option<PreviousArtifact>,
        labelled: &DatasetBundle,
        transforms: &[Transform],
        cache: &mut UnlabelledCache,
        tag: &str,
    ) -> Result<()> {
        let learning_rate = config.initial_learning_rate();
        let epochs = config.epochs();
        let batch_size = config.batch_size();
        let optimizer = OptimizerSpec {
            kind: config.optimizer(),
            learning_rate,
        };

        let core = match &previous {
            None => {
                info!("creating new feature extractor");
                self.model_service.create_core(labelled.input_shape)?
            }
            Some(artifact) => {
                info!("loading previous model {:?}", artifact.path);
                let loaded = self.model_service.load(&artifact.path)?;
                self.model_service.extract_core(&loaded)?
            }
        };

        let task_names: Vec<String> = transforms.iter().map(|t| t.name.to_string()).collect();
        let model =
            self.model_service
                .attach_multitask_head(core, &task_names, None, &optimizer)?;

        let pool = self.unlabelled_pool(cache, labelled)?;
        let dataset = create_transform_dataset(&pool.combined, transforms, None)?;
        let (train, val) = dataset.train_val_split(PRE_TRAIN_VAL_FRACTION, PRE_TRAIN_SPLIT_SEED)?;

        let outcome = self.fit_multitask(
            model,
            &train,
            &val,
            LrSchedule::step_decay(learning_rate),
            epochs,
            batch_size,
            tag,
        )?;

        config.trained_model_path = Some(outcome.best_path);
        config.trained_model_type = Some(ArtifactKind::TransformModel);
        Ok(())
    }

    /// Supervised HAR training in one of the three freeze modes
    fn run_har_train(
        &self,
        config: &mut ExperimentConfig,
        experiment_type: ExperimentType,
        previous: Option<PreviousArtifact>,
        labelled: &DatasetBundle,
        tag: &str,
    ) -> Result<()> {
        let learning_rate = config.initial_learning_rate();
        let epochs = config.epochs();
        let batch_size = config.batch_size();
        let optimizer = OptimizerSpec {
            kind: config.optimizer(),
            learning_rate,
        };

        // Decide whether we start from a bare feature extractor (and
        // attach a fresh head) or from an existing HAR model.
        enum Start<T> {
            Core(T),
            Har(T),
        }

        let start = match &previous {
            None => {
                info!("creating new feature extractor");
                Start::Core(self.model_service.create_core(labelled.input_shape)?)
            }
            Some(artifact) => {
                info!("loading previous model {:?}", artifact.path);
                let loaded = self.model_service.load(&artifact.path)?;
                if experiment_type == ExperimentType::HarLinearTrain {
                    Start::Core(self.model_service.extract_core(&loaded)?)
                } else {
                    match artifact.kind {
                        ArtifactKind::HarModel => Start::Har(loaded),
                        ArtifactKind::TransformWithHarModel => {
                            Start::Har(self.model_service.extract_har_head(&loaded)?)
                        }
                        _ => Start::Core(self.model_service.extract_core(&loaded)?),
                    }
                }
            }
        };

        let model = match start {
            Start::Core(mut core) => {
                let (freeze, head) = match experiment_type {
                    ExperimentType::HarLinearTrain => (FreezeMode::All, ClassifierHead::Linear),
                    ExperimentType::HarFullTrain => (
                        FreezeMode::None,
                        ClassifierHead::Hidden {
                            units: FULL_HEAD_UNITS,
                        },
                    ),
                    ExperimentType::HarFullFineTune => (
                        FreezeMode::FirstLayers(FINE_TUNE_FREEZE_LAYERS),
                        ClassifierHead::Hidden {
                            units: FULL_HEAD_UNITS,
                        },
                    ),
                    _ => unreachable!("not a HAR training type"),
                };
                self.model_service.set_trainability(&mut core, freeze)?;
                self.model_service.attach_classification_head(
                    core,
                    labelled.output_shape,
                    head,
                    &optimizer,
                )?
            }
            Start::Har(mut har) => {
                let freeze = match experiment_type {
                    ExperimentType::HarFullTrain => FreezeMode::None,
                    ExperimentType::HarFullFineTune => {
                        FreezeMode::FirstLayers(FINE_TUNE_FREEZE_LAYERS)
                    }
                    _ => unreachable!("linear probing always restarts from the extractor"),
                };
                self.model_service.set_trainability(&mut har, freeze)?;
                har
            }
        };

        let request = FitRequest {
            train_x: &labelled.train.x,
            train_targets: TrainTargets::Classification(&labelled.train.y),
            val_x: &labelled.val.x,
            val_targets: TrainTargets::Classification(&labelled.val.y),
            schedule: LrSchedule::constant(learning_rate),
            epochs,
            batch_size,
            tag: tag.to_string(),
        };
        let outcome = self.model_service.fit(model, &request)?;

        config.trained_model_path = Some(outcome.best_path);
        config.trained_model_type = Some(ArtifactKind::HarModel);
        Ok(())
    }

    /// Teacher-student self-training (plain distillation or joint
    /// multi-task + HAR pretraining)
    #[allow(clippy::too_many_arguments)]
    fn run_self_training(
        &self,
        config: &mut ExperimentConfig,
        index: usize,
        experiment_type: ExperimentType,
        previous: Option<PreviousArtifact>,
        labelled: &DatasetBundle,
        transforms: &[Transform],
        cache: &mut UnlabelledCache,
        tag: &str,
    ) -> Result<()> {
        let learning_rate = config.initial_learning_rate();
        let epochs = config.epochs();
        let batch_size = config.batch_size();
        let optimizer = OptimizerSpec {
            kind: config.optimizer(),
            learning_rate,
        };

        let Some(previous) = previous else {
            return Err(PipelineError::MissingDependency {
                experiment: index,
                reason: "no previous model for self-training".to_string(),
            });
        };

        let selection_options = PseudoLabelOptions {
            samples_per_class: config.self_training_samples_per_class(),
            minimum_confidence: config.self_training_minimum_confidence(),
            plurality_only: config.self_training_plurality_only(),
        };

        let teacher = self.load_har_model(&previous)?;
        let pool = self.unlabelled_pool(cache, labelled)?;
        let probabilities = self
            .model_service
            .predict(&teacher, &pool.combined, batch_size)?;
        let selection = select_top_samples(&pool.combined, &probabilities, &selection_options)?;
        if selection.is_empty() {
            return Err(PipelineError::Data(
                "pseudo-label selection kept no samples; nothing to train on".to_string(),
            ));
        }
        info!(
            selected = selection.len(),
            per_class = ?selection.selected_per_class,
            "teacher labelled the unlabelled pool"
        );

        let core = self.model_service.create_core(labelled.input_shape)?;
        let schedule = LrSchedule::step_decay(learning_rate);

        let outcome = if experiment_type == ExperimentType::SelfTraining {
            let student = self.model_service.attach_classification_head(
                core,
                labelled.output_shape,
                ClassifierHead::Hidden {
                    units: FULL_HEAD_UNITS,
                },
                &optimizer,
            )?;
            let ((train_x, train_y), (val_x, val_y)) = train_val_split_xy(
                &selection.x,
                &selection.y,
                PRE_TRAIN_VAL_FRACTION,
                PRE_TRAIN_SPLIT_SEED,
            )?;
            let request = FitRequest {
                train_x: &train_x,
                train_targets: TrainTargets::Classification(&train_y),
                val_x: &val_x,
                val_targets: TrainTargets::Classification(&val_y),
                schedule,
                epochs,
                batch_size,
                tag: tag.to_string(),
            };
            self.model_service.fit(student, &request)?
        } else {
            let task_names: Vec<String> = transforms.iter().map(|t| t.name.to_string()).collect();
            let student = self.model_service.attach_multitask_head(
                core,
                &task_names,
                Some(HarHeadSpec {
                    num_classes: labelled.output_shape,
                    units: FULL_HEAD_UNITS,
                }),
                &optimizer,
            )?;
            let dataset = create_transform_dataset(&selection.x, transforms, Some(&selection.y))?;
            let (train, val) =
                dataset.train_val_split(PRE_TRAIN_VAL_FRACTION, PRE_TRAIN_SPLIT_SEED)?;
            self.fit_multitask(student, &train, &val, schedule, epochs, batch_size, tag)?
        };

        config.trained_model_path = Some(outcome.best_path);
        config.trained_model_type = Some(if experiment_type == ExperimentType::SelfTraining {
            ArtifactKind::HarModel
        } else {
            ArtifactKind::TransformWithHarModel
        });
        Ok(())
    }

    fn fit_multitask(
        &self,
        model: M::Model,
        train: &MultiTaskDataset,
        val: &MultiTaskDataset,
        schedule: LrSchedule,
        epochs: usize,
        batch_size: usize,
        tag: &str,
    ) -> Result<crate::model::FitOutcome> {
        let train_tasks = train.split_task_labels();
        let val_tasks = val.split_task_labels();
        let request = FitRequest {
            train_x: &train.x,
            train_targets: TrainTargets::MultiTask {
                tasks: &train_tasks,
                har: train.har_labels.as_ref(),
            },
            val_x: &val.x,
            val_targets: TrainTargets::MultiTask {
                tasks: &val_tasks,
                har: val.har_labels.as_ref(),
            },
            schedule,
            epochs,
            batch_size,
            tag: tag.to_string(),
        };
        self.model_service.fit(model, &request)
    }

    /// Post-step evaluation of the step's own artifact (the `eval_har`
    /// flag). Designated experiment indices additionally feed the pooled
    /// prediction lists and, when the pool carries ground truth, the
    /// unlabelled-pool evaluation.
    fn evaluate_trained_artifact(
        &self,
        configs: &mut [ExperimentConfig],
        index: usize,
        labelled: &DatasetBundle,
        cache: &mut UnlabelledCache,
        designated_eval_indices: &[usize],
        outcome: &mut FoldOutcome,
    ) -> Result<()> {
        let kind = configs[index].trained_model_type();
        let artifact = match configs[index].peek_trained_model_path() {
            Some(path) => PreviousArtifact {
                path: path.to_path_buf(),
                kind,
            },
            None => {
                warn!(experiment = index, "eval_har flag set but the step produced no artifact");
                return Ok(());
            }
        };
        let model = match kind {
            ArtifactKind::HarModel | ArtifactKind::TransformWithHarModel => {
                self.load_har_model(&artifact)?
            }
            // Transform-only artifacts have no HAR output to evaluate.
            _ => return Ok(()),
        };

        let batch_size = configs[index].batch_size();
        let pred = self
            .model_service
            .predict(&model, &labelled.test.x, batch_size)?;
        let report = EvalReport::from_probabilities(&pred, &labelled.test.y)?;
        info!(
            experiment = index,
            f1_macro = report.f1_macro,
            kappa = report.kappa,
            "post-training evaluation complete"
        );

        if designated_eval_indices.contains(&index) {
            let pooled = outcome.pooled.entry(index).or_default();
            pooled.y_true.extend(argmax_rows(&labelled.test.y));
            pooled.y_pred.extend(argmax_rows(&pred));

            let pool = self.unlabelled_pool(cache, labelled)?;
            if let Some(pool_labels) = pool.labels.clone() {
                let pool_windows = pool.windows.clone();
                let pool_pred = self
                    .model_service
                    .predict(&model, &pool_windows, batch_size)?;
                let pool_report = EvalReport::from_probabilities(&pool_pred, &pool_labels)?;
                outcome.unlabelled_evals.insert(index, pool_report);
            }
        }

        outcome.labelled_evals.insert(index, report.clone());
        configs[index].eval_results = Some(report);
        Ok(())
    }
}
