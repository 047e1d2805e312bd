//! Experiment Configuration Module
//!
//! A run is driven by a declarative JSON document: a run tag plus an
//! ordered list of experiment configs. Missing fields are filled with
//! fixed defaults on first access (memoised back into the config, with
//! an informational notice), mirroring how the configs behave as the
//! persisted run record: each step writes its trained artifact path and
//! evaluation results back into its own entry.
//!
//! Dependencies between steps are expressed as backward offsets into the
//! same list (`previous_config_offset`, 0 = no dependency). Offsets are
//! validated statically before any training begins.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::utils::metrics::EvalReport;

/// Default initial learning rate for all training experiment types
pub const DEFAULT_LEARNING_RATE: f64 = 0.0003;

/// Default number of training epochs
pub const DEFAULT_EPOCHS: usize = 30;

/// Default training batch size
pub const DEFAULT_BATCH_SIZE: usize = 300;

/// Default cap on pseudo-labelled samples kept per class
pub const DEFAULT_SAMPLES_PER_CLASS: usize = 10_000;

/// The kind of experiment a config entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentType {
    /// Placeholder entry, skipped by the dispatcher
    None,
    /// Self-supervised multi-task pretraining on the unlabelled pool
    TransformTrain,
    /// Supervised HAR training with every layer trainable
    HarFullTrain,
    /// Supervised HAR training with the earliest extractor layers frozen
    HarFullFineTune,
    /// Linear probe: extractor fully frozen, single linear head
    HarLinearTrain,
    /// Teacher-student distillation onto a fresh classifier
    SelfTraining,
    /// Teacher-student distillation with joint multi-task + HAR heads
    SelfHar,
    /// Evaluate a previous step's HAR artifact on the held-out test split
    EvalHar,
}

impl std::fmt::Display for ExperimentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::TransformTrain => "transform_train",
            Self::HarFullTrain => "har_full_train",
            Self::HarFullFineTune => "har_full_fine_tune",
            Self::HarLinearTrain => "har_linear_train",
            Self::SelfTraining => "self_training",
            Self::SelfHar => "self_har",
            Self::EvalHar => "eval_har",
        };
        write!(f, "{}", s)
    }
}

/// Optimizer selection for a training step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

impl std::fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adam => write!(f, "adam"),
            Self::Sgd => write!(f, "sgd"),
        }
    }
}

/// Type tag of a persisted trained artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// No artifact produced yet
    Unknown,
    /// A HAR classifier (feature extractor + classification head)
    HarModel,
    /// A multi-task transform-discrimination model
    TransformModel,
    /// A multi-task model carrying an additional HAR head
    TransformWithHarModel,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::HarModel => "har_model",
            Self::TransformModel => "transform_model",
            Self::TransformWithHarModel => "transform_with_har_model",
        };
        write!(f, "{}", s)
    }
}

/// A single experiment entry.
///
/// All fields are optional in the JSON document; accessors fill in the
/// documented defaults on first use. `trained_model_path`,
/// `trained_model_type` and `eval_results` are written by the dispatcher
/// once the step completes and are never overwritten afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub experiment_type: Option<ExperimentType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Backward offset to the step whose artifact this step consumes (0 = none)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_config_offset: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_learning_rate: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub epochs: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<OptimizerKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_training_samples_per_class: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_training_minimum_confidence: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_training_plurality_only: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trained_model_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trained_model_type: Option<ArtifactKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_results: Option<EvalReport>,

    /// Evaluate this step's own artifact on the test split after training
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_har: Option<bool>,
}

/// Fill a missing field with its default, memoise it, and emit a notice.
fn resolve_with<T, F>(slot: &mut Option<T>, name: &str, default: F) -> T
where
    T: Clone + std::fmt::Debug,
    F: FnOnce() -> T,
{
    match slot {
        Some(value) => value.clone(),
        None => {
            let value = default();
            info!("configuration '{}' set to default value: {:?}", name, value);
            *slot = Some(value.clone());
            value
        }
    }
}

impl ExperimentConfig {
    /// Current local time formatted the way run tags are stamped
    pub fn timestamp_tag() -> String {
        Local::now().format("%Y%m%d-%H%M%S").to_string()
    }

    pub fn experiment_type(&mut self) -> ExperimentType {
        resolve_with(&mut self.experiment_type, "type", || ExperimentType::None)
    }

    pub fn tag(&mut self) -> String {
        resolve_with(&mut self.tag, "tag", Self::timestamp_tag)
    }

    pub fn previous_config_offset(&mut self) -> usize {
        resolve_with(&mut self.previous_config_offset, "previous_config_offset", || 0)
    }

    pub fn initial_learning_rate(&mut self) -> f64 {
        resolve_with(&mut self.initial_learning_rate, "initial_learning_rate", || {
            DEFAULT_LEARNING_RATE
        })
    }

    pub fn epochs(&mut self) -> usize {
        resolve_with(&mut self.epochs, "epochs", || DEFAULT_EPOCHS)
    }

    pub fn batch_size(&mut self) -> usize {
        resolve_with(&mut self.batch_size, "batch_size", || DEFAULT_BATCH_SIZE)
    }

    pub fn optimizer(&mut self) -> OptimizerKind {
        resolve_with(&mut self.optimizer, "optimizer", || OptimizerKind::Adam)
    }

    pub fn self_training_samples_per_class(&mut self) -> usize {
        resolve_with(
            &mut self.self_training_samples_per_class,
            "self_training_samples_per_class",
            || DEFAULT_SAMPLES_PER_CLASS,
        )
    }

    pub fn self_training_minimum_confidence(&mut self) -> f32 {
        resolve_with(
            &mut self.self_training_minimum_confidence,
            "self_training_minimum_confidence",
            || 0.0,
        )
    }

    pub fn self_training_plurality_only(&mut self) -> bool {
        resolve_with(
            &mut self.self_training_plurality_only,
            "self_training_plurality_only",
            || true,
        )
    }

    pub fn trained_model_type(&mut self) -> ArtifactKind {
        resolve_with(&mut self.trained_model_type, "trained_model_type", || {
            ArtifactKind::Unknown
        })
    }

    pub fn eval_results(&mut self) -> EvalReport {
        resolve_with(&mut self.eval_results, "eval_results", EvalReport::default)
    }

    pub fn eval_har(&mut self) -> bool {
        resolve_with(&mut self.eval_har, "eval_har", || false)
    }

    /// The trained artifact path, without memoising a default.
    ///
    /// Returns `None` when the step never produced an artifact (unset or
    /// empty path); this is the check consumers use before depending on
    /// a step.
    pub fn peek_trained_model_path(&self) -> Option<&Path> {
        match &self.trained_model_path {
            Some(path) if !path.as_os_str().is_empty() => Some(path),
            _ => None,
        }
    }

    /// The artifact kind as recorded, without memoising a default
    pub fn peek_trained_model_type(&self) -> ArtifactKind {
        self.trained_model_type.unwrap_or(ArtifactKind::Unknown)
    }
}

fn default_labelled_eval_experiments() -> Vec<usize> {
    vec![2, 3]
}

/// The declarative run document: `{ "tag": ..., "experiment_configs": [...] }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Tag prefixed to every artifact and summary produced by the run
    pub tag: String,

    /// Ordered experiment list; order defines the dependency indexing
    pub experiment_configs: Vec<ExperimentConfig>,

    /// Experiment indices whose labelled-test confusion matrix is pooled
    /// across folds instead of fold-averaged
    #[serde(default = "default_labelled_eval_experiments")]
    pub labelled_eval_experiments: Vec<usize>,
}

impl RunConfig {
    /// Load and validate a run config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Static validation pass, run before any training begins.
    ///
    /// Every `previous_config_offset` must point strictly backward within
    /// the list; forward or self references are configuration errors.
    pub fn validate(&self) -> Result<()> {
        for (i, config) in self.experiment_configs.iter().enumerate() {
            let offset = config.previous_config_offset.unwrap_or(0);
            if offset > i {
                return Err(PipelineError::Config(format!(
                    "experiment {}: previous_config_offset {} points outside the preceding steps",
                    i, offset
                )));
            }
        }
        for &index in &self.labelled_eval_experiments {
            if index >= self.experiment_configs.len() {
                return Err(PipelineError::Config(format!(
                    "labelled_eval_experiments index {} exceeds the experiment list (len {})",
                    index,
                    self.experiment_configs.len()
                )));
            }
        }
        Ok(())
    }

    /// Resolve the dependency of step `index`: `None` when the offset is 0.
    ///
    /// Assumes `validate` has run; an out-of-range offset here is a
    /// configuration error.
    pub fn resolve_previous(
        configs: &mut [ExperimentConfig],
        index: usize,
    ) -> Result<Option<usize>> {
        let offset = configs[index].previous_config_offset();
        if offset == 0 {
            return Ok(None);
        }
        index
            .checked_sub(offset)
            .map(Some)
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "experiment {}: previous_config_offset {} points outside the preceding steps",
                    index, offset
                ))
            })
    }
}
