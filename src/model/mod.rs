//! Trainable Model Service Interface
//!
//! The pipeline treats models as opaque handles behind the
//! [`ModelService`] trait: it composes feature extractors with
//! classification or multi-task heads, freezes layers, trains, predicts
//! and persists, without knowing the numeric framework underneath.
//! Artifacts are identified by filesystem path plus the kind tag kept in
//! the experiment config; they are write-once and never mutated
//! (fine-tuning always produces a new artifact).
//!
//! `prototype` ships a deliberately small reference backend used by the
//! binary and the test suite; neural backends implement the same trait
//! out of crate.

use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::config::OptimizerKind;
use crate::error::Result;
use crate::training::scheduler::LrSchedule;

pub mod prototype;

/// Hidden-layer width of the full HAR classification head
pub const FULL_HEAD_UNITS: usize = 1024;

/// Number of leading extractor layers frozen by fine-tuning
pub const FINE_TUNE_FREEZE_LAYERS: usize = 5;

/// Which part of the feature extractor stays trainable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreezeMode {
    /// Every layer trains
    None,
    /// The first `n` layers are frozen, the rest train
    FirstLayers(usize),
    /// The whole extractor is frozen (linear probing)
    All,
}

/// Shape of a classification head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassifierHead {
    /// Single linear layer + softmax
    Linear,
    /// Hidden ReLU layer of the given width, then linear + softmax
    Hidden { units: usize },
}

/// Optimizer selection plus initial learning rate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSpec {
    pub kind: OptimizerKind,
    pub learning_rate: f64,
}

/// Specification of the optional HAR head on a multi-task model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarHeadSpec {
    pub num_classes: usize,
    pub units: usize,
}

/// Training targets for a fit call
#[derive(Debug, Clone, Copy)]
pub enum TrainTargets<'a> {
    /// One-hot class labels for a single classification output
    Classification(&'a Array2<f32>),
    /// Per-task binary labels (by head name), plus the optional HAR head
    MultiTask {
        tasks: &'a [(String, Array1<f32>)],
        har: Option<&'a Array2<f32>>,
    },
}

/// A complete training request
#[derive(Debug, Clone)]
pub struct FitRequest<'a> {
    pub train_x: &'a Array3<f32>,
    pub train_targets: TrainTargets<'a>,
    pub val_x: &'a Array3<f32>,
    pub val_targets: TrainTargets<'a>,
    pub schedule: LrSchedule,
    pub epochs: usize,
    pub batch_size: usize,
    /// Stem for the persisted artifact file names
    pub tag: String,
}

/// Paths of the artifacts a fit call produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitOutcome {
    /// Checkpoint with the best validation score
    pub best_path: PathBuf,
    /// Checkpoint from the final epoch
    pub last_path: PathBuf,
}

/// The trainable-model capability set consumed by the dispatcher
pub trait ModelService {
    /// Opaque model handle
    type Model;

    /// A freshly initialised feature extractor for the given input shape
    fn create_core(&self, input_shape: (usize, usize)) -> Result<Self::Model>;

    /// Load a persisted artifact
    fn load(&self, path: &Path) -> Result<Self::Model>;

    /// The feature-extractor sub-model of a composite model
    fn extract_core(&self, model: &Self::Model) -> Result<Self::Model>;

    /// The HAR classifier sub-model of a composite multi-task model.
    ///
    /// Fails when the model carries no HAR output.
    fn extract_har_head(&self, model: &Self::Model) -> Result<Self::Model>;

    /// Set which extractor layers remain trainable
    fn set_trainability(&self, model: &mut Self::Model, freeze: FreezeMode) -> Result<()>;

    /// Attach a classification head to a feature extractor
    fn attach_classification_head(
        &self,
        core: Self::Model,
        num_classes: usize,
        head: ClassifierHead,
        optimizer: &OptimizerSpec,
    ) -> Result<Self::Model>;

    /// Attach one binary head per task, plus an optional HAR head
    fn attach_multitask_head(
        &self,
        core: Self::Model,
        tasks: &[String],
        har_head: Option<HarHeadSpec>,
        optimizer: &OptimizerSpec,
    ) -> Result<Self::Model>;

    /// Class probabilities for a batch of windows
    fn predict(&self, model: &Self::Model, x: &Array3<f32>, batch_size: usize)
        -> Result<Array2<f32>>;

    /// Train the model and persist best/last checkpoints
    fn fit(&self, model: Self::Model, request: &FitRequest<'_>) -> Result<FitOutcome>;
}
