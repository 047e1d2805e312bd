//! # HAR Semi-Supervised Learning Pipeline
//!
//! A Rust library for semi-supervised human activity recognition from
//! wearable sensor data. A declarative experiment list drives a chain of
//! training stages (supervised baselines, self-supervised multi-task
//! pretraining over unlabelled windows, teacher-student self-training),
//! evaluated with leave-one-user-out cross-validation across a sweep of
//! labelled-data fractions.
//!
//! ## Features
//!
//! - **Experiment chaining** through backward config references: each
//!   step can consume the trained artifact of an earlier step
//! - **Self-supervised pretraining** on transform-discrimination tasks
//!   over a lazily materialised unlabelled pool
//! - **Teacher-student self-training** with confidence-based,
//!   class-balanced pseudo-label selection
//! - **Cross-validation reporting**: fold-averaged metrics, pooled
//!   confusion matrices and per-fraction CSV summaries
//!
//! ## Modules
//!
//! - `config`: the declarative run document and its defaulting rules
//! - `dataset`: windowed datasets, the unlabelled pool, transformation
//!   registry and the multi-task label builder
//! - `model`: the trainable-model service interface and the prototype
//!   reference backend
//! - `training`: the experiment dispatcher, pseudo-labeling and
//!   learning-rate schedules
//! - `pipeline`: the fraction × fold sweep
//! - `report`: cross-fold aggregation and persisted run artifacts
//! - `utils`: logging and evaluation metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use har_ssl::config::RunConfig;
//! use har_ssl::dataset::loader::JsonDatasetProvider;
//! use har_ssl::model::prototype::PrototypeModelService;
//! use har_ssl::pipeline::{run_sweep, SweepOptions};
//!
//! let run_config = RunConfig::load("configs/self_har.json".as_ref())?;
//! let provider = JsonDatasetProvider::new();
//! let service = PrototypeModelService::new("run/models");
//! // ... build SweepOptions and run
//! ```

pub mod config;
pub mod dataset;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use config::{ArtifactKind, ExperimentConfig, ExperimentType, OptimizerKind, RunConfig};
pub use dataset::{DatasetBundle, DatasetProvider, LabelMap, UnlabelledCache, WindowedDataset};
pub use error::{PipelineError, Result};
pub use model::ModelService;
pub use pipeline::{run_sweep, SweepOptions};
pub use report::PerformanceAccumulator;
pub use training::dispatcher::{ExperimentRunner, FoldOutcome};
pub use training::pseudo_label::{select_top_samples, PseudoLabelOptions};
pub use utils::metrics::{ConfusionMatrix, EvalReport};

/// Default sliding-window length in samples (4 seconds at 13 Hz)
pub const DEFAULT_WINDOW_SIZE: usize = 52;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
