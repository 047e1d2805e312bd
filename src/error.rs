//! Error Handling Module
//!
//! Defines the error taxonomy for the pipeline. Configuration and
//! dependency errors are detected at or before step dispatch; data and
//! model errors fail fast rather than leaving partial state behind.

use thiserror::Error;

use crate::config::ArtifactKind;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid or unresolvable configuration (bad offsets, bad fractions, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// An experiment step requires a previous trained artifact that was never produced
    #[error("Experiment {experiment}: missing dependency: {reason}")]
    MissingDependency { experiment: usize, reason: String },

    /// Attempted to treat an artifact as a kind it is not
    #[error("Artifact kind mismatch: expected {expected}, found '{found}'")]
    ArtifactKindMismatch {
        expected: &'static str,
        found: ArtifactKind,
    },

    /// Dataset-level error (label set mismatch, empty split, shape mismatch)
    #[error("Data error: {0}")]
    Data(String),

    /// Error from the model service (load, fit, predict)
    #[error("Model error: {0}")]
    Model(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
