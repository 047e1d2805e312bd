//! Cross-Fold Aggregation and Reporting
//!
//! Collects evaluation results across the leave-one-user-out folds and
//! emits the run's persisted artifacts: per-fold results summaries, the
//! aggregated performance files, and the per-fraction CSV tables.
//!
//! Two confusion-matrix rules coexist deliberately: the designated
//! labelled-evaluation experiment indices get a single matrix pooled
//! from the concatenated true/pred lists across folds, while every other
//! matrix is the elementwise fold sum divided by the fold count. The
//! scalar metrics are always fold-averaged.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::config::ExperimentConfig;
use crate::error::Result;
use crate::training::dispatcher::FoldOutcome;
use crate::utils::metrics::{ConfusionMatrix, EvalReport};

/// Running sums of the scalar metrics plus the summed confusion matrix
#[derive(Debug, Clone, Default)]
struct MetricSums {
    f1_macro: f64,
    f1_micro: f64,
    f1_weighted: f64,
    precision: f64,
    recall: f64,
    kappa: f64,
    confusion: ConfusionMatrix,
}

impl MetricSums {
    fn add(&mut self, report: &EvalReport) {
        self.f1_macro += report.f1_macro;
        self.f1_micro += report.f1_micro;
        self.f1_weighted += report.f1_weighted;
        self.precision += report.precision;
        self.recall += report.recall;
        self.kappa += report.kappa;
        self.confusion.accumulate(&report.confusion_matrix);
    }
}

/// How an aggregated confusion matrix was produced
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ConfusionSummary {
    /// Built from globally pooled true/pred lists across all folds
    Pooled(ConfusionMatrix),
    /// Elementwise fold sum divided by the fold count
    FoldAveraged(Vec<Vec<f64>>),
}

/// Fold-averaged metrics for one experiment index
#[derive(Debug, Clone, Serialize)]
pub struct AggregateMetrics {
    #[serde(rename = "F1 Macro")]
    pub f1_macro: f64,
    #[serde(rename = "F1 Micro")]
    pub f1_micro: f64,
    #[serde(rename = "F1 Weighted")]
    pub f1_weighted: f64,
    #[serde(rename = "Precision")]
    pub precision: f64,
    #[serde(rename = "Recall")]
    pub recall: f64,
    #[serde(rename = "Kappa")]
    pub kappa: f64,
    #[serde(rename = "Confusion Matrix")]
    pub confusion: ConfusionSummary,
}

/// Aggregated results of one labelled-fraction setting
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSummary {
    /// Test-split performance per experiment index
    pub labelled: BTreeMap<usize, AggregateMetrics>,
    /// Unlabelled-pool performance per experiment index
    pub unlabelled: BTreeMap<usize, AggregateMetrics>,
    /// Unlabelled-pool reports per fold, as recorded
    pub per_fold: BTreeMap<usize, BTreeMap<usize, EvalReport>>,
    pub folds: usize,
}

/// Explicit accumulator threaded through the fold loop.
///
/// Fold outcomes are folded in one at a time; `finalize` divides by the
/// expected fold count (folds aborted early contribute nothing to the
/// sums but still count toward the divisor, keeping fold weights equal).
#[derive(Debug, Clone)]
pub struct PerformanceAccumulator {
    total_folds: usize,
    designated: Vec<usize>,
    labelled: BTreeMap<usize, MetricSums>,
    unlabelled: BTreeMap<usize, MetricSums>,
    pooled_true: BTreeMap<usize, Vec<usize>>,
    pooled_pred: BTreeMap<usize, Vec<usize>>,
    per_fold: BTreeMap<usize, BTreeMap<usize, EvalReport>>,
}

impl PerformanceAccumulator {
    pub fn new(total_folds: usize, designated: Vec<usize>) -> Self {
        Self {
            total_folds,
            designated,
            labelled: BTreeMap::new(),
            unlabelled: BTreeMap::new(),
            pooled_true: BTreeMap::new(),
            pooled_pred: BTreeMap::new(),
            per_fold: BTreeMap::new(),
        }
    }

    /// Fold one fold's outcome into the running sums
    pub fn add_fold(&mut self, fold: usize, outcome: &FoldOutcome) {
        for (&index, report) in &outcome.labelled_evals {
            self.labelled.entry(index).or_default().add(report);
        }
        for (&index, report) in &outcome.unlabelled_evals {
            self.unlabelled.entry(index).or_default().add(report);
        }
        for (&index, pooled) in &outcome.pooled {
            self.pooled_true
                .entry(index)
                .or_default()
                .extend_from_slice(&pooled.y_true);
            self.pooled_pred
                .entry(index)
                .or_default()
                .extend_from_slice(&pooled.y_pred);
        }
        if !outcome.unlabelled_evals.is_empty() {
            self.per_fold.insert(fold, outcome.unlabelled_evals.clone());
        }
    }

    /// Average the sums into the final summary
    pub fn finalize(self) -> PerformanceSummary {
        let folds = self.total_folds.max(1);
        let average = |sums: &MetricSums, confusion: ConfusionSummary| AggregateMetrics {
            f1_macro: sums.f1_macro / folds as f64,
            f1_micro: sums.f1_micro / folds as f64,
            f1_weighted: sums.f1_weighted / folds as f64,
            precision: sums.precision / folds as f64,
            recall: sums.recall / folds as f64,
            kappa: sums.kappa / folds as f64,
            confusion,
        };

        let labelled = self
            .labelled
            .iter()
            .map(|(&index, sums)| {
                let confusion = if self.designated.contains(&index) {
                    let y_true = self.pooled_true.get(&index).cloned().unwrap_or_default();
                    let y_pred = self.pooled_pred.get(&index).cloned().unwrap_or_default();
                    let num_classes = sums.confusion.num_classes;
                    ConfusionSummary::Pooled(ConfusionMatrix::from_predictions(
                        &y_pred,
                        &y_true,
                        num_classes,
                    ))
                } else {
                    ConfusionSummary::FoldAveraged(sums.confusion.averaged(folds))
                };
                (index, average(sums, confusion))
            })
            .collect();

        let unlabelled = self
            .unlabelled
            .iter()
            .map(|(&index, sums)| {
                let confusion = ConfusionSummary::FoldAveraged(sums.confusion.averaged(folds));
                (index, average(sums, confusion))
            })
            .collect();

        PerformanceSummary {
            labelled,
            unlabelled,
            per_fold: self.per_fold,
            folds: self.total_folds,
        }
    }
}

/// One row of the per-fraction sweep table
#[derive(Debug, Clone, Serialize)]
pub struct SweepRow {
    #[serde(rename = "labelled data percentage")]
    pub labelled_data_percentage: f64,
    #[serde(rename = "F1 Macro")]
    pub f1_macro: f64,
    #[serde(rename = "F1 Micro")]
    pub f1_micro: f64,
    #[serde(rename = "F1 Weighted")]
    pub f1_weighted: f64,
    #[serde(rename = "Precision")]
    pub precision: f64,
    #[serde(rename = "Recall")]
    pub recall: f64,
    #[serde(rename = "Kappa")]
    pub kappa: f64,
}

impl SweepRow {
    pub fn new(fraction: f64, metrics: &AggregateMetrics) -> Self {
        Self {
            labelled_data_percentage: fraction,
            f1_macro: metrics.f1_macro,
            f1_micro: metrics.f1_micro,
            f1_weighted: metrics.f1_weighted,
            precision: metrics.precision,
            recall: metrics.recall,
            kappa: metrics.kappa,
        }
    }
}

/// Sweep summary keyed by labelled-data fraction
#[derive(Debug, Clone, Default)]
pub struct SweepTable {
    rows: Vec<SweepRow>,
}

impl SweepTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: SweepRow) {
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write the table as CSV with the canonical column set
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)
            .map_err(|e| crate::error::PipelineError::Data(format!("cannot write {:?}: {}", path, e)))?;
        for row in &self.rows {
            writer
                .serialize(row)
                .map_err(|e| crate::error::PipelineError::Data(format!("CSV write failed: {}", e)))?;
        }
        writer
            .flush()
            .map_err(crate::error::PipelineError::Io)?;
        Ok(())
    }
}

/// Persist the fold's final experiment configs as the results summary
pub fn write_results_summary(path: &Path, configs: &[ExperimentConfig]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let structured = serde_json::to_string_pretty(configs)?;
    fs::write(path, structured)?;
    Ok(())
}

/// Persist a serialisable performance record as pretty-printed text
pub fn write_performance_file<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let structured = serde_json::to_string_pretty(record)?;
    fs::write(path, structured)?;
    Ok(())
}
