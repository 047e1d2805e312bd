//! Metrics Module for Model Evaluation
//!
//! Provides the evaluation metrics reported for HAR classifiers:
//! - F1-score (macro, micro and support-weighted averages)
//! - Macro-averaged precision and recall
//! - Cohen's kappa
//! - Confusion matrix
//!
//! Serialized field names match the report format consumed downstream
//! (`"F1 Macro"`, `"Kappa"`, ...), so an `EvalReport` written into a
//! results summary is the persisted evaluation record.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Evaluation results for a single model on a single dataset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    #[serde(rename = "F1 Macro")]
    pub f1_macro: f64,

    #[serde(rename = "F1 Micro")]
    pub f1_micro: f64,

    #[serde(rename = "F1 Weighted")]
    pub f1_weighted: f64,

    /// Macro-averaged precision
    #[serde(rename = "Precision")]
    pub precision: f64,

    /// Macro-averaged recall
    #[serde(rename = "Recall")]
    pub recall: f64,

    #[serde(rename = "Kappa")]
    pub kappa: f64,

    #[serde(rename = "Confusion Matrix")]
    pub confusion_matrix: ConfusionMatrix,
}

impl EvalReport {
    /// Evaluate predicted class probabilities against one-hot ground truth.
    ///
    /// Both arrays must be `[N, num_classes]` with matching shapes; the
    /// class count is taken from the ground-truth width so the report is
    /// comparable across folds of the same label map.
    pub fn from_probabilities(pred: &Array2<f32>, truth: &Array2<f32>) -> Result<Self> {
        if pred.dim() != truth.dim() {
            return Err(PipelineError::Data(format!(
                "prediction shape {:?} does not match ground truth shape {:?}",
                pred.dim(),
                truth.dim()
            )));
        }
        let predictions = argmax_rows(pred);
        let ground_truth = argmax_rows(truth);
        Ok(Self::from_predictions(
            &predictions,
            &ground_truth,
            truth.ncols(),
        ))
    }

    /// Evaluate predicted class indices against ground-truth class indices
    pub fn from_predictions(
        predictions: &[usize],
        ground_truth: &[usize],
        num_classes: usize,
    ) -> Self {
        let cm = ConfusionMatrix::from_predictions(predictions, ground_truth, num_classes);
        Self::from_confusion_matrix(cm)
    }

    /// Derive every scalar metric from a confusion matrix
    pub fn from_confusion_matrix(cm: ConfusionMatrix) -> Self {
        let total = cm.total();
        if total == 0 {
            return Self {
                confusion_matrix: cm,
                ..Default::default()
            };
        }

        let row_sums = cm.row_sums();
        let col_sums = cm.col_sums();

        // Average over classes that appear in either the truth or the
        // predictions; classes absent from both carry no signal.
        let mut macro_precision = 0.0;
        let mut macro_recall = 0.0;
        let mut macro_f1 = 0.0;
        let mut weighted_f1 = 0.0;
        let mut observed_classes = 0usize;

        for class in 0..cm.num_classes {
            let support = row_sums[class];
            let predicted = col_sums[class];
            if support == 0 && predicted == 0 {
                continue;
            }
            observed_classes += 1;

            let tp = cm.get(class, class) as f64;
            let precision = if predicted > 0 { tp / predicted as f64 } else { 0.0 };
            let recall = if support > 0 { tp / support as f64 } else { 0.0 };
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };

            macro_precision += precision;
            macro_recall += recall;
            macro_f1 += f1;
            weighted_f1 += f1 * support as f64;
        }

        let n = observed_classes.max(1) as f64;
        let accuracy = cm.correct() as f64 / total as f64;

        Self {
            f1_macro: macro_f1 / n,
            // Single-label multi-class: micro precision, recall and F1
            // all collapse to overall accuracy.
            f1_micro: accuracy,
            f1_weighted: weighted_f1 / total as f64,
            precision: macro_precision / n,
            recall: macro_recall / n,
            kappa: cm.cohen_kappa(),
            confusion_matrix: cm,
        }
    }
}

/// Row-wise argmax of a probability matrix
pub fn argmax_rows(probs: &Array2<f32>) -> Vec<usize> {
    probs
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(i, _)| i)
                .unwrap_or(0)
        })
        .collect()
}

/// Confusion Matrix for multi-class classification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// Number of classes
    pub num_classes: usize,

    /// Matrix data (row = actual, column = predicted), row-major
    pub matrix: Vec<usize>,
}

impl ConfusionMatrix {
    /// Create a new empty confusion matrix
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![0; num_classes * num_classes],
        }
    }

    /// Build a confusion matrix from predicted and actual class indices
    pub fn from_predictions(
        predictions: &[usize],
        ground_truth: &[usize],
        num_classes: usize,
    ) -> Self {
        let mut cm = Self::new(num_classes);
        for (&pred, &actual) in predictions.iter().zip(ground_truth.iter()) {
            cm.add(actual, pred);
        }
        cm
    }

    /// Record a single prediction
    pub fn add(&mut self, actual: usize, predicted: usize) {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted] += 1;
        }
    }

    /// Count at (actual, predicted)
    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted]
        } else {
            0
        }
    }

    /// Total number of recorded predictions
    pub fn total(&self) -> usize {
        self.matrix.iter().sum()
    }

    /// Diagonal sum: number of correct predictions
    pub fn correct(&self) -> usize {
        (0..self.num_classes).map(|i| self.get(i, i)).sum()
    }

    /// Overall accuracy
    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total > 0 {
            self.correct() as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Row sums (actual class counts)
    pub fn row_sums(&self) -> Vec<usize> {
        (0..self.num_classes)
            .map(|row| (0..self.num_classes).map(|col| self.get(row, col)).sum())
            .collect()
    }

    /// Column sums (predicted class counts)
    pub fn col_sums(&self) -> Vec<usize> {
        (0..self.num_classes)
            .map(|col| (0..self.num_classes).map(|row| self.get(row, col)).sum())
            .collect()
    }

    /// Cohen's kappa: agreement corrected for chance
    pub fn cohen_kappa(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let n = total as f64;
        let po = self.correct() as f64 / n;
        let pe = self
            .row_sums()
            .iter()
            .zip(self.col_sums().iter())
            .map(|(&r, &c)| (r as f64 / n) * (c as f64 / n))
            .sum::<f64>();
        if (1.0 - pe).abs() < f64::EPSILON {
            return 0.0;
        }
        (po - pe) / (1.0 - pe)
    }

    /// Elementwise addition of another matrix, growing if the other is wider.
    ///
    /// Used when summing confusion matrices across cross-validation folds;
    /// folds over the same label map always have identical widths.
    pub fn accumulate(&mut self, other: &ConfusionMatrix) {
        if other.num_classes > self.num_classes {
            let mut grown = ConfusionMatrix::new(other.num_classes);
            for row in 0..self.num_classes {
                for col in 0..self.num_classes {
                    grown.matrix[row * grown.num_classes + col] = self.get(row, col);
                }
            }
            *self = grown;
        }
        for row in 0..other.num_classes {
            for col in 0..other.num_classes {
                self.matrix[row * self.num_classes + col] += other.get(row, col);
            }
        }
    }

    /// The matrix scaled by `1 / divisor`, as nested rows of floats
    pub fn averaged(&self, divisor: usize) -> Vec<Vec<f64>> {
        let d = divisor.max(1) as f64;
        (0..self.num_classes)
            .map(|row| {
                (0..self.num_classes)
                    .map(|col| self.get(row, col) as f64 / d)
                    .collect()
            })
            .collect()
    }
}

impl std::fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Confusion Matrix (rows=actual, cols=predicted):")?;
        for row in 0..self.num_classes {
            for col in 0..self.num_classes {
                write!(f, "{:>6}", self.get(row, col))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
