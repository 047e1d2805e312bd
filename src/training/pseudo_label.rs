//! Pseudo-Labeling for Teacher-Student Self-Training
//!
//! A trained teacher predicts class probabilities over the unlabelled
//! pool; this module turns those predictions into a bounded,
//! class-balanced synthetic training set. Per class, the most confident
//! predictions win; classes with too few confident samples contribute
//! what they have, classes with none contribute nothing.

use ndarray::{Array2, Array3, Axis};
use tracing::debug;

use crate::dataset::one_hot;
use crate::error::{PipelineError, Result};

/// Selection parameters, resolved from the experiment config
#[derive(Debug, Clone, Copy)]
pub struct PseudoLabelOptions {
    /// Keep at most this many samples per predicted class
    pub samples_per_class: usize,
    /// Discard predictions below this confidence
    pub minimum_confidence: f32,
    /// When true, a sample is only a candidate for its argmax class with
    /// its top probability as confidence; when false, every sample is a
    /// candidate for every class, scored by that class's raw probability.
    pub plurality_only: bool,
}

/// The selected pseudo-labelled subset
#[derive(Debug, Clone)]
pub struct PseudoLabelSelection {
    /// Selected windows, grouped by predicted class
    pub x: Array3<f32>,
    /// One-hot labels of the predicted (not ground-truth) class
    pub y: Array2<f32>,
    /// Samples kept per class, for diagnostics
    pub selected_per_class: Vec<usize>,
}

impl PseudoLabelSelection {
    pub fn len(&self) -> usize {
        self.x.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Select the top pseudo-labelled samples per class.
///
/// Within each class, candidates are ranked by descending confidence and
/// truncated to `samples_per_class`; the output concatenates the kept
/// samples class by class.
pub fn select_top_samples(
    windows: &Array3<f32>,
    probabilities: &Array2<f32>,
    options: &PseudoLabelOptions,
) -> Result<PseudoLabelSelection> {
    let n = windows.shape()[0];
    if probabilities.nrows() != n {
        return Err(PipelineError::Data(format!(
            "probabilities ({} rows) do not align with windows ({} rows)",
            probabilities.nrows(),
            n
        )));
    }
    let num_classes = probabilities.ncols();
    if num_classes == 0 {
        return Err(PipelineError::Data(
            "probability matrix has zero classes".to_string(),
        ));
    }

    // Argmax class and top probability per sample, computed once.
    let plurality: Vec<(usize, f32)> = probabilities
        .rows()
        .into_iter()
        .map(|row| {
            row.iter().enumerate().fold((0usize, f32::MIN), |best, (i, &p)| {
                if p > best.1 {
                    (i, p)
                } else {
                    best
                }
            })
        })
        .collect();

    let mut indices: Vec<usize> = Vec::new();
    let mut classes: Vec<usize> = Vec::new();
    let mut selected_per_class = vec![0usize; num_classes];

    for class in 0..num_classes {
        let mut candidates: Vec<(usize, f32)> = if options.plurality_only {
            plurality
                .iter()
                .enumerate()
                .filter(|(_, &(argmax, _))| argmax == class)
                .map(|(sample, &(_, confidence))| (sample, confidence))
                .collect()
        } else {
            (0..n)
                .map(|sample| (sample, probabilities[[sample, class]]))
                .collect()
        };

        candidates.retain(|&(_, confidence)| confidence >= options.minimum_confidence);
        // Descending confidence; index breaks ties for determinism.
        candidates.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        candidates.truncate(options.samples_per_class);

        selected_per_class[class] = candidates.len();
        for (sample, _) in candidates {
            indices.push(sample);
            classes.push(class);
        }
    }

    debug!(
        total = indices.len(),
        per_class = ?selected_per_class,
        threshold = options.minimum_confidence,
        "pseudo-label selection complete"
    );

    Ok(PseudoLabelSelection {
        x: windows.select(Axis(0), &indices),
        y: one_hot(&classes, num_classes),
        selected_per_class,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    fn windows_for(probs: &Array2<f32>) -> Array3<f32> {
        // Window i is constant-valued i, so selected windows are identifiable.
        Array3::from_shape_fn((probs.nrows(), 4, 1), |(i, _, _)| i as f32)
    }

    #[test]
    fn test_single_highest_sample_selected() {
        // Three samples, all predicted class 0 (confidences 0.9, 0.6, 0.95);
        // one slot per class, minimum confidence 0.5.
        let probs = array![[0.9f32, 0.1], [0.6, 0.4], [0.95, 0.05]];
        let windows = windows_for(&probs);
        let options = PseudoLabelOptions {
            samples_per_class: 1,
            minimum_confidence: 0.5,
            plurality_only: true,
        };

        let selection = select_top_samples(&windows, &probs, &options).unwrap();

        // Exactly one class-0 sample (window 2, the 0.95), none for class 1.
        assert_eq!(selection.len(), 1);
        assert_eq!(selection.selected_per_class, vec![1, 0]);
        assert_eq!(selection.x[[0, 0, 0]], 2.0);
        assert_eq!(selection.y[[0, 0]], 1.0);
        assert_eq!(selection.y[[0, 1]], 0.0);
    }

    #[test]
    fn test_per_class_cap() {
        let probs = array![
            [0.9f32, 0.1],
            [0.8, 0.2],
            [0.7, 0.3],
            [0.2, 0.8],
        ];
        let windows = windows_for(&probs);
        let options = PseudoLabelOptions {
            samples_per_class: 2,
            minimum_confidence: 0.0,
            plurality_only: true,
        };

        let selection = select_top_samples(&windows, &probs, &options).unwrap();
        assert_eq!(selection.selected_per_class, vec![2, 1]);
        // Class 0 keeps its two most confident windows, 0 then 1.
        assert_eq!(selection.x[[0, 0, 0]], 0.0);
        assert_eq!(selection.x[[1, 0, 0]], 1.0);
        assert_eq!(selection.x[[2, 0, 0]], 3.0);
    }

    #[test]
    fn test_rank_preserving_truncation() {
        let probs = array![
            [0.95f32, 0.05],
            [0.55, 0.45],
            [0.85, 0.15],
            [0.75, 0.25],
        ];
        let windows = windows_for(&probs);
        let options = PseudoLabelOptions {
            samples_per_class: 2,
            minimum_confidence: 0.5,
            plurality_only: true,
        };

        let selection = select_top_samples(&windows, &probs, &options).unwrap();
        // Kept: windows 0 (0.95) and 2 (0.85); discarded confident
        // samples (0.75, 0.55) are all below the kept minimum.
        assert_eq!(selection.selected_per_class[0], 2);
        let kept: Vec<f32> = (0..2).map(|r| selection.x[[r, 0, 0]]).collect();
        assert_eq!(kept, vec![0.0, 2.0]);
    }

    #[test]
    fn test_minimum_confidence_filters_everything() {
        let probs = array![[0.6f32, 0.4], [0.55, 0.45]];
        let windows = windows_for(&probs);
        let options = PseudoLabelOptions {
            samples_per_class: 10,
            minimum_confidence: 0.9,
            plurality_only: true,
        };

        let selection = select_top_samples(&windows, &probs, &options).unwrap();
        assert!(selection.is_empty());
        assert_eq!(selection.selected_per_class, vec![0, 0]);
    }

    #[test]
    fn test_non_plurality_scores_every_class() {
        // Window 0 is a strong class-0 prediction, but with
        // plurality_only off it is also the best class-1 candidate.
        let probs = array![[0.6f32, 0.4], [0.9, 0.1]];
        let windows = windows_for(&probs);
        let options = PseudoLabelOptions {
            samples_per_class: 1,
            minimum_confidence: 0.0,
            plurality_only: false,
        };

        let selection = select_top_samples(&windows, &probs, &options).unwrap();
        assert_eq!(selection.selected_per_class, vec![1, 1]);
        // Class 0 slot: window 1 (0.9); class 1 slot: window 0 (0.4).
        assert_eq!(selection.x[[0, 0, 0]], 1.0);
        assert_eq!(selection.y[[0, 0]], 1.0);
        assert_eq!(selection.x[[1, 0, 0]], 0.0);
        assert_eq!(selection.y[[1, 1]], 1.0);
    }

    #[test]
    fn test_misaligned_inputs_rejected() {
        let probs = array![[0.9f32, 0.1]];
        let windows = Array3::<f32>::zeros((2, 4, 1));
        let options = PseudoLabelOptions {
            samples_per_class: 1,
            minimum_confidence: 0.0,
            plurality_only: true,
        };
        assert!(select_top_samples(&windows, &probs, &options).is_err());
    }
}
