//! Multi-task dataset construction for transform-discrimination training
//!
//! For T transformation tasks over N windows, the builder materialises a
//! shared feature array of N·(T+1) windows laid out in blocks:
//! the originals first, then one block per transformation. Every task
//! owns one binary label column, aligned index-for-index with the shared
//! feature array: rows of block t carry a 1 in column t and 0 elsewhere,
//! rows of the original block are all-zero.
//!
//! Optional passthrough labels (ground-truth or pseudo HAR targets) are
//! replicated per block so each transformed copy keeps its source
//! window's label, which is what joint multi-head training consumes.

use ndarray::{concatenate, Array1, Array2, Array3, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::dataset::transforms::Transform;
use crate::error::{PipelineError, Result};

/// A multi-task dataset: shared features with per-task binary labels
#[derive(Debug, Clone)]
pub struct MultiTaskDataset {
    /// `[N·(T+1), W, C]` shared feature array
    pub x: Array3<f32>,
    /// Task names, one per transformation, in head order
    pub task_names: Vec<String>,
    /// `[N·(T+1), T]` binary task labels
    pub task_labels: Array2<f32>,
    /// Optional aligned HAR labels `[N·(T+1), num_classes]`
    pub har_labels: Option<Array2<f32>>,
}

impl MultiTaskDataset {
    pub fn len(&self) -> usize {
        self.x.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The per-task label vectors in declaration order, keyed by task name
    pub fn split_task_labels(&self) -> Vec<(String, Array1<f32>)> {
        self.task_names
            .iter()
            .enumerate()
            .map(|(t, name)| (name.clone(), self.task_labels.column(t).to_owned()))
            .collect()
    }

    /// Deterministic train/validation split.
    ///
    /// A single shuffled index set (seeded ChaCha8) is applied to the
    /// feature array and every label array, so task and HAR labels stay
    /// aligned across the partition. Same seed, same partition.
    pub fn train_val_split(&self, test_size: f64, random_seed: u64) -> Result<(Self, Self)> {
        let (train_idx, val_idx) = split_indices(self.len(), test_size, random_seed)?;

        let take = |indices: &[usize]| -> Self {
            Self {
                x: self.x.select(Axis(0), indices),
                task_names: self.task_names.clone(),
                task_labels: self.task_labels.select(Axis(0), indices),
                har_labels: self
                    .har_labels
                    .as_ref()
                    .map(|har| har.select(Axis(0), indices)),
            }
        };

        Ok((take(&train_idx), take(&val_idx)))
    }
}

/// Build the multi-task transform-discrimination dataset.
///
/// `other_labels`, when present, must align with `windows` and is
/// replicated into every block.
pub fn create_transform_dataset(
    windows: &Array3<f32>,
    transforms: &[Transform],
    other_labels: Option<&Array2<f32>>,
) -> Result<MultiTaskDataset> {
    let task_names: Vec<String> = transforms.iter().map(|t| t.name.to_string()).collect();
    {
        let mut seen = std::collections::HashSet::new();
        for name in &task_names {
            if !seen.insert(name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "duplicate transform task name '{}'",
                    name
                )));
            }
        }
    }

    let n = windows.shape()[0];
    if let Some(labels) = other_labels {
        if labels.nrows() != n {
            return Err(PipelineError::Data(format!(
                "passthrough labels ({} rows) do not align with windows ({} rows)",
                labels.nrows(),
                n
            )));
        }
    }

    let tasks = transforms.len();
    let blocks = tasks + 1;

    let mut x_blocks: Vec<Array3<f32>> = Vec::with_capacity(blocks);
    x_blocks.push(windows.clone());
    for transform in transforms {
        x_blocks.push(transform.apply(windows));
    }

    let mut task_labels = Array2::<f32>::zeros((n * blocks, tasks));
    for t in 0..tasks {
        let block = t + 1;
        task_labels
            .slice_mut(ndarray::s![block * n..(block + 1) * n, t])
            .fill(1.0);
    }

    let x_views: Vec<_> = x_blocks.iter().map(|b| b.view()).collect();
    let x = concatenate(Axis(0), &x_views)
        .map_err(|e| PipelineError::Data(format!("failed to stack transform blocks: {}", e)))?;

    let har_labels = match other_labels {
        Some(labels) => {
            let views: Vec<_> = (0..blocks).map(|_| labels.view()).collect();
            Some(concatenate(Axis(0), &views).map_err(|e| {
                PipelineError::Data(format!("failed to replicate passthrough labels: {}", e))
            })?)
        }
        None => None,
    };

    Ok(MultiTaskDataset {
        x,
        task_names,
        task_labels,
        har_labels,
    })
}

/// Deterministic train/validation split of a plain `(x, y)` dataset
pub fn train_val_split_xy(
    x: &Array3<f32>,
    y: &Array2<f32>,
    test_size: f64,
    random_seed: u64,
) -> Result<((Array3<f32>, Array2<f32>), (Array3<f32>, Array2<f32>))> {
    if x.shape()[0] != y.nrows() {
        return Err(PipelineError::Data(format!(
            "features ({} rows) do not align with labels ({} rows)",
            x.shape()[0],
            y.nrows()
        )));
    }
    let (train_idx, val_idx) = split_indices(x.shape()[0], test_size, random_seed)?;
    Ok((
        (x.select(Axis(0), &train_idx), y.select(Axis(0), &train_idx)),
        (x.select(Axis(0), &val_idx), y.select(Axis(0), &val_idx)),
    ))
}

/// One shuffled index set, partitioned: `round(test_size · n)` validation
/// indices, the rest training.
fn split_indices(n: usize, test_size: f64, random_seed: u64) -> Result<(Vec<usize>, Vec<usize>)> {
    if !(0.0..1.0).contains(&test_size) {
        return Err(PipelineError::Config(format!(
            "test_size {} outside [0, 1)",
            test_size
        )));
    }
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(random_seed);
    indices.shuffle(&mut rng);

    let n_val = ((n as f64) * test_size).round() as usize;
    let val = indices[..n_val].to_vec();
    let train = indices[n_val..].to_vec();
    Ok((train, val))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::one_hot;
    use crate::dataset::transforms::{negated, time_flipped, Transform};
    use ndarray::Array3;

    fn marker_windows(n: usize) -> Array3<f32> {
        // Window i is constant-valued i+1, so a row's source window is
        // recoverable from any of its values.
        Array3::from_shape_fn((n, 4, 2), |(i, _, _)| (i + 1) as f32)
    }

    fn test_transforms() -> Vec<Transform> {
        vec![
            Transform::new("negated", negated),
            Transform::new("time_flipped", time_flipped),
        ]
    }

    #[test]
    fn test_block_layout_and_alignment() {
        let windows = marker_windows(3);
        let dataset = create_transform_dataset(&windows, &test_transforms(), None).unwrap();

        assert_eq!(dataset.len(), 9);
        assert_eq!(dataset.task_names, vec!["negated", "time_flipped"]);

        // Original block: all-zero task labels, untouched values.
        for i in 0..3 {
            assert_eq!(dataset.task_labels[[i, 0]], 0.0);
            assert_eq!(dataset.task_labels[[i, 1]], 0.0);
            assert_eq!(dataset.x[[i, 0, 0]], (i + 1) as f32);
        }
        // Negated block: 1 in column 0 only, negated values.
        for i in 3..6 {
            assert_eq!(dataset.task_labels[[i, 0]], 1.0);
            assert_eq!(dataset.task_labels[[i, 1]], 0.0);
            assert_eq!(dataset.x[[i, 0, 0]], -((i - 2) as f32));
        }
        // Time-flipped block: 1 in column 1 only.
        for i in 6..9 {
            assert_eq!(dataset.task_labels[[i, 0]], 0.0);
            assert_eq!(dataset.task_labels[[i, 1]], 1.0);
        }
    }

    #[test]
    fn test_duplicate_task_names_rejected() {
        let windows = marker_windows(2);
        let transforms = vec![
            Transform::new("negated", negated),
            Transform::new("negated", time_flipped),
        ];
        assert!(create_transform_dataset(&windows, &transforms, None).is_err());
    }

    #[test]
    fn test_passthrough_labels_replicated_per_block() {
        let windows = marker_windows(4);
        let har = one_hot(&[0, 1, 0, 1], 2);
        let dataset =
            create_transform_dataset(&windows, &test_transforms(), Some(&har)).unwrap();

        let har_out = dataset.har_labels.unwrap();
        assert_eq!(har_out.nrows(), 12);
        for block in 0..3 {
            for i in 0..4 {
                assert_eq!(har_out[[block * 4 + i, i % 2]], 1.0);
            }
        }
    }

    #[test]
    fn test_passthrough_label_misalignment_rejected() {
        let windows = marker_windows(4);
        let har = one_hot(&[0, 1], 2);
        assert!(create_transform_dataset(&windows, &test_transforms(), Some(&har)).is_err());
    }

    #[test]
    fn test_split_task_labels_order() {
        let windows = marker_windows(2);
        let dataset = create_transform_dataset(&windows, &test_transforms(), None).unwrap();
        let per_task = dataset.split_task_labels();
        assert_eq!(per_task[0].0, "negated");
        assert_eq!(per_task[1].0, "time_flipped");
        assert_eq!(per_task[0].1.len(), dataset.len());
        // Column 0 is exactly the negated block's indicator.
        assert_eq!(per_task[0].1[2], 1.0);
        assert_eq!(per_task[0].1[4], 0.0);
    }

    #[test]
    fn test_split_is_deterministic() {
        let windows = marker_windows(20);
        let dataset = create_transform_dataset(&windows, &test_transforms(), None).unwrap();

        let (train_a, val_a) = dataset.train_val_split(0.25, 42).unwrap();
        let (train_b, val_b) = dataset.train_val_split(0.25, 42).unwrap();

        assert_eq!(val_a.len(), 15); // round(0.25 * 60)
        assert_eq!(train_a.len(), 45);
        assert_eq!(train_a.x, train_b.x);
        assert_eq!(val_a.x, val_b.x);
        assert_eq!(train_a.task_labels, train_b.task_labels);

        let (train_c, _) = dataset.train_val_split(0.25, 43).unwrap();
        assert_ne!(train_a.x, train_c.x);
    }

    #[test]
    fn test_split_keeps_rows_aligned() {
        let windows = marker_windows(6);
        let har = one_hot(&[0, 1, 0, 1, 0, 1], 2);
        let dataset =
            create_transform_dataset(&windows, &test_transforms(), Some(&har)).unwrap();
        let (train, val) = dataset.train_val_split(0.2, 7).unwrap();

        for part in [&train, &val] {
            let har_labels = part.har_labels.as_ref().unwrap();
            for row in 0..part.len() {
                // Recover the source window from the row's constant value.
                let source = (part.x[[row, 0, 0]].abs() as usize) - 1;
                assert_eq!(har_labels[[row, source % 2]], 1.0);
                // Negated rows must carry the negated task indicator.
                let is_negated = part.x[[row, 0, 0]] < 0.0;
                assert_eq!(part.task_labels[[row, 0]], if is_negated { 1.0 } else { 0.0 });
            }
        }
    }

    #[test]
    fn test_train_val_split_xy_deterministic() {
        let x = marker_windows(10);
        let y = one_hot(&[0, 1, 0, 1, 0, 1, 0, 1, 0, 1], 2);
        let (train_a, val_a) = train_val_split_xy(&x, &y, 0.1, 42).unwrap();
        let (train_b, val_b) = train_val_split_xy(&x, &y, 0.1, 42).unwrap();
        assert_eq!(val_a.0.shape()[0], 1);
        assert_eq!(train_a.0, train_b.0);
        assert_eq!(val_a.1, val_b.1);
    }
}
