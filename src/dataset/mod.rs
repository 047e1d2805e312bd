//! Dataset types and preparation interfaces
//!
//! Windowed sensor data is carried as `[N, window_size, channels]`
//! feature arrays with `[N, num_classes]` one-hot label matrices. The
//! label map is derived once from the labelled dataset's sorted label
//! list and reused (as an override) when preparing the unlabelled pool,
//! keeping class indices consistent across both datasets.
//!
//! The unlabelled pool is expensive to materialise, so each fold holds
//! it in a cache that is populated at most once and read-only afterward.

use std::collections::BTreeMap;
use std::path::Path;

use ndarray::{concatenate, Array2, Array3, Axis};
use tracing::debug;

use crate::error::{PipelineError, Result};

pub mod loader;
pub mod multitask;
pub mod transforms;

/// Class-name to class-index mapping, in stable sorted name order
pub type LabelMap = BTreeMap<String, usize>;

/// Build a label map from a list of class names (sorted, deduplicated)
pub fn label_map_from_list(labels: &[String]) -> LabelMap {
    let mut names: Vec<&String> = labels.iter().collect();
    names.sort();
    names.dedup();
    names
        .into_iter()
        .enumerate()
        .map(|(index, name)| (name.clone(), index))
        .collect()
}

/// One-hot encode class indices into an `[N, num_classes]` matrix
pub fn one_hot(indices: &[usize], num_classes: usize) -> Array2<f32> {
    let mut encoded = Array2::zeros((indices.len(), num_classes));
    for (row, &class) in indices.iter().enumerate() {
        if class < num_classes {
            encoded[[row, class]] = 1.0;
        }
    }
    encoded
}

/// A windowed split: features plus aligned one-hot labels
#[derive(Debug, Clone)]
pub struct WindowedDataset {
    /// `[N, window_size, channels]`
    pub x: Array3<f32>,
    /// `[N, num_classes]`
    pub y: Array2<f32>,
}

impl WindowedDataset {
    pub fn new(x: Array3<f32>, y: Array2<f32>) -> Result<Self> {
        if x.shape()[0] != y.shape()[0] {
            return Err(PipelineError::Data(format!(
                "feature count {} does not match label count {}",
                x.shape()[0],
                y.shape()[0]
            )));
        }
        Ok(Self { x, y })
    }

    /// An empty dataset with the given window and label dimensions
    pub fn empty(window_size: usize, channels: usize, num_classes: usize) -> Self {
        Self {
            x: Array3::zeros((0, window_size, channels)),
            y: Array2::zeros((0, num_classes)),
        }
    }

    pub fn len(&self) -> usize {
        self.x.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_classes(&self) -> usize {
        self.y.ncols()
    }
}

/// Prepared train/val/test splits with the shared label map
#[derive(Debug, Clone)]
pub struct DatasetBundle {
    pub train: WindowedDataset,
    pub val: WindowedDataset,
    pub test: WindowedDataset,
    pub label_map: LabelMap,
    /// `(window_size, channels)`
    pub input_shape: (usize, usize),
    /// Number of output classes
    pub output_shape: usize,
}

/// How users are assigned to the train and test sides of a split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSplit {
    /// Leave-one-user-out: the user at this index is the held-out test user
    HoldOutUser(usize),
    /// Every user goes to the train side (used for the unlabelled pool)
    AllTrain,
}

/// Parameters for a dataset preparation request
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub window_size: usize,
    pub user_split: UserSplit,
    /// Fraction of the train windows moved to the validation split
    pub validation_fraction: f64,
    /// Reuse this label map instead of deriving one from the dataset
    pub label_map_override: Option<LabelMap>,
}

/// Dataset preparation service: raw per-user recordings in, windowed
/// normalized splits out. Implementations own parsing and windowing;
/// the pipeline only consumes bundles.
pub trait DatasetProvider {
    /// The user identifiers present in the dataset, in stable order
    fn list_users(&self, path: &Path) -> Result<Vec<String>>;

    /// Prepare windowed, normalized, labelled splits
    fn prepare(&self, path: &Path, request: &PrepareRequest) -> Result<DatasetBundle>;
}

/// Options controlling unlabelled pool assembly
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Number of times the labelled train windows are appended to the pool
    pub labelled_repeat: usize,
    /// Cap on the number of unlabelled windows kept
    pub max_windows: Option<usize>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            labelled_repeat: 1,
            max_windows: None,
        }
    }
}

/// The materialised unlabelled pool for one fold
#[derive(Debug, Clone)]
pub struct UnlabelledPool {
    /// The capped unlabelled windows
    pub windows: Array3<f32>,
    /// Ground-truth labels for the pool, when the source carries them
    pub labels: Option<Array2<f32>>,
    /// Pool windows concatenated with repeated labelled train windows
    pub combined: Array3<f32>,
}

/// Assemble the unlabelled pool: prepare the unlabelled dataset under the
/// labelled label map, cap it, and append repeated labelled train windows
/// to bias self-supervision toward the labelled domain.
pub fn build_unlabelled_pool<D: DatasetProvider + ?Sized>(
    provider: &D,
    path: &Path,
    window_size: usize,
    labelled: &DatasetBundle,
    options: &PoolOptions,
) -> Result<UnlabelledPool> {
    let request = PrepareRequest {
        window_size,
        user_split: UserSplit::AllTrain,
        validation_fraction: 0.0,
        label_map_override: Some(labelled.label_map.clone()),
    };
    let bundle = provider.prepare(path, &request)?;

    if bundle.label_map != labelled.label_map {
        return Err(PipelineError::Data(
            "unlabelled dataset was prepared under a different label map".to_string(),
        ));
    }

    let mut windows = bundle.train.x;
    let mut labels = if bundle.train.y.ncols() > 0 {
        Some(bundle.train.y)
    } else {
        None
    };

    if let Some(cap) = options.max_windows {
        if windows.shape()[0] > cap {
            windows = windows.slice(ndarray::s![..cap, .., ..]).to_owned();
            labels = labels.map(|y| y.slice(ndarray::s![..cap, ..]).to_owned());
        }
    }

    let combined = if options.labelled_repeat == 0 || labelled.train.is_empty() {
        windows.clone()
    } else {
        let mut parts = vec![windows.view()];
        for _ in 0..options.labelled_repeat {
            parts.push(labelled.train.x.view());
        }
        concatenate(Axis(0), &parts)
            .map_err(|e| PipelineError::Data(format!("failed to combine unlabelled pool: {}", e)))?
    };

    debug!(
        unlabelled = windows.shape()[0],
        combined = combined.shape()[0],
        "unlabelled pool assembled"
    );

    Ok(UnlabelledPool {
        windows,
        labels,
        combined,
    })
}

/// Once-populated cache for the unlabelled pool.
///
/// Populated on first access within a fold and read-only afterwards; a
/// new fold (or labelled fraction) gets a fresh cache.
#[derive(Debug, Default)]
pub struct UnlabelledCache {
    pool: Option<UnlabelledPool>,
}

impl UnlabelledCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_populated(&self) -> bool {
        self.pool.is_some()
    }

    /// Return the cached pool, building it first if this is the first access
    pub fn get_or_populate<F>(&mut self, build: F) -> Result<&UnlabelledPool>
    where
        F: FnOnce() -> Result<UnlabelledPool>,
    {
        if self.pool.is_none() {
            self.pool = Some(build()?);
        }
        self.pool
            .as_ref()
            .ok_or_else(|| PipelineError::Data("unlabelled pool unavailable".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn bundle(n: usize, classes: usize) -> DatasetBundle {
        let x = Array3::from_shape_fn((n, 4, 2), |(i, j, k)| (i + j + k) as f32);
        let y = one_hot(&(0..n).map(|i| i % classes).collect::<Vec<_>>(), classes);
        let label_map: LabelMap = (0..classes).map(|c| (format!("class_{}", c), c)).collect();
        DatasetBundle {
            train: WindowedDataset::new(x, y).unwrap(),
            val: WindowedDataset::empty(4, 2, classes),
            test: WindowedDataset::empty(4, 2, classes),
            label_map,
            input_shape: (4, 2),
            output_shape: classes,
        }
    }

    struct FixedProvider {
        bundle: DatasetBundle,
    }

    impl DatasetProvider for FixedProvider {
        fn list_users(&self, _path: &Path) -> Result<Vec<String>> {
            Ok(vec!["u1".to_string()])
        }

        fn prepare(&self, _path: &Path, request: &PrepareRequest) -> Result<DatasetBundle> {
            let mut bundle = self.bundle.clone();
            if let Some(map) = &request.label_map_override {
                bundle.label_map = map.clone();
            }
            Ok(bundle)
        }
    }

    #[test]
    fn test_label_map_is_sorted_and_deduplicated() {
        let labels = vec![
            "walking".to_string(),
            "sitting".to_string(),
            "walking".to_string(),
            "laying".to_string(),
        ];
        let map = label_map_from_list(&labels);
        assert_eq!(map.len(), 3);
        assert_eq!(map["laying"], 0);
        assert_eq!(map["sitting"], 1);
        assert_eq!(map["walking"], 2);
    }

    #[test]
    fn test_one_hot() {
        let encoded = one_hot(&[1, 0, 2], 3);
        assert_eq!(encoded[[0, 1]], 1.0);
        assert_eq!(encoded[[1, 0]], 1.0);
        assert_eq!(encoded[[2, 2]], 1.0);
        assert_eq!(encoded.sum(), 3.0);
    }

    #[test]
    fn test_windowed_dataset_rejects_mismatched_lengths() {
        let x = Array3::<f32>::zeros((3, 4, 2));
        let y = one_hot(&[0, 1], 2);
        assert!(WindowedDataset::new(x, y).is_err());
    }

    #[test]
    fn test_pool_combines_and_caps() {
        let labelled = bundle(4, 2);
        let provider = FixedProvider { bundle: bundle(10, 2) };
        let options = PoolOptions {
            labelled_repeat: 2,
            max_windows: Some(6),
        };
        let pool =
            build_unlabelled_pool(&provider, Path::new("pool.json"), 4, &labelled, &options)
                .unwrap();
        assert_eq!(pool.windows.shape()[0], 6);
        // 6 capped + 4 labelled × 2 repeats
        assert_eq!(pool.combined.shape()[0], 14);
        assert_eq!(pool.labels.as_ref().unwrap().nrows(), 6);
    }

    #[test]
    fn test_pool_label_map_mismatch_fails() {
        let labelled = bundle(4, 2);
        let mut other = bundle(10, 2);
        other.label_map.insert("extra".to_string(), 9);
        struct Stubborn {
            bundle: DatasetBundle,
        }
        impl DatasetProvider for Stubborn {
            fn list_users(&self, _path: &Path) -> Result<Vec<String>> {
                Ok(vec![])
            }
            fn prepare(&self, _path: &Path, _request: &PrepareRequest) -> Result<DatasetBundle> {
                Ok(self.bundle.clone())
            }
        }
        let provider = Stubborn { bundle: other };
        let result = build_unlabelled_pool(
            &provider,
            Path::new("pool.json"),
            4,
            &labelled,
            &PoolOptions::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_cache_populates_once() {
        let labelled = bundle(4, 2);
        let provider = FixedProvider { bundle: bundle(8, 2) };
        let mut cache = UnlabelledCache::new();
        let mut builds = 0;

        for _ in 0..3 {
            let pool = cache
                .get_or_populate(|| {
                    builds += 1;
                    build_unlabelled_pool(
                        &provider,
                        Path::new("pool.json"),
                        4,
                        &labelled,
                        &PoolOptions::default(),
                    )
                })
                .unwrap();
            assert_eq!(pool.windows.shape()[0], 8);
        }
        assert_eq!(builds, 1);
        assert!(cache.is_populated());
    }
}
