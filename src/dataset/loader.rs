//! JSON-Backed Dataset Provider
//!
//! A working [`DatasetProvider`] over a JSON document of per-user
//! continuous recordings:
//!
//! ```json
//! {
//!   "label_list": ["sitting", "walking"],
//!   "user_split": {
//!     "user_a": [
//!       { "samples": [[0.1, -0.2, 0.9], ...], "labels": ["sitting", ...] }
//!     ]
//!   }
//! }
//! ```
//!
//! Recordings are cut into non-overlapping windows (shift = window
//! size); a window takes the label of its final timestep. Channels are
//! standardised with mean and deviation computed from the train users
//! only, and the validation split is drawn from the train windows with a
//! seeded shuffle so folds are reproducible.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ndarray::{Array3, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use tracing::debug;

use crate::dataset::{
    label_map_from_list, one_hot, DatasetBundle, DatasetProvider, LabelMap, PrepareRequest,
    UserSplit, WindowedDataset,
};
use crate::error::{PipelineError, Result};

/// Seed for the reproducible validation split
const VALIDATION_SPLIT_SEED: u64 = 42;

#[derive(Debug, Deserialize)]
struct RawDataset {
    label_list: Vec<String>,
    user_split: BTreeMap<String, Vec<RawRecording>>,
}

#[derive(Debug, Deserialize)]
struct RawRecording {
    /// `[T, channels]` continuous sensor samples
    samples: Vec<Vec<f32>>,
    /// Per-timestep activity labels, aligned with `samples`
    labels: Vec<String>,
}

/// Dataset provider reading per-user recordings from a JSON document
#[derive(Debug, Clone)]
pub struct JsonDatasetProvider {
    validation_seed: u64,
}

impl Default for JsonDatasetProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonDatasetProvider {
    pub fn new() -> Self {
        Self {
            validation_seed: VALIDATION_SPLIT_SEED,
        }
    }

    pub fn with_seed(validation_seed: u64) -> Self {
        Self { validation_seed }
    }

    fn load_raw(&self, path: &Path) -> Result<RawDataset> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Cut one recording into non-overlapping `(window, class)` pairs
fn window_recording(
    recording: &RawRecording,
    window_size: usize,
    label_map: &LabelMap,
) -> Result<Vec<(Vec<Vec<f32>>, usize)>> {
    if recording.samples.len() != recording.labels.len() {
        return Err(PipelineError::Data(format!(
            "recording has {} samples but {} labels",
            recording.samples.len(),
            recording.labels.len()
        )));
    }

    let count = recording.samples.len() / window_size;
    let mut windows = Vec::with_capacity(count);
    for w in 0..count {
        let start = w * window_size;
        let end = start + window_size;
        // The window's label is its final timestep's label.
        let label_name = &recording.labels[end - 1];
        let class = *label_map.get(label_name).ok_or_else(|| {
            PipelineError::Data(format!(
                "label '{}' is not in the label map; labelled and unlabelled \
                 datasets must share one label set",
                label_name
            ))
        })?;
        windows.push((recording.samples[start..end].to_vec(), class));
    }
    Ok(windows)
}

/// Stack `(window, class)` pairs into aligned arrays
fn stack_windows(
    windows: &[(Vec<Vec<f32>>, usize)],
    window_size: usize,
    channels: usize,
    num_classes: usize,
) -> Result<WindowedDataset> {
    let mut x = Array3::<f32>::zeros((windows.len(), window_size, channels));
    let mut classes = Vec::with_capacity(windows.len());
    for (i, (window, class)) in windows.iter().enumerate() {
        for (t, row) in window.iter().enumerate() {
            if row.len() != channels {
                return Err(PipelineError::Data(format!(
                    "inconsistent channel count: expected {}, found {}",
                    channels,
                    row.len()
                )));
            }
            for (c, &value) in row.iter().enumerate() {
                x[[i, t, c]] = value;
            }
        }
        classes.push(*class);
    }
    WindowedDataset::new(x, one_hot(&classes, num_classes))
}

/// Per-channel standardisation statistics
struct ChannelStats {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl ChannelStats {
    fn from_windows(x: &Array3<f32>) -> Self {
        let channels = x.shape()[2];
        let mut mean = vec![0.0f32; channels];
        let mut std = vec![1.0f32; channels];
        let per_channel = (x.shape()[0] * x.shape()[1]) as f32;
        if per_channel > 0.0 {
            for c in 0..channels {
                let lane = x.index_axis(Axis(2), c);
                let m = lane.sum() / per_channel;
                let var = lane.mapv(|v| (v - m) * (v - m)).sum() / per_channel;
                mean[c] = m;
                std[c] = if var.sqrt() > f32::EPSILON { var.sqrt() } else { 1.0 };
            }
        }
        Self { mean, std }
    }

    fn apply(&self, x: &mut Array3<f32>) {
        for c in 0..self.mean.len() {
            let mean = self.mean[c];
            let std = self.std[c];
            x.index_axis_mut(Axis(2), c)
                .mapv_inplace(|v| (v - mean) / std);
        }
    }
}

impl DatasetProvider for JsonDatasetProvider {
    fn list_users(&self, path: &Path) -> Result<Vec<String>> {
        let raw = self.load_raw(path)?;
        Ok(raw.user_split.keys().cloned().collect())
    }

    fn prepare(&self, path: &Path, request: &PrepareRequest) -> Result<DatasetBundle> {
        if request.window_size == 0 {
            return Err(PipelineError::Config("window_size must be positive".to_string()));
        }
        let raw = self.load_raw(path)?;

        let label_map = match &request.label_map_override {
            Some(map) => map.clone(),
            None => label_map_from_list(&raw.label_list),
        };
        let num_classes = label_map.len();

        let users: Vec<&String> = raw.user_split.keys().collect();
        let (train_users, test_users): (Vec<&String>, Vec<&String>) = match request.user_split {
            UserSplit::AllTrain => (users.clone(), Vec::new()),
            UserSplit::HoldOutUser(index) => {
                let held_out: &String = users.get(index).copied().ok_or_else(|| {
                    PipelineError::Config(format!(
                        "hold-out user index {} exceeds the {} users in {:?}",
                        index,
                        users.len(),
                        path
                    ))
                })?;
                (
                    users
                        .iter()
                        .filter(|user| user.as_str() != held_out.as_str())
                        .copied()
                        .collect(),
                    vec![held_out],
                )
            }
        };
        debug!(?train_users, ?test_users, "user split resolved");

        let channels = raw
            .user_split
            .values()
            .flatten()
            .flat_map(|r| r.samples.first())
            .map(|row| row.len())
            .next()
            .ok_or_else(|| PipelineError::Data("dataset contains no samples".to_string()))?;

        let collect_windows = |selected: &[&String]| -> Result<Vec<(Vec<Vec<f32>>, usize)>> {
            let mut all = Vec::new();
            for user in selected {
                for recording in &raw.user_split[*user] {
                    all.extend(window_recording(recording, request.window_size, &label_map)?);
                }
            }
            Ok(all)
        };

        let train_windows = collect_windows(&train_users)?;
        let test_windows = collect_windows(&test_users)?;
        if train_windows.is_empty() {
            return Err(PipelineError::Data(format!(
                "no training windows of size {} in {:?}",
                request.window_size, path
            )));
        }

        let mut train_all =
            stack_windows(&train_windows, request.window_size, channels, num_classes)?;
        let mut test =
            stack_windows(&test_windows, request.window_size, channels, num_classes)?;

        // Standardise with statistics from the train users only.
        let stats = ChannelStats::from_windows(&train_all.x);
        stats.apply(&mut train_all.x);
        stats.apply(&mut test.x);

        // Reproducible validation split out of the train windows.
        let n = train_all.len();
        let n_val = ((n as f64) * request.validation_fraction.clamp(0.0, 1.0)).round() as usize;
        let mut indices: Vec<usize> = (0..n).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(self.validation_seed);
        indices.shuffle(&mut rng);
        let val_idx = &indices[..n_val];
        let train_idx = &indices[n_val..];

        let train = WindowedDataset::new(
            train_all.x.select(Axis(0), train_idx),
            train_all.y.select(Axis(0), train_idx),
        )?;
        let val = WindowedDataset::new(
            train_all.x.select(Axis(0), val_idx),
            train_all.y.select(Axis(0), val_idx),
        )?;

        Ok(DatasetBundle {
            train,
            val,
            test,
            label_map,
            input_shape: (request.window_size, channels),
            output_shape: num_classes,
        })
    }
}
