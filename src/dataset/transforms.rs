//! Signal transformation registry for self-supervised pretraining
//!
//! Each transformation is a named pure function over a batch of windows
//! (`[N, W, C]` in, same shape out). The names are stable identifiers:
//! they become the output-head names of the multi-task model and the
//! task names in the multi-task label builder.

use ndarray::{s, Array3};
use rand::seq::SliceRandom;
use rand_distr::{Distribution, Normal};

/// Standard deviation of additive sensor noise
const NOISE_SIGMA: f32 = 0.05;

/// Standard deviation of the per-channel scaling factor around 1.0
const SCALE_SIGMA: f32 = 0.1;

/// Number of time segments shuffled by the permutation transform
const PERMUTE_SEGMENTS: usize = 4;

/// A named signal transformation
#[derive(Clone, Copy)]
pub struct Transform {
    pub name: &'static str,
    apply: fn(&Array3<f32>) -> Array3<f32>,
}

impl Transform {
    pub const fn new(name: &'static str, apply: fn(&Array3<f32>) -> Array3<f32>) -> Self {
        Self { name, apply }
    }

    /// Apply the transformation to a batch of windows
    pub fn apply(&self, windows: &Array3<f32>) -> Array3<f32> {
        (self.apply)(windows)
    }
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transform").field("name", &self.name).finish()
    }
}

/// The default transformation set, in head order
pub fn default_transforms() -> Vec<Transform> {
    vec![
        Transform::new("noised", noised),
        Transform::new("scaled", scaled),
        Transform::new("negated", negated),
        Transform::new("time_flipped", time_flipped),
        Transform::new("permuted", permuted),
        Transform::new("channel_shuffled", channel_shuffled),
    ]
}

/// Additive Gaussian noise per sample value
pub fn noised(windows: &Array3<f32>) -> Array3<f32> {
    let normal = Normal::new(0.0, NOISE_SIGMA).expect("valid noise sigma");
    let mut rng = rand::thread_rng();
    windows.mapv(|v| v + normal.sample(&mut rng))
}

/// Per-window, per-channel magnitude scaling
pub fn scaled(windows: &Array3<f32>) -> Array3<f32> {
    let normal = Normal::new(1.0, SCALE_SIGMA).expect("valid scale sigma");
    let mut rng = rand::thread_rng();
    let (n, _, channels) = windows.dim();
    let mut out = windows.clone();
    for i in 0..n {
        for c in 0..channels {
            let factor: f32 = normal.sample(&mut rng);
            out.slice_mut(s![i, .., c]).mapv_inplace(|v| v * factor);
        }
    }
    out
}

/// Sign inversion of every channel
pub fn negated(windows: &Array3<f32>) -> Array3<f32> {
    windows.mapv(|v| -v)
}

/// Reversal along the time axis
pub fn time_flipped(windows: &Array3<f32>) -> Array3<f32> {
    windows.slice(s![.., ..;-1, ..]).to_owned()
}

/// Shuffle fixed-length time segments within each window
pub fn permuted(windows: &Array3<f32>) -> Array3<f32> {
    let mut rng = rand::thread_rng();
    let (n, window, _) = windows.dim();
    let segments = PERMUTE_SEGMENTS.min(window.max(1));
    let seg_len = window / segments;
    if seg_len == 0 {
        return windows.clone();
    }

    let mut out = windows.clone();
    for i in 0..n {
        let mut order: Vec<usize> = (0..segments).collect();
        order.shuffle(&mut rng);
        for (target, &source) in order.iter().enumerate() {
            // The remainder after the last full segment stays in place.
            let src = windows.slice(s![i, source * seg_len..(source + 1) * seg_len, ..]);
            out.slice_mut(s![i, target * seg_len..(target + 1) * seg_len, ..])
                .assign(&src);
        }
    }
    out
}

/// Random permutation of the sensor channels within each window
pub fn channel_shuffled(windows: &Array3<f32>) -> Array3<f32> {
    let mut rng = rand::thread_rng();
    let (n, _, channels) = windows.dim();
    let mut out = windows.clone();
    for i in 0..n {
        let mut order: Vec<usize> = (0..channels).collect();
        order.shuffle(&mut rng);
        for (target, &source) in order.iter().enumerate() {
            out.slice_mut(s![i, .., target])
                .assign(&windows.slice(s![i, .., source]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Axis};
    use std::collections::HashSet;

    fn sample_windows() -> Array3<f32> {
        Array3::from_shape_fn((3, 8, 2), |(i, j, k)| (i * 100 + j * 2 + k) as f32)
    }

    #[test]
    fn test_default_transform_names_are_unique() {
        let transforms = default_transforms();
        let names: HashSet<&str> = transforms.iter().map(|t| t.name).collect();
        assert_eq!(names.len(), transforms.len());
    }

    #[test]
    fn test_all_transforms_preserve_shape() {
        let windows = sample_windows();
        for transform in default_transforms() {
            let out = transform.apply(&windows);
            assert_eq!(out.dim(), windows.dim(), "{} changed shape", transform.name);
        }
    }

    #[test]
    fn test_negated() {
        let windows = sample_windows();
        let out = negated(&windows);
        assert_eq!(out[[1, 3, 1]], -windows[[1, 3, 1]]);
    }

    #[test]
    fn test_time_flipped() {
        let windows = sample_windows();
        let out = time_flipped(&windows);
        assert_eq!(out[[0, 0, 0]], windows[[0, 7, 0]]);
        assert_eq!(out[[2, 7, 1]], windows[[2, 0, 1]]);
    }

    #[test]
    fn test_permuted_preserves_values_per_window() {
        let windows = sample_windows();
        let out = permuted(&windows);
        for i in 0..windows.dim().0 {
            let mut before: Vec<i64> = windows
                .index_axis(Axis(0), i)
                .iter()
                .map(|v| *v as i64)
                .collect();
            let mut after: Vec<i64> = out
                .index_axis(Axis(0), i)
                .iter()
                .map(|v| *v as i64)
                .collect();
            before.sort();
            after.sort();
            assert_eq!(before, after);
        }
    }

    #[test]
    fn test_channel_shuffled_preserves_channel_contents() {
        let windows = sample_windows();
        let out = channel_shuffled(&windows);
        for i in 0..windows.dim().0 {
            let mut before: Vec<Vec<i64>> = (0..2)
                .map(|c| {
                    windows
                        .slice(s![i, .., c])
                        .iter()
                        .map(|v| *v as i64)
                        .collect()
                })
                .collect();
            let mut after: Vec<Vec<i64>> = (0..2)
                .map(|c| out.slice(s![i, .., c]).iter().map(|v| *v as i64).collect())
                .collect();
            before.sort();
            after.sort();
            assert_eq!(before, after);
        }
    }

    #[test]
    fn test_noised_changes_values_but_stays_close() {
        let windows = Array3::<f32>::zeros((2, 8, 2));
        let out = noised(&windows);
        assert!(out.iter().any(|&v| v != 0.0));
        assert!(out.iter().all(|&v| v.abs() < 1.0));
    }
}
