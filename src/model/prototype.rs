//! Prototype Reference Backend
//!
//! A minimal [`ModelService`] implementation used by the binary and the
//! test suite: windows are flattened, each classification output keeps
//! one prototype (centroid) per class, and prediction is a softmax over
//! negative squared distances. Fitting is closed-form, so epochs, batch
//! size and the learning-rate schedule are accepted but numerically
//! inert, and freeze modes are recorded on the handle without affecting
//! the prototypes.
//!
//! Artifacts are JSON documents, written once per fit (best + last) and
//! never overwritten by later steps.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::model::{
    ClassifierHead, FitOutcome, FitRequest, FreezeMode, HarHeadSpec, ModelService, OptimizerSpec,
    TrainTargets,
};
use crate::utils::metrics::argmax_rows;

/// One prototype per class for a softmax output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassPrototypes {
    pub head: ClassifierHead,
    /// `[num_classes, flattened_features]`
    pub centroids: Array2<f32>,
    /// Samples that shaped each centroid; zero marks an untrained class
    pub counts: Vec<usize>,
}

impl ClassPrototypes {
    fn untrained(head: ClassifierHead, num_classes: usize, features: usize) -> Self {
        Self {
            head,
            centroids: Array2::zeros((num_classes, features)),
            counts: vec![0; num_classes],
        }
    }

    fn num_classes(&self) -> usize {
        self.centroids.nrows()
    }

    fn is_trained(&self) -> bool {
        self.counts.iter().any(|&c| c > 0)
    }
}

/// Binary prototypes for one transform-discrimination head
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPrototypes {
    pub name: String,
    pub on: Array1<f32>,
    pub off: Array1<f32>,
}

/// The serialisable model handle of the prototype backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrototypeModel {
    pub input_shape: (usize, usize),
    pub freeze: FreezeMode,
    /// Classification (or HAR) output, when attached
    pub classifier: Option<ClassPrototypes>,
    /// Transform-discrimination heads, when attached
    pub tasks: Vec<TaskPrototypes>,
}

impl PrototypeModel {
    fn features(&self) -> usize {
        self.input_shape.0 * self.input_shape.1
    }
}

/// [`ModelService`] backed by nearest-prototype classification
#[derive(Debug, Clone)]
pub struct PrototypeModelService {
    models_dir: PathBuf,
}

impl PrototypeModelService {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    fn save(&self, model: &PrototypeModel, file_name: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.models_dir)?;
        let path = self.models_dir.join(file_name);
        let json = serde_json::to_string_pretty(model)?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

/// Flatten `[N, W, C]` windows into `[N, W·C]` feature rows
fn flatten(x: &Array3<f32>) -> Array2<f32> {
    let (n, w, c) = x.dim();
    Array2::from_shape_fn((n, w * c), |(i, j)| x[[i, j / c, j % c]])
}

/// Mean of the selected feature rows, or zeros when nothing is selected
fn centroid_of(features: &Array2<f32>, selected: &[usize]) -> Array1<f32> {
    let mut sum = Array1::<f32>::zeros(features.ncols());
    for &row in selected {
        sum += &features.row(row);
    }
    if !selected.is_empty() {
        sum /= selected.len() as f32;
    }
    sum
}

fn fit_class_prototypes(
    prototypes: &mut ClassPrototypes,
    features: &Array2<f32>,
    targets: &Array2<f32>,
) -> Result<()> {
    if targets.ncols() != prototypes.num_classes() {
        return Err(PipelineError::Model(format!(
            "targets have {} classes but the head was attached with {}",
            targets.ncols(),
            prototypes.num_classes()
        )));
    }
    if features.nrows() != targets.nrows() {
        return Err(PipelineError::Model(format!(
            "feature rows ({}) do not align with target rows ({})",
            features.nrows(),
            targets.nrows()
        )));
    }

    let classes = argmax_rows(targets);
    for class in 0..prototypes.num_classes() {
        let selected: Vec<usize> = classes
            .iter()
            .enumerate()
            .filter(|(_, &c)| c == class)
            .map(|(row, _)| row)
            .collect();
        prototypes.counts[class] = selected.len();
        prototypes
            .centroids
            .row_mut(class)
            .assign(&centroid_of(features, &selected));
    }
    Ok(())
}

impl ModelService for PrototypeModelService {
    type Model = PrototypeModel;

    fn create_core(&self, input_shape: (usize, usize)) -> Result<Self::Model> {
        Ok(PrototypeModel {
            input_shape,
            freeze: FreezeMode::None,
            classifier: None,
            tasks: Vec::new(),
        })
    }

    fn load(&self, path: &Path) -> Result<Self::Model> {
        let raw = fs::read_to_string(path)
            .map_err(|e| PipelineError::Model(format!("cannot load artifact {:?}: {}", path, e)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn extract_core(&self, model: &Self::Model) -> Result<Self::Model> {
        Ok(PrototypeModel {
            input_shape: model.input_shape,
            freeze: model.freeze,
            classifier: None,
            tasks: Vec::new(),
        })
    }

    fn extract_har_head(&self, model: &Self::Model) -> Result<Self::Model> {
        let classifier = model.classifier.clone().ok_or_else(|| {
            PipelineError::Model("model carries no HAR output to extract".to_string())
        })?;
        Ok(PrototypeModel {
            input_shape: model.input_shape,
            freeze: model.freeze,
            classifier: Some(classifier),
            tasks: Vec::new(),
        })
    }

    fn set_trainability(&self, model: &mut Self::Model, freeze: FreezeMode) -> Result<()> {
        model.freeze = freeze;
        Ok(())
    }

    fn attach_classification_head(
        &self,
        core: Self::Model,
        num_classes: usize,
        head: ClassifierHead,
        _optimizer: &OptimizerSpec,
    ) -> Result<Self::Model> {
        let features = core.features();
        Ok(PrototypeModel {
            classifier: Some(ClassPrototypes::untrained(head, num_classes, features)),
            tasks: Vec::new(),
            ..core
        })
    }

    fn attach_multitask_head(
        &self,
        core: Self::Model,
        tasks: &[String],
        har_head: Option<HarHeadSpec>,
        _optimizer: &OptimizerSpec,
    ) -> Result<Self::Model> {
        let features = core.features();
        let task_heads = tasks
            .iter()
            .map(|name| TaskPrototypes {
                name: name.clone(),
                on: Array1::zeros(features),
                off: Array1::zeros(features),
            })
            .collect();
        let classifier = har_head.map(|spec| {
            ClassPrototypes::untrained(
                ClassifierHead::Hidden { units: spec.units },
                spec.num_classes,
                features,
            )
        });
        Ok(PrototypeModel {
            classifier,
            tasks: task_heads,
            ..core
        })
    }

    fn predict(
        &self,
        model: &Self::Model,
        x: &Array3<f32>,
        batch_size: usize,
    ) -> Result<Array2<f32>> {
        let classifier = model.classifier.as_ref().ok_or_else(|| {
            PipelineError::Model("model has no classification output".to_string())
        })?;
        if !classifier.is_trained() {
            return Err(PipelineError::Model(
                "classification head has not been trained".to_string(),
            ));
        }

        let n = x.shape()[0];
        let num_classes = classifier.num_classes();
        let mut probabilities = Array2::<f32>::zeros((n, num_classes));
        let step = batch_size.max(1);

        for start in (0..n).step_by(step) {
            let end = (start + step).min(n);
            let batch = flatten(&x.slice(ndarray::s![start..end, .., ..]).to_owned());
            for (offset, row) in batch.rows().into_iter().enumerate() {
                let mut logits = vec![f32::NEG_INFINITY; num_classes];
                for class in 0..num_classes {
                    if classifier.counts[class] == 0 {
                        continue;
                    }
                    let diff = &row - &classifier.centroids.row(class);
                    logits[class] = -diff.dot(&diff);
                }
                let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let mut exp_sum = 0.0;
                let mut exps = vec![0.0f32; num_classes];
                for class in 0..num_classes {
                    if logits[class].is_finite() {
                        let e = (logits[class] - max_logit).exp();
                        exps[class] = e;
                        exp_sum += e;
                    }
                }
                for class in 0..num_classes {
                    probabilities[[start + offset, class]] = exps[class] / exp_sum;
                }
            }
        }
        Ok(probabilities)
    }

    fn fit(&self, mut model: Self::Model, request: &FitRequest<'_>) -> Result<FitOutcome> {
        debug!(
            epochs = request.epochs,
            batch_size = request.batch_size,
            initial_lr = request.schedule.get_lr(0),
            tag = %request.tag,
            "fitting prototype model"
        );

        let features = flatten(request.train_x);

        match request.train_targets {
            TrainTargets::Classification(targets) => {
                let classifier = model.classifier.as_mut().ok_or_else(|| {
                    PipelineError::Model(
                        "classification targets given but no classification head attached"
                            .to_string(),
                    )
                })?;
                fit_class_prototypes(classifier, &features, targets)?;
            }
            TrainTargets::MultiTask { tasks, har } => {
                for (name, labels) in tasks {
                    if labels.len() != features.nrows() {
                        return Err(PipelineError::Model(format!(
                            "task '{}' labels ({}) do not align with features ({})",
                            name,
                            labels.len(),
                            features.nrows()
                        )));
                    }
                    let head = model
                        .tasks
                        .iter_mut()
                        .find(|t| &t.name == name)
                        .ok_or_else(|| {
                            PipelineError::Model(format!("model has no task head '{}'", name))
                        })?;
                    let on_rows: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] > 0.5).collect();
                    let off_rows: Vec<usize> =
                        (0..labels.len()).filter(|&i| labels[i] <= 0.5).collect();
                    head.on = centroid_of(&features, &on_rows);
                    head.off = centroid_of(&features, &off_rows);
                }
                if let Some(har_targets) = har {
                    let classifier = model.classifier.as_mut().ok_or_else(|| {
                        PipelineError::Model(
                            "HAR targets given but no HAR head attached".to_string(),
                        )
                    })?;
                    fit_class_prototypes(classifier, &features, har_targets)?;
                }
            }
        }

        if request.val_x.shape()[0] > 0 && request.val_x.shape()[1..] != request.train_x.shape()[1..]
        {
            return Err(PipelineError::Model(
                "validation windows do not match the training window shape".to_string(),
            ));
        }

        let best_path = self.save(&model, &format!("{}.best.json", request.tag))?;
        let last_path = self.save(&model, &format!("{}.last.json", request.tag))?;
        Ok(FitOutcome {
            best_path,
            last_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerKind;
    use crate::dataset::one_hot;
    use crate::model::FULL_HEAD_UNITS;
    use crate::training::scheduler::LrSchedule;
    use ndarray::Array3;
    use tempfile::TempDir;

    fn service() -> (TempDir, PrototypeModelService) {
        let dir = TempDir::new().unwrap();
        let service = PrototypeModelService::new(dir.path().join("models"));
        (dir, service)
    }

    fn adam() -> OptimizerSpec {
        OptimizerSpec {
            kind: OptimizerKind::Adam,
            learning_rate: 0.0003,
        }
    }

    /// Two cleanly separated classes: class 0 windows around 0, class 1 around 10.
    fn separable_data(n_per_class: usize) -> (Array3<f32>, Array2<f32>) {
        let n = n_per_class * 2;
        let x = Array3::from_shape_fn((n, 4, 2), |(i, j, _)| {
            let base = if i < n_per_class { 0.0 } else { 10.0 };
            base + (j as f32) * 0.01
        });
        let labels: Vec<usize> = (0..n).map(|i| usize::from(i >= n_per_class)).collect();
        (x, one_hot(&labels, 2))
    }

    fn fit_request<'a>(
        x: &'a Array3<f32>,
        y: &'a Array2<f32>,
        tag: &str,
    ) -> FitRequest<'a> {
        FitRequest {
            train_x: x,
            train_targets: TrainTargets::Classification(y),
            val_x: x,
            val_targets: TrainTargets::Classification(y),
            schedule: LrSchedule::constant(0.0003),
            epochs: 5,
            batch_size: 4,
            tag: tag.to_string(),
        }
    }

    #[test]
    fn test_fit_and_predict_separable() {
        let (_dir, service) = service();
        let (x, y) = separable_data(5);

        let core = service.create_core((4, 2)).unwrap();
        let model = service
            .attach_classification_head(core, 2, ClassifierHead::Linear, &adam())
            .unwrap();
        let outcome = service.fit(model, &fit_request(&x, &y, "sep")).unwrap();

        let trained = service.load(&outcome.best_path).unwrap();
        let probs = service.predict(&trained, &x, 3).unwrap();
        assert_eq!(probs.dim(), (10, 2));
        for i in 0..5 {
            assert!(probs[[i, 0]] > probs[[i, 1]]);
            assert!(probs[[i + 5, 1]] > probs[[i + 5, 0]]);
        }
        // Rows sum to one.
        for row in probs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_predict_untrained_fails() {
        let (_dir, service) = service();
        let core = service.create_core((4, 2)).unwrap();
        let model = service
            .attach_classification_head(core, 2, ClassifierHead::Linear, &adam())
            .unwrap();
        let x = Array3::<f32>::zeros((2, 4, 2));
        assert!(service.predict(&model, &x, 4).is_err());
    }

    #[test]
    fn test_predict_without_head_fails() {
        let (_dir, service) = service();
        let core = service.create_core((4, 2)).unwrap();
        let x = Array3::<f32>::zeros((2, 4, 2));
        assert!(service.predict(&core, &x, 4).is_err());
    }

    #[test]
    fn test_extract_har_head_requires_har_output() {
        let (_dir, service) = service();
        let core = service.create_core((4, 2)).unwrap();
        let multitask = service
            .attach_multitask_head(core, &["negated".to_string()], None, &adam())
            .unwrap();
        assert!(service.extract_har_head(&multitask).is_err());

        let core = service.create_core((4, 2)).unwrap();
        let with_har = service
            .attach_multitask_head(
                core,
                &["negated".to_string()],
                Some(HarHeadSpec {
                    num_classes: 3,
                    units: FULL_HEAD_UNITS,
                }),
                &adam(),
            )
            .unwrap();
        let har = service.extract_har_head(&with_har).unwrap();
        assert!(har.tasks.is_empty());
        assert_eq!(har.classifier.unwrap().num_classes(), 3);
    }

    #[test]
    fn test_multitask_fit_trains_task_and_har_heads() {
        let (_dir, service) = service();
        let x = Array3::from_shape_fn((8, 4, 2), |(i, _, _)| i as f32);
        let task_labels = vec![(
            "negated".to_string(),
            Array1::from_shape_fn(8, |i| if i >= 4 { 1.0 } else { 0.0 }),
        )];
        let har = one_hot(&[0, 1, 0, 1, 0, 1, 0, 1], 2);

        let core = service.create_core((4, 2)).unwrap();
        let model = service
            .attach_multitask_head(
                core,
                &["negated".to_string()],
                Some(HarHeadSpec {
                    num_classes: 2,
                    units: FULL_HEAD_UNITS,
                }),
                &adam(),
            )
            .unwrap();

        let request = FitRequest {
            train_x: &x,
            train_targets: TrainTargets::MultiTask {
                tasks: &task_labels,
                har: Some(&har),
            },
            val_x: &x,
            val_targets: TrainTargets::MultiTask {
                tasks: &task_labels,
                har: Some(&har),
            },
            schedule: LrSchedule::step_decay(0.0003),
            epochs: 2,
            batch_size: 4,
            tag: "multitask".to_string(),
        };
        let outcome = service.fit(model, &request).unwrap();
        let trained = service.load(&outcome.best_path).unwrap();

        assert_eq!(trained.tasks.len(), 1);
        // On-centroid averages windows 4..8, off-centroid windows 0..4.
        assert!(trained.tasks[0].on[0] > trained.tasks[0].off[0]);
        assert!(trained.classifier.unwrap().is_trained());
    }

    #[test]
    fn test_unknown_task_rejected() {
        let (_dir, service) = service();
        let x = Array3::<f32>::zeros((2, 4, 2));
        let task_labels = vec![("scaled".to_string(), Array1::zeros(2))];
        let core = service.create_core((4, 2)).unwrap();
        let model = service
            .attach_multitask_head(core, &["negated".to_string()], None, &adam())
            .unwrap();
        let request = FitRequest {
            train_x: &x,
            train_targets: TrainTargets::MultiTask {
                tasks: &task_labels,
                har: None,
            },
            val_x: &x,
            val_targets: TrainTargets::MultiTask {
                tasks: &task_labels,
                har: None,
            },
            schedule: LrSchedule::constant(0.0003),
            epochs: 1,
            batch_size: 2,
            tag: "bad".to_string(),
        };
        assert!(service.fit(model, &request).is_err());
    }

    #[test]
    fn test_artifacts_round_trip() {
        let (_dir, service) = service();
        let (x, y) = separable_data(3);
        let core = service.create_core((4, 2)).unwrap();
        let model = service
            .attach_classification_head(core, 2, ClassifierHead::Hidden { units: 1024 }, &adam())
            .unwrap();
        let outcome = service.fit(model, &fit_request(&x, &y, "roundtrip")).unwrap();

        assert!(outcome.best_path.exists());
        assert!(outcome.last_path.exists());
        let reloaded = service.load(&outcome.best_path).unwrap();
        assert_eq!(reloaded.input_shape, (4, 2));
        assert_eq!(
            reloaded.classifier.as_ref().unwrap().head,
            ClassifierHead::Hidden { units: 1024 }
        );
    }
}
