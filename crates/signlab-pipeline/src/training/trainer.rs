//! Training loop for the gesture classifier with checkpointing and early stopping.

use candle_core::{Device, Tensor, D};
use candle_nn::{Optimizer, VarMap};
use chrono::Utc;
use serde::Serialize;
use signlab_core::{LabelMap, Result, SignLabError, TrainingConfig, TrainingRun, FEATURE_WIDTH};
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::{
    read_artifact, restore_weights, save_bundle, ArtifactInfo, ModelArtifact, CHECKPOINT_FILE,
    LABEL_MAP_FILE, MODEL_FILE,
};
use crate::dataset::{write_label_map, DatasetStore};
use crate::device::{device_name, select_device};
use crate::model::GestureClassifier;
use crate::training::data::{load_dataset, split_dataset, BatchIterator};
use crate::training::metrics::{EvalMetrics, MetricsAccumulator};

/// Per-epoch metrics logged during training.
#[derive(Debug, Clone, Serialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub validation: EvalMetrics,
    /// Whether this epoch produced a new best checkpoint.
    pub improved: bool,
}

/// Result of a successful training run.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    /// The promoted bundle.
    pub artifact: ModelArtifact,
    /// Metrics of the restored best weights on the test split.
    pub test: EvalMetrics,
    pub history: Vec<EpochMetrics>,
    pub best_epoch: usize,
    pub stopped_early: bool,
}

/// Fits a fresh classifier on the dataset store and writes the model bundle.
pub struct Trainer {
    config: TrainingConfig,
    sequence_length: usize,
    model_dir: PathBuf,
    device: Device,
}

impl Trainer {
    pub fn new(config: TrainingConfig, sequence_length: usize, model_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            sequence_length,
            model_dir: model_dir.into(),
            device: select_device(),
        }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Run a full training pass, moving `run` through its lifecycle.
    ///
    /// `run` must be in the `started` state. Any failure after the run is
    /// marked `running` leaves it `failed` and is returned as
    /// [`SignLabError::TrainingFailure`].
    pub fn train(&self, store: &DatasetStore, run: &mut TrainingRun) -> Result<TrainingOutcome> {
        run.mark_running()?;
        tracing::info!(run_id = %run.id, dataset = %store.root().display(), "Training started");

        match self.fit(store) {
            Ok(outcome) => {
                run.complete(outcome.test.accuracy, outcome.test.loss)?;
                tracing::info!(
                    run_id = %run.id,
                    accuracy = outcome.test.accuracy,
                    loss = outcome.test.loss,
                    model = %outcome.artifact.path.display(),
                    "Training completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(run_id = %run.id, error = %e, "Training failed");
                run.fail(e.to_string())?;
                Err(SignLabError::TrainingFailure(Box::new(e)))
            }
        }
    }

    fn fit(&self, store: &DatasetStore) -> Result<TrainingOutcome> {
        let config = &self.config;
        config.validate()?;

        let data = load_dataset(store, self.sequence_length)?;
        let split = split_dataset(data.len(), config.test_size, config.validation_size, config.seed)?;
        let (train_x, train_y) = data.tensors(&split.train, &self.device)?;
        let (val_x, val_y) = data.tensors(&split.validation, &self.device)?;
        let (test_x, test_y) = data.tensors(&split.test, &self.device)?;

        let num_classes = data.label_map.len();
        let varmap = VarMap::new();
        let model =
            GestureClassifier::new_trainable(&varmap, &self.device, FEATURE_WIDTH, num_classes)?;

        let mut optimizer = candle_nn::AdamW::new(
            varmap.all_vars(),
            candle_nn::ParamsAdamW {
                lr: config.learning_rate,
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-7,
                weight_decay: 0.0,
            },
        )
        .map_err(|e| SignLabError::Model(format!("Failed to create optimizer: {e}")))?;

        fs::create_dir_all(&self.model_dir).map_err(|e| SignLabError::io(&self.model_dir, e))?;
        let checkpoint = self.model_dir.join(CHECKPOINT_FILE);

        let mut batches = BatchIterator::new(train_x, train_y, config.batch_size)?;
        let mut best_accuracy = f64::NEG_INFINITY;
        let mut best_epoch = 0usize;
        let mut patience_counter = 0usize;
        let mut stopped_early = false;
        let mut history: Vec<EpochMetrics> = Vec::new();

        tracing::info!(
            classes = num_classes,
            device = device_name(&self.device),
            train = batches.len(),
            lr = config.learning_rate,
            batch_size = config.batch_size,
            max_epochs = config.epochs,
            patience = config.patience,
            "Fitting gesture classifier"
        );

        for epoch in 0..config.epochs {
            batches.reshuffle(config.seed, epoch);

            let mut epoch_loss = 0.0;
            let mut batch_count = 0usize;
            while let Some((xs, ys)) = batches.next_batch()? {
                let logits = model.forward_logits(&xs, true)?;
                let loss = candle_nn::loss::cross_entropy(&logits, &ys)
                    .map_err(|e| SignLabError::Model(format!("Loss computation failed: {e}")))?;
                optimizer
                    .backward_step(&loss)
                    .map_err(|e| SignLabError::Model(format!("Backward step failed: {e}")))?;
                epoch_loss += scalar(&loss)?;
                batch_count += 1;
            }
            let train_loss = if batch_count > 0 {
                epoch_loss / batch_count as f64
            } else {
                0.0
            };

            let validation = evaluate(&model, &val_x, &val_y, config.batch_size)?;
            let improved = validation.accuracy > best_accuracy;
            if improved {
                best_accuracy = validation.accuracy;
                best_epoch = epoch + 1;
                patience_counter = 0;
                let info = ArtifactInfo {
                    sequence_length: self.sequence_length,
                    feature_width: FEATURE_WIDTH,
                    num_classes,
                    created_at: Utc::now(),
                };
                save_bundle(&varmap, &data.label_map, &info, &checkpoint)?;
            } else {
                patience_counter += 1;
            }

            tracing::info!(
                epoch = epoch + 1,
                train_loss,
                val_loss = validation.loss,
                val_accuracy = validation.accuracy,
                improved,
                "Epoch finished"
            );
            history.push(EpochMetrics {
                epoch: epoch + 1,
                train_loss,
                validation,
                improved,
            });

            if !improved && patience_counter >= config.patience {
                tracing::info!(
                    epoch = epoch + 1,
                    patience = config.patience,
                    "Early stopping, validation accuracy stalled"
                );
                stopped_early = true;
                break;
            }
        }

        restore_weights(&varmap, &checkpoint)?;
        let test = evaluate(&model, &test_x, &test_y, config.batch_size)?;
        tracing::info!(best_epoch, best_val_accuracy = best_accuracy, test = %test, "Restored best weights");

        let artifact = self.promote(&checkpoint, &data.label_map)?;
        Ok(TrainingOutcome {
            artifact,
            test,
            history,
            best_epoch,
            stopped_early,
        })
    }

    /// Move the checkpoint into place as the served bundle, then write the sidecar.
    fn promote(&self, checkpoint: &Path, label_map: &LabelMap) -> Result<ModelArtifact> {
        let target = self.model_dir.join(MODEL_FILE);
        fs::rename(checkpoint, &target).map_err(|e| SignLabError::io(&target, e))?;
        // The bundle is live from here on; the sidecar is informational only.
        let sidecar = self.model_dir.join(LABEL_MAP_FILE);
        if let Err(e) = write_label_map(label_map, &sidecar) {
            tracing::warn!(path = %sidecar.display(), error = %e, "Failed to write label map sidecar");
        }
        read_artifact(&target)
    }
}

/// Batched loss and accuracy of `model` in inference mode.
pub fn evaluate(
    model: &GestureClassifier,
    inputs: &Tensor,
    labels: &Tensor,
    batch_size: usize,
) -> Result<EvalMetrics> {
    let mut batches = BatchIterator::new(inputs.clone(), labels.clone(), batch_size)?;
    let mut acc = MetricsAccumulator::default();
    while let Some((xs, ys)) = batches.next_batch()? {
        let logits = model.forward_logits(&xs, false)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &ys)
            .map_err(|e| SignLabError::Model(format!("Eval loss failed: {e}")))?;
        let predictions: Vec<u32> = logits
            .argmax(D::Minus1)
            .and_then(|t| t.to_vec1())
            .map_err(|e| SignLabError::Model(format!("argmax failed: {e}")))?;
        let targets: Vec<u32> = ys
            .to_vec1()
            .map_err(|e| SignLabError::Model(format!("labels to vec: {e}")))?;
        acc.add_batch(scalar(&loss)?, &predictions, &targets);
    }
    Ok(acc.finish())
}

fn scalar(loss: &Tensor) -> Result<f64> {
    loss.to_scalar::<f32>()
        .map(f64::from)
        .map_err(|e| SignLabError::Model(format!("Loss scalar failed: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use signlab_core::RunStatus;

    #[test]
    fn test_failed_run_is_marked_and_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("missing"));
        let trainer = Trainer::new(TrainingConfig::default(), 30, dir.path().join("models"));
        let mut run = TrainingRun::new();

        let err = trainer.train(&store, &mut run).unwrap_err();
        assert!(matches!(err, SignLabError::TrainingFailure(_)));
        assert!(matches!(run.status(), RunStatus::Failed { .. }));
        assert!(run.finished_at.is_some());
        assert!(!dir.path().join("models").join(MODEL_FILE).exists());
    }

    #[test]
    fn test_run_must_start_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());
        let trainer = Trainer::new(TrainingConfig::default(), 30, dir.path().join("models"));
        let mut run = TrainingRun::new();
        run.mark_running().unwrap();

        assert!(matches!(
            trainer.train(&store, &mut run),
            Err(SignLabError::InvalidTransition { .. })
        ));
        assert_eq!(run.status(), &RunStatus::Running);
    }

    #[test]
    fn test_evaluate_counts_every_sample() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = GestureClassifier::new_trainable(&varmap, &device, 6, 3).unwrap();
        let xs = Tensor::zeros((5, 2, 6), DType::F32, &device).unwrap();
        let ys = Tensor::new(&[0u32, 1, 2, 0, 1], &device).unwrap();

        let m = evaluate(&model, &xs, &ys, 2).unwrap();
        assert_eq!(m.total, 5);
        assert!(m.loss > 0.0);
        assert!((0.0..=1.0).contains(&m.accuracy));
    }
}
