//! Gated gesture prediction over a lazily loaded model bundle.
//!
//! An [`InferenceService`] is created once per process and shared by all
//! prediction calls. The bundle is loaded on first use, at most once; a
//! failed load is not cached, so a later call retries after training has
//! produced a bundle.

use candle_core::{Device, Tensor};
use signlab_core::{
    Frame, LabelMap, Prediction, PredictionRequest, Result, SignLabError, FEATURE_WIDTH,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::artifact::load_classifier;
use crate::device::{device_name, select_device};
use crate::model::GestureClassifier;
use crate::shaper::{flatten_sequence, preprocess_sequence};

/// Message attached to predictions that fail the confidence gate.
pub const LOW_CONFIDENCE_MESSAGE: &str = "Confidence too low for a reliable prediction";

/// Anything that maps one flattened sequence to class probabilities.
pub trait GestureModel: Send + Sync {
    /// Probabilities for one row-major `[sequence_length, FEATURE_WIDTH]` input.
    fn class_probabilities(&self, features: &[f32], sequence_length: usize) -> Result<Vec<f32>>;
}

impl GestureModel for GestureClassifier {
    fn class_probabilities(&self, features: &[f32], sequence_length: usize) -> Result<Vec<f32>> {
        let input = Tensor::from_slice(features, (1, sequence_length, FEATURE_WIDTH), self.device())
            .map_err(|e| SignLabError::Model(format!("Failed to create input tensor: {e}")))?;
        self.probabilities(&input)?
            .squeeze(0)
            .and_then(|t| t.to_vec1())
            .map_err(|e| SignLabError::Model(format!("Failed to extract probabilities: {e}")))
    }
}

/// A model together with the label map it was trained with.
struct LoadedModel {
    model: Box<dyn GestureModel>,
    label_map: LabelMap,
    sequence_length: usize,
}

/// Prediction context: bundle location, gate threshold, and the model cache.
pub struct InferenceService {
    model_path: PathBuf,
    threshold: f32,
    device: Device,
    cache: RwLock<Option<Arc<LoadedModel>>>,
}

impl InferenceService {
    /// Service that loads the bundle at `model_path` on first prediction.
    pub fn new(model_path: impl Into<PathBuf>, threshold: f32) -> Self {
        Self {
            model_path: model_path.into(),
            threshold,
            device: select_device(),
            cache: RwLock::new(None),
        }
    }

    /// Service around an already loaded model.
    pub fn with_model(
        model: Box<dyn GestureModel>,
        label_map: LabelMap,
        sequence_length: usize,
        threshold: f32,
    ) -> Self {
        let loaded = LoadedModel {
            model,
            label_map,
            sequence_length,
        };
        Self {
            model_path: PathBuf::new(),
            threshold,
            device: Device::Cpu,
            cache: RwLock::new(Some(Arc::new(loaded))),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Whether a model is cached.
    pub fn is_loaded(&self) -> bool {
        self.cache.read().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Label map of the cached model, loading it if needed.
    pub fn label_map(&self) -> Result<LabelMap> {
        Ok(self.loaded()?.label_map.clone())
    }

    fn loaded(&self) -> Result<Arc<LoadedModel>> {
        {
            let cache = self
                .cache
                .read()
                .map_err(|_| SignLabError::Model("model cache lock poisoned".to_string()))?;
            if let Some(loaded) = cache.as_ref() {
                return Ok(Arc::clone(loaded));
            }
        }

        let mut cache = self
            .cache
            .write()
            .map_err(|_| SignLabError::Model("model cache lock poisoned".to_string()))?;
        // Another caller may have finished loading while we waited.
        if let Some(loaded) = cache.as_ref() {
            return Ok(Arc::clone(loaded));
        }

        let (artifact, model) =
            load_classifier(&self.model_path, &self.device).inspect_err(|e| {
                tracing::error!(path = %self.model_path.display(), error = %e, "Failed to load gesture model");
            })?;
        tracing::debug!(device = device_name(&self.device), "Serving gesture model");
        let loaded = Arc::new(LoadedModel {
            model: Box::new(model),
            label_map: artifact.label_map,
            sequence_length: artifact.info.sequence_length,
        });
        *cache = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Classify a raw frame sequence and apply the confidence gate.
    pub fn predict(&self, frames: &[Frame]) -> Result<Prediction> {
        let loaded = self.loaded()?;
        tracing::debug!(frames = frames.len(), "Preparing sequence for prediction");
        let shaped = preprocess_sequence(frames, loaded.sequence_length)?;
        let features = flatten_sequence(&shaped)?;

        let probabilities = loaded
            .model
            .class_probabilities(&features, loaded.sequence_length)?;
        let (index, confidence) = argmax(&probabilities)
            .ok_or_else(|| SignLabError::Model("model returned no usable probabilities".to_string()))?;

        let prediction = apply_confidence_gate(index, confidence, self.threshold, &loaded.label_map)?;
        match &prediction.predicted_label {
            Some(label) => tracing::info!(label = %label, confidence, "Prediction accepted"),
            None => tracing::warn!(
                confidence,
                threshold = self.threshold,
                "Low confidence, prediction not accepted"
            ),
        }
        Ok(prediction)
    }

    /// [`predict`](Self::predict) for a deserialized request body.
    pub fn predict_request(&self, request: &PredictionRequest) -> Result<Prediction> {
        self.predict(&request.frames_data)
    }
}

/// Index and value of the largest probability; ties go to the lowest index.
///
/// NaN entries are ignored. `None` when nothing else is left.
pub fn argmax(probabilities: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &p) in probabilities.iter().enumerate() {
        if p.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if p <= current => {}
            _ => best = Some((idx, p)),
        }
    }
    best
}

/// Turn an arg-max result into a [`Prediction`].
///
/// Below `threshold` the label is withheld and a message explains why;
/// this is a successful outcome, not an error.
pub fn apply_confidence_gate(
    index: usize,
    confidence: f32,
    threshold: f32,
    label_map: &LabelMap,
) -> Result<Prediction> {
    if confidence < threshold {
        return Ok(Prediction {
            predicted_label: None,
            confidence,
            message: Some(LOW_CONFIDENCE_MESSAGE.to_string()),
        });
    }
    let label = label_map.label_of(index).ok_or_else(|| {
        SignLabError::Model(format!(
            "predicted class {index} is outside the label map ({} classes)",
            label_map.len()
        ))
    })?;
    Ok(Prediction {
        predicted_label: Some(label.to_string()),
        confidence,
        message: None,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use signlab_core::DEFAULT_CONFIDENCE_THRESHOLD;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedModel {
        probabilities: Vec<f32>,
        calls: Arc<AtomicUsize>,
    }

    impl GestureModel for FixedModel {
        fn class_probabilities(&self, features: &[f32], sequence_length: usize) -> Result<Vec<f32>> {
            assert_eq!(features.len(), sequence_length * FEATURE_WIDTH);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.probabilities.clone())
        }
    }

    fn service(probabilities: Vec<f32>) -> (InferenceService, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = FixedModel {
            probabilities,
            calls: Arc::clone(&calls),
        };
        let svc = InferenceService::with_model(
            Box::new(model),
            LabelMap::from_labels(["GRACIAS", "HOLA"]),
            30,
            DEFAULT_CONFIDENCE_THRESHOLD,
        );
        (svc, calls)
    }

    #[test]
    fn test_confident_prediction_is_decoded() {
        let (svc, calls) = service(vec![0.05, 0.95]);
        let prediction = svc.predict(&vec![Frame::default(); 3]).unwrap();
        assert_eq!(prediction.predicted_label.as_deref(), Some("HOLA"));
        assert!((prediction.confidence - 0.95).abs() < 1e-6);
        assert!(prediction.message.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_low_confidence_withholds_label() {
        let (svc, _) = service(vec![0.45, 0.55]);
        let prediction = svc.predict(&[Frame::default()]).unwrap();
        assert!(!prediction.is_accepted());
        assert!((prediction.confidence - 0.55).abs() < 1e-6);
        assert_eq!(prediction.message.as_deref(), Some(LOW_CONFIDENCE_MESSAGE));
    }

    #[test]
    fn test_gate_boundary_accepts_threshold() {
        let map = LabelMap::from_labels(["A"]);
        let p = apply_confidence_gate(0, 0.8, 0.8, &map).unwrap();
        assert_eq!(p.predicted_label.as_deref(), Some("A"));
        let p = apply_confidence_gate(0, 0.79, 0.8, &map).unwrap();
        assert_eq!(p.predicted_label, None);
        assert!(apply_confidence_gate(3, 0.9, 0.8, &map).is_err());
    }

    #[test]
    fn test_argmax_ties_pick_lowest_index() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), Some((1, 0.4)));
        assert_eq!(argmax(&[0.9]), Some((0, 0.9)));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_argmax_ignores_nan_anywhere() {
        assert_eq!(argmax(&[f32::NAN, 0.3, 0.7]), Some((2, 0.7)));
        assert_eq!(argmax(&[0.6, f32::NAN, 0.4]), Some((0, 0.6)));
        assert_eq!(argmax(&[0.2, 0.5, f32::NAN]), Some((1, 0.5)));
        assert_eq!(argmax(&[f32::NAN, f32::NAN]), None);
    }

    #[test]
    fn test_all_nan_output_is_model_error() {
        let (svc, _) = service(vec![f32::NAN, f32::NAN]);
        assert!(matches!(
            svc.predict(&[Frame::default()]),
            Err(SignLabError::Model(_))
        ));
    }

    #[test]
    fn test_empty_request_is_invalid_sequence() {
        let (svc, calls) = service(vec![0.0, 1.0]);
        let request: PredictionRequest = serde_json::from_str("{}").unwrap();
        assert!(matches!(
            svc.predict_request(&request),
            Err(SignLabError::InvalidSequence(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_model_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let svc = InferenceService::new(dir.path().join("gesture_model.safetensors"), 0.8);
        for _ in 0..2 {
            assert!(matches!(
                svc.predict(&[Frame::default()]),
                Err(SignLabError::ModelNotFound { .. })
            ));
        }
        assert!(!svc.is_loaded());
    }
}
