//! Model bundle: trained weights plus the label map they were trained with.
//!
//! The bundle is a single safetensors file. Its header metadata carries the
//! label map and the input geometry, so the inference path never has to pair
//! weights with a separately generated map.

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use signlab_core::{LabelMap, Result, SignLabError};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::GestureClassifier;
use crate::tensor_io::{self, NamedTensor};

/// File name of the promoted model bundle inside the model directory.
pub const MODEL_FILE: &str = "gesture_model.safetensors";

/// File name of the best-so-far checkpoint written during training.
pub const CHECKPOINT_FILE: &str = "checkpoint.safetensors";

/// File name of the JSON label map sidecar.
pub const LABEL_MAP_FILE: &str = "label_map.json";

const FORMAT_TAG: &str = "signlab-gesture-v1";

const META_FORMAT: &str = "format";
const META_LABEL_MAP: &str = "label_map";
const META_SEQUENCE_LENGTH: &str = "sequence_length";
const META_FEATURE_WIDTH: &str = "feature_width";
const META_NUM_CLASSES: &str = "num_classes";
const META_CREATED_AT: &str = "created_at";

/// Input geometry and provenance recorded in a bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactInfo {
    pub sequence_length: usize,
    pub feature_width: usize,
    pub num_classes: usize,
    pub created_at: DateTime<Utc>,
}

/// A persisted bundle, as found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArtifact {
    pub path: PathBuf,
    pub info: ArtifactInfo,
    pub label_map: LabelMap,
}

/// Bundle path inside a model directory.
pub fn model_path(model_dir: &Path) -> PathBuf {
    model_dir.join(MODEL_FILE)
}

/// Write the current parameters of `varmap` and the label map to `path`.
pub fn save_bundle(
    varmap: &VarMap,
    label_map: &LabelMap,
    info: &ArtifactInfo,
    path: &Path,
) -> Result<()> {
    let tensors = {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| SignLabError::Model("varmap lock poisoned".to_string()))?;
        let mut tensors = Vec::with_capacity(data.len());
        for (name, var) in data.iter() {
            let values: Vec<f32> = var
                .as_tensor()
                .flatten_all()
                .and_then(|t| t.to_vec1())
                .map_err(|e| SignLabError::Model(format!("Failed to read {name}: {e}")))?;
            tensors.push(NamedTensor::new(name.clone(), var.dims().to_vec(), values));
        }
        tensors
    };

    let mut metadata = HashMap::new();
    metadata.insert(META_FORMAT.to_string(), FORMAT_TAG.to_string());
    metadata.insert(META_LABEL_MAP.to_string(), serde_json::to_string(label_map)?);
    metadata.insert(META_SEQUENCE_LENGTH.to_string(), info.sequence_length.to_string());
    metadata.insert(META_FEATURE_WIDTH.to_string(), info.feature_width.to_string());
    metadata.insert(META_NUM_CLASSES.to_string(), info.num_classes.to_string());
    metadata.insert(META_CREATED_AT.to_string(), info.created_at.to_rfc3339());

    let bytes = tensor_io::encode(&tensors, Some(metadata))?;
    tensor_io::write_replace(path, &bytes)?;
    tracing::debug!(path = %path.display(), tensors = tensors.len(), "Saved model bundle");
    Ok(())
}

/// Overwrite the parameters of `varmap` with those stored in a bundle.
pub fn restore_weights(varmap: &VarMap, path: &Path) -> Result<()> {
    let bytes = read_bytes(path)?;
    let data = varmap
        .data()
        .lock()
        .map_err(|_| SignLabError::Model("varmap lock poisoned".to_string()))?;
    for (name, var) in data.iter() {
        let stored = tensor_io::decode_tensor(&bytes, name)?;
        let tensor = Tensor::from_vec(stored.data, stored.shape.as_slice(), var.device())
            .map_err(|e| SignLabError::Model(format!("Failed to rebuild {name}: {e}")))?;
        var.set(&tensor)
            .map_err(|e| SignLabError::Model(format!("Failed to restore {name}: {e}")))?;
    }
    Ok(())
}

/// Read a bundle's header: label map and geometry. Weights are not parsed.
pub fn read_artifact(path: &Path) -> Result<ModelArtifact> {
    let bytes = read_bytes(path)?;
    parse_artifact(path, &bytes)
}

/// Load a bundle into a ready classifier.
pub fn load_classifier(path: &Path, device: &Device) -> Result<(ModelArtifact, GestureClassifier)> {
    let bytes = read_bytes(path)?;
    let artifact = parse_artifact(path, &bytes)?;
    let model = GestureClassifier::from_buffer(
        bytes,
        device,
        artifact.info.feature_width,
        artifact.info.num_classes,
    )?;
    tracing::info!(
        path = %path.display(),
        classes = artifact.info.num_classes,
        sequence_length = artifact.info.sequence_length,
        "Loaded gesture model"
    );
    Ok((artifact, model))
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SignLabError::ModelNotFound {
                path: path.to_path_buf(),
            }
        } else {
            SignLabError::io(path, e)
        }
    })
}

fn parse_artifact(path: &Path, bytes: &[u8]) -> Result<ModelArtifact> {
    let metadata = tensor_io::decode_metadata(bytes)?;

    let format = metadata.get(META_FORMAT).map(String::as_str);
    if format != Some(FORMAT_TAG) {
        return Err(SignLabError::Model(format!(
            "{} is not a gesture model bundle (format {format:?})",
            path.display()
        )));
    }

    let label_map: LabelMap = match metadata.get(META_LABEL_MAP) {
        Some(json) => serde_json::from_str(json)?,
        None => {
            return Err(SignLabError::LabelMapNotFound {
                path: path.to_path_buf(),
            })
        }
    };

    let info = ArtifactInfo {
        sequence_length: meta_usize(&metadata, META_SEQUENCE_LENGTH)?,
        feature_width: meta_usize(&metadata, META_FEATURE_WIDTH)?,
        num_classes: meta_usize(&metadata, META_NUM_CLASSES)?,
        created_at: metadata
            .get(META_CREATED_AT)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default(),
    };

    if info.num_classes != label_map.len() {
        return Err(SignLabError::Model(format!(
            "bundle declares {} classes but its label map has {}",
            info.num_classes,
            label_map.len()
        )));
    }

    Ok(ModelArtifact {
        path: path.to_path_buf(),
        info,
        label_map,
    })
}

fn meta_usize(metadata: &HashMap<String, String>, key: &str) -> Result<usize> {
    metadata
        .get(key)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| SignLabError::Model(format!("bundle metadata '{key}' missing or invalid")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    const WIDTH: usize = 6;

    fn info(num_classes: usize) -> ArtifactInfo {
        ArtifactInfo {
            sequence_length: 4,
            feature_width: WIDTH,
            num_classes,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_bundle_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_path(dir.path());
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = GestureClassifier::new_trainable(&varmap, &device, WIDTH, 2).unwrap();
        let map = LabelMap::from_labels(["HOLA", "GRACIAS"]);

        save_bundle(&varmap, &map, &info(2), &path).unwrap();

        let (artifact, loaded) = load_classifier(&path, &device).unwrap();
        assert_eq!(artifact.label_map, map);
        assert_eq!(artifact.info.sequence_length, 4);
        assert_eq!(loaded.num_classes(), 2);

        let xs = Tensor::ones((1, 4, WIDTH), DType::F32, &device).unwrap();
        let expected: Vec<Vec<f32>> = model.probabilities(&xs).unwrap().to_vec2().unwrap();
        let actual: Vec<Vec<f32>> = loaded.probabilities(&xs).unwrap().to_vec2().unwrap();
        for (a, b) in expected[0].iter().zip(&actual[0]) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_restore_weights_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = GestureClassifier::new_trainable(&varmap, &device, WIDTH, 2).unwrap();
        save_bundle(&varmap, &LabelMap::from_labels(["A", "B"]), &info(2), &path).unwrap();

        let xs = Tensor::ones((1, 4, WIDTH), DType::F32, &device).unwrap();
        let before: Vec<Vec<f32>> = model.probabilities(&xs).unwrap().to_vec2().unwrap();

        for var in varmap.all_vars() {
            let zeros = var.zeros_like().unwrap();
            var.set(&zeros).unwrap();
        }
        restore_weights(&varmap, &path).unwrap();

        let after: Vec<Vec<f32>> = model.probabilities(&xs).unwrap().to_vec2().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_missing_bundle_is_model_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_artifact(&model_path(dir.path())).unwrap_err();
        assert!(matches!(err, SignLabError::ModelNotFound { .. }));
    }

    #[test]
    fn test_bundle_without_label_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_path(dir.path());
        let mut metadata = HashMap::new();
        metadata.insert(META_FORMAT.to_string(), FORMAT_TAG.to_string());
        let bytes = tensor_io::encode(&[NamedTensor::new("w", vec![1], vec![0.0])], Some(metadata))
            .unwrap();
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            read_artifact(&path),
            Err(SignLabError::LabelMapNotFound { .. })
        ));
    }

    #[test]
    fn test_foreign_safetensors_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.safetensors");
        let bytes = tensor_io::encode(&[NamedTensor::new("w", vec![1], vec![0.0])], None).unwrap();
        fs::write(&path, bytes).unwrap();
        assert!(matches!(read_artifact(&path), Err(SignLabError::Model(_))));
    }
}
