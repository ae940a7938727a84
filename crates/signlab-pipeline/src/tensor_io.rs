//! Safetensors encoding for `f32` tensors with optional header metadata.
//!
//! Used both for dataset sequences and for model bundles, whose header
//! metadata carries the label map.

use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use signlab_core::{Result, SignLabError};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

/// A named, owned `f32` tensor in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl NamedTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            shape,
            data,
        }
    }
}

/// Serialize tensors plus optional string metadata into safetensors bytes.
pub fn encode(tensors: &[NamedTensor], metadata: Option<HashMap<String, String>>) -> Result<Vec<u8>> {
    let bytes: Vec<Vec<u8>> = tensors
        .iter()
        .map(|t| t.data.iter().flat_map(|f| f.to_le_bytes()).collect())
        .collect();

    let mut views = HashMap::new();
    for (tensor, raw) in tensors.iter().zip(&bytes) {
        let view = TensorView::new(Dtype::F32, tensor.shape.clone(), raw).map_err(|e| {
            SignLabError::Model(format!("TensorView create failed for {}: {e}", tensor.name))
        })?;
        views.insert(tensor.name.clone(), view);
    }

    safetensors::tensor::serialize(&views, &metadata)
        .map_err(|e| SignLabError::Model(format!("safetensors serialize failed: {e}")))
}

/// Read one `f32` tensor by name from safetensors bytes.
pub fn decode_tensor(buffer: &[u8], name: &str) -> Result<NamedTensor> {
    let tensors = SafeTensors::deserialize(buffer)
        .map_err(|e| SignLabError::Dataset(format!("failed to parse safetensors: {e}")))?;
    let view = tensors
        .tensor(name)
        .map_err(|e| SignLabError::Dataset(format!("tensor '{name}' not found: {e}")))?;
    if view.dtype() != Dtype::F32 {
        return Err(SignLabError::Dataset(format!(
            "tensor '{name}' has dtype {:?}, expected F32",
            view.dtype()
        )));
    }

    let data: Vec<f32> = view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(NamedTensor::new(name, view.shape().to_vec(), data))
}

/// Header metadata of a safetensors buffer (empty when absent).
pub fn decode_metadata(buffer: &[u8]) -> Result<HashMap<String, String>> {
    let (_, metadata) = SafeTensors::read_metadata(buffer)
        .map_err(|e| SignLabError::Model(format!("failed to read safetensors header: {e}")))?;
    Ok(metadata.metadata().clone().unwrap_or_default())
}

/// Write bytes to `path` only if the file does not exist yet.
///
/// Returns `Ok(false)` when the name is already taken.
pub fn write_new(path: &Path, bytes: &[u8]) -> Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(SignLabError::io(path, e)),
    };
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|e| SignLabError::io(path, e))?;
    Ok(true)
}

/// Replace `path` with `bytes` via a sibling temp file and a rename.
pub fn write_replace(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SignLabError::io(parent, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);
    fs::write(tmp, bytes).map_err(|e| SignLabError::io(tmp, e))?;
    fs::rename(tmp, path).map_err(|e| SignLabError::io(path, e))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_with_metadata() {
        let tensor = NamedTensor::new("sequence", vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut meta = HashMap::new();
        meta.insert("kind".to_string(), "demo".to_string());

        let bytes = encode(std::slice::from_ref(&tensor), Some(meta)).unwrap();
        assert_eq!(decode_tensor(&bytes, "sequence").unwrap(), tensor);
        assert_eq!(decode_metadata(&bytes).unwrap()["kind"], "demo");
    }

    #[test]
    fn test_missing_tensor_and_metadata() {
        let tensor = NamedTensor::new("a", vec![1], vec![0.5]);
        let bytes = encode(&[tensor], None).unwrap();
        assert!(decode_tensor(&bytes, "b").is_err());
        assert!(decode_metadata(&bytes).unwrap().is_empty());
        assert!(decode_tensor(b"not safetensors", "a").is_err());
    }

    #[test]
    fn test_write_new_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        assert!(write_new(&path, b"one").unwrap());
        assert!(!write_new(&path, b"two").unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"one");
    }

    #[test]
    fn test_write_replace_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("x.bin");
        write_replace(&path, b"one").unwrap();
        write_replace(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }
}
