//! Label-partitioned dataset store and label-map derivation.
//!
//! Layout:
//!
//! ```text
//! <root>/
//!   GRACIAS/seq_001.safetensors
//!   GRACIAS/seq_002.safetensors
//!   HOLA/seq_001.safetensors
//! ```
//!
//! Each file holds one `f32` tensor named `sequence` of shape `[T, 1629]`.
//! Class indices come from the sorted partition names, so the map must be
//! rebuilt whenever partitions change and must travel with the trained model.

use serde::Serialize;
use signlab_core::{CapturePayload, Frame, LabelMap, Result, SignLabError, FEATURE_WIDTH};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::shaper::{flatten_sequence, preprocess_sequence};
use crate::tensor_io::{self, NamedTensor};

/// Tensor name used inside every stored sequence file.
pub const SEQUENCE_TENSOR: &str = "sequence";

const SEQUENCE_PREFIX: &str = "seq_";
const SEQUENCE_EXT: &str = "safetensors";

/// Filesystem store rooted at a dataset directory.
pub struct DatasetStore {
    root: PathBuf,
    /// Serializes per-label index allocation within the process.
    write_lock: Mutex<()>,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist an already normalized and shaped sequence under `label`.
    ///
    /// Returns the path of the new file, named with the next unused index.
    pub fn store(&self, frames: &[Frame], label: &str) -> Result<PathBuf> {
        validate_label(label)?;
        if frames.is_empty() {
            return Err(SignLabError::InvalidSequence(
                "refusing to store an empty sequence".to_string(),
            ));
        }
        let data = flatten_sequence(frames)?;
        let tensor = NamedTensor::new(SEQUENCE_TENSOR, vec![frames.len(), FEATURE_WIDTH], data);
        let bytes = tensor_io::encode(&[tensor], None)?;

        let dir = self.root.join(label);
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| SignLabError::Dataset("dataset write lock poisoned".to_string()))?;
        fs::create_dir_all(&dir).map_err(|e| SignLabError::io(&dir, e))?;

        let mut index = next_sequence_index(&dir)?;
        loop {
            let path = dir.join(sequence_file_name(index));
            // Another process may have claimed the name since the scan.
            if tensor_io::write_new(&path, &bytes)? {
                tracing::info!(label, path = %path.display(), "Stored sequence");
                return Ok(path);
            }
            index += 1;
        }
    }

    /// Normalize, shape, and persist a labeled capture.
    pub fn store_capture(&self, payload: &CapturePayload, target_length: usize) -> Result<PathBuf> {
        let frames = preprocess_sequence(&payload.frames_data, target_length)?;
        self.store(&frames, &payload.label)
    }

    /// Sorted names of the label partitions.
    ///
    /// Directories whose names are not valid UTF-8 cannot be labels and are
    /// skipped.
    pub fn labels(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.root).map_err(|e| SignLabError::io(&self.root, e))?;
        let mut labels = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SignLabError::io(&self.root, e))?;
            let is_dir = entry
                .file_type()
                .map_err(|e| SignLabError::io(entry.path(), e))?
                .is_dir();
            if !is_dir {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(label) => labels.push(label),
                Err(raw) => tracing::warn!(
                    partition = ?raw,
                    "Skipping partition whose name is not valid UTF-8"
                ),
            }
        }
        labels.sort();
        Ok(labels)
    }

    /// Derive the label map from the current partitions.
    pub fn build_label_map(&self) -> Result<LabelMap> {
        let map = LabelMap::from_labels(self.labels()?);
        tracing::info!(classes = map.len(), label_map = %map, "Built label map");
        Ok(map)
    }

    /// Sequence files of one label, in index order.
    pub fn sequence_files(&self, label: &str) -> Result<Vec<PathBuf>> {
        let dir = self.root.join(label);
        let entries = fs::read_dir(&dir).map_err(|e| SignLabError::io(&dir, e))?;
        let mut files: Vec<(u32, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SignLabError::io(&dir, e))?;
            let name = entry.file_name();
            if let Some(index) = parse_sequence_index(&name.to_string_lossy()) {
                files.push((index, entry.path()));
            }
        }
        files.sort();
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }
}

/// Read a stored sequence tensor.
pub fn load_sequence(path: &Path) -> Result<NamedTensor> {
    let bytes = fs::read(path).map_err(|e| SignLabError::io(path, e))?;
    tensor_io::decode_tensor(&bytes, SEQUENCE_TENSOR)
}

/// Write a label map as pretty JSON.
pub fn write_label_map(map: &LabelMap, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(map)?;
    tensor_io::write_replace(path, json.as_bytes())
}

/// Read a label map written by [`write_label_map`].
pub fn read_label_map(path: &Path) -> Result<LabelMap> {
    let json = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SignLabError::LabelMapNotFound {
                path: path.to_path_buf(),
            }
        } else {
            SignLabError::io(path, e)
        }
    })?;
    Ok(serde_json::from_str(&json)?)
}

fn validate_label(label: &str) -> Result<()> {
    let bad = label.is_empty()
        || label == "."
        || label == ".."
        || label.contains(['/', '\\', '\0'])
        || label.trim() != label;
    if bad {
        return Err(SignLabError::InvalidLabel(label.to_string()));
    }
    Ok(())
}

fn sequence_file_name(index: u32) -> String {
    format!("{SEQUENCE_PREFIX}{index:03}.{SEQUENCE_EXT}")
}

fn parse_sequence_index(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix(SEQUENCE_PREFIX)?
        .strip_suffix(SEQUENCE_EXT)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

fn next_sequence_index(dir: &Path) -> Result<u32> {
    let entries = fs::read_dir(dir).map_err(|e| SignLabError::io(dir, e))?;
    let mut max = 0;
    for entry in entries {
        let entry = entry.map_err(|e| SignLabError::io(dir, e))?;
        if let Some(index) = parse_sequence_index(&entry.file_name().to_string_lossy()) {
            max = max.max(index);
        }
    }
    Ok(max + 1)
}

// ---------------------------------------------------------------------------
// Batch ingestion
// ---------------------------------------------------------------------------

/// Counts from a batch ingestion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub processed: usize,
    pub stored: usize,
    pub failed: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessedCapture<'a> {
    frames_data: &'a [Frame],
    label: &'a str,
}

/// Preprocess and store every `*.json` capture found in `input_dir`.
///
/// Files that fail to parse or process are logged and counted, not fatal.
/// When `processed_dir` is given the normalized frames are also written
/// there as JSON under the same file name.
pub fn ingest_captures(
    store: &DatasetStore,
    input_dir: &Path,
    processed_dir: Option<&Path>,
    target_length: usize,
) -> Result<IngestReport> {
    let entries = fs::read_dir(input_dir).map_err(|e| SignLabError::io(input_dir, e))?;
    let mut inputs: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| SignLabError::io(input_dir, e))?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            inputs.push(path);
        }
    }
    inputs.sort();

    if let Some(dir) = processed_dir {
        fs::create_dir_all(dir).map_err(|e| SignLabError::io(dir, e))?;
    }

    tracing::info!(dir = %input_dir.display(), files = inputs.len(), "Ingesting captures");
    let mut report = IngestReport::default();
    for path in &inputs {
        report.processed += 1;
        match ingest_one(store, path, processed_dir, target_length) {
            Ok(stored) => {
                report.stored += 1;
                tracing::debug!(input = %path.display(), stored = %stored.display(), "Capture ingested");
            }
            Err(e) => {
                report.failed += 1;
                tracing::error!(input = %path.display(), error = %e, "Failed to ingest capture");
            }
        }
    }
    tracing::info!(
        processed = report.processed,
        stored = report.stored,
        failed = report.failed,
        "Capture ingestion finished"
    );
    Ok(report)
}

fn ingest_one(
    store: &DatasetStore,
    path: &Path,
    processed_dir: Option<&Path>,
    target_length: usize,
) -> Result<PathBuf> {
    let json = fs::read_to_string(path).map_err(|e| SignLabError::io(path, e))?;
    let payload: CapturePayload = serde_json::from_str(&json)?;
    let frames = preprocess_sequence(&payload.frames_data, target_length)?;

    if let (Some(dir), Some(name)) = (processed_dir, path.file_name()) {
        let processed = ProcessedCapture {
            frames_data: &frames,
            label: &payload.label,
        };
        let out = serde_json::to_string_pretty(&processed)?;
        let out_path = dir.join(name);
        fs::write(&out_path, out).map_err(|e| SignLabError::io(&out_path, e))?;
    }
    store.store(&frames, &payload.label)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use signlab_core::DEFAULT_SEQUENCE_LENGTH;

    fn shaped(len: usize) -> Vec<Frame> {
        preprocess_sequence(&vec![Frame::default(); len], DEFAULT_SEQUENCE_LENGTH).unwrap()
    }

    #[test]
    fn test_store_names_sequentially_and_round_trips_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());

        let first = store.store(&shaped(45), "HOLA").unwrap();
        let second = store.store(&shaped(3), "HOLA").unwrap();
        assert_eq!(first.file_name().unwrap(), "seq_001.safetensors");
        assert_eq!(second.file_name().unwrap(), "seq_002.safetensors");

        let tensor = load_sequence(&first).unwrap();
        assert_eq!(tensor.shape, vec![DEFAULT_SEQUENCE_LENGTH, FEATURE_WIDTH]);
        assert_eq!(store.sequence_files("HOLA").unwrap(), vec![first, second]);
    }

    #[test]
    fn test_store_continues_after_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());
        let label_dir = dir.path().join("HOLA");
        fs::create_dir_all(&label_dir).unwrap();
        fs::write(label_dir.join("seq_007.safetensors"), b"").unwrap();
        fs::write(label_dir.join("notes.txt"), b"").unwrap();

        let path = store.store(&shaped(30), "HOLA").unwrap();
        assert_eq!(path.file_name().unwrap(), "seq_008.safetensors");
    }

    #[test]
    fn test_store_rejects_bad_labels() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());
        for label in ["", "..", "a/b", " HOLA"] {
            assert!(matches!(
                store.store(&shaped(30), label),
                Err(SignLabError::InvalidLabel(_))
            ));
        }
    }

    #[test]
    fn test_label_map_sorted_from_partitions() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("HOLA")).unwrap();
        fs::create_dir_all(dir.path().join("GRACIAS")).unwrap();
        fs::write(dir.path().join("README"), b"not a label").unwrap();

        let store = DatasetStore::new(dir.path());
        let map = store.build_label_map().unwrap();
        assert_eq!(map.index_of("GRACIAS"), Some(0));
        assert_eq!(map.index_of("HOLA"), Some(1));
        assert_eq!(map.len(), 2);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_partition_is_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());
        store.store(&shaped(30), "HOLA").unwrap();
        fs::create_dir_all(dir.path().join(OsStr::from_bytes(b"bad\xff"))).unwrap();

        assert_eq!(store.labels().unwrap(), vec!["HOLA".to_string()]);
        assert_eq!(store.build_label_map().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_stores_never_share_a_name() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::thread;

        const WRITERS: usize = 8;
        let dir = tempfile::tempdir().unwrap();
        let frames = Arc::new(preprocess_sequence(&[Frame::default()], 2).unwrap());
        let shared = Arc::new(DatasetStore::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..2 * WRITERS {
            let frames = Arc::clone(&frames);
            // Half share one store, half use their own instance on the same root.
            let store = if i % 2 == 0 {
                Arc::clone(&shared)
            } else {
                Arc::new(DatasetStore::new(dir.path()))
            };
            handles.push(thread::spawn(move || store.store(&frames, "HOLA").unwrap()));
        }
        let paths: Vec<PathBuf> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let distinct: HashSet<&PathBuf> = paths.iter().collect();
        assert_eq!(distinct.len(), 2 * WRITERS);
        assert_eq!(shared.sequence_files("HOLA").unwrap().len(), 2 * WRITERS);
        for path in &paths {
            assert_eq!(load_sequence(path).unwrap().shape, vec![2, FEATURE_WIDTH]);
        }
    }

    #[test]
    fn test_missing_root_is_io_error() {
        let store = DatasetStore::new("/nonexistent/signlab/dataset");
        assert!(matches!(
            store.build_label_map(),
            Err(SignLabError::DatasetIo { .. })
        ));
    }

    #[test]
    fn test_label_map_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("label_map.json");
        let map = LabelMap::from_labels(["B", "A"]);
        write_label_map(&map, &path).unwrap();
        assert_eq!(read_label_map(&path).unwrap(), map);
        assert!(matches!(
            read_label_map(&dir.path().join("missing.json")),
            Err(SignLabError::LabelMapNotFound { .. })
        ));
    }

    #[test]
    fn test_ingest_captures_counts_failures() {
        let input = tempfile::tempdir().unwrap();
        let processed = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();

        let good = r#"{"framesData": [{"pose": [{"x": 0.1, "y": 0.2, "z": 0.3}]}], "label": "HOLA"}"#;
        fs::write(input.path().join("a.json"), good).unwrap();
        fs::write(input.path().join("b.json"), r#"{"framesData": [], "label": "HOLA"}"#).unwrap();
        fs::write(input.path().join("c.json"), "{not json").unwrap();
        fs::write(input.path().join("d.txt"), good).unwrap();

        let store = DatasetStore::new(data.path());
        let report =
            ingest_captures(&store, input.path(), Some(processed.path()), DEFAULT_SEQUENCE_LENGTH)
                .unwrap();
        assert_eq!(
            report,
            IngestReport {
                processed: 3,
                stored: 1,
                failed: 2
            }
        );
        assert_eq!(store.sequence_files("HOLA").unwrap().len(), 1);

        let written = fs::read_to_string(processed.path().join("a.json")).unwrap();
        let parsed: CapturePayload = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed.frames_data.len(), DEFAULT_SEQUENCE_LENGTH);
        assert!(parsed.frames_data.iter().all(Frame::is_complete));
    }
}
