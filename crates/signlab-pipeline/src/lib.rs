//! SignLab landmark pipeline
//!
//! Turns per-frame body/hand/face landmark captures into fixed-shape
//! sequences, stores them by label, trains a recurrent gesture classifier,
//! and serves confidence-gated predictions from the trained bundle.
//!
//! # Modules
//!
//! - [`normalize`]: Gap filling and shoulder-relative normalization of frames
//! - [`shaper`]: Fixed-length shaping and `[T, 1629]` flattening
//! - [`dataset`]: Label-partitioned sequence store, label map, batch ingestion
//! - [`model`]: Stacked-LSTM classifier
//! - [`device`]: CUDA / Metal / CPU selection
//! - [`artifact`]: Model bundle persistence (weights plus label map)
//! - [`training`]: Split, epoch loop, checkpointing, early stopping
//! - [`inference`]: Lazily loaded model and the confidence gate
//! - [`coordinator`]: Background training with a single-run guard
//! - [`tensor_io`]: Safetensors encoding and atomic file writes

pub mod artifact;
pub mod coordinator;
pub mod dataset;
pub mod device;
pub mod inference;
pub mod model;
pub mod normalize;
pub mod shaper;
pub mod tensor_io;
pub mod training;

pub use artifact::{model_path, read_artifact, ArtifactInfo, ModelArtifact};
pub use coordinator::{TrainingCoordinator, TrainingHandle};
pub use dataset::{
    ingest_captures, read_label_map, write_label_map, DatasetStore, IngestReport,
};
pub use inference::{apply_confidence_gate, argmax, GestureModel, InferenceService};
pub use model::GestureClassifier;
pub use normalize::{fill_missing_landmarks, normalize_frame};
pub use shaper::{flatten_sequence, preprocess_sequence, shape_sequence};
pub use training::{EvalMetrics, Trainer, TrainingOutcome};
