//! Core types, configuration, and errors for SignLab
//!
//! This crate contains the foundational data model shared by the capture,
//! training, and inference paths: landmarks and frames, the label map, the
//! training-run record, prediction results, configuration, and the error type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Landmark layout
// ---------------------------------------------------------------------------

/// Number of pose landmarks per frame.
pub const POSE_POINTS: usize = 33;

/// Number of landmarks per hand.
pub const HAND_POINTS: usize = 21;

/// Number of face mesh landmarks per frame.
pub const FACE_POINTS: usize = 468;

/// Total landmarks per frame across all groups.
pub const TOTAL_POINTS: usize = POSE_POINTS + 2 * HAND_POINTS + FACE_POINTS;

/// Coordinates stored per landmark (x, y, z).
pub const COORDS_PER_POINT: usize = 3;

/// Width of one flattened frame: 543 landmarks × 3 coordinates.
pub const FEATURE_WIDTH: usize = TOTAL_POINTS * COORDS_PER_POINT;

/// Default number of frames per shaped sequence.
pub const DEFAULT_SEQUENCE_LENGTH: usize = 30;

/// Default minimum probability for a prediction to be accepted.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.8;

/// A single 3D landmark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Landmark {
    pub const ZERO: Landmark = Landmark {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Named landmark group within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LandmarkGroup {
    Pose,
    LeftHand,
    RightHand,
    Face,
}

impl LandmarkGroup {
    /// All groups in flatten order. Training and inference both depend on it.
    pub const ALL: [LandmarkGroup; 4] = [
        LandmarkGroup::Pose,
        LandmarkGroup::LeftHand,
        LandmarkGroup::RightHand,
        LandmarkGroup::Face,
    ];

    /// Fixed cardinality of the group.
    #[must_use]
    pub fn expected_points(self) -> usize {
        match self {
            Self::Pose => POSE_POINTS,
            Self::LeftHand | Self::RightHand => HAND_POINTS,
            Self::Face => FACE_POINTS,
        }
    }

    /// Wire name of the group as it appears in capture payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pose => "pose",
            Self::LeftHand => "leftHand",
            Self::RightHand => "rightHand",
            Self::Face => "face",
        }
    }
}

impl std::fmt::Display for LandmarkGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One time step of landmark groups.
///
/// An absent group deserializes as an empty list and is treated exactly like
/// a missing one by the normalizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(default, deserialize_with = "nullable_points")]
    pub pose: Vec<Landmark>,
    #[serde(default, deserialize_with = "nullable_points")]
    pub left_hand: Vec<Landmark>,
    #[serde(default, deserialize_with = "nullable_points")]
    pub right_hand: Vec<Landmark>,
    #[serde(default, deserialize_with = "nullable_points")]
    pub face: Vec<Landmark>,
}

fn nullable_points<'de, D>(deserializer: D) -> std::result::Result<Vec<Landmark>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Landmark>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Frame {
    /// Borrow the landmarks of one group.
    #[must_use]
    pub fn group(&self, group: LandmarkGroup) -> &[Landmark] {
        match group {
            LandmarkGroup::Pose => &self.pose,
            LandmarkGroup::LeftHand => &self.left_hand,
            LandmarkGroup::RightHand => &self.right_hand,
            LandmarkGroup::Face => &self.face,
        }
    }

    /// Mutably borrow the landmarks of one group.
    pub fn group_mut(&mut self, group: LandmarkGroup) -> &mut Vec<Landmark> {
        match group {
            LandmarkGroup::Pose => &mut self.pose,
            LandmarkGroup::LeftHand => &mut self.left_hand,
            LandmarkGroup::RightHand => &mut self.right_hand,
            LandmarkGroup::Face => &mut self.face,
        }
    }

    /// Whether every group carries exactly its fixed cardinality.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        LandmarkGroup::ALL
            .iter()
            .all(|&g| self.group(g).len() == g.expected_points())
    }
}

// ---------------------------------------------------------------------------
// Payloads and results
// ---------------------------------------------------------------------------

/// Labeled capture submitted on the training path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturePayload {
    #[serde(default)]
    pub frames_data: Vec<Frame>,
    pub label: String,
}

/// Unlabeled frame sequence submitted for prediction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionRequest {
    #[serde(default)]
    pub frames_data: Vec<Frame>,
}

/// Outcome of a gated prediction.
///
/// A `None` label with a message is the low-confidence outcome and is a
/// successful response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_label: Option<String>,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Prediction {
    /// Whether the prediction passed the confidence gate.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.predicted_label.is_some()
    }
}

// ---------------------------------------------------------------------------
// Label map
// ---------------------------------------------------------------------------

/// Bijection between gesture labels and dense class indices.
///
/// Indices follow the lexicographic order of the labels. Serialized as a
/// `label -> index` JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, usize>", into = "BTreeMap<String, usize>")]
pub struct LabelMap {
    by_label: BTreeMap<String, usize>,
    by_index: Vec<String>,
}

impl LabelMap {
    /// Build a map from label names; duplicates collapse, order is sorted.
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut by_index: Vec<String> = labels.into_iter().map(Into::into).collect();
        by_index.sort();
        by_index.dedup();
        let by_label = by_index
            .iter()
            .enumerate()
            .map(|(idx, label)| (label.clone(), idx))
            .collect();
        Self { by_label, by_index }
    }

    /// Class index of a label.
    #[must_use]
    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.by_label.get(label).copied()
    }

    /// Label of a class index.
    #[must_use]
    pub fn label_of(&self, index: usize) -> Option<&str> {
        self.by_index.get(index).map(String::as_str)
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    /// Labels in index order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.by_index.iter().map(String::as_str)
    }
}

impl TryFrom<BTreeMap<String, usize>> for LabelMap {
    type Error = SignLabError;

    fn try_from(by_label: BTreeMap<String, usize>) -> Result<Self> {
        let mut by_index: Vec<Option<String>> = vec![None; by_label.len()];
        let n = by_label.len();
        for (label, &idx) in &by_label {
            let slot = by_index.get_mut(idx).ok_or_else(|| {
                SignLabError::Dataset(format!(
                    "label map index {idx} for '{label}' is out of range 0..{n}"
                ))
            })?;
            if let Some(other) = slot {
                return Err(SignLabError::Dataset(format!(
                    "label map assigns index {idx} to both '{other}' and '{label}'"
                )));
            }
            *slot = Some(label.clone());
        }
        let by_index = by_index.into_iter().flatten().collect();
        Ok(Self { by_label, by_index })
    }
}

impl From<LabelMap> for BTreeMap<String, usize> {
    fn from(map: LabelMap) -> Self {
        map.by_label
    }
}

impl std::fmt::Display for LabelMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .by_index
            .iter()
            .enumerate()
            .map(|(idx, label)| format!("{label}:{idx}"))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

// ---------------------------------------------------------------------------
// Training run record
// ---------------------------------------------------------------------------

/// Lifecycle state of a training run, carrying the data each state owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunStatus {
    Started,
    Running,
    Completed { accuracy: f64, loss: f64 },
    Failed { reason: String },
}

impl RunStatus {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Running => "running",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Status and metrics record of one training run.
///
/// Created by the caller in the `started` state; only the trainer moves it
/// forward, along `started -> running -> {completed | failed}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRun {
    pub id: Uuid,
    #[serde(flatten)]
    status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrainingRun {
    /// Create a new run in the `started` state.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    #[must_use]
    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            status: RunStatus::Started,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    /// Test accuracy, once completed.
    #[must_use]
    pub fn accuracy(&self) -> Option<f64> {
        match self.status {
            RunStatus::Completed { accuracy, .. } => Some(accuracy),
            _ => None,
        }
    }

    /// Test loss, once completed.
    #[must_use]
    pub fn loss(&self) -> Option<f64> {
        match self.status {
            RunStatus::Completed { loss, .. } => Some(loss),
            _ => None,
        }
    }

    /// `started -> running`.
    pub fn mark_running(&mut self) -> Result<()> {
        self.transition(RunStatus::Running)
    }

    /// `running -> completed`, recording metrics rounded to two decimals.
    pub fn complete(&mut self, accuracy: f64, loss: f64) -> Result<()> {
        self.transition(RunStatus::Completed {
            accuracy: round2(accuracy),
            loss: round2(loss),
        })?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// `running -> failed`.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(RunStatus::Failed {
            reason: reason.into(),
        })?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, next: RunStatus) -> Result<()> {
        let legal = matches!(
            (&self.status, &next),
            (RunStatus::Started, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed { .. })
                | (RunStatus::Running, RunStatus::Failed { .. })
        );
        if !legal {
            return Err(SignLabError::InvalidTransition {
                from: self.status.name(),
                to: next.name(),
            });
        }
        self.status = next;
        Ok(())
    }
}

impl Default for TrainingRun {
    fn default() -> Self {
        Self::new()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

/// Top-level configuration. Every section falls back to its defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignLabConfig {
    /// Root of the label-partitioned dataset store.
    #[serde(default = "default_dataset_root")]
    pub dataset_root: PathBuf,
    /// Directory holding the model bundle and label map sidecar.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    /// Directory scanned for raw capture JSON files during batch ingestion.
    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,
    /// Directory receiving processed capture JSON files, if any.
    #[serde(default)]
    pub processed_dir: Option<PathBuf>,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_dataset_root() -> PathBuf {
    PathBuf::from("dataset")
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from("data/capturas")
}

impl Default for SignLabConfig {
    fn default() -> Self {
        Self {
            dataset_root: default_dataset_root(),
            model_dir: default_model_dir(),
            capture_dir: default_capture_dir(),
            processed_dir: None,
            sequence: SequenceConfig::default(),
            training: TrainingConfig::default(),
            inference: InferenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SignLabConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sequence.target_length == 0 {
            return Err(SignLabError::Config(
                "sequence.target_length must be at least 1".to_string(),
            ));
        }
        self.training.validate()?;
        let threshold = self.inference.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(SignLabError::Config(format!(
                "inference.confidence_threshold must be within [0, 1], got {threshold}"
            )));
        }
        Ok(())
    }
}

/// Temporal shaping configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceConfig {
    #[serde(default = "default_target_length")]
    pub target_length: usize,
}

fn default_target_length() -> usize {
    DEFAULT_SEQUENCE_LENGTH
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            target_length: default_target_length(),
        }
    }
}

/// Hyperparameters and split proportions for the trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Fraction of the dataset held out for the final test evaluation.
    pub test_size: f64,
    /// Fraction of the dataset held out for per-epoch validation.
    pub validation_size: f64,
    pub batch_size: usize,
    /// Maximum number of epochs.
    pub epochs: usize,
    /// Epochs without validation-accuracy improvement before stopping.
    pub patience: usize,
    pub learning_rate: f64,
    /// Seed for the split and the per-epoch shuffles.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            test_size: 0.2,
            validation_size: 0.1,
            batch_size: 32,
            epochs: 50,
            patience: 5,
            learning_rate: 1e-3,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.test_size > 0.0 && self.validation_size > 0.0) {
            return Err(SignLabError::Config(
                "training.test_size and training.validation_size must be positive".to_string(),
            ));
        }
        if self.test_size + self.validation_size >= 1.0 {
            return Err(SignLabError::Config(format!(
                "held-out fraction {} leaves no training data",
                self.test_size + self.validation_size
            )));
        }
        if self.batch_size == 0 || self.epochs == 0 {
            return Err(SignLabError::Config(
                "training.batch_size and training.epochs must be at least 1".to_string(),
            ));
        }
        if !(self.learning_rate > 0.0) {
            return Err(SignLabError::Config(
                "training.learning_rate must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Inference-side configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
}

fn default_confidence_threshold() -> f32 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: `text` (human-readable) or `json` (structured).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Core error types.
#[derive(thiserror::Error, Debug)]
pub enum SignLabError {
    /// Empty or structurally malformed frame sequence.
    #[error("Invalid sequence: {0}")]
    InvalidSequence(String),

    /// Label that cannot name a dataset partition.
    #[error("Invalid label: {0:?}")]
    InvalidLabel(String),

    /// No trained model bundle exists yet.
    #[error("Model not found at {}", path.display())]
    ModelNotFound {
        /// Expected bundle location.
        path: PathBuf,
    },

    /// The model bundle carries no label map.
    #[error("Label map not found in {}", path.display())]
    LabelMapNotFound {
        /// Bundle that was inspected.
        path: PathBuf,
    },

    /// Dataset store could not be read or written.
    #[error("Dataset I/O error at {}: {source}", path.display())]
    DatasetIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Dataset content unusable for the requested operation.
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// A training run failed; the run record has already been marked.
    #[error("Training failed: {0}")]
    TrainingFailure(#[source] Box<SignLabError>),

    /// Illegal training-run state change.
    #[error("Invalid training run transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// A training run is already active.
    #[error("A training run is already in progress")]
    TrainingInProgress,

    /// Tensor backend or model construction error.
    #[error("Model error: {0}")]
    Model(String),

    /// Serialization / deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SignLabError {
    /// Wrap an I/O error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::DatasetIo {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias for `std::result::Result<T, SignLabError>`.
pub type Result<T> = std::result::Result<T, SignLabError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
