//! Gesture classifier training: dataset loading and splitting, metrics, and
//! the epoch loop.

pub mod data;
pub mod metrics;
pub mod trainer;

pub use data::{load_dataset, split_dataset, BatchIterator, DataSplit, LoadedDataset};
pub use metrics::EvalMetrics;
pub use trainer::{evaluate, EpochMetrics, Trainer, TrainingOutcome};
