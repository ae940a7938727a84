//! SignLab command-line interface.
//!
//! Subcommands:
//!   ingest     -- Preprocess and store every capture JSON in a directory
//!   store      -- Preprocess and store a single labeled capture
//!   label-map  -- Print (or write) the label map derived from the dataset
//!   train      -- Train the gesture classifier and promote the bundle
//!   predict    -- Classify a frame sequence with the trained bundle

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use signlab_core::{CapturePayload, PredictionRequest, SignLabConfig};
use signlab_pipeline::artifact::LABEL_MAP_FILE;
use signlab_pipeline::{
    ingest_captures, model_path, write_label_map, DatasetStore, InferenceService, Trainer,
    TrainingCoordinator,
};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "signlab", about = "Sign-language landmark pipeline")]
struct Cli {
    /// YAML configuration file.
    #[arg(long, global = true, env = "SIGNLAB_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Preprocess and store every capture JSON file in a directory.
    Ingest {
        /// Directory of raw captures (defaults to `capture_dir`).
        #[arg(long)]
        input: Option<PathBuf>,

        /// Also write processed captures here (defaults to `processed_dir`).
        #[arg(long)]
        processed: Option<PathBuf>,
    },

    /// Preprocess and store one labeled capture (`{"framesData": [...], "label": ...}`).
    Store {
        /// Capture JSON file.
        file: PathBuf,
    },

    /// Print the label map derived from the dataset partitions.
    LabelMap {
        /// Write it to `<model_dir>/label_map.json` as well.
        #[arg(long)]
        write: bool,
    },

    /// Train the gesture classifier on the dataset store.
    Train {
        /// Maximum training epochs.
        #[arg(long)]
        epochs: Option<usize>,

        /// Mini-batch size.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Early stopping patience (epochs without improvement).
        #[arg(long)]
        patience: Option<usize>,

        /// Random seed for the split and shuffles.
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Classify a frame sequence (`{"framesData": [...]}`).
    Predict {
        /// Prediction request JSON file.
        file: PathBuf,

        /// Override the confidence threshold.
        #[arg(long)]
        threshold: Option<f32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => SignLabConfig::default(),
    };
    init_tracing(&config);
    match &cli.config {
        Some(path) => info!(path = %path.display(), "Loaded configuration from file"),
        None => info!("No config file specified, using defaults"),
    }

    match cli.command {
        Command::Ingest { input, processed } => {
            let input = input.unwrap_or_else(|| config.capture_dir.clone());
            let processed = processed.or_else(|| config.processed_dir.clone());
            let store = DatasetStore::new(&config.dataset_root);
            let report = ingest_captures(
                &store,
                &input,
                processed.as_deref(),
                config.sequence.target_length,
            )?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Store { file } => {
            let payload: CapturePayload = read_json(&file)?;
            let store = DatasetStore::new(&config.dataset_root);
            let path = store.store_capture(&payload, config.sequence.target_length)?;
            println!("{}", path.display());
        }

        Command::LabelMap { write } => {
            let store = DatasetStore::new(&config.dataset_root);
            let map = store.build_label_map()?;
            if write {
                let path = config.model_dir.join(LABEL_MAP_FILE);
                write_label_map(&map, &path)?;
                info!(path = %path.display(), "Wrote label map");
            }
            println!("{}", serde_json::to_string_pretty(&map)?);
        }

        Command::Train {
            epochs,
            batch_size,
            patience,
            seed,
        } => {
            let mut training = config.training.clone();
            if let Some(epochs) = epochs {
                training.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                training.batch_size = batch_size;
            }
            if let Some(patience) = patience {
                training.patience = patience;
            }
            if let Some(seed) = seed {
                training.seed = seed;
            }
            training.validate()?;

            let coordinator = TrainingCoordinator::new(
                DatasetStore::new(&config.dataset_root),
                Trainer::new(training, config.sequence.target_length, &config.model_dir),
            );
            let handle = coordinator.start()?;
            info!(run_id = %handle.run_id, "Training run started");
            let result = handle.wait().await;

            if let Some(run) = coordinator.last_run() {
                println!("{}", serde_json::to_string_pretty(&run)?);
            }
            let outcome = result?;
            if let Some(last) = outcome.history.last() {
                println!(
                    "Final epoch {}: {} (best epoch {}{})",
                    last.epoch,
                    last.validation,
                    outcome.best_epoch,
                    if outcome.stopped_early { ", stopped early" } else { "" },
                );
            }
            println!("Test: {}", outcome.test);
            println!("Model saved to: {}", outcome.artifact.path.display());
        }

        Command::Predict { file, threshold } => {
            let request: PredictionRequest = read_json(&file)?;
            let threshold = threshold.unwrap_or(config.inference.confidence_threshold);
            let service = InferenceService::new(model_path(&config.model_dir), threshold);
            let prediction = service.predict_request(&request)?;
            println!("{}", serde_json::to_string_pretty(&prediction)?);
        }
    }

    Ok(())
}

/// Install the global subscriber; `RUST_LOG` wins over the configured level.
fn init_tracing(config: &SignLabConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}
