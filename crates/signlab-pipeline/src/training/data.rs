//! Dataset loading, seeded train/validation/test splitting, and batch iteration.

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use signlab_core::{LabelMap, Result, SignLabError, FEATURE_WIDTH};

use crate::dataset::{load_sequence, DatasetStore};

/// Every usable sequence of the store, flattened and labeled.
pub struct LoadedDataset {
    /// Row-major `[len, sequence_length, FEATURE_WIDTH]` values.
    pub features: Vec<f32>,
    pub labels: Vec<u32>,
    pub sequence_length: usize,
    pub label_map: LabelMap,
    /// Files that could not be used.
    pub skipped: usize,
}

impl LoadedDataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn row_width(&self) -> usize {
        self.sequence_length * FEATURE_WIDTH
    }

    /// Gather `indices` into `[n, T, 1629]` input and `[n]` label tensors.
    pub fn tensors(&self, indices: &[usize], device: &Device) -> Result<(Tensor, Tensor)> {
        let width = self.row_width();
        let mut features = Vec::with_capacity(indices.len() * width);
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            features.extend_from_slice(&self.features[i * width..(i + 1) * width]);
            labels.push(self.labels[i]);
        }
        let inputs = Tensor::from_vec(
            features,
            (indices.len(), self.sequence_length, FEATURE_WIDTH),
            device,
        )
        .map_err(|e| SignLabError::Model(format!("Failed to build input tensor: {e}")))?;
        let labels = Tensor::new(labels.as_slice(), device)
            .map_err(|e| SignLabError::Model(format!("Failed to build label tensor: {e}")))?;
        Ok((inputs, labels))
    }
}

/// Load every stored sequence of length `sequence_length`.
///
/// Unreadable or mis-shaped files are logged and skipped.
pub fn load_dataset(store: &DatasetStore, sequence_length: usize) -> Result<LoadedDataset> {
    let label_map = store.build_label_map()?;
    let mut features = Vec::new();
    let mut labels = Vec::new();
    let mut skipped = 0usize;
    let mut present = vec![false; label_map.len()];

    for (index, label) in label_map.labels().enumerate() {
        for path in store.sequence_files(label)? {
            let tensor = match load_sequence(&path) {
                Ok(tensor) => tensor,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Skipping unreadable sequence");
                    skipped += 1;
                    continue;
                }
            };
            if tensor.shape != [sequence_length, FEATURE_WIDTH] {
                tracing::error!(
                    path = %path.display(),
                    shape = ?tensor.shape,
                    expected = ?[sequence_length, FEATURE_WIDTH],
                    "Skipping mis-shaped sequence"
                );
                skipped += 1;
                continue;
            }
            features.extend_from_slice(&tensor.data);
            labels.push(index as u32);
            present[index] = true;
        }
    }

    if labels.is_empty() {
        return Err(SignLabError::Dataset(format!(
            "no usable sequences under {}",
            store.root().display()
        )));
    }
    let classes = present.iter().filter(|&&p| p).count();
    if classes < 2 {
        return Err(SignLabError::Dataset(format!(
            "need sequences for at least two labels, found {classes}"
        )));
    }

    tracing::info!(
        sequences = labels.len(),
        classes,
        skipped,
        label_map = %label_map,
        "Loaded dataset"
    );
    Ok(LoadedDataset {
        features,
        labels,
        sequence_length,
        label_map,
        skipped,
    })
}

/// Index partition of a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSplit {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
    pub test: Vec<usize>,
}

/// Shuffle `0..n` with a seeded RNG and carve out test and validation sets.
///
/// `ceil(n * (test + validation))` samples are held out; of those,
/// `ceil(held * test / (test + validation))` form the test set.
pub fn split_dataset(n: usize, test_size: f64, validation_size: f64, seed: u64) -> Result<DataSplit> {
    let held_fraction = test_size + validation_size;
    if !(test_size > 0.0 && validation_size > 0.0 && held_fraction < 1.0) {
        return Err(SignLabError::Config(format!(
            "invalid split fractions test={test_size} validation={validation_size}"
        )));
    }

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let held = ceil_count(n as f64 * held_fraction).min(n);
    let test = ceil_count(held as f64 * test_size / held_fraction).min(held);

    let split = DataSplit {
        test: indices[..test].to_vec(),
        validation: indices[test..held].to_vec(),
        train: indices[held..].to_vec(),
    };
    if split.train.is_empty() || split.validation.is_empty() || split.test.is_empty() {
        return Err(SignLabError::Dataset(format!(
            "{n} sequences are too few to split (train={}, validation={}, test={})",
            split.train.len(),
            split.validation.len(),
            split.test.len()
        )));
    }

    tracing::info!(
        train = split.train.len(),
        validation = split.validation.len(),
        test = split.test.len(),
        "Split dataset"
    );
    Ok(split)
}

/// `ceil` that ignores representation noise, so `10 * (0.2 + 0.1)` is 3.
fn ceil_count(value: f64) -> usize {
    (value - 1e-9).ceil().max(0.0) as usize
}

/// Mini-batch iterator over pre-loaded tensors. Reshuffles indices each epoch.
pub struct BatchIterator {
    inputs: Tensor,
    labels: Tensor,
    indices: Vec<u32>,
    batch_size: usize,
    pos: usize,
}

impl BatchIterator {
    pub fn new(inputs: Tensor, labels: Tensor, batch_size: usize) -> Result<Self> {
        let n = inputs
            .dim(0)
            .map_err(|e| SignLabError::Model(format!("batch dim: {e}")))?;
        Ok(Self {
            inputs,
            labels,
            indices: (0..n as u32).collect(),
            batch_size: batch_size.max(1),
            pos: 0,
        })
    }

    /// Number of samples per epoch.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Reshuffle for a new epoch using a seeded RNG derived from base seed + epoch.
    pub fn reshuffle(&mut self, seed: u64, epoch: usize) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
        self.indices.shuffle(&mut rng);
        self.pos = 0;
    }

    /// Returns the next mini-batch, or `None` once the epoch is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<(Tensor, Tensor)>> {
        let n = self.indices.len();
        if self.pos >= n {
            return Ok(None);
        }
        let end = (self.pos + self.batch_size).min(n);
        let batch = &self.indices[self.pos..end];
        self.pos = end;

        let gathered = Tensor::new(batch, self.inputs.device())
            .and_then(|idx| {
                let inputs = self.inputs.index_select(&idx, 0)?;
                let labels = self.labels.index_select(&idx, 0)?;
                Ok((inputs, labels))
            })
            .map_err(|e| SignLabError::Model(format!("batch gather failed: {e}")))?;
        Ok(Some(gathered))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
