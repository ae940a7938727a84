//! Recurrent gesture classifier over `[batch, T, 1629]` landmark sequences.
//!
//! # Architecture
//!
//! ```text
//! Input [B, T, 1629] → LSTM(64, all steps) → LSTM(64, last step)
//!                    → Linear(128) → ReLU → Dropout(0.5, training only)
//!                    → Linear(num_classes) → Softmax (inference)
//! ```

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{LSTMConfig, Module, VarBuilder, VarMap, LSTM, RNN};
use signlab_core::{Result, SignLabError};

/// Hidden width of both recurrent layers.
pub const LSTM_HIDDEN: usize = 64;

/// Width of the dense projection.
pub const DENSE_HIDDEN: usize = 128;

/// Dropout rate applied after the dense projection during training.
pub const DROPOUT_RATE: f32 = 0.5;

/// Two stacked LSTMs followed by a dense head.
pub struct GestureClassifier {
    lstm1: LSTM,
    lstm2: LSTM,
    dense: candle_nn::Linear,
    head: candle_nn::Linear,
    num_classes: usize,
    device: Device,
}

impl GestureClassifier {
    /// Build the network from a variable builder.
    ///
    /// Parameter names are `lstm1.*`, `lstm2.*`, `dense.*`, `head.*`, which
    /// is what a saved bundle must contain.
    pub fn new(vb: VarBuilder, feature_width: usize, num_classes: usize) -> Result<Self> {
        if num_classes == 0 {
            return Err(SignLabError::Model(
                "classifier needs at least one class".to_string(),
            ));
        }
        let device = vb.device().clone();
        let lstm1 = candle_nn::lstm(feature_width, LSTM_HIDDEN, LSTMConfig::default(), vb.pp("lstm1"))
            .map_err(|e| SignLabError::Model(format!("Failed to create lstm1: {e}")))?;
        let lstm2 = candle_nn::lstm(LSTM_HIDDEN, LSTM_HIDDEN, LSTMConfig::default(), vb.pp("lstm2"))
            .map_err(|e| SignLabError::Model(format!("Failed to create lstm2: {e}")))?;
        let dense = candle_nn::linear(LSTM_HIDDEN, DENSE_HIDDEN, vb.pp("dense"))
            .map_err(|e| SignLabError::Model(format!("Failed to create dense: {e}")))?;
        let head = candle_nn::linear(DENSE_HIDDEN, num_classes, vb.pp("head"))
            .map_err(|e| SignLabError::Model(format!("Failed to create head: {e}")))?;

        Ok(Self {
            lstm1,
            lstm2,
            dense,
            head,
            num_classes,
            device,
        })
    }

    /// Create a classifier whose parameters live in `varmap` for training.
    pub fn new_trainable(
        varmap: &VarMap,
        device: &Device,
        feature_width: usize,
        num_classes: usize,
    ) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        Self::new(vb, feature_width, num_classes)
    }

    /// Load trained weights from safetensors bytes.
    pub fn from_buffer(
        bytes: Vec<u8>,
        device: &Device,
        feature_width: usize,
        num_classes: usize,
    ) -> Result<Self> {
        let vb = VarBuilder::from_buffered_safetensors(bytes, DType::F32, device)
            .map_err(|e| SignLabError::Model(format!("Failed to read model weights: {e}")))?;
        Self::new(vb, feature_width, num_classes)
    }

    /// Forward pass returning raw logits `[B, num_classes]`.
    ///
    /// Dropout is only active when `train` is set.
    pub fn forward_logits(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let states = self
            .lstm1
            .seq(xs)
            .map_err(|e| SignLabError::Model(format!("lstm1 forward failed: {e}")))?;
        let steps = self
            .lstm1
            .states_to_tensor(&states)
            .map_err(|e| SignLabError::Model(format!("lstm1 stacking failed: {e}")))?;

        let states = self
            .lstm2
            .seq(&steps)
            .map_err(|e| SignLabError::Model(format!("lstm2 forward failed: {e}")))?;
        let last = states
            .last()
            .ok_or_else(|| SignLabError::Model("lstm2 produced no time steps".to_string()))?
            .h()
            .clone();

        let hidden = self
            .dense
            .forward(&last)
            .and_then(|t| t.relu())
            .map_err(|e| SignLabError::Model(format!("dense forward failed: {e}")))?;
        let hidden = if train {
            candle_nn::ops::dropout(&hidden, DROPOUT_RATE)
                .map_err(|e| SignLabError::Model(format!("dropout failed: {e}")))?
        } else {
            hidden
        };

        self.head
            .forward(&hidden)
            .map_err(|e| SignLabError::Model(format!("head forward failed: {e}")))
    }

    /// Class probabilities `[B, num_classes]` in inference mode.
    pub fn probabilities(&self, xs: &Tensor) -> Result<Tensor> {
        let logits = self.forward_logits(xs, false)?;
        candle_nn::ops::softmax(&logits, D::Minus1)
            .map_err(|e| SignLabError::Model(format!("softmax failed: {e}")))
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Returns a reference to the device this classifier runs on.
    pub fn device(&self) -> &Device {
        &self.device
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
