//! Evaluation metrics for gesture classifier training.

use serde::Serialize;

/// Loss and accuracy over one evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EvalMetrics {
    /// Mean cross-entropy per sample.
    pub loss: f64,
    pub accuracy: f64,
    pub correct: usize,
    pub total: usize,
}

/// Accumulates batch results into [`EvalMetrics`].
#[derive(Debug, Default)]
pub struct MetricsAccumulator {
    loss_sum: f64,
    correct: usize,
    total: usize,
}

impl MetricsAccumulator {
    /// Record one batch given its mean loss, predictions, and labels.
    pub fn add_batch(&mut self, mean_loss: f64, predictions: &[u32], labels: &[u32]) {
        debug_assert_eq!(predictions.len(), labels.len());
        let n = predictions.len().min(labels.len());
        self.loss_sum += mean_loss * n as f64;
        self.correct += count_correct(predictions, labels);
        self.total += n;
    }

    pub fn finish(self) -> EvalMetrics {
        if self.total == 0 {
            return EvalMetrics::default();
        }
        EvalMetrics {
            loss: self.loss_sum / self.total as f64,
            accuracy: self.correct as f64 / self.total as f64,
            correct: self.correct,
            total: self.total,
        }
    }
}

/// Number of positions where prediction and label agree.
pub fn count_correct(predictions: &[u32], labels: &[u32]) -> usize {
    predictions
        .iter()
        .zip(labels)
        .filter(|(p, l)| p == l)
        .count()
}

impl std::fmt::Display for EvalMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "loss={:.4} acc={:.4} ({}/{})",
            self.loss, self.accuracy, self.correct, self.total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_by_batch_size() {
        let mut acc = MetricsAccumulator::default();
        acc.add_batch(1.0, &[0, 1, 1], &[0, 1, 0]);
        acc.add_batch(4.0, &[2], &[2]);
        let m = acc.finish();
        assert_eq!(m.total, 4);
        assert_eq!(m.correct, 3);
        assert!((m.accuracy - 0.75).abs() < 1e-9);
        // (1.0 * 3 + 4.0 * 1) / 4
        assert!((m.loss - 1.75).abs() < 1e-9);
    }

    #[test]
    fn test_empty_is_zero() {
        let m = MetricsAccumulator::default().finish();
        assert_eq!(m, EvalMetrics::default());
    }

    #[test]
    fn test_display() {
        let m = EvalMetrics {
            loss: 0.5,
            accuracy: 1.0,
            correct: 2,
            total: 2,
        };
        assert_eq!(m.to_string(), "loss=0.5000 acc=1.0000 (2/2)");
    }
}
