//! Background training with a single-run-at-a-time guard.

use signlab_core::{Result, SignLabError, TrainingRun};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::dataset::DatasetStore;
use crate::training::{Trainer, TrainingOutcome};

/// Runs [`Trainer::train`] on the blocking pool and tracks the latest run.
pub struct TrainingCoordinator {
    store: Arc<DatasetStore>,
    trainer: Arc<Trainer>,
    active: Arc<AtomicBool>,
    last_run: Arc<Mutex<Option<TrainingRun>>>,
}

/// A training run in progress.
pub struct TrainingHandle {
    pub run_id: Uuid,
    join: JoinHandle<Result<TrainingOutcome>>,
}

impl TrainingHandle {
    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<TrainingOutcome> {
        self.join.await.map_err(|e| {
            SignLabError::TrainingFailure(Box::new(SignLabError::Model(format!(
                "training task aborted: {e}"
            ))))
        })?
    }
}

/// Clears the active flag when the training task ends, including by panic.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl TrainingCoordinator {
    pub fn new(store: DatasetStore, trainer: Trainer) -> Self {
        Self {
            store: Arc::new(store),
            trainer: Arc::new(trainer),
            active: Arc::new(AtomicBool::new(false)),
            last_run: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether a run is currently executing.
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Record of the most recently finished run.
    pub fn last_run(&self) -> Option<TrainingRun> {
        self.last_run.lock().ok().and_then(|run| run.clone())
    }

    /// Start a run in the background.
    ///
    /// Must be called from within a Tokio runtime. Fails with
    /// [`SignLabError::TrainingInProgress`] while another run is active.
    pub fn start(&self) -> Result<TrainingHandle> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("Rejected training request, a run is already active");
            return Err(SignLabError::TrainingInProgress);
        }
        let guard = ActiveGuard(Arc::clone(&self.active));

        let mut run = TrainingRun::new();
        let run_id = run.id;
        let store = Arc::clone(&self.store);
        let trainer = Arc::clone(&self.trainer);
        let last_run = Arc::clone(&self.last_run);

        tracing::info!(run_id = %run_id, "Scheduling training run");
        let join = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let result = trainer.train(&store, &mut run);
            if let Ok(mut slot) = last_run.lock() {
                *slot = Some(run);
            }
            result
        });

        Ok(TrainingHandle { run_id, join })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signlab_core::{RunStatus, TrainingConfig};

    fn coordinator(dir: &std::path::Path) -> TrainingCoordinator {
        TrainingCoordinator::new(
            DatasetStore::new(dir.join("dataset")),
            Trainer::new(TrainingConfig::default(), 30, dir.join("models")),
        )
    }

    #[tokio::test]
    async fn test_failed_run_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path());
        assert!(coordinator.last_run().is_none());

        let handle = coordinator.start().unwrap();
        let run_id = handle.run_id;
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, SignLabError::TrainingFailure(_)));

        let run = coordinator.last_run().unwrap();
        assert_eq!(run.id, run_id);
        assert!(matches!(run.status(), RunStatus::Failed { .. }));
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_active() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path());
        coordinator.active.store(true, Ordering::SeqCst);

        assert!(matches!(
            coordinator.start(),
            Err(SignLabError::TrainingInProgress)
        ));
        assert!(coordinator.is_running());
    }

    #[tokio::test]
    async fn test_can_restart_after_finish() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path());
        let _ = coordinator.start().unwrap().wait().await;
        let second = coordinator.start().unwrap();
        assert!(second.wait().await.is_err());
    }
}
