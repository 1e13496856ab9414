//! Trainer state threaded through every step.

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerPhase {
    /// Constructed, nothing loaded yet.
    #[default]
    Init,
    /// Loading upstream weights or a resume checkpoint.
    CheckpointLoading,
    /// Running optimizer steps.
    Training,
    /// Computing validation loss.
    Validating,
    /// Writing a checkpoint artifact.
    CheckpointSaving,
    /// Run finished or aborted.
    Terminated,
}

impl TrainerPhase {
    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_transition_to(self, next: TrainerPhase) -> bool {
        use TrainerPhase::{CheckpointLoading, CheckpointSaving, Init, Terminated, Training, Validating};
        matches!(
            (self, next),
            (Init, CheckpointLoading | Training | Terminated)
                | (CheckpointLoading, Training | Terminated)
                | (Training, Validating | CheckpointSaving | Terminated)
                | (Validating, Training | CheckpointSaving | Terminated)
                | (CheckpointSaving, Training | Terminated)
        )
    }
}

/// Counters and scalars describing where a run is.
///
/// Serialized as JSON into checkpoint metadata so a run can resume exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Optimizer steps completed.
    pub global_step: usize,
    /// Passes over the training batches completed.
    pub epoch: usize,
    /// Current phase.
    pub phase: TrainerPhase,
    /// Learning rate used by the last step.
    pub learning_rate: f64,
    /// KL weight used by the last VAE step.
    pub kl_beta: f64,
    /// Lowest validation loss seen.
    pub best_val_loss: Option<f64>,
    /// AdamW bias-correction counter.
    pub optimizer_step: usize,
    /// Scheduler position.
    pub scheduler_step: usize,
    /// Shadow updates applied (blends and hard resets).
    #[serde(default)]
    pub ema_updates: usize,
}

impl Default for TrainerState {
    fn default() -> Self {
        Self {
            global_step: 0,
            epoch: 0,
            phase: TrainerPhase::Init,
            learning_rate: 0.0,
            kl_beta: 0.0,
            best_val_loss: None,
            optimizer_step: 0,
            scheduler_step: 0,
            ema_updates: 0,
        }
    }
}

impl TrainerState {
    /// Fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to `next`, logging transitions the state machine does not allow.
    pub fn enter(&mut self, next: TrainerPhase) {
        if self.phase != next && !self.phase.can_transition_to(next) {
            tracing::warn!(from = ?self.phase, to = ?next, "unexpected trainer phase transition");
        }
        self.phase = next;
    }

    /// Record a validation loss; returns true when it is the best so far.
    pub fn record_val_loss(&mut self, loss: f64) -> bool {
        let improved = self.best_val_loss.map_or(true, |best| loss < best);
        if improved {
            self.best_val_loss = Some(loss);
        }
        improved
    }
}
