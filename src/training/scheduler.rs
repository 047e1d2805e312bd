//! Learning Rate Schedules
//!
//! The pipeline uses two schedules: a constant rate for supervised HAR
//! training, and a step decay (halving every 15 epochs) for the
//! self-supervised and self-training stages.

use serde::{Deserialize, Serialize};

/// Epochs between each step-decay halving
pub const DECAY_EPOCHS: usize = 15;

/// Multiplier applied at each decay step
pub const DECAY_FACTOR: f64 = 0.5;

/// Learning rate schedule evaluated per epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LrSchedule {
    /// Constant learning rate (no scheduling)
    Constant { lr: f64 },

    /// Step decay: `initial_lr * decay_factor^(epoch / epochs_per_step)`
    StepDecay {
        initial_lr: f64,
        decay_factor: f64,
        epochs_per_step: usize,
    },
}

impl LrSchedule {
    /// Constant schedule at the given rate
    pub fn constant(lr: f64) -> Self {
        Self::Constant { lr }
    }

    /// The pipeline's standard step decay: halve every 15 epochs
    pub fn step_decay(initial_lr: f64) -> Self {
        Self::StepDecay {
            initial_lr,
            decay_factor: DECAY_FACTOR,
            epochs_per_step: DECAY_EPOCHS,
        }
    }

    /// Learning rate for a zero-based epoch index
    pub fn get_lr(&self, epoch: usize) -> f64 {
        match self {
            Self::Constant { lr } => *lr,
            Self::StepDecay {
                initial_lr,
                decay_factor,
                epochs_per_step,
            } => {
                let steps = epoch / (*epochs_per_step).max(1);
                initial_lr * decay_factor.powi(steps as i32)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant() {
        let schedule = LrSchedule::constant(0.01);
        assert_eq!(schedule.get_lr(0), 0.01);
        assert_eq!(schedule.get_lr(100), 0.01);
    }

    #[test]
    fn test_step_decay_halves_every_fifteen_epochs() {
        let schedule = LrSchedule::step_decay(0.0003);
        assert!((schedule.get_lr(0) - 0.0003).abs() < 1e-12);
        assert!((schedule.get_lr(14) - 0.0003).abs() < 1e-12);
        assert!((schedule.get_lr(15) - 0.00015).abs() < 1e-12);
        assert!((schedule.get_lr(29) - 0.00015).abs() < 1e-12);
        assert!((schedule.get_lr(30) - 0.000075).abs() < 1e-12);
    }
}
