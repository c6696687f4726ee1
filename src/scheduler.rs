//! Learning rate schedules with linear warmup.

use crate::config::{LrScheduler, TrainerConfig};

/// Learning rate as a function of the optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    kind: LrScheduler,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LrSchedule {
    /// Schedule over `total_steps` optimizer steps.
    ///
    /// Warmup lasts `ceil(warmup_ratio * total_steps)` steps.
    #[must_use]
    pub fn new(config: &TrainerConfig, total_steps: usize) -> Self {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let warmup_steps = (config.warmup_ratio * total_steps as f64).ceil() as usize;
        Self {
            kind: config.lr_scheduler,
            base_lr: config.learning_rate,
            warmup_steps,
            total_steps,
        }
    }

    /// Steps spent warming up.
    #[must_use]
    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    /// Learning rate for the update that follows `step` completed updates.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * (step + 1) as f64 / self.warmup_steps as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps);
        if decay_steps == 0 {
            return self.base_lr;
        }
        let progress = ((step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);
        match self.kind {
            LrScheduler::Constant => self.base_lr,
            LrScheduler::Linear => self.base_lr * (1.0 - progress),
            LrScheduler::Cosine => {
                self.base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
            }
        }
    }
}
