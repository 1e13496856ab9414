//! Learning rate schedulers.

use serde::{Deserialize, Serialize};

use crate::optimizer::AdamW;

/// Learning rate scheduler types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerType {
    /// Constant learning rate
    Constant,
    /// Linear warmup then linear decay
    Linear {
        /// Number of warmup steps
        warmup_steps: usize,
        /// Total number of training steps
        total_steps: usize,
    },
    /// Cosine annealing with warmup
    Cosine {
        /// Number of warmup steps
        warmup_steps: usize,
        /// Total number of training steps
        total_steps: usize,
    },
    /// One-cycle policy with cosine annealing in both phases
    OneCycle {
        /// Total number of training steps
        total_steps: usize,
        /// Fraction of the cycle spent increasing the learning rate
        pct_start: f64,
        /// `initial_lr = base_lr / div_factor`
        div_factor: f64,
        /// `min_lr = initial_lr / final_div_factor`
        final_div_factor: f64,
    },
}

impl SchedulerType {
    /// One-cycle schedule with `div_factor` 25 and `final_div_factor` 1000.
    #[must_use]
    pub fn one_cycle(total_steps: usize, pct_start: f64) -> Self {
        SchedulerType::OneCycle {
            total_steps,
            pct_start,
            div_factor: 25.0,
            final_div_factor: 1e3,
        }
    }
}

/// Learning rate scheduler.
///
/// The whole scheduler is serializable; checkpoints store it under the
/// `lr_schedulers` metadata key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LRScheduler {
    /// Scheduler type
    scheduler_type: SchedulerType,
    /// Base (peak) learning rate
    base_lr: f64,
    /// Current step
    current_step: usize,
}

impl LRScheduler {
    /// Create a new scheduler.
    #[must_use]
    pub fn new(scheduler_type: SchedulerType, base_lr: f64) -> Self {
        Self {
            scheduler_type,
            base_lr,
            current_step: 0,
        }
    }

    /// Steps taken so far.
    #[must_use]
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Scheduler type.
    #[must_use]
    pub fn scheduler_type(&self) -> &SchedulerType {
        &self.scheduler_type
    }

    /// Get learning rate for current step.
    #[must_use]
    pub fn get_lr(&self) -> f64 {
        match &self.scheduler_type {
            SchedulerType::Constant => self.base_lr,

            SchedulerType::Linear {
                warmup_steps,
                total_steps,
            } => self.linear_schedule(*warmup_steps, *total_steps),

            SchedulerType::Cosine {
                warmup_steps,
                total_steps,
            } => self.cosine_schedule(*warmup_steps, *total_steps),

            SchedulerType::OneCycle {
                total_steps,
                pct_start,
                div_factor,
                final_div_factor,
            } => self.one_cycle_schedule(*total_steps, *pct_start, *div_factor, *final_div_factor),
        }
    }

    /// Step the scheduler and update optimizer.
    pub fn step(&mut self, optimizer: &mut AdamW) {
        self.current_step += 1;
        let lr = self.get_lr();
        optimizer.set_learning_rate(lr);
    }

    fn progress(&self, start: usize, end: usize) -> f64 {
        if end <= start {
            return 1.0;
        }
        (self.current_step.saturating_sub(start) as f64 / (end - start) as f64).min(1.0)
    }

    /// Linear warmup then linear decay.
    fn linear_schedule(&self, warmup_steps: usize, total_steps: usize) -> f64 {
        if self.current_step < warmup_steps {
            self.base_lr * (self.current_step as f64 / warmup_steps as f64)
        } else {
            let progress = self.progress(warmup_steps, total_steps);
            self.base_lr * (1.0 - progress).max(0.0)
        }
    }

    /// Cosine annealing with linear warmup.
    fn cosine_schedule(&self, warmup_steps: usize, total_steps: usize) -> f64 {
        if self.current_step < warmup_steps {
            self.base_lr * (self.current_step as f64 / warmup_steps as f64)
        } else {
            let progress = self.progress(warmup_steps, total_steps);
            let cosine_decay = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
            self.base_lr * cosine_decay
        }
    }

    /// Cosine ramp from `base_lr / div` up to `base_lr`, then down to the floor.
    fn one_cycle_schedule(
        &self,
        total_steps: usize,
        pct_start: f64,
        div_factor: f64,
        final_div_factor: f64,
    ) -> f64 {
        let initial_lr = self.base_lr / div_factor;
        let min_lr = initial_lr / final_div_factor;
        let peak_step = ((pct_start * total_steps as f64).round() as usize).saturating_sub(1);
        let last_step = total_steps.saturating_sub(1);

        if self.current_step <= peak_step {
            cosine_anneal(initial_lr, self.base_lr, self.progress(0, peak_step))
        } else {
            cosine_anneal(self.base_lr, min_lr, self.progress(peak_step, last_step))
        }
    }
}

fn cosine_anneal(start: f64, end: f64, pct: f64) -> f64 {
    end + (start - end) / 2.0 * (1.0 + (std::f64::consts::PI * pct).cos())
}
