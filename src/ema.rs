//! Exponential-moving-average shadow weights.
//!
//! An [`EmaTracker`] keeps a shadow [`ParameterStore`] as a decayed running
//! average of a live one:
//!
//! ```text
//! shadow[k] = decay * shadow[k] + (1 - decay) * live[k]
//! ```
//!
//! Before `warmup_steps` the shadow is hard-reset to the live values instead.
//! The update cadence is stored here but checked by the caller through
//! [`EmaTracker::is_due`]; `update` itself only compares the step against the
//! warm-up boundary.
//!
//! # Example
//! ```
//! use candle_core::{Device, Tensor};
//! use traj_ldm::ema::EmaTracker;
//! use traj_ldm::params::ParameterStore;
//!
//! # fn main() -> traj_ldm::Result<()> {
//! let device = Device::Cpu;
//! let mut live = ParameterStore::new(&device);
//! live.insert("w", &Tensor::new(&[1.0f32], &device)?, true)?;
//! let mut shadow = ParameterStore::new(&device);
//! shadow.insert("w", &Tensor::new(&[0.0f32], &device)?, false)?;
//!
//! let ema = EmaTracker::new(0.99, 1, 0)?;
//! ema.update(&mut shadow, &live, 0)?;
//! let w = shadow.value("w").unwrap().to_vec1::<f32>()?[0];
//! assert!((w - 0.01).abs() < 1e-6);
//! # Ok(())
//! # }
//! ```

use tracing::{debug, warn};

use crate::error::{Result, TrajError};
use crate::params::{ParameterStore, SyncReport};

/// Decay, cadence and warm-up policy for one run's shadow weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmaTracker {
    decay: f64,
    update_every: usize,
    warmup_steps: usize,
}

impl EmaTracker {
    /// Create a tracker.
    ///
    /// # Errors
    ///
    /// Returns [`TrajError::Config`] when `decay` is outside `[0, 1)` or
    /// `update_every` is zero.
    pub fn new(decay: f64, update_every: usize, warmup_steps: usize) -> Result<Self> {
        if !(0.0..1.0).contains(&decay) {
            return Err(TrajError::Config(format!(
                "ema decay must be in [0, 1), got {decay}"
            )));
        }
        if update_every == 0 {
            return Err(TrajError::Config("ema update_every must be > 0".into()));
        }
        Ok(Self {
            decay,
            update_every,
            warmup_steps,
        })
    }

    /// Fixed decay factor.
    #[must_use]
    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// Steps between updates.
    #[must_use]
    pub fn update_every(&self) -> usize {
        self.update_every
    }

    /// Steps during which updates hard-reset the shadow.
    #[must_use]
    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    /// Whether an update falls on `step`.
    #[must_use]
    pub fn is_due(&self, step: usize) -> bool {
        step % self.update_every == 0
    }

    /// Whether `step` is still inside the warm-up range.
    #[must_use]
    pub fn in_warmup(&self, step: usize) -> bool {
        step < self.warmup_steps
    }

    /// Advance `shadow` towards `live`.
    ///
    /// Only keys present in both stores with identical shapes are touched;
    /// everything else is left alone and listed in the returned report.
    ///
    /// # Errors
    ///
    /// Only tensor backend failures are returned. Key and shape mismatches
    /// never fail.
    pub fn update(
        &self,
        shadow: &mut ParameterStore,
        live: &ParameterStore,
        step: usize,
    ) -> Result<SyncReport> {
        let report = if self.in_warmup(step) {
            shadow.copy_from(live)?
        } else {
            self.blend(shadow, live)?
        };

        if report.is_complete() {
            debug!(step, updated = report.updated, "ema update");
        } else {
            warn!(
                step,
                updated = report.updated,
                skipped = ?report.skipped,
                "ema update skipped unmatched parameters"
            );
        }
        Ok(report)
    }

    fn blend(&self, shadow: &mut ParameterStore, live: &ParameterStore) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let names: Vec<String> = shadow.names().map(str::to_string).collect();
        for name in names {
            let (Some(current), Some(target)) = (shadow.value(&name), live.value(&name)) else {
                report.skipped.push(name);
                continue;
            };
            if current.dims() != target.dims() {
                report.skipped.push(name);
                continue;
            }
            let blended = current
                .affine(self.decay, 0.0)?
                .add(&target.detach().affine(1.0 - self.decay, 0.0)?)?;
            shadow.assign(&name, &blended)?;
            report.updated += 1;
        }
        report.skipped.extend(
            live.names()
                .filter(|name| !shadow.contains(name))
                .map(str::to_string),
        );
        Ok(report)
    }
}
