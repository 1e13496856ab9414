//! AdamW over [`ParameterStore`]s with persistable moments.
//!
//! Only gradient-tracking parameters are visited, so a frozen upstream store
//! can be passed alongside the downstream one without being touched.

use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::Tensor;

use crate::error::Result;
use crate::params::{ParamKey, ParameterStore, StageId};

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.0,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Create an AdamW optimizer with these parameters.
    #[must_use]
    pub fn build_adamw(&self) -> AdamW {
        AdamW::new(self.clone())
    }
}

/// Moment estimates and bias-correction counter.
#[derive(Debug, Clone, Default)]
pub struct OptimizerState {
    /// Number of optimizer steps taken.
    pub step: usize,
    /// First moment estimates.
    pub exp_avg: BTreeMap<ParamKey, Tensor>,
    /// Second moment estimates.
    pub exp_avg_sq: BTreeMap<ParamKey, Tensor>,
}

impl OptimizerState {
    /// Whether no moments have been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exp_avg.is_empty() && self.exp_avg_sq.is_empty()
    }
}

/// AdamW with decoupled weight decay.
pub struct AdamW {
    config: OptimizerConfig,
    learning_rate: f64,
    state: OptimizerState,
}

impl AdamW {
    /// Create an optimizer with empty moments.
    #[must_use]
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            config,
            state: OptimizerState::default(),
        }
    }

    /// Get current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    /// Number of steps taken so far.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.state.step
    }

    /// Current moments.
    #[must_use]
    pub fn state(&self) -> &OptimizerState {
        &self.state
    }

    /// Replace the moments, e.g. when resuming.
    pub fn load_state(&mut self, state: OptimizerState) {
        self.state = state;
    }

    /// Apply one update to every trainable parameter that has a gradient.
    ///
    /// Returns the number of parameters updated.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn step(&mut self, grads: &GradStore, stores: &[(StageId, &ParameterStore)]) -> Result<usize> {
        self.state.step += 1;
        let t = i32::try_from(self.state.step).unwrap_or(i32::MAX);
        let bc1 = 1.0 - self.config.beta1.powi(t);
        let bc2 = 1.0 - self.config.beta2.powi(t);
        let lr = self.learning_rate;

        let mut updated = 0;
        for (stage, store) in stores {
            for (name, var) in store.trainable_vars() {
                let Some(grad) = grads.get(var) else {
                    continue;
                };
                let key = ParamKey::new(*stage, name);

                let m = match self.state.exp_avg.get(&key) {
                    Some(m) => m.clone(),
                    None => grad.zeros_like()?,
                };
                let v = match self.state.exp_avg_sq.get(&key) {
                    Some(v) => v.clone(),
                    None => grad.zeros_like()?,
                };

                let m_new = ((&m * self.config.beta1)? + (grad * (1.0 - self.config.beta1))?)?;
                let v_new = ((&v * self.config.beta2)? + (grad.sqr()? * (1.0 - self.config.beta2))?)?;

                let m_hat = (&m_new / bc1)?;
                let v_hat = (&v_new / bc2)?;
                let update = ((m_hat / (v_hat.sqrt()? + self.config.eps)?)? * lr)?;

                let w = var.as_tensor().detach();
                let decayed = (&w * (1.0 - lr * self.config.weight_decay))?;
                var.set(&(decayed - update)?)?;

                self.state.exp_avg.insert(key.clone(), m_new);
                self.state.exp_avg_sq.insert(key, v_new);
                updated += 1;
            }
        }
        Ok(updated)
    }
}
