//! Configuration parsing and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ema::EmaTracker;
use crate::error::{Result, TrajError};
use crate::optimizer::OptimizerConfig;
use crate::scheduler::{LRScheduler, SchedulerType};

/// Main configuration for a training run.
///
/// # Example
///
/// ```rust
/// use traj_ldm::TrajConfig;
///
/// # fn main() -> traj_ldm::Result<()> {
/// let config = TrajConfig::from_preset("nusc-dm")?;
/// config.validate()?;
/// assert_eq!(config.dm.cond_feat_dim, config.vae.cond_dim);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajConfig {
    /// Run name, used in logs.
    #[serde(default = "default_name")]
    pub name: String,

    /// Which stage this run trains.
    #[serde(default)]
    pub mode: TrainMode,

    /// Stage-1 artifact providing the upstream weights (required in `dm` mode).
    #[serde(default)]
    pub vae_checkpoint: Option<String>,

    /// Output directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Upstream VAE architecture.
    #[serde(default)]
    pub vae: VaeSettings,

    /// Downstream diffusion architecture.
    #[serde(default)]
    pub dm: DmSettings,

    /// Shadow weight tracking.
    #[serde(default)]
    pub ema: EmaSettings,

    /// How the downstream loss is formed.
    #[serde(default)]
    pub coupling: Coupling,

    /// Batch source settings.
    #[serde(default)]
    pub data: DataSettings,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Periodic validation.
    #[serde(default)]
    pub validation: ValidationSettings,

    /// Periodic checkpointing.
    #[serde(default)]
    pub save: SaveSettings,
}

fn default_name() -> String {
    "traj-ldm".into()
}

fn default_output_dir() -> String {
    "./outputs".into()
}

fn default_seed() -> u64 {
    42
}

fn default_true() -> bool {
    true
}

/// Stage trained by a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainMode {
    /// Stage 1: the VAE alone.
    #[default]
    Vae,
    /// Stage 2: the diffusion model on top of a frozen VAE.
    Dm,
}

/// Downstream loss formulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coupling {
    /// Loss computed by the downstream model on the latent code.
    #[default]
    LatentMatching,
    /// Denoised latent decoded by the upstream model and compared in
    /// trajectory space with masked MSE.
    TrajectoryMatching,
}

/// Which shadow stores the trainer keeps up to date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmaPolicy {
    /// One tracker updates the upstream and downstream shadows together.
    Joint,
    /// Only the downstream shadow is tracked; the upstream shadow is loaded
    /// once and never updated.
    #[default]
    DownstreamOnly,
}

/// Conditional LSTM VAE dimensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaeSettings {
    /// Features per trajectory step.
    #[serde(default = "default_xy")]
    pub input_size: usize,
    /// LSTM hidden size.
    #[serde(default = "default_vae_hidden")]
    pub hidden_size: usize,
    /// Latent code size.
    #[serde(default = "default_latent")]
    pub latent_size: usize,
    /// Features per decoded step.
    #[serde(default = "default_xy")]
    pub output_size: usize,
    /// Stacked LSTM layers.
    #[serde(default = "default_vae_layers")]
    pub num_layers: usize,
    /// Context vector size.
    #[serde(default = "default_cond_dim")]
    pub cond_dim: usize,
    /// Dropout probability between LSTM layers.
    #[serde(default)]
    pub dropout: f64,
}

fn default_xy() -> usize {
    2
}
fn default_vae_hidden() -> usize {
    64
}
fn default_latent() -> usize {
    16
}
fn default_vae_layers() -> usize {
    2
}
fn default_cond_dim() -> usize {
    32
}

impl Default for VaeSettings {
    fn default() -> Self {
        Self {
            input_size: default_xy(),
            hidden_size: default_vae_hidden(),
            latent_size: default_latent(),
            output_size: default_xy(),
            num_layers: default_vae_layers(),
            cond_dim: default_cond_dim(),
            dropout: 0.0,
        }
    }
}

/// Latent denoiser dimensions and noise schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmSettings {
    /// Context vector size (must equal `vae.cond_dim`).
    #[serde(default = "default_cond_dim")]
    pub cond_feat_dim: usize,
    /// Sinusoidal timestep embedding size.
    #[serde(default = "default_time_dim")]
    pub time_dim: usize,
    /// Width of the residual MLP.
    #[serde(default = "default_mlpres_hidden")]
    pub mlpres_hidden: usize,
    /// Number of residual blocks.
    #[serde(default = "default_mlp_blocks")]
    pub mlp_blocks: usize,
    /// Diffusion timesteps.
    #[serde(default = "default_diffusion_steps")]
    pub diffusion_steps: usize,
    /// First beta of the linear schedule.
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    /// Last beta of the linear schedule.
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
}

fn default_time_dim() -> usize {
    16
}
fn default_mlpres_hidden() -> usize {
    128
}
fn default_mlp_blocks() -> usize {
    2
}
fn default_diffusion_steps() -> usize {
    100
}
fn default_beta_start() -> f64 {
    1e-4
}
fn default_beta_end() -> f64 {
    2e-2
}

impl Default for DmSettings {
    fn default() -> Self {
        Self {
            cond_feat_dim: default_cond_dim(),
            time_dim: default_time_dim(),
            mlpres_hidden: default_mlpres_hidden(),
            mlp_blocks: default_mlp_blocks(),
            diffusion_steps: default_diffusion_steps(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
        }
    }
}

/// Shadow weight settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmaSettings {
    /// Track shadow weights and validate with them.
    #[serde(default = "default_true")]
    pub use_ema: bool,
    /// Decay in `[0, 1)`.
    #[serde(default = "default_decay")]
    pub decay: f64,
    /// Steps between updates.
    #[serde(default = "default_update_every")]
    pub update_every: usize,
    /// Updates before this step hard-reset the shadow.
    #[serde(default = "default_ema_start")]
    pub start_step: usize,
    /// Which shadows are tracked in `dm` mode.
    #[serde(default)]
    pub policy: EmaPolicy,
}

fn default_decay() -> f64 {
    0.995
}
fn default_update_every() -> usize {
    10
}
fn default_ema_start() -> usize {
    1000
}

impl Default for EmaSettings {
    fn default() -> Self {
        Self {
            use_ema: true,
            decay: default_decay(),
            update_every: default_update_every(),
            start_step: default_ema_start(),
            policy: EmaPolicy::default(),
        }
    }
}

/// Synthetic batch source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    /// Trajectory length in steps.
    #[serde(default = "default_history")]
    pub history_steps: usize,
    /// Batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Training batches per epoch.
    #[serde(default = "default_train_batches")]
    pub train_batches: usize,
    /// Validation batches available.
    #[serde(default = "default_val_batches")]
    pub val_batches: usize,
    /// Positions are divided by this before entering the models.
    #[serde(default = "default_position_scale")]
    pub position_scale: f64,
}

fn default_history() -> usize {
    52
}
fn default_batch_size() -> usize {
    32
}
fn default_train_batches() -> usize {
    200
}
fn default_val_batches() -> usize {
    8
}
fn default_position_scale() -> f64 {
    20.0
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            history_steps: default_history(),
            batch_size: default_batch_size(),
            train_batches: default_train_batches(),
            val_batches: default_val_batches(),
            position_scale: default_position_scale(),
        }
    }
}

/// Training hyperparameters.
///
/// # Example
///
/// ```rust
/// use traj_ldm::config::{LrScheduler, TrainingConfig};
///
/// let training = TrainingConfig {
///     num_steps: 2000,
///     learning_rate: 5e-4,
///     lr_scheduler: LrScheduler::Cosine,
///     ..Default::default()
/// };
///
/// assert_eq!(training.num_steps, 2000);
/// assert_eq!(training.warmup_steps(), 600);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Total optimizer steps.
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,

    /// Peak learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Weight decay.
    #[serde(default)]
    pub weight_decay: f64,

    /// Learning rate scheduler.
    #[serde(default)]
    pub lr_scheduler: LrScheduler,

    /// Warmup ratio (one-cycle: fraction of the cycle spent ramping up).
    #[serde(default = "default_warmup")]
    pub warmup_ratio: f64,

    /// Log every N steps.
    #[serde(default = "default_log_steps")]
    pub logging_steps: usize,

    /// KL weight at the first VAE step.
    #[serde(default = "default_kl_start")]
    pub beta_start: f64,

    /// KL weight at the last VAE step.
    #[serde(default = "default_kl_max")]
    pub beta_max: f64,
}

fn default_num_steps() -> usize {
    10_000
}
fn default_lr() -> f64 {
    1e-3
}
fn default_warmup() -> f64 {
    0.3
}
fn default_log_steps() -> usize {
    50
}
fn default_kl_start() -> f64 {
    0.01
}
fn default_kl_max() -> f64 {
    1.0
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_steps: default_num_steps(),
            learning_rate: default_lr(),
            weight_decay: 0.0,
            lr_scheduler: LrScheduler::OneCycle,
            warmup_ratio: default_warmup(),
            logging_steps: default_log_steps(),
            beta_start: default_kl_start(),
            beta_max: default_kl_max(),
        }
    }
}

impl TrainingConfig {
    /// Warmup length in steps.
    #[must_use]
    pub fn warmup_steps(&self) -> usize {
        (self.num_steps as f64 * self.warmup_ratio).round() as usize
    }

    /// KL weight for `step`, annealed linearly from `beta_start` to `beta_max`.
    #[must_use]
    pub fn kl_beta(&self, step: usize) -> f64 {
        if self.num_steps <= 1 {
            return self.beta_max;
        }
        let progress = (step as f64 / (self.num_steps - 1) as f64).min(1.0);
        self.beta_start + (self.beta_max - self.beta_start) * progress
    }

    /// Optimizer settings.
    #[must_use]
    pub fn optimizer_config(&self) -> OptimizerConfig {
        OptimizerConfig {
            learning_rate: self.learning_rate,
            weight_decay: self.weight_decay,
            ..Default::default()
        }
    }

    /// Scheduler for this run.
    #[must_use]
    pub fn build_scheduler(&self) -> LRScheduler {
        let total_steps = self.num_steps;
        let warmup_steps = self.warmup_steps();
        let scheduler_type = match self.lr_scheduler {
            LrScheduler::Constant => SchedulerType::Constant,
            LrScheduler::Linear => SchedulerType::Linear {
                warmup_steps,
                total_steps,
            },
            LrScheduler::Cosine => SchedulerType::Cosine {
                warmup_steps,
                total_steps,
            },
            LrScheduler::OneCycle => SchedulerType::one_cycle(total_steps, self.warmup_ratio),
        };
        LRScheduler::new(scheduler_type, self.learning_rate)
    }
}

/// Learning rate scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrScheduler {
    /// One-cycle policy.
    #[default]
    OneCycle,
    /// Cosine annealing.
    Cosine,
    /// Linear decay.
    Linear,
    /// Constant learning rate.
    Constant,
}

/// Periodic validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSettings {
    /// Run validation at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Validate every N steps.
    #[serde(default = "default_val_every")]
    pub every_n_steps: usize,
    /// Batches per validation pass.
    #[serde(default = "default_val_batches")]
    pub num_batches: usize,
}

fn default_val_every() -> usize {
    500
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            every_n_steps: default_val_every(),
            num_batches: default_val_batches(),
        }
    }
}

/// Periodic checkpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveSettings {
    /// Write periodic checkpoints (the final one is always written).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Save every N steps.
    #[serde(default = "default_save_every")]
    pub every_n_steps: usize,
    /// Checkpoints kept on disk (0 keeps all).
    #[serde(default = "default_keep_last")]
    pub keep_last_n: usize,
    /// Keep the lowest-validation-loss artifacts under `checkpoints/best`.
    #[serde(default = "default_true")]
    pub save_best_validation: bool,
    /// Number of best-validation artifacts kept.
    #[serde(default = "default_best_k")]
    pub best_k: usize,
}

fn default_save_every() -> usize {
    1000
}
fn default_keep_last() -> usize {
    3
}
fn default_best_k() -> usize {
    1
}

impl Default for SaveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            every_n_steps: default_save_every(),
            keep_last_n: default_keep_last(),
            save_best_validation: true,
            best_k: default_best_k(),
        }
    }
}

impl Default for TrajConfig {
    fn default() -> Self {
        Self::nusc_vae_preset()
    }
}

impl TrajConfig {
    /// Names accepted by [`TrajConfig::from_preset`].
    pub const PRESETS: [&'static str; 3] = ["nusc-vae", "nusc-dm", "smoke"];

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"nusc-vae"` - stage 1, VAE on nuScenes-sized trajectories
    /// - `"nusc-dm"` - stage 2, latent diffusion on top of `nusc-vae`
    /// - `"smoke"` - tiny VAE run for quick checks
    ///
    /// # Errors
    ///
    /// Returns [`TrajError::Config`] for unknown names.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "nusc-vae" => Ok(Self::nusc_vae_preset()),
            "nusc-dm" => Ok(Self::nusc_dm_preset()),
            "smoke" => Ok(Self::smoke_preset()),
            _ => Err(TrajError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Stage 1 preset.
    #[must_use]
    pub fn nusc_vae_preset() -> Self {
        Self {
            name: "nusc-vae".into(),
            mode: TrainMode::Vae,
            vae_checkpoint: None,
            output_dir: "./outputs/nusc-vae".into(),
            seed: default_seed(),
            vae: VaeSettings::default(),
            dm: DmSettings::default(),
            ema: EmaSettings::default(),
            coupling: Coupling::LatentMatching,
            data: DataSettings::default(),
            training: TrainingConfig::default(),
            validation: ValidationSettings::default(),
            save: SaveSettings::default(),
        }
    }

    /// Stage 2 preset consuming the final `nusc-vae` checkpoint.
    #[must_use]
    pub fn nusc_dm_preset() -> Self {
        Self {
            name: "nusc-dm".into(),
            mode: TrainMode::Dm,
            vae_checkpoint: Some(
                "./outputs/nusc-vae/checkpoints/checkpoint_step_00010000.safetensors".into(),
            ),
            output_dir: "./outputs/nusc-dm".into(),
            ema: EmaSettings {
                policy: EmaPolicy::DownstreamOnly,
                ..Default::default()
            },
            ..Self::nusc_vae_preset()
        }
    }

    /// Tiny stage 1 run.
    #[must_use]
    pub fn smoke_preset() -> Self {
        Self {
            name: "smoke".into(),
            mode: TrainMode::Vae,
            vae_checkpoint: None,
            output_dir: "./outputs/smoke".into(),
            seed: default_seed(),
            vae: VaeSettings {
                hidden_size: 8,
                latent_size: 4,
                num_layers: 1,
                cond_dim: 6,
                ..Default::default()
            },
            dm: DmSettings {
                cond_feat_dim: 6,
                time_dim: 4,
                mlpres_hidden: 16,
                mlp_blocks: 1,
                diffusion_steps: 10,
                ..Default::default()
            },
            ema: EmaSettings {
                update_every: 1,
                start_step: 2,
                ..Default::default()
            },
            coupling: Coupling::LatentMatching,
            data: DataSettings {
                history_steps: 6,
                batch_size: 4,
                train_batches: 3,
                val_batches: 2,
                position_scale: 20.0,
            },
            training: TrainingConfig {
                num_steps: 6,
                logging_steps: 2,
                ..Default::default()
            },
            validation: ValidationSettings {
                enabled: true,
                every_n_steps: 2,
                num_batches: 1,
            },
            save: SaveSettings {
                enabled: true,
                every_n_steps: 3,
                keep_last_n: 2,
                ..Default::default()
            },
        }
    }

    /// `<output_dir>/checkpoints`.
    #[must_use]
    pub fn checkpoint_dir(&self) -> PathBuf {
        Path::new(&self.output_dir).join("checkpoints")
    }

    /// Tracker built from the `ema` section.
    ///
    /// # Errors
    ///
    /// Returns [`TrajError::Config`] for an invalid decay or cadence.
    pub fn ema_tracker(&self) -> Result<EmaTracker> {
        EmaTracker::new(self.ema.decay, self.ema.update_every, self.ema.start_step)
    }

    /// Validate the configuration.
    ///
    /// ```rust
    /// use traj_ldm::TrajConfig;
    ///
    /// let mut config = TrajConfig::from_preset("nusc-dm").unwrap();
    /// config.ema.decay = 1.0;
    /// assert!(config.validate().is_err());
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`TrajError::Config`] describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.ema.decay) {
            return Err(TrajError::Config(format!(
                "ema.decay must be in [0, 1), got {}",
                self.ema.decay
            )));
        }
        if self.ema.update_every == 0 {
            return Err(TrajError::Config("ema.update_every must be > 0".into()));
        }
        if self.training.num_steps == 0 {
            return Err(TrajError::Config("training.num_steps must be > 0".into()));
        }
        if self.training.learning_rate <= 0.0 {
            return Err(TrajError::Config("training.learning_rate must be > 0".into()));
        }
        if self.data.batch_size == 0 {
            return Err(TrajError::Config("data.batch_size must be > 0".into()));
        }
        if self.data.history_steps == 0 || self.data.train_batches == 0 {
            return Err(TrajError::Config(
                "data.history_steps and data.train_batches must be > 0".into(),
            ));
        }
        if self.validation.enabled && self.validation.every_n_steps == 0 {
            return Err(TrajError::Config("validation.every_n_steps must be > 0".into()));
        }
        if self.save.enabled && self.save.every_n_steps == 0 {
            return Err(TrajError::Config("save.every_n_steps must be > 0".into()));
        }
        if self.validation.enabled
            && self.save.enabled
            && self.save.every_n_steps <= self.validation.every_n_steps
        {
            return Err(TrajError::Config(format!(
                "save.every_n_steps ({}) must be greater than validation.every_n_steps ({})",
                self.save.every_n_steps, self.validation.every_n_steps
            )));
        }
        if self.save.save_best_validation && self.save.best_k == 0 {
            return Err(TrajError::Config(
                "save.best_k must be > 0 when save.save_best_validation is set".into(),
            ));
        }
        if self.vae.hidden_size == 0 || self.vae.latent_size == 0 || self.vae.num_layers == 0 {
            return Err(TrajError::Config(
                "vae.hidden_size, vae.latent_size and vae.num_layers must be > 0".into(),
            ));
        }
        if self.dm.cond_feat_dim != self.vae.cond_dim {
            return Err(TrajError::Config(format!(
                "dm.cond_feat_dim ({}) must equal vae.cond_dim ({})",
                self.dm.cond_feat_dim, self.vae.cond_dim
            )));
        }
        if self.dm.diffusion_steps == 0 {
            return Err(TrajError::Config("dm.diffusion_steps must be > 0".into()));
        }
        if !(0.0 < self.dm.beta_start && self.dm.beta_start <= self.dm.beta_end && self.dm.beta_end < 1.0) {
            return Err(TrajError::Config(
                "dm betas must satisfy 0 < beta_start <= beta_end < 1".into(),
            ));
        }
        if self.mode == TrainMode::Dm && self.vae_checkpoint.is_none() {
            return Err(TrajError::Config("mode 'dm' requires vae_checkpoint".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_presets_validate() {
        for name in TrajConfig::PRESETS {
            let config = TrajConfig::from_preset(name).unwrap();
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_preset_unknown() {
        let err = TrajConfig::from_preset("gpt-4").unwrap_err();
        assert!(matches!(err, TrajError::Config(_)));
    }

    #[test]
    fn test_yaml_sections_parse() {
        let yaml = r"
name: nusc-dm
mode: dm
vae_checkpoint: ./vae.safetensors
vae: { input_size: 2, hidden_size: 64, latent_size: 16, output_size: 2, num_layers: 2, cond_dim: 32, dropout: 0.0 }
dm: { cond_feat_dim: 32, time_dim: 16, mlpres_hidden: 128, mlp_blocks: 2, diffusion_steps: 100, beta_start: 1.0e-4, beta_end: 2.0e-2 }
ema: { use_ema: true, decay: 0.995, update_every: 10, start_step: 1000, policy: joint }
coupling: trajectory_matching
training: { num_steps: 10000, learning_rate: 1.0e-3, lr_scheduler: one_cycle }
";
        let config: TrajConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mode, TrainMode::Dm);
        assert_eq!(config.ema.policy, EmaPolicy::Joint);
        assert_eq!(config.coupling, Coupling::TrajectoryMatching);
        assert_eq!(config.training.lr_scheduler, LrScheduler::OneCycle);
        assert_eq!(config.data.batch_size, 32);
        assert_eq!(config.save.keep_last_n, 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_decay_range() {
        let mut config = TrajConfig::smoke_preset();
        config.ema.decay = 1.0;
        assert!(config.validate().is_err());
        config.ema.decay = -0.1;
        assert!(config.validate().is_err());
        config.ema.decay = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_cadence() {
        let mut config = TrajConfig::smoke_preset();
        config.ema.update_every = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_save_after_validation_interval() {
        let mut config = TrajConfig::smoke_preset();
        config.save.every_n_steps = config.validation.every_n_steps;
        assert!(config.validate().is_err());

        config.validation.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_best_k() {
        let mut config = TrajConfig::smoke_preset();
        config.save.best_k = 0;
        assert!(config.validate().is_err());

        config.save.save_best_validation = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_cond_dims_must_match() {
        let mut config = TrajConfig::nusc_dm_preset();
        config.dm.cond_feat_dim = 7;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cond_feat_dim"));
    }

    #[test]
    fn test_validation_dm_requires_vae_checkpoint() {
        let mut config = TrajConfig::nusc_dm_preset();
        config.vae_checkpoint = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_kl_beta_anneals_linearly() {
        let training = TrainingConfig {
            num_steps: 101,
            ..Default::default()
        };
        assert!((training.kl_beta(0) - 0.01).abs() < 1e-12);
        assert!((training.kl_beta(100) - 1.0).abs() < 1e-12);
        assert!((training.kl_beta(50) - 0.505).abs() < 1e-12);
        assert!((training.kl_beta(500) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_build_scheduler_variants() {
        let mut training = TrainingConfig {
            num_steps: 100,
            ..Default::default()
        };
        assert!(matches!(
            training.build_scheduler().scheduler_type(),
            SchedulerType::OneCycle { total_steps: 100, .. }
        ));
        training.lr_scheduler = LrScheduler::Linear;
        assert!(matches!(
            training.build_scheduler().scheduler_type(),
            SchedulerType::Linear {
                warmup_steps: 30,
                total_steps: 100
            }
        ));
        training.lr_scheduler = LrScheduler::Constant;
        assert_eq!(training.build_scheduler().get_lr(), training.learning_rate);
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = TrajConfig::from_file("/nonexistent/path/config.yaml");
        assert!(matches!(result, Err(TrajError::Io(_))));
    }

    #[test]
    fn test_load_config_malformed_yaml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "invalid: yaml: content: [[[").unwrap();

        let result = TrajConfig::from_file(temp_file.path());
        assert!(matches!(result, Err(TrajError::ConfigParse(_))));
    }

    #[test]
    fn test_save_config_roundtrip() {
        let config = TrajConfig::nusc_dm_preset();
        let temp_file = NamedTempFile::new().unwrap();
        config.to_file(temp_file.path()).unwrap();

        let loaded = TrajConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.name, config.name);
        assert_eq!(loaded.mode, TrainMode::Dm);
        assert_eq!(loaded.vae_checkpoint, config.vae_checkpoint);
        assert_eq!(loaded.ema.decay, config.ema.decay);
        assert_eq!(loaded.training.learning_rate, config.training.learning_rate);
    }

    #[test]
    fn test_checkpoint_dir() {
        let config = TrajConfig::smoke_preset();
        assert_eq!(
            config.checkpoint_dir(),
            PathBuf::from("./outputs/smoke/checkpoints")
        );
    }
}
