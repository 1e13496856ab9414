//! Training loop and optimization.

use std::path::{Path, PathBuf};

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};

use crate::checkpoint::{AfterLoad, CheckpointBundle, CheckpointCodec, CheckpointManager, ShadowKey};
use crate::config::{TrainMode, TrajConfig};
use crate::dataset::{BatchSource, SyntheticTrajectories, TrajectoryBatch};
use crate::ema::EmaTracker;
use crate::error::{Result, TrajError};
use crate::models::{LatentDenoiser, LstmVae};
use crate::optimizer::AdamW;
use crate::params::{ParameterStore, StageId};
use crate::pipeline::{DownstreamModel, PipelineOptions, StagePipeline, UpstreamModel};
use crate::scheduler::LRScheduler;
use crate::state::{TrainerPhase, TrainerState};

/// File the resolved configuration is written to inside `output_dir`.
pub const RUN_CONFIG_FILE: &str = "run_config.yaml";

/// Training step metrics for monitoring.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    /// Loss for this step
    pub loss: f64,
    /// Global norm of all gradients reaching trainable parameters
    pub grad_norm: f64,
    /// Learning rate the step was taken with
    pub learning_rate: f64,
}

/// One trainable stage as seen by the [`Trainer`].
pub trait TrainingTask {
    /// Stage whose live weights receive gradients.
    fn stage(&self) -> StageId;

    /// Stores handed to the optimizer.
    fn trainable(&self) -> Vec<(StageId, &ParameterStore)>;

    /// Scalar training loss for one batch.
    fn loss(&mut self, batch: &TrajectoryBatch, state: &TrainerState) -> Result<Tensor>;

    /// Held-out loss, computed with shadow weights when the task keeps them.
    fn validation_loss(&self, batch: &TrajectoryBatch, state: &TrainerState) -> Result<f64>;

    /// Advance the tracked shadows.
    fn update_ema(&mut self, tracker: &EmaTracker, step: usize) -> Result<()>;

    /// Checkpoint contents for the current weights.
    fn bundle<'a>(&'a self, state: &'a TrainerState) -> CheckpointBundle<'a>;

    /// Bind the weights of a previous stage. Stages without one ignore this.
    fn restore_upstream(&mut self, _path: &Path) -> Result<()> {
        Ok(())
    }

    /// Restore live and shadow weights from a checkpoint of this stage.
    fn restore_resume(&mut self, path: &Path) -> Result<()>;
}

/// Stage 1: the VAE trained on its own.
pub struct VaeStage {
    model: LstmVae,
    live: ParameterStore,
    shadow: Option<ParameterStore>,
}

impl VaeStage {
    /// Stage with freshly initialized weights; `use_ema` adds a shadow.
    ///
    /// # Errors
    ///
    /// Returns an error if weight initialization fails.
    pub fn new(model: LstmVae, use_ema: bool, device: &Device) -> Result<Self> {
        let live = model.init_weights(device)?;
        let shadow = if use_ema {
            Some(live.clone_detached()?)
        } else {
            None
        };
        Ok(Self {
            model,
            live,
            shadow,
        })
    }

    /// Live weights.
    pub fn live(&self) -> &ParameterStore {
        &self.live
    }

    /// Shadow weights, when EMA is on.
    pub fn shadow(&self) -> Option<&ParameterStore> {
        self.shadow.as_ref()
    }
}

impl TrainingTask for VaeStage {
    fn stage(&self) -> StageId {
        StageId::Vae
    }

    fn trainable(&self) -> Vec<(StageId, &ParameterStore)> {
        vec![(StageId::Vae, &self.live)]
    }

    fn loss(&mut self, batch: &TrajectoryBatch, state: &TrainerState) -> Result<Tensor> {
        let loss = self.model.training_loss(&self.live, batch, state.kl_beta, true)?;
        tracing::debug!(recon = loss.recon, kld = loss.kld, kl_beta = state.kl_beta, "vae loss terms");
        Ok(loss.total)
    }

    fn validation_loss(&self, batch: &TrajectoryBatch, state: &TrainerState) -> Result<f64> {
        let weights = self.shadow.as_ref().unwrap_or(&self.live);
        let loss = self.model.training_loss(weights, batch, state.kl_beta, false)?;
        Ok(f64::from(loss.total.to_scalar::<f32>()?))
    }

    fn update_ema(&mut self, tracker: &EmaTracker, step: usize) -> Result<()> {
        if let Some(shadow) = self.shadow.as_mut() {
            tracker.update(shadow, &self.live, step)?;
        }
        Ok(())
    }

    fn bundle<'a>(&'a self, state: &'a TrainerState) -> CheckpointBundle<'a> {
        let bundle = CheckpointBundle::new(state).with_primary(StageId::Vae, &self.live);
        match &self.shadow {
            Some(shadow) => bundle.with_shadow(ShadowKey::Upstream, shadow),
            None => bundle,
        }
    }

    fn restore_resume(&mut self, path: &Path) -> Result<()> {
        CheckpointCodec::load_primary(path, &mut self.live, StageId::Vae, AfterLoad::KeepTrainable)?;
        if self.shadow.is_some() {
            let mut shadow = self.live.clone_detached()?;
            CheckpointCodec::load_shadow(path, &mut shadow, ShadowKey::Upstream)?;
            self.shadow = Some(shadow);
        }
        Ok(())
    }
}

impl<U: UpstreamModel, D: DownstreamModel> TrainingTask for StagePipeline<U, D> {
    fn stage(&self) -> StageId {
        StageId::Dm
    }

    fn trainable(&self) -> Vec<(StageId, &ParameterStore)> {
        StagePipeline::trainable(self)
    }

    fn loss(&mut self, batch: &TrajectoryBatch, _state: &TrainerState) -> Result<Tensor> {
        self.train_step(batch)
    }

    fn validation_loss(&self, batch: &TrajectoryBatch, _state: &TrainerState) -> Result<f64> {
        Ok(f64::from(StagePipeline::validation_loss(self, batch)?))
    }

    fn update_ema(&mut self, tracker: &EmaTracker, step: usize) -> Result<()> {
        self.step_ema(tracker, step)
    }

    fn bundle<'a>(&'a self, state: &'a TrainerState) -> CheckpointBundle<'a> {
        StagePipeline::bundle(self, state)
    }

    fn restore_upstream(&mut self, path: &Path) -> Result<()> {
        self.load_upstream(path)?;
        Ok(())
    }

    fn restore_resume(&mut self, path: &Path) -> Result<()> {
        self.load_resume(path)
    }
}

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use traj_ldm::{TrajConfig, Trainer, VaeStage};
/// use traj_ldm::dataset::SyntheticTrajectories;
/// use traj_ldm::models::LstmVae;
///
/// # fn main() -> traj_ldm::Result<()> {
/// let config = TrajConfig::from_preset("smoke")?;
/// let device = traj_ldm::trainer::select_device();
///
/// let source = SyntheticTrajectories::new(&config.data, &config.vae, config.seed, &device);
/// let model = LstmVae::new(config.vae.clone(), config.data.position_scale);
/// let task = VaeStage::new(model, config.ema.use_ema, &device)?;
///
/// let mut trainer = Trainer::new(config, task, source, device)?;
/// trainer.restore(None)?;
/// trainer.train()?;
/// # Ok(())
/// # }
/// ```
pub struct Trainer<T, S> {
    /// Configuration
    config: TrajConfig,
    /// Stage being trained
    task: T,
    /// Batches
    source: S,
    /// Device for training
    device: Device,
    /// Optimizer over the task's trainable stores
    optimizer: AdamW,
    /// Learning rate scheduler
    scheduler: LRScheduler,
    /// Shadow tracker, when EMA is on
    ema: Option<EmaTracker>,
    /// Artifact naming and rotation
    checkpoints: CheckpointManager,
    /// Counters threaded through every step
    state: TrainerState,
    /// Step of the last written artifact
    last_saved: Option<usize>,
    /// Training metrics from last run
    pub training_metrics: Vec<StepMetrics>,
}

impl<T: TrainingTask, S: BatchSource> Trainer<T, S> {
    /// Create a new trainer.
    ///
    /// Validates the configuration and creates the checkpoint directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the checkpoint
    /// directory cannot be created.
    pub fn new(config: TrajConfig, task: T, source: S, device: Device) -> Result<Self> {
        config.validate()?;

        let optimizer = config.training.optimizer_config().build_adamw();
        let scheduler = config.training.build_scheduler();
        let ema = if config.ema.use_ema {
            Some(config.ema_tracker()?)
        } else {
            None
        };
        let save_interval = if config.save.enabled {
            config.save.every_n_steps
        } else {
            0
        };
        let best_k = if config.save.save_best_validation {
            config.save.best_k
        } else {
            0
        };
        let checkpoints =
            CheckpointManager::new(config.checkpoint_dir(), save_interval, config.save.keep_last_n)?.with_best_k(best_k)?;

        Ok(Self {
            config,
            task,
            source,
            device,
            optimizer,
            scheduler,
            ema,
            checkpoints,
            state: TrainerState::new(),
            last_saved: None,
            training_metrics: Vec::new(),
        })
    }

    /// Current trainer state.
    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// Stage being trained.
    pub fn task(&self) -> &T {
        &self.task
    }

    /// Checkpoint manager.
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Optimizer.
    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    /// Load weights before training.
    ///
    /// In `dm` mode the upstream artifact is always loaded. With `resume`,
    /// weights, trainer state, optimizer moments and scheduler position are
    /// restored from that artifact. Any failure terminates the run.
    ///
    /// # Errors
    ///
    /// Artifact-level failures from [`CheckpointCodec`].
    pub fn restore(&mut self, resume: Option<&Path>) -> Result<()> {
        self.state.enter(TrainerPhase::CheckpointLoading);
        if let Err(err) = self.load_artifacts(resume) {
            tracing::error!("Checkpoint loading failed: {err}");
            self.state.enter(TrainerPhase::Terminated);
            return Err(err);
        }
        self.state.enter(TrainerPhase::Training);
        Ok(())
    }

    fn load_artifacts(&mut self, resume: Option<&Path>) -> Result<()> {
        if self.config.mode == TrainMode::Dm {
            let upstream = self
                .config
                .vae_checkpoint
                .as_deref()
                .ok_or_else(|| TrajError::Config("mode 'dm' requires vae_checkpoint".into()))?;
            tracing::info!("Loading upstream weights from {upstream}");
            self.task.restore_upstream(Path::new(upstream))?;
        }

        let Some(path) = resume else {
            return Ok(());
        };
        tracing::info!("Resuming from {}", path.display());
        let restored = CheckpointCodec::load_trainer_state(path)?;
        self.task.restore_resume(path)?;
        if let Some(state) = CheckpointCodec::load_optimizer_state(path, &self.device)? {
            self.optimizer.load_state(state);
        }
        if let Some(scheduler) = CheckpointCodec::load_scheduler(path)? {
            self.scheduler = scheduler;
        }

        self.state = TrainerState {
            phase: TrainerPhase::CheckpointLoading,
            ..restored
        };
        self.last_saved = Some(self.state.global_step);
        tracing::info!(
            "Resumed at step {}, epoch {}",
            self.state.global_step,
            self.state.epoch
        );
        Ok(())
    }

    /// Run the training loop.
    ///
    /// This performs the following steps:
    /// 1. Loads artifacts through [`Trainer::restore`] if that has not happened
    /// 2. Writes the resolved configuration to `<output_dir>/run_config.yaml`
    /// 3. Iterates over batches until `training.num_steps`
    /// 4. Updates shadow weights on the EMA cadence
    /// 5. Validates and saves checkpoints periodically
    /// 6. Saves a final checkpoint
    ///
    /// Any failure terminates the run.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Artifact loading fails
    /// - A batch cannot be produced
    /// - The loss is not finite
    /// - Checkpoint saving fails
    pub fn train(&mut self) -> Result<()> {
        if self.state.phase == TrainerPhase::Init {
            self.restore(None)?;
        }
        if let Err(err) = self.run_loop() {
            tracing::error!("Training failed at step {}: {err}", self.state.global_step);
            self.state.enter(TrainerPhase::Terminated);
            return Err(err);
        }
        self.state.enter(TrainerPhase::Terminated);
        Ok(())
    }

    fn run_loop(&mut self) -> Result<()> {
        if self.state.phase != TrainerPhase::Training {
            self.state.enter(TrainerPhase::Training);
        }
        self.write_run_config()?;

        let total_steps = self.config.training.num_steps;
        let start_step = self.state.global_step;
        let batches_per_epoch = self.source.num_train_batches().max(1);

        tracing::info!("Starting training");
        tracing::info!("  Run: {}", self.config.name);
        tracing::info!("  Stage: {}", self.task.stage());
        tracing::info!("  Steps: {}/{}", start_step, total_steps);
        tracing::info!(
            "  Trainable params: {}",
            self.task
                .trainable()
                .iter()
                .map(|(_, store)| store.num_elements())
                .sum::<usize>()
        );

        self.optimizer.set_learning_rate(self.scheduler.get_lr());
        self.training_metrics.clear();

        let pb = ProgressBar::new(total_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_position(start_step as u64);

        while self.state.global_step < total_steps {
            let step = self.state.global_step;
            self.state.kl_beta = self.config.training.kl_beta(step);
            let batch = self.source.train_batch(step % batches_per_epoch)?;

            let metrics = self.training_step(&batch)?;
            self.state.global_step += 1;
            let global_step = self.state.global_step;
            if global_step % batches_per_epoch == 0 {
                self.state.epoch += 1;
            }

            if let Some(tracker) = &self.ema {
                if tracker.is_due(global_step) {
                    self.task.update_ema(tracker, global_step)?;
                    self.state.ema_updates += 1;
                }
            }

            pb.set_message(format!("{:.4}", metrics.loss));
            pb.inc(1);

            if global_step % self.config.training.logging_steps.max(1) == 0 {
                tracing::info!(
                    "Step {}/{}, Epoch {}, Loss: {:.4}, GradNorm: {:.4}, LR: {:.2e}",
                    global_step,
                    total_steps,
                    self.state.epoch + 1,
                    metrics.loss,
                    metrics.grad_norm,
                    metrics.learning_rate
                );
            }
            self.training_metrics.push(metrics);

            if self.config.validation.enabled && global_step % self.config.validation.every_n_steps == 0 {
                self.validate()?;
            }

            if self.checkpoints.should_save(global_step) {
                self.save_checkpoint()?;
            }
        }

        pb.finish_with_message("Training complete");

        if self.last_saved != Some(self.state.global_step) {
            self.save_checkpoint()?;
        }
        Ok(())
    }

    fn write_run_config(&self) -> Result<()> {
        let dir = Path::new(&self.config.output_dir);
        std::fs::create_dir_all(dir)?;
        let path = dir.join(RUN_CONFIG_FILE);
        self.config.to_file(&path)?;
        tracing::debug!("Wrote run configuration to {}", path.display());
        Ok(())
    }

    /// Perform a single training step.
    ///
    /// This method:
    /// 1. Computes the task loss
    /// 2. Performs the backward pass
    /// 3. Applies the optimizer to the trainable stores only
    /// 4. Steps the scheduler
    fn training_step(&mut self, batch: &TrajectoryBatch) -> Result<StepMetrics> {
        let loss = self.task.loss(batch, &self.state)?;
        let loss_val = f64::from(loss.to_scalar::<f32>()?);
        if !loss_val.is_finite() {
            return Err(TrajError::Training(format!(
                "non-finite loss {loss_val} at step {}",
                self.state.global_step
            )));
        }

        let grads = loss.backward()?;
        let trainable = self.task.trainable();
        let grad_norm = global_grad_norm(&grads, &trainable)?;
        let learning_rate = self.optimizer.learning_rate();
        self.optimizer.step(&grads, &trainable)?;
        self.scheduler.step(&mut self.optimizer);

        self.state.learning_rate = learning_rate;
        self.state.optimizer_step = self.optimizer.step_count();
        self.state.scheduler_step = self.scheduler.current_step();

        Ok(StepMetrics {
            loss: loss_val,
            grad_norm,
            learning_rate,
        })
    }

    /// Mean loss over the configured number of validation batches.
    fn validate(&mut self) -> Result<Option<f64>> {
        let num_batches = self
            .config
            .validation
            .num_batches
            .min(self.source.num_val_batches());
        if num_batches == 0 {
            return Ok(None);
        }

        self.state.enter(TrainerPhase::Validating);
        let mut total = 0.0;
        for idx in 0..num_batches {
            let batch = self.source.val_batch(idx)?;
            total += self.task.validation_loss(&batch, &self.state)?;
        }
        let mean = total / num_batches as f64;
        let improved = self.state.record_val_loss(mean);
        tracing::info!(
            "Validation at step {}: loss {:.4}{}",
            self.state.global_step,
            mean,
            if improved { " (best)" } else { "" }
        );
        if self.checkpoints.qualifies_as_best(mean) {
            self.state.enter(TrainerPhase::CheckpointSaving);
            let bundle = self
                .task
                .bundle(&self.state)
                .with_optimizer(self.optimizer.state())
                .with_scheduler(&self.scheduler);
            if let Some(path) = self.checkpoints.save_best(&bundle, mean)? {
                tracing::info!("Saved best checkpoint to: {}", path.display());
            }
        }
        self.state.enter(TrainerPhase::Training);
        Ok(Some(mean))
    }

    /// Write an artifact for the current step.
    fn save_checkpoint(&mut self) -> Result<PathBuf> {
        self.state.enter(TrainerPhase::CheckpointSaving);
        let bundle = self
            .task
            .bundle(&self.state)
            .with_optimizer(self.optimizer.state())
            .with_scheduler(&self.scheduler);
        let path = self.checkpoints.save(&bundle)?;
        tracing::info!("Saved checkpoint to: {}", path.display());

        self.last_saved = Some(self.state.global_step);
        self.state.enter(TrainerPhase::Training);
        Ok(path)
    }
}

fn global_grad_norm(grads: &GradStore, stores: &[(StageId, &ParameterStore)]) -> Result<f64> {
    let mut sum_sq = 0.0f64;
    for (_, store) in stores {
        for (_, var) in store.trainable_vars() {
            if let Some(grad) = grads.get(var.as_tensor()) {
                sum_sq += f64::from(grad.sqr()?.sum_all()?.to_scalar::<f32>()?);
            }
        }
    }
    Ok(sum_sq.sqrt())
}

/// Pick the training device.
///
/// CUDA is used when the crate is built with the `cuda` feature and a device
/// is available; `TRAJ_FORCE_CPU=1` overrides. `TRAJ_CUDA_DEVICE` selects the
/// ordinal.
#[must_use]
pub fn select_device() -> Device {
    let force_cpu = std::env::var("TRAJ_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let cuda_device = std::env::var("TRAJ_CUDA_DEVICE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if !force_cpu && cfg!(feature = "cuda") {
        match Device::cuda_if_available(cuda_device) {
            Ok(device @ Device::Cuda(_)) => {
                tracing::info!("Training device: CUDA (device {})", cuda_device);
                device
            }
            Ok(_) => {
                tracing::warn!("CUDA not available; falling back to CPU.");
                Device::Cpu
            }
            Err(err) => {
                tracing::warn!("CUDA init failed ({err}); falling back to CPU.");
                Device::Cpu
            }
        }
    } else {
        if force_cpu {
            tracing::info!("CPU mode forced via TRAJ_FORCE_CPU=1.");
        } else {
            tracing::debug!("CUDA feature disabled; training on CPU.");
        }
        Device::Cpu
    }
}

/// Train the stage selected by `config.mode` on synthetic batches.
///
/// Returns the final trainer state.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, an artifact cannot be
/// loaded, or training fails.
pub fn train(config: TrajConfig, resume: Option<&Path>) -> Result<TrainerState> {
    config.validate()?;
    let device = select_device();
    if let Err(err) = device.set_seed(config.seed) {
        tracing::debug!("Device RNG not seeded: {err}");
    }

    let source = SyntheticTrajectories::new(&config.data, &config.vae, config.seed, &device);
    let vae = LstmVae::new(config.vae.clone(), config.data.position_scale);

    match config.mode {
        TrainMode::Vae => {
            let task = VaeStage::new(vae, config.ema.use_ema, &device)?;
            run_task(config, task, source, device, resume)
        }
        TrainMode::Dm => {
            let dm = LatentDenoiser::new(config.dm.clone(), config.vae.latent_size)?;
            let options = PipelineOptions {
                coupling: config.coupling,
                use_ema: config.ema.use_ema,
                policy: config.ema.policy,
            };
            let task = StagePipeline::new(vae, dm, options, &device)?;
            run_task(config, task, source, device, resume)
        }
    }
}

fn run_task<T: TrainingTask, S: BatchSource>(
    config: TrajConfig,
    task: T,
    source: S,
    device: Device,
    resume: Option<&Path>,
) -> Result<TrainerState> {
    let mut trainer = Trainer::new(config, task, source, device)?;
    trainer.restore(resume)?;
    trainer.train()?;
    Ok(trainer.state().clone())
}
