//! Two-stage latent pipeline: a frozen upstream autoencoder feeding a
//! trainable downstream diffusion model.
//!
//! The pipeline owns the weight stores of both stages and decides which of
//! them a computation runs with. Callers ask for a [`WeightView`] once per
//! step through [`StagePipeline::weights`]:
//!
//! | Phase | Upstream | Downstream |
//! |---|---|---|
//! | `Train` | shadow if bound, else live | live |
//! | `Validate` | shadow if bound, else live | shadow when EMA is on, else live |
//! | `Inference` | shadow if bound, else live | shadow when EMA is on, else live |
//!
//! The upstream shadow is only bound when EMA is on.
//!
//! Upstream weights are always frozen, so gradients from the downstream loss
//! never reach them.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::checkpoint::{AfterLoad, CheckpointBundle, CheckpointCodec, KeyMismatch, ShadowKey};
use crate::config::{Coupling, EmaPolicy};
use crate::dataset::TrajectoryBatch;
use crate::ema::EmaTracker;
use crate::error::Result;
use crate::params::{ParameterStore, StageId};
use crate::state::TrainerState;

/// Conditioning carried alongside a latent code.
#[derive(Debug, Clone)]
pub struct AuxInfo {
    /// Context features, `(B, C)`.
    pub cond_feat: Tensor,
    /// Availability mask, `(B, T)`.
    pub availabilities: Tensor,
}

impl AuxInfo {
    /// Number of time steps a decoded trajectory must have.
    ///
    /// # Errors
    ///
    /// Returns an error if the mask is not two-dimensional.
    pub fn history_steps(&self) -> Result<usize> {
        Ok(self.availabilities.dim(1)?)
    }
}

/// Gaussian posterior parameters, each `(B, L)`.
#[derive(Debug, Clone)]
pub struct LatentParams {
    /// Mean.
    pub mu: Tensor,
    /// Log-variance.
    pub logvar: Tensor,
}

/// A batch prepared for the upstream encoder.
#[derive(Debug, Clone)]
pub struct Prepared {
    /// Conditioning.
    pub aux: AuxInfo,
    /// Positions as given, `(B, T, F)`.
    pub unscaled: Tensor,
    /// Positions in model units, `(B, T, F)`.
    pub scaled: Tensor,
}

/// Output of [`StagePipeline::encode`]. Every tensor is detached.
#[derive(Debug, Clone)]
pub struct EncodeOutput {
    /// Conditioning.
    pub aux: AuxInfo,
    /// Positions as given, `(B, T, F)`.
    pub unscaled: Tensor,
    /// Positions in model units, `(B, T, F)`.
    pub scaled: Tensor,
    /// Sampled latent code, `(B, L)`.
    pub latent: Tensor,
}

/// Trajectory autoencoder used as the upstream stage.
///
/// Trajectories are `(B, T, F)`, latents `(B, L)`. Every method computes with
/// the weights it is handed and never mutates them.
pub trait UpstreamModel {
    /// Freshly initialized weights.
    fn init_weights(&self, device: &Device) -> Result<ParameterStore>;

    /// Latent width `L`.
    fn latent_size(&self) -> usize;

    /// Split a batch into conditioning and scaled input.
    fn prepare(&self, batch: &TrajectoryBatch) -> Result<Prepared>;

    /// Posterior parameters for a scaled trajectory.
    fn encode(&self, weights: &ParameterStore, scaled: &Tensor, aux: &AuxInfo) -> Result<LatentParams>;

    /// Draw a latent from the posterior.
    fn sample(&self, params: &LatentParams) -> Result<Tensor>;

    /// Decode a latent back into a scaled trajectory.
    fn decode(&self, weights: &ParameterStore, latent: &Tensor, aux: &AuxInfo) -> Result<Tensor>;

    /// Undo the input scaling.
    fn unscale(&self, scaled: &Tensor) -> Result<Tensor>;
}

/// Generative model over latent codes used as the downstream stage.
pub trait DownstreamModel {
    /// Freshly initialized weights.
    fn init_weights(&self, device: &Device) -> Result<ParameterStore>;

    /// Scalar training loss for a batch of latents.
    fn compute_loss(&self, weights: &ParameterStore, z: &Tensor, aux: &AuxInfo) -> Result<Tensor>;

    /// Reconstruct `z` from a noised version of itself, `(B, L)`.
    fn denoise(&self, weights: &ParameterStore, z: &Tensor, aux: &AuxInfo) -> Result<Tensor>;

    /// Generate latents from scratch, `(B, L)`.
    fn sample(&self, weights: &ParameterStore, aux: &AuxInfo) -> Result<Tensor>;
}

/// What a computation is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Gradient step.
    Train,
    /// Held-out loss.
    Validate,
    /// Generation.
    Inference,
}

/// The stores a computation should read, resolved for one phase.
#[derive(Debug, Clone, Copy)]
pub struct WeightView<'a> {
    upstream: &'a ParameterStore,
    downstream: &'a ParameterStore,
    upstream_shadow: bool,
    downstream_shadow: bool,
}

impl<'a> WeightView<'a> {
    /// Active upstream weights.
    #[must_use]
    pub fn upstream(&self) -> &'a ParameterStore {
        self.upstream
    }

    /// Active downstream weights.
    #[must_use]
    pub fn downstream(&self) -> &'a ParameterStore {
        self.downstream
    }

    /// Active weights of `stage`.
    #[must_use]
    pub fn active(&self, stage: StageId) -> &'a ParameterStore {
        match stage {
            StageId::Vae => self.upstream,
            StageId::Dm => self.downstream,
        }
    }

    /// Whether `stage` resolved to its shadow store.
    #[must_use]
    pub fn uses_shadow(&self, stage: StageId) -> bool {
        match stage {
            StageId::Vae => self.upstream_shadow,
            StageId::Dm => self.downstream_shadow,
        }
    }
}

/// Construction options for a [`StagePipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// How the downstream loss is formed.
    pub coupling: Coupling,
    /// Keep shadows and use them; off means live weights everywhere.
    pub use_ema: bool,
    /// Which shadows the EMA step advances.
    pub policy: EmaPolicy,
}

/// Frozen upstream plus trainable downstream, with their shadows.
pub struct StagePipeline<U, D> {
    upstream: U,
    downstream: D,
    options: PipelineOptions,
    upstream_live: ParameterStore,
    upstream_shadow: Option<ParameterStore>,
    downstream_live: ParameterStore,
    downstream_shadow: Option<ParameterStore>,
}

impl<U: UpstreamModel, D: DownstreamModel> StagePipeline<U, D> {
    /// Pipeline with freshly initialized weights.
    ///
    /// The upstream starts frozen and without a shadow; bind trained weights
    /// with [`StagePipeline::load_upstream`] or [`StagePipeline::load_resume`].
    ///
    /// # Errors
    ///
    /// Returns an error if weight initialization fails.
    pub fn new(upstream: U, downstream: D, options: PipelineOptions, device: &Device) -> Result<Self> {
        let mut upstream_live = upstream.init_weights(device)?;
        upstream_live.freeze();
        let downstream_live = downstream.init_weights(device)?;
        let downstream_shadow = if options.use_ema {
            Some(downstream_live.clone_detached()?)
        } else {
            None
        };
        Ok(Self {
            upstream,
            downstream,
            options,
            upstream_live,
            upstream_shadow: None,
            downstream_live,
            downstream_shadow,
        })
    }

    /// Construction options.
    #[must_use]
    pub fn options(&self) -> PipelineOptions {
        self.options
    }

    /// Upstream model.
    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    /// Downstream model.
    pub fn downstream(&self) -> &D {
        &self.downstream
    }

    /// Upstream live weights (always frozen).
    pub fn upstream_live(&self) -> &ParameterStore {
        &self.upstream_live
    }

    /// Upstream shadow weights, once bound.
    pub fn upstream_shadow(&self) -> Option<&ParameterStore> {
        self.upstream_shadow.as_ref()
    }

    /// Downstream live weights.
    pub fn downstream_live(&self) -> &ParameterStore {
        &self.downstream_live
    }

    /// Downstream shadow weights, when EMA is on.
    pub fn downstream_shadow(&self) -> Option<&ParameterStore> {
        self.downstream_shadow.as_ref()
    }

    /// Stores the optimizer updates.
    pub fn trainable(&self) -> Vec<(StageId, &ParameterStore)> {
        vec![(StageId::Dm, &self.downstream_live)]
    }

    /// Resolve the active stores for `phase`.
    #[must_use]
    pub fn weights(&self, phase: Phase) -> WeightView<'_> {
        let (upstream, upstream_shadow) = match &self.upstream_shadow {
            Some(shadow) => (shadow, true),
            None => (&self.upstream_live, false),
        };
        let (downstream, downstream_shadow) = match (phase, &self.downstream_shadow) {
            (Phase::Validate | Phase::Inference, Some(shadow)) if self.options.use_ema => (shadow, true),
            _ => (&self.downstream_live, false),
        };
        WeightView {
            upstream,
            downstream,
            upstream_shadow,
            downstream_shadow,
        }
    }

    fn encode_with(&self, view: &WeightView<'_>, batch: &TrajectoryBatch) -> Result<EncodeOutput> {
        let prepared = self.upstream.prepare(batch)?;
        let params = self
            .upstream
            .encode(view.upstream(), &prepared.scaled, &prepared.aux)?;
        let latent = self.upstream.sample(&params)?.detach();
        Ok(EncodeOutput {
            aux: prepared.aux,
            unscaled: prepared.unscaled.detach(),
            scaled: prepared.scaled.detach(),
            latent,
        })
    }

    /// Encode a batch with the active upstream weights.
    ///
    /// Outputs are detached; nothing in the pipeline changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch is malformed or a tensor operation fails.
    pub fn encode(&self, batch: &TrajectoryBatch) -> Result<EncodeOutput> {
        self.encode_with(&self.weights(Phase::Train), batch)
    }

    fn loss_with(&self, view: &WeightView<'_>, batch: &TrajectoryBatch) -> Result<Tensor> {
        let encoded = self.encode_with(view, batch)?;
        match self.options.coupling {
            Coupling::LatentMatching => {
                self.downstream
                    .compute_loss(view.downstream(), &encoded.latent, &encoded.aux)
            }
            Coupling::TrajectoryMatching => {
                let z_hat = self
                    .downstream
                    .denoise(view.downstream(), &encoded.latent, &encoded.aux)?;
                let traj = self.upstream.decode(view.upstream(), &z_hat, &encoded.aux)?;
                masked_mse(&traj, &encoded.scaled, &encoded.aux.availabilities)
            }
        }
    }

    /// Downstream training loss for one batch, attached to the graph of the
    /// downstream live weights only.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch is malformed or a tensor operation fails.
    pub fn train_step(&self, batch: &TrajectoryBatch) -> Result<Tensor> {
        self.loss_with(&self.weights(Phase::Train), batch)
    }

    /// Held-out loss with the [`Phase::Validate`] view.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch is malformed or a tensor operation fails.
    pub fn validation_loss(&self, batch: &TrajectoryBatch) -> Result<f32> {
        let loss = self.loss_with(&self.weights(Phase::Validate), batch)?;
        Ok(loss.detach().to_scalar::<f32>()?)
    }

    /// Sample trajectories for the contexts of `batch`, `(B, T, F)` in scene
    /// units.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch is malformed or a tensor operation fails.
    pub fn generate(&self, batch: &TrajectoryBatch) -> Result<Tensor> {
        let view = self.weights(Phase::Inference);
        let prepared = self.upstream.prepare(batch)?;
        let z = self.downstream.sample(view.downstream(), &prepared.aux)?;
        let traj = self.upstream.decode(view.upstream(), &z, &prepared.aux)?;
        Ok(self.upstream.unscale(&traj)?.detach())
    }

    /// Bind trained upstream weights from a stage-1 artifact.
    ///
    /// The live store takes `state_dict.vae.*` and is frozen. With EMA on, the
    /// shadow starts as a copy of it and is overwritten by `ema_state` when the
    /// artifact has one. With EMA off no shadow is bound and `ema_state` is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Artifact-level failures from [`CheckpointCodec`].
    pub fn load_upstream(&mut self, path: impl AsRef<Path>) -> Result<KeyMismatch> {
        let path = path.as_ref();
        let keys = CheckpointCodec::load_primary(path, &mut self.upstream_live, StageId::Vae, AfterLoad::Freeze)?;
        if !self.options.use_ema {
            self.upstream_shadow = None;
            return Ok(keys);
        }
        let mut shadow = self.upstream_live.clone_detached()?;
        if CheckpointCodec::load_shadow(path, &mut shadow, ShadowKey::Upstream)?.is_none() {
            info!("upstream shadow not recorded; encoding with live upstream weights");
        }
        self.upstream_shadow = Some(shadow);
        Ok(keys)
    }

    /// Restore both stages and their shadows from a stage-2 artifact.
    ///
    /// # Errors
    ///
    /// Artifact-level failures from [`CheckpointCodec`].
    pub fn load_resume(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.load_upstream(path)?;
        CheckpointCodec::load_primary(path, &mut self.downstream_live, StageId::Dm, AfterLoad::KeepTrainable)?;
        if self.options.use_ema {
            let mut shadow = self.downstream_live.clone_detached()?;
            CheckpointCodec::load_shadow(path, &mut shadow, ShadowKey::Downstream)?;
            self.downstream_shadow = Some(shadow);
        }
        Ok(())
    }

    /// Advance the tracked shadows.
    ///
    /// The downstream shadow always follows its live store. With
    /// [`EmaPolicy::Joint`] the upstream shadow also moves towards the frozen
    /// upstream live weights.
    ///
    /// # Errors
    ///
    /// Tensor backend failures only.
    pub fn step_ema(&mut self, tracker: &EmaTracker, step: usize) -> Result<()> {
        if !self.options.use_ema {
            return Ok(());
        }
        if let Some(shadow) = self.downstream_shadow.as_mut() {
            tracker.update(shadow, &self.downstream_live, step)?;
        }
        if self.options.policy == EmaPolicy::Joint {
            if let Some(shadow) = self.upstream_shadow.as_mut() {
                tracker.update(shadow, &self.upstream_live, step)?;
            }
        }
        Ok(())
    }

    /// Checkpoint contents for the current weights.
    ///
    /// Primary state holds both stages; shadows are written when bound.
    #[must_use]
    pub fn bundle<'a>(&'a self, state: &'a TrainerState) -> CheckpointBundle<'a> {
        let mut bundle = CheckpointBundle::new(state)
            .with_primary(StageId::Vae, &self.upstream_live)
            .with_primary(StageId::Dm, &self.downstream_live);
        if let Some(shadow) = &self.upstream_shadow {
            bundle = bundle.with_shadow(ShadowKey::Upstream, shadow);
        }
        if let Some(shadow) = &self.downstream_shadow {
            bundle = bundle.with_shadow(ShadowKey::Downstream, shadow);
        }
        bundle
    }
}

/// Mean squared error over available steps only.
///
/// `pred` and `target` are `(B, T, F)`, `mask` is `(B, T)` and broadcast over
/// features. The masked sum is divided by `Σmask · F`; an all-zero mask gives
/// zero.
///
/// # Errors
///
/// Returns an error if the shapes are incompatible.
pub fn masked_mse(pred: &Tensor, target: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let features = pred.dim(2)?;
    let mask = mask.to_dtype(pred.dtype())?;
    let weights = mask.unsqueeze(2)?.broadcast_as(pred.shape())?;
    let total = (pred - target)?.sqr()?.mul(&weights)?.sum_all()?;
    let count = mask.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()? * features as f64;
    if count == 0.0 {
        return Ok(total.zeros_like()?);
    }
    Ok(total.affine(1.0 / count, 0.0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataSettings, DmSettings, VaeSettings};
    use crate::dataset::{BatchSource, SyntheticTrajectories};
    use crate::models::{LatentDenoiser, LstmVae};
    use tempfile::TempDir;

    type Pipeline = StagePipeline<LstmVae, LatentDenoiser>;

    fn vae_settings() -> VaeSettings {
        VaeSettings {
            input_size: 2,
            hidden_size: 8,
            latent_size: 4,
            output_size: 2,
            num_layers: 1,
            cond_dim: 6,
            dropout: 0.0,
        }
    }

    fn dm_settings() -> DmSettings {
        DmSettings {
            cond_feat_dim: 6,
            time_dim: 4,
            mlpres_hidden: 16,
            mlp_blocks: 1,
            diffusion_steps: 5,
            beta_start: 1e-4,
            beta_end: 2e-2,
        }
    }

    fn pipeline(coupling: Coupling, use_ema: bool, policy: EmaPolicy) -> Pipeline {
        let vae = LstmVae::new(vae_settings(), 20.0);
        let dm = LatentDenoiser::new(dm_settings(), 4).unwrap();
        let options = PipelineOptions {
            coupling,
            use_ema,
            policy,
        };
        StagePipeline::new(vae, dm, options, &Device::Cpu).unwrap()
    }

    fn batch() -> TrajectoryBatch {
        let data = DataSettings {
            history_steps: 5,
            batch_size: 3,
            train_batches: 1,
            val_batches: 1,
            position_scale: 20.0,
        };
        SyntheticTrajectories::new(&data, &vae_settings(), 3, &Device::Cpu)
            .train_batch(0)
            .unwrap()
    }

    fn flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    /// Write a stage-1 artifact; the shadow (if any) is the live weights plus `offset`.
    fn vae_artifact(dir: &TempDir, shadow_offset: Option<f64>) -> std::path::PathBuf {
        let vae = LstmVae::new(vae_settings(), 20.0);
        let live = vae.init_weights(&Device::Cpu).unwrap();
        let mut shadow = live.clone_detached().unwrap();
        let names: Vec<String> = shadow.names().map(str::to_string).collect();
        for name in &names {
            let shifted = shadow
                .value(name)
                .unwrap()
                .affine(1.0, shadow_offset.unwrap_or(0.0))
                .unwrap();
            shadow.assign(name, &shifted).unwrap();
        }
        let state = TrainerState::new();
        let mut bundle = CheckpointBundle::new(&state).with_primary(StageId::Vae, &live);
        if shadow_offset.is_some() {
            bundle = bundle.with_shadow(ShadowKey::Upstream, &shadow);
        }
        let path = dir.path().join("vae.safetensors");
        CheckpointCodec::save(&path, &bundle).unwrap();
        path
    }

    #[test]
    fn test_masked_mse_matches_manual_reference() {
        let pred = Tensor::new(
            &[
                [[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]],
                [[0.5, 0.5], [1.0, -1.0], [9.0, 9.0]],
            ],
            &Device::Cpu,
        )
        .unwrap();
        let target = Tensor::zeros((2, 3, 2), DType::F32, &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1.0f32, 1.0, 0.0], [1.0, 0.0, 0.0]], &Device::Cpu).unwrap();

        let loss = masked_mse(&pred, &target, &mask)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();

        // Available entries, flattened: (1,2), (3,4), (0.5,0.5).
        let kept = [1.0f32, 2.0, 3.0, 4.0, 0.5, 0.5];
        let reference = kept.iter().map(|v| v * v).sum::<f32>() / kept.len() as f32;
        assert!((loss - reference).abs() < 1e-6);
    }

    #[test]
    fn test_masked_mse_all_zero_mask_is_zero() {
        let pred = Tensor::ones((2, 3, 2), DType::F32, &Device::Cpu).unwrap();
        let target = Tensor::zeros((2, 3, 2), DType::F32, &Device::Cpu).unwrap();
        let mask = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let loss = masked_mse(&pred, &target, &mask).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_weight_view_resolution() {
        let dir = TempDir::new().unwrap();
        let path = vae_artifact(&dir, Some(0.0));
        let mut p = pipeline(Coupling::LatentMatching, true, EmaPolicy::DownstreamOnly);

        let before = p.weights(Phase::Train);
        assert!(!before.uses_shadow(StageId::Vae));
        assert!(std::ptr::eq(before.upstream(), p.upstream_live()));

        p.load_upstream(&path).unwrap();

        let train = p.weights(Phase::Train);
        assert!(train.uses_shadow(StageId::Vae));
        assert!(!train.uses_shadow(StageId::Dm));
        assert!(std::ptr::eq(train.downstream(), p.downstream_live()));

        for phase in [Phase::Validate, Phase::Inference] {
            let view = p.weights(phase);
            assert!(view.uses_shadow(StageId::Dm));
            assert!(std::ptr::eq(view.active(StageId::Dm), p.downstream_shadow().unwrap()));
        }
    }

    #[test]
    fn test_weight_view_without_ema_uses_live() {
        let p = pipeline(Coupling::LatentMatching, false, EmaPolicy::DownstreamOnly);
        assert!(p.downstream_shadow().is_none());
        let view = p.weights(Phase::Validate);
        assert!(!view.uses_shadow(StageId::Dm));
        assert!(std::ptr::eq(view.downstream(), p.downstream_live()));
    }

    #[test]
    fn test_encode_outputs_are_detached() {
        let p = pipeline(Coupling::LatentMatching, true, EmaPolicy::DownstreamOnly);
        let out = p.encode(&batch()).unwrap();
        assert_eq!(out.latent.dims(), &[3, 4]);
        assert_eq!(out.scaled.dims(), &[3, 5, 2]);
        assert_eq!(out.unscaled.dims(), &[3, 5, 2]);
        assert!(!out.latent.is_variable());
        assert!(!out.latent.track_op()); // track_op() == is_variable || op.is_some(); op() is crate-private
    }

    #[test]
    fn test_gradients_never_reach_upstream() {
        let dir = TempDir::new().unwrap();
        let path = vae_artifact(&dir, Some(0.0));
        for coupling in [Coupling::LatentMatching, Coupling::TrajectoryMatching] {
            let mut p = pipeline(coupling, true, EmaPolicy::DownstreamOnly);
            p.load_upstream(&path).unwrap();
            assert!(p.upstream_live().is_frozen());

            let loss = p.train_step(&batch()).unwrap();
            let grads = loss.backward().unwrap();

            for name in p.upstream_live().names() {
                assert!(grads.get(p.upstream_live().value(name).unwrap()).is_none());
            }
            let shadow = p.upstream_shadow().unwrap();
            for name in shadow.names() {
                assert!(grads.get(shadow.value(name).unwrap()).is_none());
            }
            assert!(grads
                .get(p.downstream_live().value("out_proj.weight").unwrap())
                .is_some());
        }
    }

    #[test]
    fn test_missing_upstream_shadow_falls_back_to_live_copy() {
        let dir = TempDir::new().unwrap();
        let path = vae_artifact(&dir, None);
        let mut p = pipeline(Coupling::LatentMatching, true, EmaPolicy::DownstreamOnly);
        let keys = p.load_upstream(&path).unwrap();
        assert!(keys.is_clean());

        let shadow = p.upstream_shadow().unwrap();
        for name in p.upstream_live().names() {
            assert_eq!(
                flat(shadow.value(name).unwrap()),
                flat(p.upstream_live().value(name).unwrap())
            );
        }
    }

    #[test]
    fn test_joint_policy_moves_upstream_shadow() {
        let dir = TempDir::new().unwrap();
        let path = vae_artifact(&dir, Some(1.0));
        let tracker = EmaTracker::new(0.5, 1, 0).unwrap();

        let mut joint = pipeline(Coupling::LatentMatching, true, EmaPolicy::Joint);
        joint.load_upstream(&path).unwrap();
        joint.step_ema(&tracker, 1).unwrap();

        let live = flat(joint.upstream_live().value("mu.bias").unwrap());
        let shadow = flat(joint.upstream_shadow().unwrap().value("mu.bias").unwrap());
        for (s, l) in shadow.iter().zip(&live) {
            assert!((s - (l + 0.5)).abs() < 1e-5);
        }

        let mut downstream_only = pipeline(Coupling::LatentMatching, true, EmaPolicy::DownstreamOnly);
        downstream_only.load_upstream(&path).unwrap();
        downstream_only.step_ema(&tracker, 1).unwrap();
        let live = flat(downstream_only.upstream_live().value("mu.bias").unwrap());
        let shadow = flat(downstream_only.upstream_shadow().unwrap().value("mu.bias").unwrap());
        for (s, l) in shadow.iter().zip(&live) {
            assert!((s - (l + 1.0)).abs() < 1e-5);
        }
    }

    #[test]
    fn test_validation_and_generation() {
        let dir = TempDir::new().unwrap();
        let path = vae_artifact(&dir, Some(0.0));
        let b = batch();
        for use_ema in [true, false] {
            let mut p = pipeline(Coupling::TrajectoryMatching, use_ema, EmaPolicy::DownstreamOnly);
            p.load_upstream(&path).unwrap();
            assert!(p.validation_loss(&b).unwrap().is_finite());

            let traj = p.generate(&b).unwrap();
            assert_eq!(traj.dims(), &[3, 5, 2]);
        }
    }

    #[test]
    fn test_ema_off_ignores_recorded_upstream_shadow() {
        let dir = TempDir::new().unwrap();
        let path = vae_artifact(&dir, Some(1.0));
        let mut p = pipeline(Coupling::LatentMatching, false, EmaPolicy::DownstreamOnly);
        p.load_upstream(&path).unwrap();

        assert!(p.upstream_shadow().is_none());
        for phase in [Phase::Train, Phase::Validate, Phase::Inference] {
            let view = p.weights(phase);
            assert!(!view.uses_shadow(StageId::Vae));
            assert!(std::ptr::eq(view.upstream(), p.upstream_live()));
        }

        let state = TrainerState::new();
        assert!(p.bundle(&state).shadows.is_empty());
    }

    #[test]
    fn test_masked_mse_f64_inputs() {
        let pred = Tensor::ones((1, 2, 2), DType::F64, &Device::Cpu).unwrap();
        let target = Tensor::zeros((1, 2, 2), DType::F64, &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1.0f64, 0.0]], &Device::Cpu).unwrap();
        let loss = masked_mse(&pred, &target, &mask).unwrap();
        assert_eq!(loss.to_scalar::<f64>().unwrap(), 1.0);
    }

    #[test]
    fn test_bundle_sections() {
        let dir = TempDir::new().unwrap();
        let path = vae_artifact(&dir, Some(0.0));
        let mut p = pipeline(Coupling::LatentMatching, true, EmaPolicy::DownstreamOnly);
        p.load_upstream(&path).unwrap();

        let state = TrainerState::new();
        let bundle = p.bundle(&state);
        let stages: Vec<StageId> = bundle.primary.iter().map(|(s, _)| *s).collect();
        let shadows: Vec<ShadowKey> = bundle.shadows.iter().map(|(k, _)| *k).collect();
        assert_eq!(stages, vec![StageId::Vae, StageId::Dm]);
        assert_eq!(shadows, vec![ShadowKey::Upstream, ShadowKey::Downstream]);
    }
}
