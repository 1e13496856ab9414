//! End-to-end runs: stage 1 (VAE) feeding stage 2 (latent diffusion).

use std::path::{Path, PathBuf};

use candle_core::Device;
use tempfile::TempDir;

use traj_ldm::checkpoint::{AfterLoad, ShadowKey};
use traj_ldm::config::{Coupling, EmaPolicy, TrainMode};
use traj_ldm::dataset::{BatchSource, SyntheticTrajectories};
use traj_ldm::models::{LatentDenoiser, LstmVae};
use traj_ldm::pipeline::{DownstreamModel, PipelineOptions};
use traj_ldm::{CheckpointCodec, StageId, StagePipeline, Trainer, TrainerPhase, TrajConfig};

type DmTrainer = Trainer<StagePipeline<LstmVae, LatentDenoiser>, SyntheticTrajectories>;

fn vae_config(root: &Path) -> TrajConfig {
    let mut config = TrajConfig::smoke_preset();
    config.output_dir = root.join("vae").to_string_lossy().into_owned();
    config
}

fn dm_config(root: &Path, vae_ckpt: &Path) -> TrajConfig {
    let mut config = TrajConfig::smoke_preset();
    config.name = "smoke-dm".into();
    config.mode = TrainMode::Dm;
    config.vae_checkpoint = Some(vae_ckpt.to_string_lossy().into_owned());
    config.output_dir = root.join("dm").to_string_lossy().into_owned();
    config
}

fn train_vae(root: &Path) -> PathBuf {
    let config = vae_config(root);
    let checkpoint = config.checkpoint_dir().join("checkpoint_step_00000006.safetensors");
    let state = traj_ldm::train(config, None).unwrap();
    assert_eq!(state.global_step, 6);
    assert!(checkpoint.exists());
    checkpoint
}

fn dm_trainer(config: TrajConfig) -> DmTrainer {
    let device = Device::Cpu;
    let source = SyntheticTrajectories::new(&config.data, &config.vae, config.seed, &device);
    let vae = LstmVae::new(config.vae.clone(), config.data.position_scale);
    let dm = LatentDenoiser::new(config.dm.clone(), config.vae.latent_size).unwrap();
    let options = PipelineOptions {
        coupling: config.coupling,
        use_ema: config.ema.use_ema,
        policy: config.ema.policy,
    };
    let pipeline = StagePipeline::new(vae, dm, options, &device).unwrap();
    Trainer::new(config, pipeline, source, device).unwrap()
}

fn flat(t: &candle_core::Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

#[test]
fn test_vae_artifact_is_consumable_by_stage_two() {
    let root = TempDir::new().unwrap();
    let vae_ckpt = train_vae(root.path());

    let summary = CheckpointCodec::inspect(&vae_ckpt).unwrap();
    assert!(summary.sections.contains_key("state_dict.vae"));
    assert!(summary.has_shadow(ShadowKey::Upstream));
    assert!(!summary.has_shadow(ShadowKey::Downstream));
    assert!(summary.has_scheduler);

    let mut trainer = dm_trainer(dm_config(root.path(), &vae_ckpt));
    trainer.restore(None).unwrap();

    let pipeline = trainer.task();
    assert!(pipeline.upstream_live().is_frozen());

    // The upstream shadow is exactly the recorded ema_state.
    let mut recorded = pipeline.upstream_live().clone_detached().unwrap();
    CheckpointCodec::load_shadow(&vae_ckpt, &mut recorded, ShadowKey::Upstream)
        .unwrap()
        .unwrap();
    let shadow = pipeline.upstream_shadow().unwrap();
    for name in recorded.names() {
        assert_eq!(flat(shadow.value(name).unwrap()), flat(recorded.value(name).unwrap()));
    }
}

#[test]
fn test_dm_run_keeps_upstream_fixed_and_writes_both_shadows() {
    let root = TempDir::new().unwrap();
    let vae_ckpt = train_vae(root.path());

    for coupling in [Coupling::LatentMatching, Coupling::TrajectoryMatching] {
        let mut config = dm_config(root.path(), &vae_ckpt);
        config.coupling = coupling;
        let mut trainer = dm_trainer(config);
        trainer.restore(None).unwrap();

        let before: Vec<Vec<f32>> = {
            let live = trainer.task().upstream_live();
            live.names().map(|n| flat(live.value(n).unwrap())).collect()
        };
        trainer.train().unwrap();
        assert_eq!(trainer.state().phase, TrainerPhase::Terminated);
        assert_eq!(trainer.state().ema_updates, 6);

        let live = trainer.task().upstream_live();
        let after: Vec<Vec<f32>> = live.names().map(|n| flat(live.value(n).unwrap())).collect();
        assert_eq!(before, after, "upstream changed under {coupling:?}");

        let latest = trainer.checkpoints().latest_checkpoint_path().unwrap();
        let summary = CheckpointCodec::inspect(latest).unwrap();
        assert_eq!(summary.trainer_state.global_step, 6);
        assert!(summary.sections.contains_key("state_dict.vae"));
        assert!(summary.sections.contains_key("state_dict.dm"));
        assert!(summary.has_shadow(ShadowKey::Upstream));
        assert!(summary.has_shadow(ShadowKey::Downstream));
        assert!(summary.sections.contains_key("optimizer_states.exp_avg"));
    }
}

#[test]
fn test_downstream_only_policy_never_moves_upstream_shadow() {
    let root = TempDir::new().unwrap();
    let vae_ckpt = train_vae(root.path());

    let mut config = dm_config(root.path(), &vae_ckpt);
    config.ema.policy = EmaPolicy::DownstreamOnly;
    let mut trainer = dm_trainer(config);
    trainer.restore(None).unwrap();

    let before: Vec<Vec<f32>> = {
        let shadow = trainer.task().upstream_shadow().unwrap();
        shadow.names().map(|n| flat(shadow.value(n).unwrap())).collect()
    };
    trainer.train().unwrap();
    let shadow = trainer.task().upstream_shadow().unwrap();
    let after: Vec<Vec<f32>> = shadow.names().map(|n| flat(shadow.value(n).unwrap())).collect();
    assert_eq!(before, after);
}

#[test]
fn test_resume_restores_counters_and_weights() {
    let root = TempDir::new().unwrap();
    let vae_ckpt = train_vae(root.path());

    let mut config = dm_config(root.path(), &vae_ckpt);
    config.training.num_steps = 4;
    let mut first = dm_trainer(config);
    first.restore(None).unwrap();
    first.train().unwrap();
    let resume_from = first.checkpoints().path_for(4);
    assert!(resume_from.exists());

    let mut config = dm_config(root.path(), &vae_ckpt);
    config.training.num_steps = 6;
    let mut resumed = dm_trainer(config);
    resumed.restore(Some(&resume_from)).unwrap();

    assert_eq!(resumed.state().global_step, 4);
    assert_eq!(resumed.state().optimizer_step, 4);
    assert_eq!(resumed.state().scheduler_step, 4);
    assert_eq!(resumed.state().phase, TrainerPhase::Training);
    assert_eq!(resumed.optimizer().step_count(), 4);
    assert!(!resumed.optimizer().state().is_empty());

    let dm = LatentDenoiser::new(TrajConfig::smoke_preset().dm, 4).unwrap();
    let mut expected = dm.init_weights(&Device::Cpu).unwrap();
    CheckpointCodec::load_primary(&resume_from, &mut expected, StageId::Dm, AfterLoad::KeepTrainable).unwrap();
    let live = resumed.task().downstream_live();
    for name in expected.names() {
        assert_eq!(flat(live.value(name).unwrap()), flat(expected.value(name).unwrap()));
    }

    resumed.train().unwrap();
    assert_eq!(resumed.state().global_step, 6);
    assert_eq!(resumed.state().optimizer_step, 6);
}

#[test]
fn test_generate_after_training() {
    let root = TempDir::new().unwrap();
    let vae_ckpt = train_vae(root.path());
    let config = dm_config(root.path(), &vae_ckpt);
    let data = config.data.clone();
    let vae_settings = config.vae.clone();

    let mut trainer = dm_trainer(config);
    trainer.restore(None).unwrap();
    trainer.train().unwrap();

    let mut source = SyntheticTrajectories::new(&data, &vae_settings, 1, &Device::Cpu);
    let batch = source.val_batch(0).unwrap();
    let traj = trainer.task().generate(&batch).unwrap();
    assert_eq!(traj.dims(), &[data.batch_size, data.history_steps, vae_settings.output_size]);
}
