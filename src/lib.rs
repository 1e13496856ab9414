//! # traj-ldm
//!
//! Two-stage latent diffusion training for trajectory prediction.
//!
//! Stage 1 trains a conditional LSTM VAE that compresses trajectories into
//! latent codes. Stage 2 freezes it and trains a diffusion model over those
//! codes. Both stages keep exponential-moving-average shadow weights, and
//! checkpoints carry live and shadow state of every stage so that one stage
//! can be loaded into the next.
//!
//! ## Features
//!
//! - **YAML Configuration** - Define entire training runs in simple config files
//! - **EMA Shadow Weights** - Decayed running averages with warm-up and cadence
//! - **Cross-Stage Checkpoints** - Prefix-filtered partial loads with key reports
//! - **Atomic Artifacts** - Single safetensors file, written temp-then-rename
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write and check a configuration
//! trajldm init vae.yaml --preset nusc-vae
//! trajldm validate vae.yaml
//!
//! # Stage 1, then stage 2 on top of its final checkpoint
//! trajldm train vae.yaml
//! trajldm train dm.yaml
//!
//! # Look inside an artifact
//! trajldm inspect ./outputs/nusc-vae/checkpoints/checkpoint_step_00010000.safetensors
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use traj_ldm::TrajConfig;
//!
//! # fn main() -> traj_ldm::Result<()> {
//! let config = TrajConfig::from_file("config.yaml")?;
//! let state = traj_ldm::train(config, None)?;
//! println!("finished at step {}", state.global_step);
//! # Ok(())
//! # }
//! ```
//!
//! ## Shadow Weights
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use traj_ldm::{EmaTracker, ParameterStore};
//!
//! # fn main() -> traj_ldm::Result<()> {
//! let device = Device::Cpu;
//! let mut live = ParameterStore::new(&device);
//! live.insert("w", &Tensor::new(&[1.0f32], &device)?, true)?;
//! let mut shadow = live.clone_detached()?;
//! shadow.assign("w", &Tensor::new(&[0.0f32], &device)?)?;
//!
//! let tracker = EmaTracker::new(0.99, 1, 0)?;
//! tracker.update(&mut shadow, &live, 1)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod ema;
pub mod error;
pub mod models;
pub mod optimizer;
pub mod params;
pub mod pipeline;
pub mod scheduler;
pub mod state;
pub mod trainer;

pub use checkpoint::{CheckpointCodec, CheckpointManager, KeyMismatch};
pub use config::{TrainingConfig, TrajConfig};
pub use ema::EmaTracker;
pub use error::{Result, TrajError};
pub use params::{ParameterStore, StageId};
pub use pipeline::{Phase, StagePipeline, WeightView};
pub use state::{TrainerPhase, TrainerState};
pub use trainer::{train, Trainer, TrainingTask, VaeStage};
