//! CLI entry point for traj-ldm.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use traj_ldm::config::TrainMode;
use traj_ldm::{CheckpointCodec, CheckpointManager, Result, TrajConfig, TrajError};

const LATEST: &str = "latest";

#[derive(Parser)]
#[command(name = "trajldm")]
#[command(about = "Two-stage latent diffusion training for trajectory prediction")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: String,
        /// Resume from a checkpoint; without a path, the latest one in the
        /// run's checkpoint directory
        #[arg(long, num_args = 0..=1, default_missing_value = LATEST)]
        resume: Option<String>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (nusc-vae, nusc-dm, smoke)
        #[arg(long, default_value = "nusc-vae")]
        preset: String,
    },
    /// Summarize a checkpoint artifact
    Inspect {
        /// Path to a .safetensors checkpoint
        path: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = TrajConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Run: {}", config.name);
            println!("  Mode: {:?}", config.mode);
            if config.mode == TrainMode::Dm {
                println!("  Coupling: {:?}", config.coupling);
                println!("  EMA policy: {:?}", config.ema.policy);
                if let Some(vae) = &config.vae_checkpoint {
                    println!("  VAE checkpoint: {vae}");
                }
            }
            println!("  Steps: {}", config.training.num_steps);
            println!("  EMA: {}", if config.ema.use_ema { "on" } else { "off" });
        }
        Commands::Train { config, resume } => {
            tracing::info!("Starting training with config: {}", config);
            let config = TrajConfig::from_file(&config)?;
            config.validate()?;

            let resume = match resume.as_deref() {
                None => None,
                Some(LATEST) => Some(latest_checkpoint(&config)?),
                Some(path) => Some(PathBuf::from(path)),
            };
            let state = traj_ldm::train(config, resume.as_deref())?;
            println!(
                "✓ Training finished at step {} (epoch {})",
                state.global_step, state.epoch
            );
            if let Some(best) = state.best_val_loss {
                println!("  Best validation loss: {best:.4}");
            }
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = TrajConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
        Commands::Inspect { path } => {
            let summary = CheckpointCodec::inspect(&path)?;
            println!("{summary}");
        }
    }

    Ok(())
}

fn latest_checkpoint(config: &TrajConfig) -> Result<PathBuf> {
    let manager = CheckpointManager::new(config.checkpoint_dir(), 0, 0)?;
    manager
        .latest_checkpoint_path()
        .map(PathBuf::from)
        .ok_or_else(|| {
            TrajError::Checkpoint(format!(
                "no checkpoint found in {}",
                config.checkpoint_dir().display()
            ))
        })
}
