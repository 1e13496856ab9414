//! Reference models for both stages.
//!
//! - [`LstmVae`]: the upstream trajectory autoencoder
//! - [`LatentDenoiser`]: the downstream latent diffusion model

mod denoiser;
mod lstm_vae;

pub use denoiser::LatentDenoiser;
pub use lstm_vae::{vae_loss, LstmVae, VaeLoss};
