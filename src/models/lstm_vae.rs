//! Conditional LSTM variational autoencoder over trajectories.
//!
//! Parameter names follow the PyTorch module layout so that artifacts line up
//! with `state_dict` naming:
//!
//! ```text
//! lstm_enc.lstm.{weight_ih,weight_hh,bias_ih,bias_hh}_l{k}
//! lstm_enc.cond2hidden.{weight,bias}
//! lstm_dec.lstm.{weight_ih,weight_hh,bias_ih,bias_hh}_l{k}
//! lstm_dec.fc.{weight,bias}
//! mu.{weight,bias}   var.{weight,bias}   fc3.{weight,bias}
//! ```
//!
//! The encoder's initial hidden state is a projection of the scene context.
//! The decoder receives the latent code at every step and starts from
//! `fc3(z)`.

use candle_core::{DType, Device, Tensor};
use candle_nn::rnn::LSTMState;
use candle_nn::{linear, lstm, LSTMConfig, Linear, Module, VarBuilder, VarMap, LSTM, RNN};

use crate::config::VaeSettings;
use crate::dataset::TrajectoryBatch;
use crate::error::{Result, TrajError};
use crate::params::ParameterStore;
use crate::pipeline::{AuxInfo, LatentParams, Prepared, UpstreamModel};

/// Stage-1 loss terms.
#[derive(Debug, Clone)]
pub struct VaeLoss {
    /// `recon + kl_beta * kld`, attached to the graph.
    pub total: Tensor,
    /// Reconstruction MSE.
    pub recon: f32,
    /// KL divergence to the unit Gaussian, averaged over the batch.
    pub kld: f32,
}

struct Layers {
    enc_lstm: Vec<LSTM>,
    cond2hidden: Linear,
    dec_lstm: Vec<LSTM>,
    fc: Linear,
    mu: Linear,
    var: Linear,
    fc3: Linear,
}

/// Conditional LSTM VAE.
#[derive(Debug, Clone)]
pub struct LstmVae {
    settings: VaeSettings,
    position_scale: f64,
}

impl LstmVae {
    /// Model with the given dimensions; positions are divided by
    /// `position_scale` before encoding.
    #[must_use]
    pub fn new(settings: VaeSettings, position_scale: f64) -> Self {
        Self {
            settings,
            position_scale,
        }
    }

    /// Dimensions.
    #[must_use]
    pub fn settings(&self) -> &VaeSettings {
        &self.settings
    }

    fn layers(&self, vb: &VarBuilder) -> Result<Layers> {
        let s = &self.settings;
        let enc = vb.pp("lstm_enc");
        let dec = vb.pp("lstm_dec");
        Ok(Layers {
            enc_lstm: stacked_lstm(&enc.pp("lstm"), s.input_size, s.hidden_size, s.num_layers)?,
            cond2hidden: linear(s.cond_dim, s.hidden_size, enc.pp("cond2hidden"))?,
            dec_lstm: stacked_lstm(&dec.pp("lstm"), s.latent_size, s.hidden_size, s.num_layers)?,
            fc: linear(s.hidden_size, s.output_size, dec.pp("fc"))?,
            mu: linear(s.hidden_size, s.latent_size, vb.pp("mu"))?,
            var: linear(s.hidden_size, s.latent_size, vb.pp("var"))?,
            fc3: linear(s.latent_size, s.hidden_size, vb.pp("fc3"))?,
        })
    }

    fn dropout(&self, train: bool) -> Option<f32> {
        (train && self.settings.dropout > 0.0).then_some(self.settings.dropout as f32)
    }

    fn encode_with(&self, layers: &Layers, scaled: &Tensor, context: &Tensor, train: bool) -> Result<LatentParams> {
        let h0 = layers.cond2hidden.forward(context)?;
        let (_, h_last) = run_stacked(&layers.enc_lstm, scaled, &h0, self.dropout(train))?;
        Ok(LatentParams {
            mu: layers.mu.forward(&h_last)?,
            logvar: layers.var.forward(&h_last)?,
        })
    }

    fn decode_with(&self, layers: &Layers, z: &Tensor, steps: usize, train: bool) -> Result<Tensor> {
        let (b, l) = z.dims2()?;
        let mut h0 = layers.fc3.forward(z)?;
        if let Some(p) = self.dropout(train) {
            h0 = candle_nn::ops::dropout(&h0, p)?;
        }
        let z_seq = z.unsqueeze(1)?.broadcast_as((b, steps, l))?.contiguous()?;
        let (out, _) = run_stacked(&layers.dec_lstm, &z_seq, &h0, self.dropout(train))?;
        Ok(layers.fc.forward(&out)?)
    }

    /// Full stage-1 pass: encode, sample, decode, and the β-weighted loss.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn training_loss(
        &self,
        weights: &ParameterStore,
        batch: &TrajectoryBatch,
        kl_beta: f64,
        train: bool,
    ) -> Result<VaeLoss> {
        let prepared = self.prepare(batch)?;
        let layers = self.layers(&weights.var_builder())?;
        let params = self.encode_with(&layers, &prepared.scaled, &prepared.aux.cond_feat, train)?;
        let z = self.sample(&params)?;
        let recon = self.decode_with(&layers, &z, prepared.aux.history_steps()?, train)?;
        vae_loss(&recon, &prepared.scaled, &params, kl_beta)
    }
}

/// Reconstruction MSE plus `kl_beta` times the KL divergence.
///
/// # Errors
///
/// Returns an error if a tensor operation fails.
pub fn vae_loss(recon: &Tensor, target: &Tensor, params: &LatentParams, kl_beta: f64) -> Result<VaeLoss> {
    let recon_loss = (recon - target)?.sqr()?.mean_all()?;
    let kld_terms = ((params.logvar.affine(1.0, 1.0)? - params.mu.sqr()?)? - params.logvar.exp()?)?;
    let kld = kld_terms.sum(1)?.affine(-0.5, 0.0)?.mean_all()?;
    let total = (&recon_loss + kld.affine(kl_beta, 0.0)?)?;
    Ok(VaeLoss {
        recon: recon_loss.to_scalar::<f32>()?,
        kld: kld.to_scalar::<f32>()?,
        total,
    })
}

impl UpstreamModel for LstmVae {
    fn init_weights(&self, device: &Device) -> Result<ParameterStore> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        self.layers(&vb)?;
        ParameterStore::from_varmap(&varmap, device)
    }

    fn latent_size(&self) -> usize {
        self.settings.latent_size
    }

    fn prepare(&self, batch: &TrajectoryBatch) -> Result<Prepared> {
        batch.validate()?;
        let unscaled = batch.target_positions.detach();
        let scaled = unscaled.affine(1.0 / self.position_scale, 0.0)?;
        Ok(Prepared {
            aux: AuxInfo {
                cond_feat: batch.context.detach(),
                availabilities: batch.target_availabilities.detach(),
            },
            unscaled,
            scaled,
        })
    }

    fn encode(&self, weights: &ParameterStore, scaled: &Tensor, aux: &AuxInfo) -> Result<LatentParams> {
        let layers = self.layers(&weights.var_builder())?;
        self.encode_with(&layers, scaled, &aux.cond_feat, false)
    }

    fn sample(&self, params: &LatentParams) -> Result<Tensor> {
        let std = params.logvar.affine(0.5, 0.0)?.exp()?;
        let noise = std.randn_like(0.0, 1.0)?;
        Ok((&params.mu + (noise * std)?)?)
    }

    fn decode(&self, weights: &ParameterStore, latent: &Tensor, aux: &AuxInfo) -> Result<Tensor> {
        let layers = self.layers(&weights.var_builder())?;
        self.decode_with(&layers, latent, aux.history_steps()?, false)
    }

    fn unscale(&self, scaled: &Tensor) -> Result<Tensor> {
        Ok(scaled.affine(self.position_scale, 0.0)?)
    }
}

fn stacked_lstm(vb: &VarBuilder, input: usize, hidden: usize, num_layers: usize) -> Result<Vec<LSTM>> {
    (0..num_layers)
        .map(|layer_idx| {
            let in_dim = if layer_idx == 0 { input } else { hidden };
            let config = LSTMConfig {
                layer_idx,
                ..Default::default()
            };
            Ok(lstm(in_dim, hidden, config, vb.clone())?)
        })
        .collect()
}

/// Run a stack of LSTMs; every layer starts from `(h0, 0)`.
///
/// Returns the top layer's output sequence `(B, T, H)` and its final hidden
/// state `(B, H)`.
fn run_stacked(layers: &[LSTM], input: &Tensor, h0: &Tensor, dropout: Option<f32>) -> Result<(Tensor, Tensor)> {
    let c0 = h0.zeros_like()?;
    let mut seq = input.clone();
    let mut last_h = h0.clone();
    for (i, layer) in layers.iter().enumerate() {
        let states = layer.seq_init(&seq, &LSTMState::new(h0.clone(), c0.clone()))?;
        last_h = states
            .last()
            .map(|s| s.h().clone())
            .ok_or_else(|| TrajError::Data("empty trajectory sequence".into()))?;
        seq = layer.states_to_tensor(&states)?;
        if let (Some(p), true) = (dropout, i + 1 < layers.len()) {
            seq = candle_nn::ops::dropout(&seq, p)?;
        }
    }
    Ok((seq, last_h))
}
