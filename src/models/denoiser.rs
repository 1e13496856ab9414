//! Residual-MLP epsilon-prediction diffusion model over latent codes.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};

use crate::config::DmSettings;
use crate::error::{Result, TrajError};
use crate::params::ParameterStore;
use crate::pipeline::{AuxInfo, DownstreamModel};

struct Block {
    fc1: Linear,
    fc2: Linear,
}

struct Layers {
    cond_proj: Linear,
    time_proj: Linear,
    in_proj: Linear,
    blocks: Vec<Block>,
    out_proj: Linear,
}

/// Linear beta schedule and its cumulative products, kept on the host.
#[derive(Debug, Clone)]
struct NoiseSchedule {
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    fn linear(steps: usize, beta_start: f64, beta_end: f64) -> Self {
        let betas: Vec<f64> = (0..steps)
            .map(|i| {
                if steps == 1 {
                    beta_start
                } else {
                    beta_start + (beta_end - beta_start) * i as f64 / (steps - 1) as f64
                }
            })
            .collect();
        let alphas_cumprod = betas
            .iter()
            .scan(1.0, |acc, beta| {
                *acc *= 1.0 - beta;
                Some(*acc)
            })
            .collect();
        Self {
            betas,
            alphas_cumprod,
        }
    }

    fn len(&self) -> usize {
        self.betas.len()
    }

    /// `(sqrt(ᾱ_t), sqrt(1 - ᾱ_t))` gathered per sample, each `(B, 1)`.
    fn coefficients(&self, t: &Tensor, device: &Device) -> Result<(Tensor, Tensor)> {
        let sqrt_ab: Vec<f32> = self.alphas_cumprod.iter().map(|a| a.sqrt() as f32).collect();
        let sqrt_1m: Vec<f32> = self
            .alphas_cumprod
            .iter()
            .map(|a| (1.0 - a).sqrt() as f32)
            .collect();
        let gather = |table: Vec<f32>| -> Result<Tensor> {
            let table = Tensor::from_vec(table, self.len(), device)?;
            Ok(table.index_select(t, 0)?.unsqueeze(1)?)
        };
        Ok((gather(sqrt_ab)?, gather(sqrt_1m)?))
    }
}

/// Latent diffusion model conditioned on scene context.
///
/// Parameters: `cond_proj`, `time_proj`, `in_proj`, `blocks.{i}.fc1`,
/// `blocks.{i}.fc2`, `out_proj`.
#[derive(Debug, Clone)]
pub struct LatentDenoiser {
    settings: DmSettings,
    latent_size: usize,
    schedule: NoiseSchedule,
}

impl LatentDenoiser {
    /// Denoiser for latents of width `latent_size`.
    ///
    /// # Errors
    ///
    /// Returns [`TrajError::Config`] when the schedule has no steps.
    pub fn new(settings: DmSettings, latent_size: usize) -> Result<Self> {
        if settings.diffusion_steps == 0 {
            return Err(TrajError::Config("dm.diffusion_steps must be > 0".into()));
        }
        let schedule = NoiseSchedule::linear(settings.diffusion_steps, settings.beta_start, settings.beta_end);
        Ok(Self {
            settings,
            latent_size,
            schedule,
        })
    }

    /// Number of diffusion steps.
    #[must_use]
    pub fn diffusion_steps(&self) -> usize {
        self.schedule.len()
    }

    fn layers(&self, vb: &VarBuilder) -> Result<Layers> {
        let s = &self.settings;
        let blocks = (0..s.mlp_blocks)
            .map(|i| {
                let vb = vb.pp("blocks").pp(i.to_string());
                Ok(Block {
                    fc1: linear(s.mlpres_hidden, s.mlpres_hidden, vb.pp("fc1"))?,
                    fc2: linear(s.mlpres_hidden, s.mlpres_hidden, vb.pp("fc2"))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Layers {
            cond_proj: linear(s.cond_feat_dim, s.mlpres_hidden, vb.pp("cond_proj"))?,
            time_proj: linear(s.time_dim, s.mlpres_hidden, vb.pp("time_proj"))?,
            in_proj: linear(self.latent_size, s.mlpres_hidden, vb.pp("in_proj"))?,
            blocks,
            out_proj: linear(s.mlpres_hidden, self.latent_size, vb.pp("out_proj"))?,
        })
    }

    /// Sinusoidal embedding of integer timesteps, `(B,) -> (B, time_dim)`.
    fn time_embedding(&self, t: &Tensor) -> Result<Tensor> {
        let dim = self.settings.time_dim;
        let half = dim / 2;
        let device = t.device();
        let t = t.to_dtype(DType::F32)?.unsqueeze(1)?;
        let b = t.dim(0)?;
        if half == 0 {
            return Ok(Tensor::zeros((b, dim), DType::F32, device)?);
        }
        let freqs: Vec<f32> = (0..half)
            .map(|i| (-(10_000f64.ln()) * i as f64 / half as f64).exp() as f32)
            .collect();
        let freqs = Tensor::from_vec(freqs, (1, half), device)?;
        let args = t.broadcast_mul(&freqs)?;
        let mut parts = vec![args.sin()?, args.cos()?];
        if dim % 2 == 1 {
            parts.push(Tensor::zeros((b, 1), DType::F32, device)?);
        }
        Ok(Tensor::cat(&parts, D::Minus1)?)
    }

    /// Predicted noise for `x_t` at timesteps `t` (`u32`, shape `(B,)`).
    fn predict_noise(&self, layers: &Layers, x_t: &Tensor, t: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let temb = self.time_embedding(t)?;
        let mut h = ((layers.in_proj.forward(x_t)? + layers.time_proj.forward(&temb)?)?
            + layers.cond_proj.forward(cond)?)?;
        for block in &layers.blocks {
            let inner = block.fc2.forward(&block.fc1.forward(&h.silu()?)?.silu()?)?;
            h = (h + inner)?;
        }
        Ok(layers.out_proj.forward(&h.silu()?)?)
    }

    fn random_timesteps(&self, batch: usize, device: &Device) -> Result<Tensor> {
        let steps = self.schedule.len() as f32;
        let t = Tensor::rand(0f32, steps, batch, device)?
            .floor()?
            .clamp(0f32, steps - 1.0)?
            .to_dtype(DType::U32)?;
        Ok(t)
    }

    /// Forward-noise `z` at random timesteps: `(x_t, noise, t, sqrt_ab, sqrt_1m)`.
    fn noised(&self, z: &Tensor) -> Result<(Tensor, Tensor, Tensor, Tensor, Tensor)> {
        let (b, _) = z.dims2()?;
        let t = self.random_timesteps(b, z.device())?;
        let (sqrt_ab, sqrt_1m) = self.schedule.coefficients(&t, z.device())?;
        let noise = z.randn_like(0.0, 1.0)?;
        let x_t = (z.broadcast_mul(&sqrt_ab)? + noise.broadcast_mul(&sqrt_1m)?)?;
        Ok((x_t, noise, t, sqrt_ab, sqrt_1m))
    }
}

impl DownstreamModel for LatentDenoiser {
    fn init_weights(&self, device: &Device) -> Result<ParameterStore> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        self.layers(&vb)?;
        ParameterStore::from_varmap(&varmap, device)
    }

    fn compute_loss(&self, weights: &ParameterStore, z: &Tensor, aux: &AuxInfo) -> Result<Tensor> {
        let layers = self.layers(&weights.var_builder())?;
        let (x_t, noise, t, _, _) = self.noised(z)?;
        let eps = self.predict_noise(&layers, &x_t, &t, &aux.cond_feat)?;
        Ok((eps - noise)?.sqr()?.mean_all()?)
    }

    fn denoise(&self, weights: &ParameterStore, z: &Tensor, aux: &AuxInfo) -> Result<Tensor> {
        let layers = self.layers(&weights.var_builder())?;
        let (x_t, _, t, sqrt_ab, sqrt_1m) = self.noised(z)?;
        let eps = self.predict_noise(&layers, &x_t, &t, &aux.cond_feat)?;
        let x0 = (x_t - eps.broadcast_mul(&sqrt_1m)?)?.broadcast_div(&sqrt_ab)?;
        Ok(x0)
    }

    fn sample(&self, weights: &ParameterStore, aux: &AuxInfo) -> Result<Tensor> {
        let layers = self.layers(&weights.var_builder())?;
        let device = aux.cond_feat.device();
        let b = aux.cond_feat.dim(0)?;
        let mut x = Tensor::randn(0f32, 1f32, (b, self.latent_size), device)?;

        for step in (0..self.schedule.len()).rev() {
            let beta = self.schedule.betas[step];
            let alpha = 1.0 - beta;
            let ab = self.schedule.alphas_cumprod[step];
            let t = Tensor::full(step as u32, b, device)?;
            let eps = self.predict_noise(&layers, &x, &t, &aux.cond_feat)?;
            let mean = (x - eps.affine(beta / (1.0 - ab).sqrt(), 0.0)?)?.affine(1.0 / alpha.sqrt(), 0.0)?;
            let next = if step > 0 {
                (&mean + mean.randn_like(0.0, 1.0)?.affine(beta.sqrt(), 0.0)?)?
            } else {
                mean
            };
            x = next.detach();
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DmSettings {
        DmSettings {
            cond_feat_dim: 6,
            time_dim: 5,
            mlpres_hidden: 16,
            mlp_blocks: 2,
            diffusion_steps: 10,
            beta_start: 1e-4,
            beta_end: 2e-2,
        }
    }

    fn aux(b: usize) -> AuxInfo {
        AuxInfo {
            cond_feat: Tensor::ones((b, 6), DType::F32, &Device::Cpu).unwrap(),
            availabilities: Tensor::ones((b, 4), DType::F32, &Device::Cpu).unwrap(),
        }
    }

    #[test]
    fn test_schedule_is_monotone() {
        let schedule = NoiseSchedule::linear(10, 1e-4, 2e-2);
        assert!((schedule.betas[0] - 1e-4).abs() < 1e-12);
        assert!((schedule.betas[9] - 2e-2).abs() < 1e-12);
        assert!(schedule.alphas_cumprod.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_parameter_names() {
        let dm = LatentDenoiser::new(settings(), 4).unwrap();
        let store = dm.init_weights(&Device::Cpu).unwrap();
        for name in [
            "cond_proj.weight",
            "time_proj.weight",
            "in_proj.bias",
            "blocks.0.fc1.weight",
            "blocks.1.fc2.bias",
            "out_proj.weight",
        ] {
            assert!(store.contains(name), "missing {name}");
        }
        assert_eq!(store.shape("out_proj.weight"), Some(&[4, 16][..]));
    }

    #[test]
    fn test_odd_time_dim_embedding() {
        let dm = LatentDenoiser::new(settings(), 4).unwrap();
        let t = Tensor::new(&[0u32, 3, 9], &Device::Cpu).unwrap();
        let emb = dm.time_embedding(&t).unwrap();
        assert_eq!(emb.dims(), &[3, 5]);
    }

    #[test]
    fn test_loss_denoise_and_sample_shapes() {
        let dm = LatentDenoiser::new(settings(), 4).unwrap();
        let store = dm.init_weights(&Device::Cpu).unwrap();
        let z = Tensor::randn(0f32, 1f32, (3, 4), &Device::Cpu).unwrap();

        let loss = dm.compute_loss(&store, &z, &aux(3)).unwrap();
        assert!(loss.dims().is_empty());
        assert!(loss.to_scalar::<f32>().unwrap().is_finite());

        let x0 = dm.denoise(&store, &z, &aux(3)).unwrap();
        assert_eq!(x0.dims(), &[3, 4]);

        let sampled = dm.sample(&store, &aux(3)).unwrap();
        assert_eq!(sampled.dims(), &[3, 4]);
    }

    #[test]
    fn test_zero_steps_rejected() {
        let mut s = settings();
        s.diffusion_steps = 0;
        assert!(matches!(LatentDenoiser::new(s, 4), Err(TrajError::Config(_))));
    }
}
