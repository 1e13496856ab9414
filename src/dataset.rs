//! Batch contract and a synthetic trajectory source.
//!
//! Real dataset ingestion lives outside this crate; anything that can produce
//! [`TrajectoryBatch`]es plugs in through [`BatchSource`].

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{DataSettings, VaeSettings};
use crate::error::{Result, TrajError};

/// One batch of agent trajectories.
#[derive(Debug, Clone)]
pub struct TrajectoryBatch {
    /// Positions, shape `(B, T, F)`, in scene units.
    pub target_positions: Tensor,
    /// Availability mask, shape `(B, T)`, 1.0 where the step was observed.
    pub target_availabilities: Tensor,
    /// Scene context, shape `(B, C)`.
    pub context: Tensor,
}

impl TrajectoryBatch {
    /// Check that the three tensors agree on batch and time dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`TrajError::Data`] describing the first inconsistency.
    pub fn validate(&self) -> Result<()> {
        let (b, t, _) = self
            .target_positions
            .dims3()
            .map_err(|_| TrajError::Data(format!(
                "target_positions must be (B, T, F), got {:?}",
                self.target_positions.dims()
            )))?;
        let avail = self.target_availabilities.dims();
        if avail != [b, t] {
            return Err(TrajError::Data(format!(
                "target_availabilities must be ({b}, {t}), got {avail:?}"
            )));
        }
        let ctx = self.context.dims();
        if ctx.len() != 2 || ctx[0] != b {
            return Err(TrajError::Data(format!(
                "context must be ({b}, C), got {ctx:?}"
            )));
        }
        Ok(())
    }

    /// Number of trajectories.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.target_positions.dims().first().copied().unwrap_or(0)
    }

    /// Number of time steps.
    #[must_use]
    pub fn history_steps(&self) -> usize {
        self.target_positions.dims().get(1).copied().unwrap_or(0)
    }
}

/// Produces training and validation batches by index.
pub trait BatchSource {
    /// Training batches per epoch.
    fn num_train_batches(&self) -> usize;

    /// Validation batches available.
    fn num_val_batches(&self) -> usize;

    /// Training batch `index` (`< num_train_batches`).
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be produced.
    fn train_batch(&mut self, index: usize) -> Result<TrajectoryBatch>;

    /// Validation batch `index` (`< num_val_batches`).
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be produced.
    fn val_batch(&mut self, index: usize) -> Result<TrajectoryBatch>;
}

/// Smooth constant-curvature trajectories with partial availability.
///
/// Every batch is generated from a seed derived from the base seed, the
/// split and the index, so the same index always yields the same batch.
/// Context vectors encode the motion parameters so that the conditioning is
/// informative.
#[derive(Debug, Clone)]
pub struct SyntheticTrajectories {
    seed: u64,
    batch_size: usize,
    history_steps: usize,
    features: usize,
    cond_dim: usize,
    train_batches: usize,
    val_batches: usize,
    device: Device,
}

const VAL_STREAM: u64 = 0x5eed_0000_0000_0001;

impl SyntheticTrajectories {
    /// Source shaped after the run configuration.
    #[must_use]
    pub fn new(data: &DataSettings, vae: &VaeSettings, seed: u64, device: &Device) -> Self {
        Self {
            seed,
            batch_size: data.batch_size,
            history_steps: data.history_steps,
            features: vae.input_size,
            cond_dim: vae.cond_dim,
            train_batches: data.train_batches,
            val_batches: data.val_batches,
            device: device.clone(),
        }
    }

    fn generate(&self, stream: u64, index: usize) -> Result<TrajectoryBatch> {
        let mut rng = StdRng::seed_from_u64(
            self.seed ^ stream ^ (index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15),
        );
        let (b, t, f, c) = (self.batch_size, self.history_steps, self.features, self.cond_dim);

        let mut positions = Vec::with_capacity(b * t * f);
        let mut avail = Vec::with_capacity(b * t);
        let mut context = Vec::with_capacity(b * c);

        for _ in 0..b {
            let speed: f32 = rng.gen_range(0.5..3.0);
            let mut heading: f32 = rng.gen_range(-std::f32::consts::PI..std::f32::consts::PI);
            let curvature: f32 = rng.gen_range(-0.1..0.1);
            let (mut x, mut y) = (0.0f32, 0.0f32);

            for _ in 0..t {
                x += speed * heading.cos();
                y += speed * heading.sin();
                heading += curvature;
                positions.push(x);
                if f > 1 {
                    positions.push(y);
                }
                for extra in 2..f {
                    // Remaining features repeat the motion state.
                    positions.push(if extra % 2 == 0 { speed } else { heading });
                }
            }

            // Observed prefix; the tail may be missing.
            let observed = if rng.gen_bool(0.3) { rng.gen_range(1..=t) } else { t };
            avail.extend((0..t).map(|i| if i < observed { 1.0f32 } else { 0.0 }));

            let motion = [speed / 3.0, heading.sin(), heading.cos(), curvature * 10.0];
            context.extend((0..c).map(|i| {
                motion[i % motion.len()] + rng.gen_range(-0.05f32..0.05)
            }));
        }

        let batch = TrajectoryBatch {
            target_positions: Tensor::from_vec(positions, (b, t, f), &self.device)?,
            target_availabilities: Tensor::from_vec(avail, (b, t), &self.device)?,
            context: Tensor::from_vec(context, (b, c), &self.device)?,
        };
        batch.validate()?;
        Ok(batch)
    }
}

impl BatchSource for SyntheticTrajectories {
    fn num_train_batches(&self) -> usize {
        self.train_batches
    }

    fn num_val_batches(&self) -> usize {
        self.val_batches
    }

    fn train_batch(&mut self, index: usize) -> Result<TrajectoryBatch> {
        self.generate(0, index % self.train_batches.max(1))
    }

    fn val_batch(&mut self, index: usize) -> Result<TrajectoryBatch> {
        self.generate(VAL_STREAM, index % self.val_batches.max(1))
    }
}
