//! DDPM training objective and ancestral sampler.
//!
//! ## Training
//!
//! For a clean batch `x₀`:
//! 1. Draw `t ~ U{1..T}` per image and `ε ~ N(0, I)`
//! 2. Diffuse: `x_t = √ᾱ_t·x₀ + √(1−ᾱ_t)·ε`
//! 3. Loss: `MSE(ε, UNet(x_t, t/T))`
//!
//! ## Sampling
//!
//! Start from `x_T ~ N(0, I)` and for `i = T..1`:
//!
//! ```text
//! x_{i−1} = (x_i − ε̂·(1−α_i)/√(1−ᾱ_i)) / √α_i + √β_i·z,   z ~ N(0, I) if i > 1 else 0
//! ```

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use ddpm_core::{DdpmError, SimpleRng, TrainConfig, IMAGE_CHANNELS, IMAGE_SIDE};

use crate::schedule::{ddpm_schedules, NoiseSchedule};
use crate::unet::Unet;

/// Result of a sampling run.
#[derive(Debug, Clone)]
pub struct SampleOutput {
    /// Final samples `x₀`, shape `(n, 1, 28, 28)`.
    pub images: Tensor,
    /// Intermediate states in sampling order (noisiest first), captured at
    /// the steps where [`should_capture`] holds. Empty unless requested.
    pub trajectory: Vec<Tensor>,
}

/// Whether the state after reverse step `i` is kept in the trajectory:
/// every 20th step, the first step, and the last seven.
///
/// # Example
///
/// ```
/// use ddpm_model::should_capture;
///
/// let kept: Vec<usize> = (1..=30).rev().filter(|&i| should_capture(i, 30)).collect();
/// assert_eq!(kept, vec![30, 20, 7, 6, 5, 4, 3, 2, 1]);
/// ```
pub fn should_capture(i: usize, n_t: usize) -> bool {
    i % 20 == 0 || i == n_t || i < 8
}

/// A noise-prediction UNet bound to its schedule.
///
/// # Example
///
/// ```
/// use candle_core::Device;
/// use candle_nn::VarMap;
/// use ddpm_core::SimpleRng;
/// use ddpm_model::Ddpm;
///
/// let var_map = VarMap::new();
/// let ddpm = Ddpm::new(&var_map, 8, 10, (1e-4, 0.02), &Device::Cpu).unwrap();
/// let mut rng = SimpleRng::new(0);
/// let out = ddpm.sample(2, &mut rng, true).unwrap();
/// assert_eq!(out.images.dims(), &[2, 1, 28, 28]);
/// assert_eq!(out.trajectory.len(), 8);
/// ```
pub struct Ddpm {
    unet: Unet,
    schedule: NoiseSchedule,
    device: Device,
}

impl std::fmt::Debug for Ddpm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ddpm(T={}, {:?})", self.n_t(), self.unet)
    }
}

impl Ddpm {
    /// Builds the UNet (parameters in `var_map`) and the noise schedule.
    ///
    /// # Errors
    ///
    /// Returns [`DdpmError::InvalidConfig`] for bad widths or betas and
    /// [`DdpmError::Internal`] if parameter creation fails.
    pub fn new(
        var_map: &VarMap,
        n_feat: usize,
        n_t: usize,
        betas: (f64, f64),
        device: &Device,
    ) -> Result<Self, DdpmError> {
        let schedule = ddpm_schedules(betas.0, betas.1, n_t)?;
        let unet = Unet::new_trainable(var_map, IMAGE_CHANNELS, n_feat, device)?;
        Ok(Self {
            unet,
            schedule,
            device: device.clone(),
        })
    }

    /// Builds a model from a run config.
    ///
    /// # Errors
    ///
    /// See [`Ddpm::new`].
    pub fn from_config(
        var_map: &VarMap,
        config: &TrainConfig,
        device: &Device,
    ) -> Result<Self, DdpmError> {
        Self::new(var_map, config.n_feat, config.n_t, config.betas, device)
    }

    /// Number of diffusion steps T.
    pub fn n_t(&self) -> usize {
        self.schedule.n_t()
    }

    /// The precomputed schedule.
    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// The underlying UNet.
    pub fn unet(&self) -> &Unet {
        &self.unet
    }

    /// Noise-prediction loss on a clean batch, drawing timesteps and noise
    /// from `rng`.
    ///
    /// # Errors
    ///
    /// Returns [`DdpmError::Internal`] if `x0` is not `(B, 1, 28, 28)` or a
    /// tensor operation fails.
    pub fn loss(&self, x0: &Tensor, rng: &mut SimpleRng, train: bool) -> Result<Tensor, DdpmError> {
        let batch = x0.dim(0).map_err(|e| DdpmError::Internal {
            message: format!("Ddpm loss: {e}"),
        })?;
        let timesteps: Vec<usize> = (0..batch).map(|_| rng.next_timestep(self.n_t())).collect();
        let noise = self.gaussian(batch, rng)?;
        self.loss_at(x0, &timesteps, &noise, train)
    }

    /// Noise-prediction loss for explicit timesteps and noise.
    ///
    /// # Errors
    ///
    /// Returns [`DdpmError::InvalidConfig`] if a timestep is outside `1..=T`
    /// or the timestep count differs from the batch size, and
    /// [`DdpmError::Internal`] on tensor failures.
    pub fn loss_at(
        &self,
        x0: &Tensor,
        timesteps: &[usize],
        noise: &Tensor,
        train: bool,
    ) -> Result<Tensor, DdpmError> {
        let map_err = |e: candle_core::Error| DdpmError::Internal {
            message: format!("Ddpm loss_at: {e}"),
        };

        let batch = x0.dim(0).map_err(map_err)?;
        if timesteps.len() != batch {
            return Err(DdpmError::InvalidConfig {
                message: format!("{} timesteps for a batch of {batch}", timesteps.len()),
            });
        }
        let n_t = self.n_t();
        if let Some(&bad) = timesteps.iter().find(|&&t| t == 0 || t > n_t) {
            return Err(DdpmError::InvalidConfig {
                message: format!("timestep {bad} outside 1..={n_t}"),
            });
        }

        let per_sample = |coeffs: &[f32]| -> Result<Tensor, DdpmError> {
            let values: Vec<f32> = timesteps.iter().map(|&t| coeffs[t]).collect();
            Tensor::from_vec(values, (batch, 1, 1, 1), &self.device).map_err(map_err)
        };
        let signal = per_sample(&self.schedule.sqrtab)?;
        let noise_scale = per_sample(&self.schedule.sqrtmab)?;

        let x_t = (x0.broadcast_mul(&signal).map_err(map_err)?
            + noise.broadcast_mul(&noise_scale).map_err(map_err)?)
        .map_err(map_err)?;

        let t_norm: Vec<f32> = timesteps.iter().map(|&t| t as f32 / n_t as f32).collect();
        let t_norm = Tensor::from_vec(t_norm, (batch, 1), &self.device).map_err(map_err)?;

        let predicted = self.unet.forward_t(&x_t, &t_norm, train)?;
        candle_nn::loss::mse(&predicted, noise).map_err(map_err)
    }

    /// Generates `n` images by ancestral sampling. When `capture` is set,
    /// intermediate states are returned in [`SampleOutput::trajectory`].
    ///
    /// BatchNorm runs on its running statistics throughout.
    ///
    /// # Errors
    ///
    /// Returns [`DdpmError::InvalidConfig`] if `n == 0` and
    /// [`DdpmError::Internal`] on tensor failures.
    pub fn sample(
        &self,
        n: usize,
        rng: &mut SimpleRng,
        capture: bool,
    ) -> Result<SampleOutput, DdpmError> {
        if n == 0 {
            return Err(DdpmError::InvalidConfig {
                message: "sample: n must be > 0".to_string(),
            });
        }
        let map_err = |e: candle_core::Error| DdpmError::Internal {
            message: format!("Ddpm sample: {e}"),
        };

        let n_t = self.n_t();
        let s = &self.schedule;
        let mut x_i = self.gaussian(n, rng)?;
        let mut trajectory = Vec::new();

        for i in (1..=n_t).rev() {
            tracing::debug!(timestep = i, "sampling");
            let t_is = Tensor::full(i as f32 / n_t as f32, (n, 1), &self.device).map_err(map_err)?;
            let eps = self.unet.forward_t(&x_i, &t_is, false)?;

            let denoised = (&x_i - eps.affine(s.mab_over_sqrtmab[i] as f64, 0.0).map_err(map_err)?)
                .map_err(map_err)?
                .affine(s.oneover_sqrta[i] as f64, 0.0)
                .map_err(map_err)?;
            x_i = if i > 1 {
                let z = self.gaussian(n, rng)?;
                (denoised + z.affine(s.sqrt_beta_t[i] as f64, 0.0).map_err(map_err)?)
                    .map_err(map_err)?
            } else {
                denoised
            };
            // drop the autograd graph so memory stays flat across T steps
            x_i = x_i.detach();

            if capture && should_capture(i, n_t) {
                trajectory.push(x_i.clone());
            }
        }

        Ok(SampleOutput {
            images: x_i,
            trajectory,
        })
    }

    fn gaussian(&self, n: usize, rng: &mut SimpleRng) -> Result<Tensor, DdpmError> {
        let shape = (n, IMAGE_CHANNELS, IMAGE_SIDE, IMAGE_SIDE);
        Tensor::from_vec(rng.gaussian_vec(shape.0 * shape.1 * shape.2 * shape.3), shape, &self.device)
            .map_err(|e| DdpmError::Internal {
                message: format!("Ddpm gaussian: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn tiny(var_map: &VarMap, n_t: usize) -> Ddpm {
        Ddpm::new(var_map, 8, n_t, (1e-4, 0.02), &Device::Cpu).unwrap()
    }

    fn half_gray(batch: usize) -> Tensor {
        Tensor::full(0.5f32, (batch, 1, 28, 28), &Device::Cpu).unwrap()
    }

    #[test]
    fn loss_is_finite_scalar() {
        let var_map = VarMap::new();
        let ddpm = tiny(&var_map, 20);
        let mut rng = SimpleRng::new(1);
        let loss = ddpm.loss(&half_gray(4), &mut rng, true).unwrap();
        assert_eq!(loss.dims(), &[] as &[usize]);
        let v = loss.to_vec0::<f32>().unwrap();
        assert!(v.is_finite() && v > 0.0);
    }

    #[test]
    fn loss_is_deterministic_for_seed() {
        let var_map = VarMap::new();
        let ddpm = tiny(&var_map, 20);
        let x0 = half_gray(3);
        let a = ddpm
            .loss(&x0, &mut SimpleRng::new(9), false)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        let b = ddpm
            .loss(&x0, &mut SimpleRng::new(9), false)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn loss_at_rejects_out_of_range_timesteps() {
        let var_map = VarMap::new();
        let ddpm = tiny(&var_map, 10);
        let noise = Tensor::zeros((2, 1, 28, 28), DType::F32, &Device::Cpu).unwrap();
        assert!(ddpm.loss_at(&half_gray(2), &[0, 3], &noise, true).is_err());
        assert!(ddpm.loss_at(&half_gray(2), &[11, 3], &noise, true).is_err());
        assert!(ddpm.loss_at(&half_gray(2), &[3], &noise, true).is_err());
        assert!(ddpm.loss_at(&half_gray(2), &[1, 10], &noise, true).is_ok());
    }

    #[test]
    fn sample_shapes_and_trajectory() {
        let var_map = VarMap::new();
        let ddpm = tiny(&var_map, 30);
        let mut rng = SimpleRng::new(2);
        let out = ddpm.sample(3, &mut rng, true).unwrap();
        assert_eq!(out.images.dims(), &[3, 1, 28, 28]);
        // steps 30, 20, 7..1
        assert_eq!(out.trajectory.len(), 9);
        for frame in &out.trajectory {
            assert_eq!(frame.dims(), &[3, 1, 28, 28]);
        }
        let flat = out.images.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(flat.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn sample_without_capture_has_empty_trajectory() {
        let var_map = VarMap::new();
        let ddpm = tiny(&var_map, 5);
        let out = ddpm.sample(1, &mut SimpleRng::new(3), false).unwrap();
        assert!(out.trajectory.is_empty());
    }

    #[test]
    fn sample_zero_is_error() {
        let var_map = VarMap::new();
        let ddpm = tiny(&var_map, 5);
        assert!(ddpm.sample(0, &mut SimpleRng::new(3), false).is_err());
    }

    #[test]
    fn capture_rule_for_reference_schedule() {
        let kept = (1..=600).filter(|&i| should_capture(i, 600)).count();
        // 30 multiples of 20 (600 included) plus 1..=7
        assert_eq!(kept, 37);
    }

    #[test]
    fn rejects_bad_betas() {
        let var_map = VarMap::new();
        assert!(Ddpm::new(&var_map, 8, 10, (0.02, 1e-4), &Device::Cpu).is_err());
    }
}
