//! # ddpm-model
//!
//! The denoising diffusion model: a linear-beta noise schedule, a small
//! UNet that predicts the added noise, and the [`Ddpm`] wrapper that turns
//! them into a training loss and an ancestral sampler.
//!
//! ## Key Components
//!
//! - [`schedule::ddpm_schedules`] — precomputed α, ᾱ and friends for t ∈ 0..=T
//! - [`unet::Unet`] — 28×28 UNet with time embeddings (candle, autograd)
//! - [`Ddpm`] — ε-prediction loss and reverse-process sampling
//!
//! ## Architecture Rules
//!
//! - All trainable parameters live in a caller-owned `VarMap` so the trainer
//!   can hand them to the optimizer and to safetensors.
//! - Randomness comes from [`ddpm_core::SimpleRng`], never from candle's
//!   device RNG.
//! - CUDA support is feature-gated: `cargo build --features cuda`.

mod blocks;
pub mod ddpm;
pub mod schedule;
pub mod unet;

pub use ddpm::{should_capture, Ddpm, SampleOutput};
pub use schedule::{ddpm_schedules, NoiseSchedule};
pub use unet::Unet;

use candle_core::Device;
use ddpm_core::{DdpmError, DeviceChoice};

/// Resolves a [`DeviceChoice`] to a candle device.
///
/// `Auto` picks CUDA device 0 when candle was built with CUDA and a device
/// is present, otherwise the CPU.
///
/// # Errors
///
/// Returns [`DdpmError::Internal`] if an explicit CUDA ordinal cannot be
/// opened.
///
/// # Example
///
/// ```
/// use ddpm_core::DeviceChoice;
///
/// let device = ddpm_model::select_device(DeviceChoice::Cpu).unwrap();
/// assert!(device.is_cpu());
/// ```
pub fn select_device(choice: DeviceChoice) -> Result<Device, DdpmError> {
    match choice {
        DeviceChoice::Cpu => Ok(Device::Cpu),
        DeviceChoice::Auto => Ok(Device::cuda_if_available(0).unwrap_or(Device::Cpu)),
        DeviceChoice::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|e| DdpmError::Internal {
            message: format!("select_device cuda:{ordinal}: {e}"),
        }),
    }
}
