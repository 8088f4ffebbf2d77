//! # ddpm-core
//!
//! Shared foundation for the ddpm-mnist workspace.
//!
//! ## Key Components
//!
//! - [`DdpmError`] — the error type every crate returns
//! - [`TrainConfig`] — run hyperparameters, loadable from TOML
//! - [`DeviceChoice`] — where tensors live (`auto`, `cpu`, `cuda:N`)
//! - [`SimpleRng`] — deterministic splitmix64 PRNG for timesteps and shuffling
//!
//! ## Architecture Rules
//!
//! - No tensor code here — candle lives in `ddpm-data` and above.
//! - Pure synchronous logic.

pub mod config;
pub mod error;
pub mod rng;

pub use config::{DeviceChoice, TrainConfig};
pub use error::DdpmError;
pub use rng::SimpleRng;

/// Side length of an MNIST digit in pixels.
pub const IMAGE_SIDE: usize = 28;

/// Channel count of an MNIST digit (grayscale).
pub const IMAGE_CHANNELS: usize = 1;

/// Pixels per MNIST digit.
pub const IMAGE_PIXELS: usize = IMAGE_SIDE * IMAGE_SIDE;
