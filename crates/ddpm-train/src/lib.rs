//! # ddpm-train
//!
//! Training driver for the MNIST diffusion model.
//!
//! - [`trainer::Trainer`]: epoch loop with linear LR decay and an EMA loss readout
//! - [`export`]: grayscale PNG strips of samples and sampling trajectories
//! - [`checkpoint`]: safetensors save/load of the model `VarMap`
//!
//! The `ddpm` binary wraps these behind a small CLI; running it with no
//! arguments trains with the reference hyperparameters and writes samples
//! to `./output/`.

pub mod checkpoint;
pub mod export;
pub mod trainer;

pub use checkpoint::{load_checkpoint, save_checkpoint};
pub use trainer::{prepare_dataset, sample_from_checkpoint, EpochStats, TrainReport, Trainer};
