//! # ddpm-data
//!
//! MNIST loading for the diffusion trainer.
//!
//! - [`idx`]: reader for the IDX binary format (plain or gzip)
//! - [`mnist::MnistDataset`]: in-memory digits scaled to [0, 1]
//! - [`loader::BatchIter`]: one shuffled epoch of `(B, 1, 28, 28)` batches
//! - [`download`]: fetches the four archives from a mirror (feature `download`)
//!
//! ## Usage
//!
//! ```no_run
//! use candle_core::Device;
//! use ddpm_core::SimpleRng;
//! use ddpm_data::{BatchIter, MnistDataset, Split};
//!
//! let dataset = MnistDataset::load("./data", Split::Train).unwrap();
//! let mut rng = SimpleRng::new(42);
//! for batch in BatchIter::new(&dataset, 256, true, &mut rng, &Device::Cpu) {
//!     let batch = batch.unwrap();
//!     assert_eq!(batch.images.dims()[1..], [1, 28, 28]);
//! }
//! ```

#[cfg(feature = "download")]
pub mod download;
pub mod idx;
pub mod loader;
pub mod mnist;

pub use loader::{Batch, BatchIter};
pub use mnist::{MnistDataset, Split};
