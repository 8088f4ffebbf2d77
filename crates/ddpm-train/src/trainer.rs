//! DDPM training loop.
//!
//! ## Algorithm
//!
//! For each epoch `ep`:
//! 1. Set the learning rate to `lrate · (1 − ep / n_epoch)`
//! 2. Walk a freshly shuffled epoch of batches
//! 3. Per batch: ε-prediction loss, backward, AdamW step
//! 4. Track `ema = 0.95·ema + 0.05·loss` (seeded with the first loss)
//! 5. On sampling epochs: generate `n_sample` digits, write
//!    `image_ep{ep}.png`, `image_ep{ep}_t.png` and `model_{ep}.safetensors`

use std::path::{Path, PathBuf};

use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use ddpm_core::{DdpmError, SimpleRng, TrainConfig};
use ddpm_data::{BatchIter, MnistDataset, Split};
use ddpm_model::Ddpm;

use crate::checkpoint::{load_checkpoint, save_checkpoint};
use crate::export::{write_samples, write_trajectory};

const EMA_DECAY: f32 = 0.95;

/// Summary of one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    /// 0-based epoch index.
    pub epoch: usize,
    /// Optimizer steps taken.
    pub batches: usize,
    /// EMA of the batch loss at the end of the epoch.
    pub loss_ema: f32,
    /// Learning rate used for the epoch.
    pub learning_rate: f64,
}

/// Outcome of a full training run.
#[derive(Debug, Clone)]
pub struct TrainReport {
    /// Number of epochs completed.
    pub epochs_completed: usize,
    /// Loss EMA after the last batch.
    pub final_loss_ema: f32,
    /// Loss EMA at the end of each epoch.
    pub loss_history: Vec<f32>,
    /// Every file written (config snapshot, images, checkpoints).
    pub artifacts: Vec<PathBuf>,
}

/// Owns the model, its parameters and the optimizer for one run.
///
/// # Example
///
/// ```no_run
/// use candle_core::Device;
/// use ddpm_core::TrainConfig;
/// use ddpm_data::{MnistDataset, Split};
/// use ddpm_train::Trainer;
///
/// let config = TrainConfig::default();
/// let dataset = MnistDataset::load(&config.data_dir, Split::Train).unwrap();
/// let mut trainer = Trainer::new(config, &Device::Cpu).unwrap();
/// let report = trainer.run(&dataset).unwrap();
/// println!("final loss {:.4}", report.final_loss_ema);
/// ```
pub struct Trainer {
    config: TrainConfig,
    device: Device,
    var_map: VarMap,
    ddpm: Ddpm,
    optimizer: AdamW,
    rng: SimpleRng,
    loss_ema: Option<f32>,
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("ddpm", &self.ddpm)
            .field("loss_ema", &self.loss_ema)
            .finish_non_exhaustive()
    }
}

impl Trainer {
    /// Validates `config` and builds a freshly initialized model.
    ///
    /// # Errors
    ///
    /// Returns [`DdpmError::InvalidConfig`] for bad hyperparameters and
    /// [`DdpmError::Internal`] if the model or optimizer cannot be built.
    pub fn new(config: TrainConfig, device: &Device) -> Result<Self, DdpmError> {
        config.validate()?;
        let var_map = VarMap::new();
        let ddpm = Ddpm::from_config(&var_map, &config, device)?;

        // zero weight decay: plain Adam
        let optimizer = AdamW::new(
            var_map.all_vars(),
            ParamsAdamW {
                lr: config.lrate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )
        .map_err(|e| DdpmError::Internal {
            message: format!("Trainer optimizer: {e}"),
        })?;

        tracing::info!(model = ?ddpm, device = ?device, "initialized");

        Ok(Self {
            rng: SimpleRng::new(config.seed),
            config,
            device: device.clone(),
            var_map,
            ddpm,
            optimizer,
            loss_ema: None,
        })
    }

    /// The run configuration.
    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// The model being trained.
    pub fn ddpm(&self) -> &Ddpm {
        &self.ddpm
    }

    /// Parameters of the model being trained.
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Runs one epoch over `dataset`.
    ///
    /// # Errors
    ///
    /// Returns [`DdpmError::Data`] for an empty dataset and
    /// [`DdpmError::Internal`] if the loss stops being finite.
    pub fn train_epoch(&mut self, ep: usize, dataset: &MnistDataset) -> Result<EpochStats, DdpmError> {
        if dataset.is_empty() {
            return Err(DdpmError::Data {
                message: "training dataset is empty".to_string(),
            });
        }
        let map_err = |e: candle_core::Error| DdpmError::Internal {
            message: format!("train_epoch {ep}: {e}"),
        };

        // the readout restarts from the first batch of every epoch
        self.loss_ema = None;
        let lr = self.config.epoch_learning_rate(ep);
        self.optimizer.set_learning_rate(lr);
        tracing::info!(epoch = ep, lr, "epoch {ep}");

        let batches = BatchIter::new(
            dataset,
            self.config.batch_size,
            self.config.shuffle,
            &mut self.rng,
            &self.device,
        );
        let total = batches.num_batches();
        let mut steps = 0usize;

        for (i, batch) in batches.enumerate() {
            let batch = batch?;
            let loss = self.ddpm.loss(&batch.images, &mut self.rng, true)?;
            let value = loss.to_vec0::<f32>().map_err(map_err)?;
            if !value.is_finite() {
                return Err(DdpmError::Internal {
                    message: format!("loss diverged at epoch {ep}, batch {i}: {value}"),
                });
            }
            self.optimizer.backward_step(&loss).map_err(map_err)?;
            steps += 1;

            let ema = match self.loss_ema {
                None => value,
                Some(prev) => EMA_DECAY * prev + (1.0 - EMA_DECAY) * value,
            };
            self.loss_ema = Some(ema);

            if self.config.log_interval > 0 && (i + 1) % self.config.log_interval == 0 {
                tracing::info!(epoch = ep, batch = i + 1, total, "loss: {ema:.4}");
            }
        }

        let loss_ema = self.loss_ema.unwrap_or(f32::NAN);
        tracing::info!(epoch = ep, batches = steps, "epoch {ep} done, loss: {loss_ema:.4}");
        Ok(EpochStats {
            epoch: ep,
            batches: steps,
            loss_ema,
            learning_rate: lr,
        })
    }

    /// Trains for `n_epoch` epochs, sampling and checkpointing on the
    /// configured epochs (always including the last).
    ///
    /// # Errors
    ///
    /// Propagates data, training and export failures.
    pub fn run(&mut self, dataset: &MnistDataset) -> Result<TrainReport, DdpmError> {
        let save_dir = self.config.save_dir.clone();
        std::fs::create_dir_all(&save_dir).map_err(|e| DdpmError::io(&save_dir, e))?;

        let config_path = save_dir.join("config.toml");
        std::fs::write(&config_path, self.config.to_toml_string()?)
            .map_err(|e| DdpmError::io(&config_path, e))?;
        let mut artifacts = vec![config_path];

        let mut loss_history = Vec::with_capacity(self.config.n_epoch);
        for ep in 0..self.config.n_epoch {
            let stats = self.train_epoch(ep, dataset)?;
            loss_history.push(stats.loss_ema);

            if self.config.is_sample_epoch(ep) {
                artifacts.extend(self.sample_and_save(ep)?);
            }
        }

        Ok(TrainReport {
            epochs_completed: self.config.n_epoch,
            final_loss_ema: self.loss_ema.unwrap_or(f32::NAN),
            loss_history,
            artifacts,
        })
    }

    /// Samples `n_sample` digits and writes the epoch's images and, when
    /// `save_model` is set, its checkpoint. Returns the written paths.
    ///
    /// # Errors
    ///
    /// Propagates sampling and export failures.
    pub fn sample_and_save(&mut self, ep: usize) -> Result<Vec<PathBuf>, DdpmError> {
        let dir = self.config.save_dir.clone();
        let mut written = write_sample_images(
            &self.ddpm,
            self.config.n_sample,
            &mut self.rng,
            &dir.join(format!("image_ep{ep}.png")),
            &dir.join(format!("image_ep{ep}_t.png")),
        )?;

        if self.config.save_model {
            let path = dir.join(format!("model_{ep}.safetensors"));
            save_checkpoint(&self.var_map, &path)?;
            written.push(path);
        }
        Ok(written)
    }
}

/// Loads MNIST for training, downloading it first when allowed and absent.
///
/// # Errors
///
/// Returns [`DdpmError::Data`] if the dataset is missing and cannot be
/// fetched.
pub fn prepare_dataset(config: &TrainConfig) -> Result<MnistDataset, DdpmError> {
    match MnistDataset::load(&config.data_dir, Split::Train) {
        Ok(dataset) => Ok(dataset),
        #[cfg(feature = "download")]
        Err(DdpmError::Data { message }) if config.download => {
            tracing::info!(reason = %message, "MNIST not found locally, downloading");
            ddpm_data::download::download_mnist(
                &config.data_dir,
                ddpm_data::download::DEFAULT_MIRRORS,
            )?;
            MnistDataset::load(&config.data_dir, Split::Train)
        }
        Err(e) => Err(e),
    }
}

/// Rebuilds the model described by `config`, loads `checkpoint` and writes
/// `samples.png` and `samples_t.png` for `n` new digits into `save_dir`.
///
/// # Errors
///
/// Returns [`DdpmError::Io`] for a missing checkpoint and
/// [`DdpmError::Internal`] if it does not match the configured architecture.
pub fn sample_from_checkpoint(
    config: &TrainConfig,
    checkpoint: &Path,
    n: usize,
    device: &Device,
) -> Result<Vec<PathBuf>, DdpmError> {
    config.validate()?;
    let mut var_map = VarMap::new();
    let ddpm = Ddpm::from_config(&var_map, config, device)?;
    load_checkpoint(&mut var_map, checkpoint)?;

    let mut rng = SimpleRng::new(config.seed);
    write_sample_images(
        &ddpm,
        n,
        &mut rng,
        &config.save_dir.join("samples.png"),
        &config.save_dir.join("samples_t.png"),
    )
}

fn write_sample_images(
    ddpm: &Ddpm,
    n: usize,
    rng: &mut SimpleRng,
    samples_path: &Path,
    trajectory_path: &Path,
) -> Result<Vec<PathBuf>, DdpmError> {
    let output = ddpm.sample(n, rng, true)?;

    write_samples(&output.images, samples_path)?;
    tracing::info!(path = %samples_path.display(), "saved image");

    write_trajectory(&output.trajectory, 0, trajectory_path)?;
    tracing::info!(path = %trajectory_path.display(), "saved image");

    Ok(vec![samples_path.to_path_buf(), trajectory_path.to_path_buf()])
}
