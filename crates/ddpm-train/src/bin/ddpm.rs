//! `ddpm` — train the MNIST diffusion model or sample from a checkpoint.
//!
//! # Usage
//!
//! ```bash
//! # reference run: 40 epochs, samples + checkpoint in ./output/
//! cargo run --release -p ddpm-train --bin ddpm
//!
//! # quick CPU run with overrides
//! cargo run --release -p ddpm-train --bin ddpm -- train \
//!   --epochs 2 --n-feat 64 --n-t 100 --device cpu --output runs/quick
//!
//! # sample from a saved checkpoint
//! cargo run --release -p ddpm-train --bin ddpm -- sample \
//!   --checkpoint output/model_39.safetensors --n 16
//! ```
//!
//! Precedence: command-line flags over `--config` file values over defaults.
//! `sample` falls back to the `config.toml` saved beside the checkpoint when
//! no `--config` is given. Log verbosity follows `RUST_LOG` (default `info`).

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use ddpm_core::{DdpmError, DeviceChoice, TrainConfig};
use ddpm_train::{prepare_dataset, sample_from_checkpoint, Trainer};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ddpm", version, about = "Denoising diffusion on MNIST")]
struct Cli {
    /// Defaults to `train` when omitted.
    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Train(TrainArgs::default()))
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train a model and write samples to the output directory.
    Train(TrainArgs),
    /// Generate samples from a saved checkpoint.
    Sample(SampleArgs),
}

#[derive(Debug, Default, Args)]
struct CommonArgs {
    /// TOML file with any subset of the run configuration.
    #[arg(long, env = "DDPM_CONFIG")]
    config: Option<PathBuf>,

    /// Output directory for images and checkpoints.
    #[arg(long)]
    output: Option<PathBuf>,

    /// auto, cpu, cuda or cuda:N.
    #[arg(long)]
    device: Option<DeviceChoice>,

    /// Random seed.
    #[arg(long)]
    seed: Option<u64>,

    /// UNet base width (multiple of 8).
    #[arg(long)]
    n_feat: Option<usize>,

    /// Number of diffusion steps.
    #[arg(long)]
    n_t: Option<usize>,
}

#[derive(Debug, Default, Args)]
struct TrainArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Number of epochs.
    #[arg(long)]
    epochs: Option<usize>,

    /// Batch size.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Initial learning rate.
    #[arg(long)]
    lr: Option<f64>,

    /// Directory holding MNIST IDX files.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Never fetch MNIST from the network.
    #[arg(long)]
    no_download: bool,

    /// Also sample and checkpoint every N epochs.
    #[arg(long)]
    sample_every: Option<usize>,

    /// Batches between loss log lines.
    #[arg(long)]
    log_interval: Option<usize>,

    /// Skip writing checkpoints.
    #[arg(long)]
    no_save_model: bool,
}

#[derive(Debug, Args)]
struct SampleArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// safetensors file written by `ddpm train`.
    #[arg(long)]
    checkpoint: PathBuf,

    /// Number of digits to generate.
    #[arg(long)]
    n: Option<usize>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let result = match Cli::parse().into_command() {
        Command::Train(args) => train(args),
        Command::Sample(args) => sample(args),
    };

    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn base_config(common: &CommonArgs, config_file: Option<&Path>) -> Result<TrainConfig, DdpmError> {
    let mut config = match config_file {
        Some(path) => TrainConfig::from_toml_file(path)?,
        None => TrainConfig::default(),
    };
    if let Some(output) = &common.output {
        config.save_dir = output.clone();
    }
    if let Some(device) = common.device {
        config.device = device;
    }
    if let Some(seed) = common.seed {
        config.seed = seed;
    }
    if let Some(n_feat) = common.n_feat {
        config.n_feat = n_feat;
    }
    if let Some(n_t) = common.n_t {
        config.n_t = n_t;
    }
    Ok(config)
}

fn train_config(args: &TrainArgs) -> Result<TrainConfig, DdpmError> {
    let mut config = base_config(&args.common, args.common.config.as_deref())?;
    if let Some(epochs) = args.epochs {
        config.n_epoch = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(lr) = args.lr {
        config.lrate = lr;
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if args.no_download {
        config.download = false;
    }
    if args.sample_every.is_some() {
        config.sample_every = args.sample_every;
    }
    if let Some(log_interval) = args.log_interval {
        config.log_interval = log_interval;
    }
    if args.no_save_model {
        config.save_model = false;
    }
    config.validate()?;
    Ok(config)
}

fn train(args: TrainArgs) -> Result<(), DdpmError> {
    let config = train_config(&args)?;

    tracing::info!(
        epochs = config.n_epoch,
        batch_size = config.batch_size,
        n_t = config.n_t,
        n_feat = config.n_feat,
        lr = config.lrate,
        output = %config.save_dir.display(),
        "=== DDPM MNIST training ==="
    );

    let device = ddpm_model::select_device(config.device)?;
    tracing::info!(?device, "using device");

    let dataset = prepare_dataset(&config)?;

    let start = Instant::now();
    let mut trainer = Trainer::new(config, &device)?;
    let report = trainer.run(&dataset)?;
    let elapsed = start.elapsed().as_secs_f32();

    tracing::info!(
        epochs = report.epochs_completed,
        "training complete in {elapsed:.1}s, final loss: {:.4}",
        report.final_loss_ema
    );
    for path in &report.artifacts {
        tracing::info!(path = %path.display(), "artifact");
    }
    Ok(())
}

fn sample_config(args: &SampleArgs) -> Result<TrainConfig, DdpmError> {
    // the schedule has no weights, so T must come from the training run
    let saved = args.checkpoint.with_file_name("config.toml");
    let config_file = match &args.common.config {
        Some(path) => Some(path.as_path()),
        None if saved.is_file() => {
            tracing::info!(path = %saved.display(), "using config saved with checkpoint");
            Some(saved.as_path())
        }
        None => None,
    };
    let mut config = base_config(&args.common, config_file)?;
    if let Some(n) = args.n {
        config.n_sample = n;
    }
    config.validate()?;
    Ok(config)
}

fn sample(args: SampleArgs) -> Result<(), DdpmError> {
    let config = sample_config(&args)?;

    let device = ddpm_model::select_device(config.device)?;
    let written = sample_from_checkpoint(&config, &args.checkpoint, config.n_sample, &device)?;
    for path in &written {
        tracing::info!(path = %path.display(), "wrote");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Command {
        Cli::try_parse_from(argv).unwrap().into_command()
    }

    fn train_args(command: Command) -> TrainArgs {
        match command {
            Command::Train(args) => args,
            Command::Sample(_) => panic!("expected train"),
        }
    }

    fn sample_args(command: Command) -> SampleArgs {
        match command {
            Command::Sample(args) => args,
            Command::Train(_) => panic!("expected sample"),
        }
    }

    #[test]
    fn no_arguments_trains_with_defaults() {
        let args = train_args(parse(&["ddpm"]));
        assert!(args.common.config.is_none());
        assert_eq!(train_config(&args).unwrap(), TrainConfig::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "n_epoch = 3\nbatch_size = 16\n").unwrap();

        let args = train_args(parse(&["ddpm", "train", "--config", path.to_str().unwrap()]));
        let config = train_config(&args).unwrap();
        assert_eq!(config.n_epoch, 3);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.n_t, TrainConfig::default().n_t);
    }

    #[test]
    fn flags_override_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "n_epoch = 3\nbatch_size = 16\n").unwrap();

        let args = train_args(parse(&[
            "ddpm",
            "train",
            "--config",
            path.to_str().unwrap(),
            "--epochs",
            "5",
            "--no-save-model",
        ]));
        let config = train_config(&args).unwrap();
        assert_eq!(config.n_epoch, 5);
        assert_eq!(config.batch_size, 16);
        assert!(!config.save_model);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let args = train_args(parse(&["ddpm", "train", "--n-feat", "12"]));
        assert!(matches!(train_config(&args), Err(DdpmError::InvalidConfig { .. })));
    }

    #[test]
    fn sample_reads_config_beside_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "n_t = 7\nn_feat = 16\n").unwrap();
        let checkpoint = dir.path().join("model_0.safetensors");

        let args = sample_args(parse(&["ddpm", "sample", "--checkpoint", checkpoint.to_str().unwrap()]));
        let config = sample_config(&args).unwrap();
        assert_eq!((config.n_t, config.n_feat), (7, 16));

        let args = sample_args(parse(&[
            "ddpm",
            "sample",
            "--checkpoint",
            checkpoint.to_str().unwrap(),
            "--n-t",
            "9",
        ]));
        assert_eq!(sample_config(&args).unwrap().n_t, 9);
    }

    #[test]
    fn sample_without_saved_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("model_0.safetensors");
        let args = sample_args(parse(&[
            "ddpm",
            "sample",
            "--checkpoint",
            checkpoint.to_str().unwrap(),
            "--n",
            "4",
        ]));
        let config = sample_config(&args).unwrap();
        assert_eq!(config.n_t, TrainConfig::default().n_t);
        assert_eq!(config.n_sample, 4);
    }
}
