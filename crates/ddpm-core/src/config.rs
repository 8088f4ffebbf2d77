//! Run configuration for training and sampling.
//!
//! Defaults reproduce the reference MNIST run: 40 epochs, batch 256,
//! 600 diffusion steps, 256 base features, Adam at 1e-4 with linear decay.
//! A TOML file may override any subset of fields.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DdpmError;

/// Where tensors are allocated.
///
/// # Example
///
/// ```
/// use ddpm_core::DeviceChoice;
///
/// assert_eq!("cuda:1".parse::<DeviceChoice>().unwrap(), DeviceChoice::Cuda(1));
/// assert_eq!("cpu".parse::<DeviceChoice>().unwrap(), DeviceChoice::Cpu);
/// assert!("tpu".parse::<DeviceChoice>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceChoice {
    /// First CUDA device if available, otherwise CPU.
    #[default]
    Auto,
    /// Always CPU.
    Cpu,
    /// A specific CUDA ordinal.
    Cuda(usize),
}

impl FromStr for DeviceChoice {
    type Err = DdpmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse().ok())
                .map(Self::Cuda)
                .ok_or_else(|| {
                    DdpmError::config(format!(
                        "unknown device '{s}'. Valid: auto, cpu, cuda, cuda:N"
                    ))
                }),
        }
    }
}

impl fmt::Display for DeviceChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(n) => write!(f, "cuda:{n}"),
        }
    }
}

impl TryFrom<String> for DeviceChoice {
    type Error = DdpmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceChoice> for String {
    fn from(value: DeviceChoice) -> Self {
        value.to_string()
    }
}

/// Hyperparameters and paths for a training run.
///
/// # Example
///
/// ```
/// use ddpm_core::TrainConfig;
///
/// let config = TrainConfig::default();
/// assert_eq!(config.n_t, 600);
/// assert_eq!(config.betas, (1e-4, 0.02));
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Number of passes over the dataset (default: 40).
    pub n_epoch: usize,

    /// Images per optimizer step (default: 256).
    pub batch_size: usize,

    /// Number of diffusion steps T (default: 600).
    pub n_t: usize,

    /// UNet base feature width; must be a multiple of 8 (default: 256).
    pub n_feat: usize,

    /// Initial learning rate, decayed linearly to zero (default: 1e-4).
    pub lrate: f64,

    /// Linear beta schedule endpoints (default: (1e-4, 0.02)).
    pub betas: (f64, f64),

    /// Context dropout probability. Carried for checkpoint compatibility;
    /// the unconditional model does not use it (default: 0.1).
    pub drop_prob: f64,

    /// Whether to write a safetensors checkpoint alongside samples.
    pub save_model: bool,

    /// Directory for sample images and checkpoints (default: `./output/`).
    pub save_dir: PathBuf,

    /// Directory holding (or receiving) the MNIST IDX files.
    pub data_dir: PathBuf,

    /// Fetch MNIST when it is not already in `data_dir`.
    pub download: bool,

    /// Images generated per sampling round (default: 10).
    pub n_sample: usize,

    /// Seed for timestep draws, shuffling and Gaussian noise.
    pub seed: u64,

    /// Reshuffle the dataset every epoch.
    pub shuffle: bool,

    /// Batches between loss log lines.
    pub log_interval: usize,

    /// Also sample and checkpoint every N epochs. `None` means only after
    /// the final epoch.
    pub sample_every: Option<usize>,

    /// Tensor device.
    pub device: DeviceChoice,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            n_epoch: 40,
            batch_size: 256,
            n_t: 600,
            n_feat: 256,
            lrate: 1e-4,
            betas: (1e-4, 0.02),
            drop_prob: 0.1,
            save_model: true,
            save_dir: PathBuf::from("./output/"),
            data_dir: PathBuf::from("./data"),
            download: true,
            n_sample: 10,
            seed: 42,
            shuffle: true,
            log_interval: 50,
            sample_every: None,
            device: DeviceChoice::Auto,
        }
    }
}

impl TrainConfig {
    /// Loads a config from a TOML file. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`DdpmError::Io`] if the file cannot be read and
    /// [`DdpmError::InvalidConfig`] if it does not parse or fails
    /// [`TrainConfig::validate`].
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, DdpmError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| DdpmError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    /// Parses a config from TOML text. Missing keys keep their defaults.
    ///
    /// # Example
    ///
    /// ```
    /// use ddpm_core::TrainConfig;
    ///
    /// let config = TrainConfig::from_toml_str("n_epoch = 2\nn_feat = 64\n").unwrap();
    /// assert_eq!(config.n_epoch, 2);
    /// assert_eq!(config.batch_size, 256);
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, DdpmError> {
        let config: Self =
            toml::from_str(text).map_err(|e| DdpmError::config(format!("toml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the config back to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`DdpmError::InvalidConfig`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, DdpmError> {
        toml::to_string_pretty(self).map_err(|e| DdpmError::config(format!("toml: {e}")))
    }

    /// Checks that every hyperparameter is in range.
    ///
    /// # Errors
    ///
    /// Returns [`DdpmError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), DdpmError> {
        if self.n_epoch == 0 {
            return Err(DdpmError::config("n_epoch must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(DdpmError::config("batch_size must be > 0"));
        }
        if self.n_t == 0 {
            return Err(DdpmError::config("n_t must be > 0"));
        }
        if self.n_sample == 0 {
            return Err(DdpmError::config("n_sample must be > 0"));
        }
        // GroupNorm(8, n_feat) in the UNet head
        if self.n_feat == 0 || self.n_feat % 8 != 0 {
            return Err(DdpmError::config(format!(
                "n_feat must be a positive multiple of 8, got {}",
                self.n_feat
            )));
        }
        if !(self.lrate.is_finite() && self.lrate > 0.0) {
            return Err(DdpmError::config(format!(
                "lrate must be positive, got {}",
                self.lrate
            )));
        }
        let (beta1, beta2) = self.betas;
        if !(0.0 < beta1 && beta1 < beta2 && beta2 < 1.0) {
            return Err(DdpmError::config(format!(
                "betas must satisfy 0 < beta1 < beta2 < 1, got ({beta1}, {beta2})"
            )));
        }
        if !(0.0..=1.0).contains(&self.drop_prob) {
            return Err(DdpmError::config(format!(
                "drop_prob must be in [0, 1], got {}",
                self.drop_prob
            )));
        }
        if self.sample_every == Some(0) {
            return Err(DdpmError::config("sample_every must be > 0 when set"));
        }
        Ok(())
    }

    /// Returns true when epoch `ep` (0-based) should sample and checkpoint.
    ///
    /// # Example
    ///
    /// ```
    /// use ddpm_core::TrainConfig;
    ///
    /// let config = TrainConfig { n_epoch: 5, sample_every: Some(2), ..TrainConfig::default() };
    /// let due: Vec<usize> = (0..5).filter(|&ep| config.is_sample_epoch(ep)).collect();
    /// assert_eq!(due, vec![1, 3, 4]);
    /// ```
    pub fn is_sample_epoch(&self, ep: usize) -> bool {
        if ep + 1 == self.n_epoch {
            return true;
        }
        matches!(self.sample_every, Some(every) if (ep + 1) % every == 0)
    }

    /// Learning rate for epoch `ep`: `lrate · (1 − ep / n_epoch)`.
    pub fn epoch_learning_rate(&self, ep: usize) -> f64 {
        self.lrate * (1.0 - ep as f64 / self.n_epoch as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_sensible() {
        let config = TrainConfig::default();
        config.validate().unwrap();
        assert_eq!(config.n_epoch, 40);
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.n_feat, 256);
        assert_eq!(config.save_dir, PathBuf::from("./output/"));
        assert_eq!(config.device, DeviceChoice::Auto);
    }

    #[test]
    fn rejects_bad_betas() {
        for betas in [(0.02, 1e-4), (0.0, 0.02), (1e-4, 1.0), (0.5, 0.5)] {
            let config = TrainConfig {
                betas,
                ..TrainConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(DdpmError::InvalidConfig { .. })),
                "betas {betas:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_n_feat_not_multiple_of_eight() {
        let config = TrainConfig {
            n_feat: 12,
            ..TrainConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("n_feat"));
    }

    #[test]
    fn rejects_zero_sizes() {
        let zeroed = [
            TrainConfig { n_epoch: 0, ..TrainConfig::default() },
            TrainConfig { batch_size: 0, ..TrainConfig::default() },
            TrainConfig { n_t: 0, ..TrainConfig::default() },
            TrainConfig { n_sample: 0, ..TrainConfig::default() },
            TrainConfig { sample_every: Some(0), ..TrainConfig::default() },
        ];
        for config in zeroed {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn rejects_non_positive_lrate() {
        for lrate in [0.0, -1e-4, f64::NAN] {
            let config = TrainConfig {
                lrate,
                ..TrainConfig::default()
            };
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let text = r#"
            n_epoch = 3
            betas = [0.0001, 0.05]
            device = "cuda:2"
            save_dir = "runs/a"
        "#;
        let config = TrainConfig::from_toml_str(text).unwrap();
        assert_eq!(config.n_epoch, 3);
        assert_eq!(config.betas, (0.0001, 0.05));
        assert_eq!(config.device, DeviceChoice::Cuda(2));
        assert_eq!(config.save_dir, PathBuf::from("runs/a"));
        assert_eq!(config.n_t, 600);
    }

    #[test]
    fn invalid_toml_values_rejected() {
        assert!(TrainConfig::from_toml_str("n_feat = 10").is_err());
        assert!(TrainConfig::from_toml_str("device = \"tpu\"").is_err());
        assert!(TrainConfig::from_toml_str("n_epoch = \"many\"").is_err());
    }

    #[test]
    fn toml_roundtrip_preserves_fields() {
        let config = TrainConfig {
            n_epoch: 7,
            sample_every: Some(3),
            device: DeviceChoice::Cpu,
            ..TrainConfig::default()
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(TrainConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn learning_rate_decays_linearly() {
        let config = TrainConfig {
            n_epoch: 4,
            lrate: 1e-3,
            ..TrainConfig::default()
        };
        assert!((config.epoch_learning_rate(0) - 1e-3).abs() < 1e-12);
        assert!((config.epoch_learning_rate(2) - 5e-4).abs() < 1e-12);
        assert!(config.epoch_learning_rate(3) > 0.0);
    }

    #[test]
    fn last_epoch_always_samples() {
        let config = TrainConfig {
            n_epoch: 3,
            ..TrainConfig::default()
        };
        assert!(!config.is_sample_epoch(0));
        assert!(!config.is_sample_epoch(1));
        assert!(config.is_sample_epoch(2));
    }

    #[test]
    fn device_choice_display_roundtrip() {
        for choice in [DeviceChoice::Auto, DeviceChoice::Cpu, DeviceChoice::Cuda(3)] {
            assert_eq!(choice.to_string().parse::<DeviceChoice>().unwrap(), choice);
        }
        assert_eq!("CUDA".parse::<DeviceChoice>().unwrap(), DeviceChoice::Cuda(0));
    }
}
