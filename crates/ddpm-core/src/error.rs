//! Error type shared across the ddpm-mnist crates.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while configuring, loading data, training or sampling.
///
/// # Example
///
/// ```
/// use ddpm_core::DdpmError;
///
/// let err = DdpmError::InvalidConfig { message: "n_feat must be > 0".into() };
/// assert!(err.to_string().contains("n_feat"));
/// ```
#[derive(Debug, Error)]
pub enum DdpmError {
    /// A hyperparameter is out of range.
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    /// The dataset is missing, truncated or malformed.
    #[error("dataset error: {message}")]
    Data { message: String },

    /// A file could not be read or written.
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A tensor or backend operation failed.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// A sample image could not be encoded.
    #[error("export error: {message}")]
    Export { message: String },
}

impl DdpmError {
    /// Wraps an [`std::io::Error`] with the path that caused it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_names_path() {
        let err = DdpmError::io(
            "data/train-images-idx3-ubyte",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        let msg = err.to_string();
        assert!(msg.contains("train-images-idx3-ubyte"));
        assert!(msg.contains("missing"));
    }

    #[test]
    fn internal_error_display() {
        let err = DdpmError::Internal {
            message: "Unet forward: shape mismatch".into(),
        };
        assert_eq!(err.to_string(), "internal error: Unet forward: shape mismatch");
    }
}
