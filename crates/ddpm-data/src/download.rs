//! MNIST downloader.
//!
//! Fetches the four gzip archives into `<dir>/MNIST/raw`, trying each mirror
//! in order. Files already on disk are left alone, so the call is cheap on
//! every run after the first.

use std::path::{Path, PathBuf};

use ddpm_core::DdpmError;

use crate::mnist::Split;

/// Mirrors tried in order.
pub const DEFAULT_MIRRORS: &[&str] = &[
    "https://ossci-datasets.s3.amazonaws.com/mnist/",
    "https://storage.googleapis.com/cvdf-datasets/mnist/",
];

/// Downloads any missing MNIST archive into `dir/MNIST/raw`.
///
/// Returns the raw directory. Existing plain or gzipped files (in `dir` or
/// the raw directory) count as present.
///
/// # Errors
///
/// Returns [`DdpmError::Io`] if the directory cannot be created or a file
/// cannot be written, and [`DdpmError::Data`] if every mirror fails for
/// some archive.
pub fn download_mnist(dir: impl AsRef<Path>, mirrors: &[&str]) -> Result<PathBuf, DdpmError> {
    let dir = dir.as_ref();
    let raw = dir.join("MNIST").join("raw");
    std::fs::create_dir_all(&raw).map_err(|e| DdpmError::io(&raw, e))?;

    for split in [Split::Train, Split::Test] {
        let (images, labels) = split.file_names();
        for base in [images, labels] {
            if crate::mnist::locate(dir, base).is_ok() {
                tracing::debug!(file = base, "already present, skipping download");
                continue;
            }
            let target = raw.join(format!("{base}.gz"));
            fetch_from_mirrors(&format!("{base}.gz"), mirrors, &target)?;
        }
    }
    Ok(raw)
}

fn fetch_from_mirrors(file: &str, mirrors: &[&str], target: &Path) -> Result<(), DdpmError> {
    let mut last_error = String::from("no mirrors configured");
    for mirror in mirrors {
        let url = format!("{mirror}{file}");
        tracing::info!(%url, "downloading");
        match fetch(&url) {
            Ok(bytes) => {
                // write-then-rename so an interrupted download never looks complete
                let partial = target.with_extension("gz.part");
                std::fs::write(&partial, &bytes).map_err(|e| DdpmError::io(&partial, e))?;
                std::fs::rename(&partial, target).map_err(|e| DdpmError::io(target, e))?;
                tracing::info!(path = %target.display(), bytes = bytes.len(), "saved");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(%url, error = %e, "mirror failed");
                last_error = e;
            }
        }
    }
    Err(DdpmError::Data {
        message: format!("could not download {file}: {last_error}"),
    })
}

fn fetch(url: &str) -> Result<Vec<u8>, String> {
    let response = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .map_err(|e| e.to_string())?;
    response
        .bytes()
        .map(|b| b.to_vec())
        .map_err(|e| e.to_string())
}
