//! In-memory MNIST dataset.

use std::path::{Path, PathBuf};

use ddpm_core::{DdpmError, IMAGE_PIXELS, IMAGE_SIDE};

use crate::idx::{parse_idx, read_maybe_gz, IMAGES_MAGIC, LABELS_MAGIC};

/// Which half of MNIST to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// 60,000 training digits.
    Train,
    /// 10,000 test digits.
    Test,
}

impl Split {
    /// Base file names (without `.gz`) for images and labels.
    pub fn file_names(&self) -> (&'static str, &'static str) {
        match self {
            Self::Train => ("train-images-idx3-ubyte", "train-labels-idx1-ubyte"),
            Self::Test => ("t10k-images-idx3-ubyte", "t10k-labels-idx1-ubyte"),
        }
    }
}

/// MNIST digits held in memory, pixels scaled to `[0, 1]`.
///
/// # Example
///
/// ```
/// use ddpm_data::MnistDataset;
///
/// let images = vec![255u8; 2 * 784];
/// let dataset = MnistDataset::from_raw(images, vec![3, 5]).unwrap();
/// assert_eq!(dataset.len(), 2);
/// assert_eq!(dataset.image(1)[0], 1.0);
/// assert_eq!(dataset.label(1), 5);
/// ```
#[derive(Debug, Clone)]
pub struct MnistDataset {
    pixels: Vec<f32>,
    labels: Vec<u8>,
}

impl MnistDataset {
    /// Builds a dataset from raw u8 pixels (784 per image) and labels.
    ///
    /// # Errors
    ///
    /// Returns [`DdpmError::Data`] if the pixel buffer is not a whole number
    /// of images or the counts disagree.
    pub fn from_raw(pixels: Vec<u8>, labels: Vec<u8>) -> Result<Self, DdpmError> {
        if pixels.len() % IMAGE_PIXELS != 0 {
            return Err(DdpmError::Data {
                message: format!(
                    "pixel buffer of {} bytes is not a multiple of {IMAGE_PIXELS}",
                    pixels.len()
                ),
            });
        }
        let count = pixels.len() / IMAGE_PIXELS;
        if count != labels.len() {
            return Err(DdpmError::Data {
                message: format!("{count} images but {} labels", labels.len()),
            });
        }
        Ok(Self {
            pixels: pixels.into_iter().map(|p| p as f32 / 255.0).collect(),
            labels,
        })
    }

    /// Loads a split from `dir`, looking in `dir` and `dir/MNIST/raw` for
    /// plain or `.gz` IDX files.
    ///
    /// # Errors
    ///
    /// Returns [`DdpmError::Data`] if the files are missing or malformed.
    pub fn load(dir: impl AsRef<Path>, split: Split) -> Result<Self, DdpmError> {
        let dir = dir.as_ref();
        let (images_name, labels_name) = split.file_names();
        let images_path = locate(dir, images_name)?;
        let labels_path = locate(dir, labels_name)?;

        let images = parse_idx(&read_maybe_gz(&images_path)?, IMAGES_MAGIC)?;
        if images.dims[1..] != [IMAGE_SIDE, IMAGE_SIDE] {
            return Err(DdpmError::Data {
                message: format!(
                    "{}: expected {IMAGE_SIDE}x{IMAGE_SIDE} images, found {:?}",
                    images_path.display(),
                    &images.dims[1..]
                ),
            });
        }
        let labels = parse_idx(&read_maybe_gz(&labels_path)?, LABELS_MAGIC)?;

        let dataset = Self::from_raw(images.data, labels.data)?;
        tracing::info!(
            split = ?split,
            images = dataset.len(),
            path = %images_path.display(),
            "loaded MNIST"
        );
        Ok(dataset)
    }

    /// Number of images.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Returns `true` if the dataset holds no images.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Pixels of image `idx`, row-major, length 784.
    ///
    /// # Panics
    ///
    /// Panics if `idx >= len()`.
    pub fn image(&self, idx: usize) -> &[f32] {
        &self.pixels[idx * IMAGE_PIXELS..(idx + 1) * IMAGE_PIXELS]
    }

    /// Digit label of image `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx >= len()`.
    pub fn label(&self, idx: usize) -> u8 {
        self.labels[idx]
    }
}

/// Returns the first existing candidate path for an IDX base name.
pub(crate) fn locate(dir: &Path, base: &str) -> Result<PathBuf, DdpmError> {
    candidates(dir, base)
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| DdpmError::Data {
            message: format!(
                "{base}[.gz] not found in {} or {}",
                dir.display(),
                dir.join("MNIST").join("raw").display()
            ),
        })
}

fn candidates(dir: &Path, base: &str) -> Vec<PathBuf> {
    let raw = dir.join("MNIST").join("raw");
    vec![
        dir.join(base),
        dir.join(format!("{base}.gz")),
        raw.join(base),
        raw.join(format!("{base}.gz")),
    ]
}
