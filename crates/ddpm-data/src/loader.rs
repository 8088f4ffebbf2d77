//! Epoch batching.
//!
//! Mirrors a `DataLoader(shuffle=True, drop_last=False)`: each epoch visits
//! every image exactly once, in a fresh permutation when shuffling, and the
//! final batch may be short.

use candle_core::{Device, Tensor};
use ddpm_core::{DdpmError, SimpleRng, IMAGE_CHANNELS, IMAGE_PIXELS, IMAGE_SIDE};

use crate::mnist::MnistDataset;

/// One mini-batch of digits.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Pixels, shape `(B, 1, 28, 28)`, values in `[0, 1]`.
    pub images: Tensor,
    /// Digit labels, length `B`.
    pub labels: Vec<u8>,
}

/// Iterator over one epoch of batches.
///
/// # Example
///
/// ```
/// use candle_core::Device;
/// use ddpm_core::SimpleRng;
/// use ddpm_data::{BatchIter, MnistDataset};
///
/// let dataset = MnistDataset::from_raw(vec![0u8; 5 * 784], vec![0; 5]).unwrap();
/// let mut rng = SimpleRng::new(1);
/// let sizes: Vec<usize> = BatchIter::new(&dataset, 2, true, &mut rng, &Device::Cpu)
///     .map(|b| b.unwrap().labels.len())
///     .collect();
/// assert_eq!(sizes, vec![2, 2, 1]);
/// ```
pub struct BatchIter<'a> {
    dataset: &'a MnistDataset,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    device: Device,
}

impl<'a> BatchIter<'a> {
    /// Starts an epoch. When `shuffle` is set the visiting order is drawn
    /// from `rng`; otherwise images come in index order.
    pub fn new(
        dataset: &'a MnistDataset,
        batch_size: usize,
        shuffle: bool,
        rng: &mut SimpleRng,
        device: &Device,
    ) -> Self {
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        if shuffle {
            rng.shuffle(&mut order);
        }
        Self {
            dataset,
            order,
            cursor: 0,
            batch_size: batch_size.max(1),
            device: device.clone(),
        }
    }

    /// Total batches in this epoch: `ceil(len / batch_size)`.
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    fn build(&self, indices: &[usize]) -> Result<Batch, DdpmError> {
        let mut data = Vec::with_capacity(indices.len() * IMAGE_PIXELS);
        let mut labels = Vec::with_capacity(indices.len());
        for &idx in indices {
            data.extend_from_slice(self.dataset.image(idx));
            labels.push(self.dataset.label(idx));
        }
        let images = Tensor::from_vec(
            data,
            (indices.len(), IMAGE_CHANNELS, IMAGE_SIDE, IMAGE_SIDE),
            &self.device,
        )
        .map_err(|e| DdpmError::Internal {
            message: format!("BatchIter build: {e}"),
        })?;
        Ok(Batch { images, labels })
    }
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Batch, DdpmError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.build(&self.order[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.order.len() - self.cursor).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}
