//! IDX file format reader.
//!
//! Layout: a big-endian u32 magic (`0x0000_08NN` where NN is the number of
//! dimensions), one big-endian u32 per dimension, then the raw u8 payload.
//! Files ending in `.gz` are decompressed transparently.

use std::io::Read;
use std::path::Path;

use ddpm_core::DdpmError;
use flate2::read::GzDecoder;

/// Magic number of an unsigned-byte image file (3 dimensions).
pub const IMAGES_MAGIC: u32 = 0x0000_0803;

/// Magic number of an unsigned-byte label file (1 dimension).
pub const LABELS_MAGIC: u32 = 0x0000_0801;

/// A decoded IDX array of unsigned bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdxArray {
    /// Dimension sizes, outermost first.
    pub dims: Vec<usize>,
    /// Row-major payload; `data.len() == dims.iter().product()`.
    pub data: Vec<u8>,
}

/// Reads a file, gunzipping it when the name ends in `.gz`.
///
/// # Errors
///
/// Returns [`DdpmError::Io`] if the file cannot be read or decompressed.
pub fn read_maybe_gz(path: &Path) -> Result<Vec<u8>, DdpmError> {
    let raw = std::fs::read(path).map_err(|e| DdpmError::io(path, e))?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        let mut out = Vec::with_capacity(raw.len() * 4);
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| DdpmError::io(path, e))?;
        Ok(out)
    } else {
        Ok(raw)
    }
}

/// Parses an IDX byte buffer, checking the magic number.
///
/// # Errors
///
/// Returns [`DdpmError::Data`] if the magic does not match `expected_magic`
/// or the payload is shorter than the header promises.
///
/// # Example
///
/// ```
/// use ddpm_data::idx::{parse_idx, LABELS_MAGIC};
///
/// let bytes = [0, 0, 8, 1, 0, 0, 0, 3, 7, 2, 1];
/// let arr = parse_idx(&bytes, LABELS_MAGIC).unwrap();
/// assert_eq!(arr.dims, vec![3]);
/// assert_eq!(arr.data, vec![7, 2, 1]);
/// ```
pub fn parse_idx(bytes: &[u8], expected_magic: u32) -> Result<IdxArray, DdpmError> {
    let data_err = |message: String| DdpmError::Data { message };

    let magic = read_be_u32(bytes, 0)
        .ok_or_else(|| data_err("idx: file shorter than magic header".into()))?;
    if magic != expected_magic {
        return Err(data_err(format!(
            "idx: bad magic {magic:#010x}, expected {expected_magic:#010x}"
        )));
    }

    let ndims = (magic & 0xff) as usize;
    let mut dims = Vec::with_capacity(ndims);
    for d in 0..ndims {
        let size = read_be_u32(bytes, 4 + 4 * d)
            .ok_or_else(|| data_err(format!("idx: truncated header at dimension {d}")))?;
        dims.push(size as usize);
    }

    let header_len = 4 + 4 * ndims;
    let payload_len = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| data_err("idx: header dimensions overflow".into()))?;
    let payload = &bytes[header_len..];
    if payload.len() < payload_len {
        return Err(data_err(format!(
            "idx: truncated payload, expected {payload_len} bytes, found {}",
            payload.len()
        )));
    }

    Ok(IdxArray {
        dims,
        data: payload[..payload_len].to_vec(),
    })
}

fn read_be_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let chunk = bytes.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}
