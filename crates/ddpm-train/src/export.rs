//! Sample image export.
//!
//! Every 28×28 tile is min-max scaled on its own to 0..=255 (a constant
//! tile renders black), then tiles are placed left to right with a
//! two-pixel black gutter and written as 8-bit grayscale PNG.

use std::path::Path;

use candle_core::{Device, Tensor};
use ddpm_core::{DdpmError, IMAGE_PIXELS, IMAGE_SIDE};
use image::GrayImage;

/// Black columns between adjacent tiles.
pub const GUTTER: usize = 2;

/// Number of frames in a trajectory strip.
pub const TRAJECTORY_FRAMES: usize = 8;

/// Scales one tile to bytes using its own min and max.
///
/// # Example
///
/// ```
/// use ddpm_train::export::tile_to_gray;
///
/// assert_eq!(tile_to_gray(&[-1.0, 0.0, 1.0]), vec![0, 128, 255]);
/// assert_eq!(tile_to_gray(&[0.3, 0.3]), vec![0, 0]);
/// ```
pub fn tile_to_gray(pixels: &[f32]) -> Vec<u8> {
    let (lo, hi) = pixels
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = hi - lo;
    if !(range.is_finite() && range > 0.0) {
        return vec![0; pixels.len()];
    }
    pixels
        .iter()
        .map(|&v| {
            if v.is_finite() {
                ((v - lo) / range * 255.0).round() as u8
            } else {
                0
            }
        })
        .collect()
}

/// Lays out tiles horizontally into one grayscale image.
///
/// # Errors
///
/// Returns [`DdpmError::Export`] if there are no tiles or a tile is not
/// 784 pixels.
pub fn compose_strip(tiles: &[Vec<f32>]) -> Result<GrayImage, DdpmError> {
    if tiles.is_empty() {
        return Err(DdpmError::Export {
            message: "compose_strip: no tiles".to_string(),
        });
    }
    let width = tiles.len() * IMAGE_SIDE + (tiles.len() - 1) * GUTTER;
    let mut strip = GrayImage::new(width as u32, IMAGE_SIDE as u32);

    for (k, tile) in tiles.iter().enumerate() {
        if tile.len() != IMAGE_PIXELS {
            return Err(DdpmError::Export {
                message: format!("tile {k} has {} pixels, expected {IMAGE_PIXELS}", tile.len()),
            });
        }
        let x0 = k * (IMAGE_SIDE + GUTTER);
        for (p, value) in tile_to_gray(tile).into_iter().enumerate() {
            let (row, col) = (p / IMAGE_SIDE, p % IMAGE_SIDE);
            strip.put_pixel((x0 + col) as u32, row as u32, image::Luma([value]));
        }
    }
    Ok(strip)
}

/// Splits a `(N, 1, 28, 28)` tensor into per-image pixel vectors on the host.
///
/// # Errors
///
/// Returns [`DdpmError::Export`] if the tensor does not hold whole images.
pub fn tensor_tiles(images: &Tensor) -> Result<Vec<Vec<f32>>, DdpmError> {
    let map_err = |e: candle_core::Error| DdpmError::Export {
        message: format!("tensor_tiles: {e}"),
    };
    let rows = images
        .to_device(&Device::Cpu)
        .and_then(|t| t.flatten_from(1))
        .and_then(|t| t.to_vec2::<f32>())
        .map_err(map_err)?;
    if let Some(bad) = rows.iter().find(|r| r.len() != IMAGE_PIXELS) {
        return Err(DdpmError::Export {
            message: format!("tensor_tiles: image has {} pixels, expected {IMAGE_PIXELS}", bad.len()),
        });
    }
    Ok(rows)
}

/// Which captured states make up a trajectory strip: seven evenly spaced
/// states (every fourth capture) and then the final one. Indices are
/// clamped for short trajectories.
///
/// # Example
///
/// ```
/// use ddpm_train::export::trajectory_frames;
///
/// assert_eq!(trajectory_frames(37), vec![4, 8, 12, 16, 20, 24, 28, 36]);
/// assert_eq!(trajectory_frames(5), vec![4, 4, 4, 4, 4, 4, 4, 4]);
/// assert!(trajectory_frames(0).is_empty());
/// ```
pub fn trajectory_frames(captured: usize) -> Vec<usize> {
    if captured == 0 {
        return Vec::new();
    }
    let last = captured - 1;
    (0..TRAJECTORY_FRAMES - 1)
        .map(|j| (4 * j + 4).min(last))
        .chain(std::iter::once(last))
        .collect()
}

/// Writes a 1×N strip of final samples.
///
/// # Errors
///
/// Returns [`DdpmError::Export`] if encoding fails or [`DdpmError::Io`] if
/// the file cannot be written.
pub fn write_samples(images: &Tensor, path: &Path) -> Result<(), DdpmError> {
    save_png(&compose_strip(&tensor_tiles(images)?)?, path)
}

/// Writes the trajectory strip of sample `index`.
///
/// # Errors
///
/// Returns [`DdpmError::Export`] if the trajectory is empty or `index` is
/// out of range.
pub fn write_trajectory(trajectory: &[Tensor], index: usize, path: &Path) -> Result<(), DdpmError> {
    let frames = trajectory_frames(trajectory.len());
    if frames.is_empty() {
        return Err(DdpmError::Export {
            message: "write_trajectory: no captured states".to_string(),
        });
    }
    let mut tiles = Vec::with_capacity(frames.len());
    for &f in &frames {
        let states = tensor_tiles(&trajectory[f])?;
        let tile = states.into_iter().nth(index).ok_or_else(|| DdpmError::Export {
            message: format!("write_trajectory: sample {index} out of range"),
        })?;
        tiles.push(tile);
    }
    save_png(&compose_strip(&tiles)?, path)
}

fn save_png(img: &GrayImage, path: &Path) -> Result<(), DdpmError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| DdpmError::io(parent, e))?;
    }
    img.save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| match e {
            image::ImageError::IoError(io) => DdpmError::io(path, io),
            other => DdpmError::Export {
                message: format!("{}: {other}", path.display()),
            },
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_ignores_non_finite_when_scaling() {
        let gray = tile_to_gray(&[0.0, f32::NAN, 2.0, 1.0]);
        assert_eq!(gray, vec![0, 0, 255, 128]);
    }

    #[test]
    fn strip_dimensions_include_gutters() {
        let tiles = vec![vec![0.5; IMAGE_PIXELS]; 10];
        let strip = compose_strip(&tiles).unwrap();
        assert_eq!(strip.width(), 10 * 28 + 9 * 2);
        assert_eq!(strip.height(), 28);
    }

    #[test]
    fn strip_places_tiles_left_to_right() {
        let mut bright = vec![0.0; IMAGE_PIXELS];
        bright[0] = 1.0;
        let dark = vec![0.0; IMAGE_PIXELS];
        let strip = compose_strip(&[dark, bright]).unwrap();
        assert_eq!(strip.get_pixel(0, 0).0, [0]);
        assert_eq!(strip.get_pixel(30, 0).0, [255]);
        // gutter stays black
        assert_eq!(strip.get_pixel(28, 0).0, [0]);
    }

    #[test]
    fn strip_rejects_bad_tiles() {
        assert!(compose_strip(&[]).is_err());
        assert!(compose_strip(&[vec![0.0; 10]]).is_err());
    }

    #[test]
    fn tensor_tiles_splits_batch() {
        let t = Tensor::arange(0f32, (2 * IMAGE_PIXELS) as f32, &Device::Cpu)
            .unwrap()
            .reshape((2, 1, 28, 28))
            .unwrap();
        let tiles = tensor_tiles(&t).unwrap();
        assert_eq!(tiles.len(), 2);
        assert_eq!(tiles[1][0], IMAGE_PIXELS as f32);
    }

    #[test]
    fn trajectory_frames_reference_length() {
        let frames = trajectory_frames(37);
        assert_eq!(frames.len(), TRAJECTORY_FRAMES);
        assert_eq!(*frames.last().unwrap(), 36);
    }

    #[test]
    fn writes_png_files() {
        let dir = tempfile::tempdir().unwrap();
        let images = Tensor::randn(0f32, 1f32, (3, 1, 28, 28), &Device::Cpu).unwrap();
        let path = dir.path().join("nested").join("samples.png");
        write_samples(&images, &path).unwrap();
        let decoded = image::open(&path).unwrap();
        assert_eq!(decoded.width(), 3 * 28 + 2 * 2);

        let trajectory: Vec<Tensor> = (0..9).map(|_| images.clone()).collect();
        let traj_path = dir.path().join("samples_t.png");
        write_trajectory(&trajectory, 0, &traj_path).unwrap();
        assert_eq!(image::open(&traj_path).unwrap().width(), 8 * 28 + 7 * 2);
    }

    #[test]
    fn trajectory_index_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let images = Tensor::zeros((1, 1, 28, 28), candle_core::DType::F32, &Device::Cpu).unwrap();
        let err = write_trajectory(&[images], 3, &dir.path().join("t.png")).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(write_trajectory(&[], 0, &dir.path().join("t.png")).is_err());
    }
}
