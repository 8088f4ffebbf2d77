//! Noise-prediction UNet for 28×28 images.
//!
//! ```text
//! x ─ init_conv ─┬─ down1 (28→14) ─┬─ down2 (14→7) ─ to_vec (7→1)
//!                │                 │                     │
//!                │                 │              up0 (1→7) + temb1(t)
//!                │                 └──────────── up1 (7→14) + temb2(t)
//!                │                                       │
//!                └─────────────── cat ─── up2 (14→28) ── out ─→ ε̂
//! ```
//!
//! Channel widths: `n_feat` at full resolution, `2·n_feat` at 7×7.
//! Time enters as `t / T` through two small MLPs whose outputs are added
//! channel-wise before each upsampling stage.

use candle_core::{DType, Device, Tensor};
use candle_nn::{
    conv2d, conv_transpose2d, group_norm, Conv2d, ConvTranspose2d, ConvTranspose2dConfig,
    GroupNorm, Module, VarBuilder, VarMap,
};
use ddpm_core::{DdpmError, IMAGE_SIDE};

use crate::blocks::{same_padding_3x3, EmbedFc, ResidualConvBlock, UnetDown, UnetUp};

const NUM_GROUPS: usize = 8;
const GROUP_NORM_EPS: f64 = 1e-5;
/// Spatial size at the bottleneck (28 / 2 / 2).
const BOTTLENECK_SIDE: usize = IMAGE_SIDE / 4;

/// UNet that predicts the noise in `x_t` given the normalized timestep.
///
/// # Example
///
/// ```
/// use candle_core::{DType, Device, Tensor};
/// use candle_nn::VarMap;
/// use ddpm_model::Unet;
///
/// let device = Device::Cpu;
/// let var_map = VarMap::new();
/// let unet = Unet::new_trainable(&var_map, 1, 8, &device).unwrap();
///
/// let x = Tensor::zeros((2, 1, 28, 28), DType::F32, &device).unwrap();
/// let t = Tensor::new(&[[0.5f32], [0.1]], &device).unwrap();
/// let eps = unet.forward_t(&x, &t, false).unwrap();
/// assert_eq!(eps.dims(), &[2, 1, 28, 28]);
/// ```
pub struct Unet {
    init_conv: ResidualConvBlock,
    down1: UnetDown,
    down2: UnetDown,
    timeembed1: EmbedFc,
    timeembed2: EmbedFc,
    up0_conv: ConvTranspose2d,
    up0_norm: GroupNorm,
    up1: UnetUp,
    up2: UnetUp,
    out_conv1: Conv2d,
    out_norm: GroupNorm,
    out_conv2: Conv2d,
    in_channels: usize,
    n_feat: usize,
    param_count: usize,
    device: Device,
}

impl std::fmt::Debug for Unet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Unet({}→{}→{}, {:.2}M params, device={:?})",
            self.in_channels,
            self.n_feat,
            2 * self.n_feat,
            self.param_count as f64 / 1_000_000.0,
            self.device
        )
    }
}

impl Unet {
    /// Creates a trainable UNet whose parameters are registered in `var_map`
    /// under the `unet.` prefix.
    ///
    /// # Errors
    ///
    /// Returns [`DdpmError::InvalidConfig`] if `n_feat` is not a positive
    /// multiple of 8, and [`DdpmError::Internal`] if parameter creation fails.
    pub fn new_trainable(
        var_map: &VarMap,
        in_channels: usize,
        n_feat: usize,
        device: &Device,
    ) -> Result<Self, DdpmError> {
        if n_feat == 0 || n_feat % NUM_GROUPS != 0 {
            return Err(DdpmError::InvalidConfig {
                message: format!("Unet: n_feat must be a positive multiple of {NUM_GROUPS}, got {n_feat}"),
            });
        }
        if in_channels == 0 {
            return Err(DdpmError::InvalidConfig {
                message: "Unet: in_channels must be > 0".to_string(),
            });
        }

        let map_err = |e: candle_core::Error| DdpmError::Internal {
            message: format!("Unet new_trainable: {e}"),
        };

        let vb = VarBuilder::from_varmap(var_map, DType::F32, device).pp("unet");
        let n = n_feat;

        let init_conv =
            ResidualConvBlock::new(in_channels, n, true, vb.pp("init_conv")).map_err(map_err)?;
        let down1 = UnetDown::new(n, n, vb.pp("down1")).map_err(map_err)?;
        let down2 = UnetDown::new(n, 2 * n, vb.pp("down2")).map_err(map_err)?;

        let timeembed1 = EmbedFc::new(1, 2 * n, vb.pp("timeembed1")).map_err(map_err)?;
        let timeembed2 = EmbedFc::new(1, n, vb.pp("timeembed2")).map_err(map_err)?;

        let up0_cfg = ConvTranspose2dConfig {
            stride: BOTTLENECK_SIDE,
            ..Default::default()
        };
        let up0_conv = conv_transpose2d(2 * n, 2 * n, BOTTLENECK_SIDE, up0_cfg, vb.pp("up0.conv"))
            .map_err(map_err)?;
        let up0_norm =
            group_norm(NUM_GROUPS, 2 * n, GROUP_NORM_EPS, vb.pp("up0.norm")).map_err(map_err)?;

        let up1 = UnetUp::new(4 * n, n, vb.pp("up1")).map_err(map_err)?;
        let up2 = UnetUp::new(2 * n, n, vb.pp("up2")).map_err(map_err)?;

        let out_conv1 =
            conv2d(2 * n, n, 3, same_padding_3x3(), vb.pp("out.conv1")).map_err(map_err)?;
        let out_norm = group_norm(NUM_GROUPS, n, GROUP_NORM_EPS, vb.pp("out.norm")).map_err(map_err)?;
        let out_conv2 =
            conv2d(n, in_channels, 3, same_padding_3x3(), vb.pp("out.conv2")).map_err(map_err)?;

        let param_count = var_map
            .all_vars()
            .iter()
            .map(|v| v.elem_count())
            .sum();

        Ok(Self {
            init_conv,
            down1,
            down2,
            timeembed1,
            timeembed2,
            up0_conv,
            up0_norm,
            up1,
            up2,
            out_conv1,
            out_norm,
            out_conv2,
            in_channels,
            n_feat,
            param_count,
            device: device.clone(),
        })
    }

    /// Predicts the noise in `x`.
    ///
    /// - `x`: `(B, in_channels, 28, 28)` noisy images
    /// - `t`: `B` normalized timesteps `t / T`, any shape with `B` elements
    /// - `train`: use batch statistics (and update running ones) in BatchNorm
    ///
    /// # Errors
    ///
    /// Returns [`DdpmError::Internal`] if shapes are incompatible.
    pub fn forward_t(&self, x: &Tensor, t: &Tensor, train: bool) -> Result<Tensor, DdpmError> {
        self.forward_inner(x, t, train).map_err(|e| DdpmError::Internal {
            message: format!("Unet forward: {e}"),
        })
    }

    fn forward_inner(&self, x: &Tensor, t: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let n = self.n_feat;

        let x = self.init_conv.forward_t(x, train)?;
        let down1 = self.down1.forward_t(&x, train)?;
        let down2 = self.down2.forward_t(&down1, train)?;
        let hiddenvec = down2.avg_pool2d(BOTTLENECK_SIDE)?.gelu_erf()?;

        let temb1 = self.timeembed1.forward(t)?.reshape(((), 2 * n, 1, 1))?;
        let temb2 = self.timeembed2.forward(t)?.reshape(((), n, 1, 1))?;

        let up1 = self
            .up0_norm
            .forward(&self.up0_conv.forward(&hiddenvec)?)?
            .relu()?;
        let up2 = self
            .up1
            .forward_t(&up1.broadcast_add(&temb1)?, &down2, train)?;
        let up3 = self
            .up2
            .forward_t(&up2.broadcast_add(&temb2)?, &down1, train)?;

        let h = Tensor::cat(&[&up3, &x], 1)?;
        let h = self.out_norm.forward(&self.out_conv1.forward(&h)?)?.relu()?;
        self.out_conv2.forward(&h)
    }

    /// Number of trainable scalars (including BatchNorm running statistics).
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Base feature width.
    pub fn n_feat(&self) -> usize {
        self.n_feat
    }

    /// Returns the device this UNet operates on.
    pub fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_unet(var_map: &VarMap) -> Unet {
        Unet::new_trainable(var_map, 1, 8, &Device::Cpu).unwrap()
    }

    fn time(values: &[f32]) -> Tensor {
        Tensor::from_slice(values, (values.len(), 1), &Device::Cpu).unwrap()
    }

    #[test]
    fn output_matches_input_shape() {
        let var_map = VarMap::new();
        let unet = small_unet(&var_map);
        let x = Tensor::randn(0f32, 1f32, (3, 1, 28, 28), &Device::Cpu).unwrap();
        let out = unet.forward_t(&x, &time(&[0.1, 0.5, 1.0]), true).unwrap();
        assert_eq!(out.dims(), &[3, 1, 28, 28]);
    }

    #[test]
    fn output_is_finite_in_eval_mode() {
        let var_map = VarMap::new();
        let unet = small_unet(&var_map);
        let x = Tensor::randn(0f32, 1f32, (2, 1, 28, 28), &Device::Cpu).unwrap();
        let out = unet.forward_t(&x, &time(&[0.3, 0.9]), false).unwrap();
        let flat = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(flat.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn timestep_changes_prediction() {
        let var_map = VarMap::new();
        let unet = small_unet(&var_map);
        let x = Tensor::randn(0f32, 1f32, (1, 1, 28, 28), &Device::Cpu).unwrap();
        let a = unet.forward_t(&x, &time(&[0.05]), false).unwrap();
        let b = unet.forward_t(&x, &time(&[0.95]), false).unwrap();
        let diff = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!(diff > 0.0, "time embedding should influence the output");
    }

    #[test]
    fn rejects_bad_widths() {
        let var_map = VarMap::new();
        assert!(Unet::new_trainable(&var_map, 1, 12, &Device::Cpu).is_err());
        assert!(Unet::new_trainable(&var_map, 1, 0, &Device::Cpu).is_err());
        assert!(Unet::new_trainable(&var_map, 0, 8, &Device::Cpu).is_err());
    }

    #[test]
    fn wrong_image_size_is_error() {
        let var_map = VarMap::new();
        let unet = small_unet(&var_map);
        let x = Tensor::zeros((1, 1, 32, 32), DType::F32, &Device::Cpu).unwrap();
        assert!(unet.forward_t(&x, &time(&[0.5]), false).is_err());
    }

    #[test]
    fn debug_format_readable() {
        let var_map = VarMap::new();
        let unet = small_unet(&var_map);
        let debug = format!("{unet:?}");
        assert!(debug.contains("Unet(1→8→16"));
        assert!(unet.param_count() > 0);
    }
}
