//! UNet building blocks.
//!
//! Internal helpers return `candle_core::Result`; [`crate::unet::Unet`]
//! maps failures to [`ddpm_core::DdpmError`] at its public boundary.

use candle_core::{Result, Tensor};
use candle_nn::{
    batch_norm, conv2d, conv_transpose2d, linear, BatchNorm, BatchNormConfig, Conv2d,
    Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Linear, Module, VarBuilder,
};

/// Residual scaling used when adding the skip path.
const RES_SCALE: f64 = 1.414;

pub(crate) fn same_padding_3x3() -> Conv2dConfig {
    Conv2dConfig {
        padding: 1,
        stride: 1,
        ..Default::default()
    }
}

/// Conv3×3 → BatchNorm → GELU.
#[derive(Debug, Clone)]
struct ConvBnGelu {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBnGelu {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv: conv2d(in_channels, out_channels, 3, same_padding_3x3(), vb.pp("conv"))?,
            bn: batch_norm(out_channels, BatchNormConfig::default(), vb.pp("bn"))?,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.conv.forward(x)?.apply_t(&self.bn, train)?.gelu_erf()
    }
}

/// ResNet-style block of two conv stages.
///
/// With `is_res`, the output is `(skip + x2) / 1.414` where `skip` is the
/// input when channel counts match and the first stage's output otherwise.
#[derive(Debug, Clone)]
pub(crate) struct ResidualConvBlock {
    conv1: ConvBnGelu,
    conv2: ConvBnGelu,
    same_channels: bool,
    is_res: bool,
}

impl ResidualConvBlock {
    pub(crate) fn new(
        in_channels: usize,
        out_channels: usize,
        is_res: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            conv1: ConvBnGelu::new(in_channels, out_channels, vb.pp("conv1"))?,
            conv2: ConvBnGelu::new(out_channels, out_channels, vb.pp("conv2"))?,
            same_channels: in_channels == out_channels,
            is_res,
        })
    }

    pub(crate) fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x1 = self.conv1.forward_t(x, train)?;
        let x2 = self.conv2.forward_t(&x1, train)?;
        if !self.is_res {
            return Ok(x2);
        }
        let skip = if self.same_channels { x } else { &x1 };
        (skip + x2)?.affine(1.0 / RES_SCALE, 0.0)
    }
}

/// ResidualConvBlock followed by 2×2 max pooling.
#[derive(Debug, Clone)]
pub(crate) struct UnetDown {
    block: ResidualConvBlock,
}

impl UnetDown {
    pub(crate) fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            block: ResidualConvBlock::new(in_channels, out_channels, false, vb.pp("block"))?,
        })
    }

    pub(crate) fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.block.forward_t(x, train)?.max_pool2d(2)
    }
}

/// Concatenates the skip connection, upsamples ×2 and refines.
#[derive(Debug, Clone)]
pub(crate) struct UnetUp {
    up: ConvTranspose2d,
    block1: ResidualConvBlock,
    block2: ResidualConvBlock,
}

impl UnetUp {
    /// `in_channels` counts both `x` and `skip` channels.
    pub(crate) fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = ConvTranspose2dConfig {
            stride: 2,
            ..Default::default()
        };
        Ok(Self {
            up: conv_transpose2d(in_channels, out_channels, 2, cfg, vb.pp("up"))?,
            block1: ResidualConvBlock::new(out_channels, out_channels, false, vb.pp("block1"))?,
            block2: ResidualConvBlock::new(out_channels, out_channels, false, vb.pp("block2"))?,
        })
    }

    pub(crate) fn forward_t(&self, x: &Tensor, skip: &Tensor, train: bool) -> Result<Tensor> {
        let h = Tensor::cat(&[x, skip], 1)?;
        let h = self.up.forward(&h)?;
        let h = self.block1.forward_t(&h, train)?;
        self.block2.forward_t(&h, train)
    }
}

/// Two-layer MLP embedding: Linear → GELU → Linear.
#[derive(Debug, Clone)]
pub(crate) struct EmbedFc {
    input_dim: usize,
    l1: Linear,
    l2: Linear,
}

impl EmbedFc {
    pub(crate) fn new(input_dim: usize, emb_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            input_dim,
            l1: linear(input_dim, emb_dim, vb.pp("l1"))?,
            l2: linear(emb_dim, emb_dim, vb.pp("l2"))?,
        })
    }

    /// Accepts any shape whose element count is a multiple of `input_dim`;
    /// the result is `(N, emb_dim)`.
    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.reshape(((), self.input_dim))?;
        self.l1.forward(&x)?.gelu_erf()?.apply(&self.l2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn vb(var_map: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(var_map, DType::F32, &Device::Cpu)
    }

    fn ones(shape: &[usize]) -> Tensor {
        Tensor::ones(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn residual_block_changes_channels() {
        let var_map = VarMap::new();
        let block = ResidualConvBlock::new(1, 8, true, vb(&var_map)).unwrap();
        let out = block.forward_t(&ones(&[2, 1, 28, 28]), true).unwrap();
        assert_eq!(out.dims(), &[2, 8, 28, 28]);
    }

    #[test]
    fn residual_block_same_channels_keeps_shape() {
        let var_map = VarMap::new();
        let block = ResidualConvBlock::new(8, 8, true, vb(&var_map)).unwrap();
        let out = block.forward_t(&ones(&[2, 8, 7, 7]), false).unwrap();
        assert_eq!(out.dims(), &[2, 8, 7, 7]);
    }

    #[test]
    fn down_halves_resolution() {
        let var_map = VarMap::new();
        let down = UnetDown::new(8, 16, vb(&var_map)).unwrap();
        let out = down.forward_t(&ones(&[2, 8, 28, 28]), true).unwrap();
        assert_eq!(out.dims(), &[2, 16, 14, 14]);
    }

    #[test]
    fn up_doubles_resolution() {
        let var_map = VarMap::new();
        let up = UnetUp::new(16, 8, vb(&var_map)).unwrap();
        let x = ones(&[2, 8, 7, 7]);
        let skip = ones(&[2, 8, 7, 7]);
        let out = up.forward_t(&x, &skip, true).unwrap();
        assert_eq!(out.dims(), &[2, 8, 14, 14]);
    }

    #[test]
    fn embed_flattens_time_input() {
        let var_map = VarMap::new();
        let embed = EmbedFc::new(1, 16, vb(&var_map)).unwrap();
        let t = Tensor::from_vec(vec![0.5f32, 0.25, 1.0], (3, 1, 1, 1), &Device::Cpu).unwrap();
        let out = embed.forward(&t).unwrap();
        assert_eq!(out.dims(), &[3, 16]);
    }

    #[test]
    fn parameters_registered_under_prefix() {
        let var_map = VarMap::new();
        let _block = ResidualConvBlock::new(1, 8, true, vb(&var_map).pp("init")).unwrap();
        let names: Vec<String> = var_map.data().lock().unwrap().keys().cloned().collect();
        assert!(names.iter().any(|n| n == "init.conv1.conv.weight"));
        assert!(names.iter().any(|n| n == "init.conv2.bn.running_mean"));
    }
}
