//! Layer constructors with fan-in scaled uniform initialisation: weights and
//! biases are drawn from U(-d, d), d = 1/sqrt(fan_in).

use candle_core::Result;
use candle_nn::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Init, Linear, VarBuilder};

fn uniform(fan_in: usize) -> Init {
    let d = 1.0 / (fan_in as f64).sqrt();
    Init::Uniform { lo: -d, up: d }
}

pub fn fc(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let init = uniform(in_dim);
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", init)?;
    let bias = vb.get_with_hints(out_dim, "bias", init)?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Square-kernel convolution without padding.
pub fn conv(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let init = uniform(in_channels * kernel * kernel);
    let weight = vb.get_with_hints((out_channels, in_channels, kernel, kernel), "weight", init)?;
    let bias = vb.get_with_hints(out_channels, "bias", init)?;
    let config = Conv2dConfig {
        stride,
        ..Default::default()
    };
    Ok(Conv2d::new(weight, Some(bias), config))
}

/// Transposed convolution. Fan-in is taken from the input side (the channels
/// being upsampled), matching the forward convolution it mirrors.
pub fn deconv(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    vb: VarBuilder,
) -> Result<ConvTranspose2d> {
    let init = uniform(in_channels * kernel * kernel);
    let weight = vb.get_with_hints((in_channels, out_channels, kernel, kernel), "weight", init)?;
    let bias = vb.get_with_hints(out_channels, "bias", init)?;
    let config = ConvTranspose2dConfig {
        stride,
        ..Default::default()
    };
    Ok(ConvTranspose2d::new(weight, Some(bias), config))
}

/// Spatial size after a padding-free convolution.
pub const fn conv_output_size(input: usize, kernel: usize, stride: usize) -> usize {
    (input - kernel) / stride + 1
}

/// Spatial size after a padding-free transposed convolution.
pub const fn deconv_output_size(input: usize, kernel: usize, stride: usize) -> usize {
    (input - 1) * stride + kernel
}
