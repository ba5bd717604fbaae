use crate::attention::MultiHeadAttention2d;
use crate::config::AugConvConfig;
use crate::error::{AugConvError, Result};
use crate::shape::dims;
use tch::{Tensor, nn};
use tracing::{debug, trace};

/// Attention-augmented 2D convolution.
///
/// A plain convolution producing `output_channels - value_dim` channels runs
/// next to multi-head self-attention producing `value_dim` channels; the two
/// are concatenated along the channel axis. Inputs and outputs are
/// channels-last `[B, H, W, C]`, and the output keeps the input's extent.
///
/// Parameters are registered under the given path and owned by the caller's
/// `VarStore`; the layer only reads them.
#[derive(Debug)]
pub struct AugmentedConv2d {
    conv: nn::Conv2D,
    attention: MultiHeadAttention2d,
    config: AugConvConfig,
    in_channels: i64,
    spatial: (i64, i64),
}

impl AugmentedConv2d {
    /// Build a layer for `[B, spatial.0, spatial.1, in_channels]` inputs.
    ///
    /// The configuration and geometry are validated before any parameter is
    /// created, so a rejected layer leaves the `VarStore` untouched.
    pub fn new(
        p: &nn::Path,
        in_channels: i64,
        spatial: (i64, i64),
        config: &AugConvConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (height, width) = spatial;
        if in_channels < 1 {
            return Err(AugConvError::configuration("in_channels", "must be >= 1"));
        }
        if height < 1 || width < 1 {
            return Err(AugConvError::configuration(
                "spatial",
                format!("{height}x{width} is empty"),
            ));
        }
        Self::check_kernel_fits(config, height, width)?;

        debug!(
            in_channels,
            height,
            width,
            conv_channels = config.conv_channels(),
            value_dim = config.value_dim,
            num_heads = config.num_heads,
            relative = config.use_relative_position,
            "building augmented conv layer"
        );

        let conv = nn::conv2d(
            p / "conv",
            in_channels,
            config.conv_channels(),
            config.kernel_size,
            nn::ConvConfig {
                padding: config.padding.amount(config.kernel_size),
                ..Default::default()
            },
        );
        let attention =
            MultiHeadAttention2d::new(&(p / "attention"), in_channels, spatial, config);

        Ok(Self {
            conv,
            attention,
            config: config.clone(),
            in_channels,
            spatial,
        })
    }

    /// `[B, H, W, in_channels]` -> `[B, H, W, output_channels]`.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_with_attention(xs).map(|(out, _)| out)
    }

    /// Like [`forward`](Self::forward), also returning the attention weights
    /// `[B, N_h, H*W, H*W]`.
    pub fn forward_with_attention(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let (height, width) = self.check_input(xs)?;

        // conv branch runs channels-first
        let conv_out = xs
            .permute([0, 3, 1, 2])
            .apply(&self.conv)
            .permute([0, 2, 3, 1]);
        let [_, conv_h, conv_w, _] = dims::<4>(&conv_out, "augmented_conv2d")?;
        trace!(conv_h, conv_w, height, width, "resizing conv branch");
        let conv_out = resize_bilinear(&conv_out, (conv_h, conv_w), (height, width));

        let attn = self.attention.forward(xs)?;
        let output = Tensor::cat(&[conv_out, attn.output], 3);
        Ok((output, attn.weights))
    }

    fn check_input(&self, xs: &Tensor) -> Result<(i64, i64)> {
        let [batch, height, width, channels] = dims::<4>(xs, "augmented_conv2d")?;
        if channels != self.in_channels {
            return Err(AugConvError::shape_mismatch(
                "augmented_conv2d",
                format!("{} input channels", self.in_channels),
                xs.size(),
            ));
        }
        if let Some(expected) = self.config.batch_size {
            if batch != expected {
                return Err(AugConvError::shape_mismatch(
                    "augmented_conv2d",
                    format!("batch of {expected}"),
                    xs.size(),
                ));
            }
        }
        if self.config.use_relative_position && (height, width) != self.spatial {
            return Err(AugConvError::shape_mismatch(
                "augmented_conv2d",
                format!("spatial extent {}x{}", self.spatial.0, self.spatial.1),
                xs.size(),
            ));
        }
        if Self::check_kernel_fits(&self.config, height, width).is_err() {
            return Err(AugConvError::shape_mismatch(
                "augmented_conv2d",
                format!("spatial extent of at least {0}x{0}", self.config.kernel_size),
                xs.size(),
            ));
        }
        Ok((height, width))
    }

    fn check_kernel_fits(config: &AugConvConfig, height: i64, width: i64) -> Result<()> {
        let pad = 2 * config.padding.amount(config.kernel_size);
        if config.kernel_size > height.min(width) + pad {
            return Err(AugConvError::configuration(
                "kernel_size",
                format!(
                    "{} does not fit a {height}x{width} input",
                    config.kernel_size
                ),
            ));
        }
        Ok(())
    }

    pub fn attention(&self) -> &MultiHeadAttention2d {
        &self.attention
    }

    pub fn config(&self) -> &AugConvConfig {
        &self.config
    }
}

/// Bilinear resize of a channels-last map with asymmetric sampling,
/// `src = dst * in / out`, clamping the upper neighbour at the border.
fn resize_bilinear(xs: &Tensor, from: (i64, i64), to: (i64, i64)) -> Tensor {
    let xs = resize_axis(xs, 1, from.0, to.0);
    resize_axis(&xs, 2, from.1, to.1)
}

fn resize_axis(xs: &Tensor, axis: usize, in_len: i64, out_len: i64) -> Tensor {
    if in_len == out_len {
        return xs.shallow_clone();
    }
    let scale = in_len as f64 / out_len as f64;
    let mut lower = Vec::with_capacity(out_len as usize);
    let mut upper = Vec::with_capacity(out_len as usize);
    let mut frac = Vec::with_capacity(out_len as usize);
    for dst in 0..out_len {
        let src = dst as f64 * scale;
        let lo = (src.floor() as i64).min(in_len - 1);
        lower.push(lo);
        upper.push((lo + 1).min(in_len - 1));
        frac.push(src - lo as f64);
    }

    let device = xs.device();
    let mut shape = [1_i64; 4];
    shape[axis] = out_len;
    let frac = Tensor::from_slice(&frac)
        .to_kind(xs.kind())
        .to_device(device)
        .reshape(shape);
    let dim = axis as i64;
    let lo = xs.index_select(dim, &Tensor::from_slice(&lower).to_device(device));
    let hi = xs.index_select(dim, &Tensor::from_slice(&upper).to_device(device));
    &lo + (&hi - &lo) * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConvPadding;
    use tch::{Device, Kind};

    #[test]
    fn reference_scenario_output_shape() -> Result<()> {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let layer = AugmentedConv2d::new(&vs.root(), 16, (8, 8), &AugConvConfig::default())?;
        let xs = Tensor::randn([2, 8, 8, 16], (Kind::Float, Device::Cpu));
        let out = layer.forward(&xs)?;
        assert_eq!(out.size(), vec![2, 8, 8, 16]);
        Ok(())
    }

    #[test]
    fn indivisible_key_dim_fails_before_any_parameter() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cfg = AugConvConfig {
            key_dim: 7,
            ..Default::default()
        };
        let err = AugmentedConv2d::new(&vs.root(), 16, (8, 8), &cfg).err();
        assert!(err.is_some_and(|e| e.is_configuration()));
        assert!(vs.variables().is_empty());
    }

    #[test]
    fn output_keeps_extent_for_all_paddings() -> Result<()> {
        tch::manual_seed(1);
        for (padding, kernel) in [
            (ConvPadding::Valid, 3),
            (ConvPadding::Valid, 5),
            (ConvPadding::Same, 3),
            (ConvPadding::Same, 4),
        ] {
            let vs = nn::VarStore::new(Device::Cpu);
            let cfg = AugConvConfig {
                output_channels: 12,
                kernel_size: kernel,
                key_dim: 4,
                value_dim: 4,
                num_heads: 2,
                padding,
                ..Default::default()
            };
            let layer = AugmentedConv2d::new(&vs.root(), 3, (6, 5), &cfg)?;
            let xs = Tensor::randn([1, 6, 5, 3], (Kind::Float, Device::Cpu));
            assert_eq!(layer.forward(&xs)?.size(), vec![1, 6, 5, 12]);
        }
        Ok(())
    }

    #[test]
    fn resize_samples_at_dst_times_in_over_out() {
        let row = Tensor::from_slice(&[0.0f32, 1.0]).reshape([1, 1, 2, 1]);
        let wide = resize_bilinear(&row, (1, 2), (1, 4));
        let want = Tensor::from_slice(&[0.0f32, 0.5, 1.0, 1.0]).reshape([1, 1, 4, 1]);
        assert!(wide.allclose(&want, 1e-6, 1e-6, false));

        let col = Tensor::from_slice(&[0.0f32, 2.0]).reshape([1, 2, 1, 1]);
        let tall = resize_bilinear(&col, (2, 1), (3, 1));
        let want = Tensor::from_slice(&[0.0f32, 4.0 / 3.0, 2.0]).reshape([1, 3, 1, 1]);
        assert!(tall.allclose(&want, 1e-6, 1e-6, false));
    }

    #[test]
    fn resize_to_same_extent_is_identity() {
        let xs = Tensor::randn([2, 3, 5, 4], (Kind::Float, Device::Cpu));
        assert!(resize_bilinear(&xs, (3, 5), (3, 5)).equal(&xs));
    }

    #[test]
    fn double_precision_store_runs_in_double() -> Result<()> {
        tch::manual_seed(3);
        let mut vs = nn::VarStore::new(Device::Cpu);
        let layer = AugmentedConv2d::new(&vs.root(), 16, (6, 6), &AugConvConfig::default())?;
        vs.double();
        let xs = Tensor::randn([2, 6, 6, 16], (Kind::Double, Device::Cpu));
        let (out, weights) = layer.forward_with_attention(&xs)?;
        assert_eq!(out.size(), vec![2, 6, 6, 16]);
        assert_eq!(out.kind(), Kind::Double);
        assert_eq!(weights.kind(), Kind::Double);
        Ok(())
    }

    #[test]
    fn channels_are_conv_then_attention() -> Result<()> {
        tch::manual_seed(2);
        let vs = nn::VarStore::new(Device::Cpu);
        let layer = AugmentedConv2d::new(&vs.root(), 16, (4, 4), &AugConvConfig::default())?;
        let xs = Tensor::randn([2, 4, 4, 16], (Kind::Float, Device::Cpu));
        let out = layer.forward(&xs)?;
        let attn = layer.attention().forward(&xs)?;
        assert!(out.narrow(3, 8, 8).allclose(&attn.output, 1e-6, 1e-6, false));
        Ok(())
    }

    #[test]
    fn kernel_larger_than_input_is_rejected() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cfg = AugConvConfig {
            kernel_size: 5,
            ..Default::default()
        };
        let err = AugmentedConv2d::new(&vs.root(), 16, (4, 4), &cfg).err();
        assert!(err.is_some_and(|e| e.is_configuration()));
    }

    #[test]
    fn wrong_rank_and_channels_are_shape_mismatches() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let layer = AugmentedConv2d::new(&vs.root(), 16, (4, 4), &AugConvConfig::default())?;
        let rank3 = Tensor::zeros([4, 4, 16], (Kind::Float, Device::Cpu));
        let wrong_c = Tensor::zeros([1, 4, 4, 15], (Kind::Float, Device::Cpu));
        let wrong_hw = Tensor::zeros([1, 5, 4, 16], (Kind::Float, Device::Cpu));
        for xs in [rank3, wrong_c, wrong_hw] {
            let err = layer.forward(&xs).err();
            assert!(err.is_some_and(|e| e.is_shape_mismatch()));
        }
        Ok(())
    }

    #[test]
    fn parameter_names_are_stable() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let cfg = AugConvConfig::default();
        let _layer = AugmentedConv2d::new(&(vs.root() / "aug"), 16, (8, 8), &cfg)?;
        let variables = vs.variables();
        for name in [
            "aug.conv.weight",
            "aug.conv.bias",
            "aug.attention.qkv.weight",
            "aug.attention.output.weight",
            "aug.attention.relative.key_rel_w",
            "aug.attention.relative.key_rel_h",
        ] {
            assert!(variables.contains_key(name), "missing {name}");
        }
        Ok(())
    }
}
