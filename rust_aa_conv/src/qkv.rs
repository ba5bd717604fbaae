use crate::config::AugConvConfig;
use crate::error::{AugConvError, Result};
use crate::heads::split_heads_2d;
use crate::shape::dims;
use tch::{Tensor, nn};

/// Queries, keys and values with flattened spatial axes, as consumed by the
/// attention core. Shapes are `[B, N_h, H*W, d]`.
#[derive(Debug)]
pub struct FlatQkv {
    /// Already scaled by `per_head_key_dim^-0.5`.
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    pub batch: i64,
    pub height: i64,
    pub width: i64,
}

/// A single 1x1 projection producing `2 * key_dim + value_dim` channels,
/// split into query, key and value.
#[derive(Debug)]
pub struct QkvProjection {
    proj: nn::Linear,
    in_channels: i64,
    key_dim: i64,
    value_dim: i64,
    num_heads: i64,
    query_scale: f64,
}

impl QkvProjection {
    /// The projection is a linear map on the channel axis of a channels-last
    /// map, i.e. a 1x1 convolution with bias.
    pub fn new(p: &nn::Path, in_channels: i64, cfg: &AugConvConfig) -> Self {
        let proj = nn::linear(
            p,
            in_channels,
            2 * cfg.key_dim + cfg.value_dim,
            Default::default(),
        );
        Self {
            proj,
            in_channels,
            key_dim: cfg.key_dim,
            value_dim: cfg.value_dim,
            num_heads: cfg.num_heads,
            query_scale: cfg.query_scale(),
        }
    }

    /// Project `[B, H, W, C]` features and return flattened per-head q/k/v.
    pub fn compute_flat_qkv(&self, xs: &Tensor) -> Result<FlatQkv> {
        let [batch, height, width, channels] = dims::<4>(xs, "compute_flat_qkv")?;
        if channels != self.in_channels {
            return Err(AugConvError::shape_mismatch(
                "compute_flat_qkv",
                format!("{} input channels", self.in_channels),
                xs.size(),
            ));
        }
        let qkv = xs.apply(&self.proj);
        let (dk, dv) = (self.key_dim, self.value_dim);

        let q = split_heads_2d(&qkv.narrow(3, 0, dk), self.num_heads)?;
        let k = split_heads_2d(&qkv.narrow(3, dk, dk), self.num_heads)?;
        let v = split_heads_2d(&qkv.narrow(3, 2 * dk, dv), self.num_heads)?;
        let q = q * self.query_scale;

        let positions = height * width;
        let dkh = dk / self.num_heads;
        let dvh = dv / self.num_heads;
        Ok(FlatQkv {
            q: q.reshape([batch, self.num_heads, positions, dkh]),
            k: k.reshape([batch, self.num_heads, positions, dkh]),
            v: v.reshape([batch, self.num_heads, positions, dvh]),
            batch,
            height,
            width,
        })
    }
}
