use crate::config::AugConvConfig;
use crate::error::{AugConvError, Result};
use crate::heads::combine_heads_2d;
use crate::qkv::QkvProjection;
use crate::relative::RelativeLogits;
use crate::shape::dims;
use tch::{Tensor, nn};
use tracing::trace;

/// Result of one attention pass.
#[derive(Debug)]
pub struct AttentionOutput {
    /// `[B, H, W, value_dim]`
    pub output: Tensor,
    /// Softmax weights `[B, N_h, H*W, H*W]`; each row sums to 1.
    pub weights: Tensor,
}

/// Multi-head self-attention over every position of a `[B, H, W, C]` map,
/// optionally biased by learned relative positions.
#[derive(Debug)]
pub struct MultiHeadAttention2d {
    qkv: QkvProjection,
    relative: Option<RelativeLogits>,
    output: nn::Linear,
    num_heads: i64,
    per_head_value_dim: i64,
    batch_size: Option<i64>,
}

impl MultiHeadAttention2d {
    /// `spatial` is only used to size the relative-position tables.
    pub fn new(
        p: &nn::Path,
        in_channels: i64,
        spatial: (i64, i64),
        cfg: &AugConvConfig,
    ) -> Self {
        let qkv = QkvProjection::new(&(p / "qkv"), in_channels, cfg);
        let relative = cfg.use_relative_position.then(|| {
            RelativeLogits::new(
                &(p / "relative"),
                spatial.0,
                spatial.1,
                cfg.num_heads,
                cfg.per_head_key_dim(),
            )
        });
        let output = nn::linear(p / "output", cfg.value_dim, cfg.value_dim, Default::default());
        Self {
            qkv,
            relative,
            output,
            num_heads: cfg.num_heads,
            per_head_value_dim: cfg.per_head_value_dim(),
            batch_size: cfg.batch_size,
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Result<AttentionOutput> {
        let [batch, _, _, _] = dims::<4>(xs, "attention")?;
        if let Some(expected) = self.batch_size {
            if expected != batch {
                return Err(AugConvError::shape_mismatch(
                    "attention",
                    format!("batch of {expected}"),
                    xs.size(),
                ));
            }
        }
        let flat = self.qkv.compute_flat_qkv(xs)?;

        let mut logits = flat.q.matmul(&flat.k.transpose(-2, -1));
        if let Some(relative) = &self.relative {
            let (rel_h, rel_w) = relative.relative_logits(&flat.q, flat.height, flat.width)?;
            logits = logits + rel_h + rel_w;
        }
        trace!(logits = ?logits.size(), relative = self.relative.is_some(), "attention logits");

        let weights = logits.softmax(-1, logits.kind());
        let attn = weights.matmul(&flat.v).reshape([
            batch,
            self.num_heads,
            flat.height,
            flat.width,
            self.per_head_value_dim,
        ]);
        let output = combine_heads_2d(&attn)?.apply(&self.output);
        Ok(AttentionOutput { output, weights })
    }

    pub fn qkv(&self) -> &QkvProjection {
        &self.qkv
    }

    pub fn relative(&self) -> Option<&RelativeLogits> {
        self.relative.as_ref()
    }
}
