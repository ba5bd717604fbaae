use crate::error::{AugConvError, Result};
use crate::shape::dims;
use tch::{Tensor, nn};

/// Final permutation of the tiled width-axis logits
/// `[B, N_h, qH, kH, qW, kW]` -> `[B, N_h, qH, qW, kH, kW]`.
pub const WIDTH_TRANSPOSE: [i64; 6] = [0, 1, 2, 4, 3, 5];

/// Final permutation of the tiled height-axis logits
/// `[B, N_h, qW, kW, qH, kH]` -> `[B, N_h, qH, qW, kH, kW]`.
pub const HEIGHT_TRANSPOSE: [i64; 6] = [0, 1, 4, 2, 5, 3];

/// Convert `[B, N, L, 2L-1]` relative logits into `[B, N, L, L]` absolute
/// logits, `abs[.., i, j] == rel[.., i, j - i + L - 1]`, by padding and
/// reshaping alone.
pub fn rel_to_abs(xs: &Tensor) -> Result<Tensor> {
    let [b, n, l, m] = dims::<4>(xs, "rel_to_abs")?;
    if l < 1 || m != 2 * l - 1 {
        return Err(AugConvError::shape_mismatch(
            "rel_to_abs",
            format!("last axis of 2 * {l} - 1"),
            xs.size(),
        ));
    }
    let options = (xs.kind(), xs.device());

    // [B, N, L, 2L]
    let col_pad = Tensor::zeros([b, n, l, 1], options);
    let padded = Tensor::cat(&[xs, &col_pad], 3);

    // [B, N, 2L^2 + L - 1]
    let flat = padded.reshape([b, n, l * 2 * l]);
    let tail_pad = Tensor::zeros([b, n, l - 1], options);
    let flat = Tensor::cat(&[&flat, &tail_pad], 2);

    Ok(flat
        .reshape([b, n, l + 1, 2 * l - 1])
        .narrow(2, 0, l)
        .narrow(3, l - 1, l))
}

/// Relative logits along the last spatial axis of `q`.
///
/// `q` is `[B, N_h, H*W, d]` laid out with `W` as the fast axis and `rel_k`
/// is `[2W-1, d]`. The result is `[B, N_h, H*W, H*W]` after applying
/// `transpose` to the tiled `[B, N_h, H, H, W, W]` tensor.
pub fn relative_logits_1d(
    q: &Tensor,
    rel_k: &Tensor,
    height: i64,
    width: i64,
    num_heads: i64,
    transpose: [i64; 6],
) -> Result<Tensor> {
    let [_, heads, positions, d] = dims::<4>(q, "relative_logits_1d")?;
    if heads != num_heads {
        return Err(AugConvError::shape_mismatch(
            "relative_logits_1d",
            format!("{num_heads} heads"),
            q.size(),
        ));
    }
    let [offsets, rel_d] = dims::<2>(rel_k, "relative_logits_1d")?;
    if positions != height * width || offsets != 2 * width - 1 || rel_d != d {
        return Err(AugConvError::shape_mismatch(
            "relative_logits_1d",
            format!(
                "queries over {height}x{width} positions and a [{}, {d}] table",
                2 * width - 1
            ),
            rel_k.size(),
        ));
    }

    // einsum("bhsd,md->bhsm")
    let rel = q.matmul(&rel_k.tr());
    let rel = rel.reshape([-1, num_heads * height, width, 2 * width - 1]);
    let rel = rel_to_abs(&rel)?;
    let rel = rel.reshape([-1, num_heads, height, width, width]);
    let rel = rel.unsqueeze(3).repeat([1, 1, 1, height, 1, 1]);
    Ok(rel
        .permute(transpose)
        .reshape([-1, num_heads, height * width, height * width]))
}

/// Learned relative-position embeddings for one fixed spatial extent.
///
/// Both tables are shared across heads and registered as `key_rel_w`
/// (`[2W-1, d_kh]`) and `key_rel_h` (`[2H-1, d_kh]`) under the given path.
#[derive(Debug)]
pub struct RelativeLogits {
    key_rel_w: Tensor,
    key_rel_h: Tensor,
    height: i64,
    width: i64,
    num_heads: i64,
}

impl RelativeLogits {
    /// Initialised from `N(0, per_head_key_dim^-0.5)`.
    pub fn new(
        p: &nn::Path,
        height: i64,
        width: i64,
        num_heads: i64,
        per_head_key_dim: i64,
    ) -> Self {
        let init = nn::Init::Randn {
            mean: 0.0,
            stdev: (per_head_key_dim as f64).powf(-0.5),
        };
        let key_rel_w = p.var("key_rel_w", &[2 * width - 1, per_head_key_dim], init);
        let key_rel_h = p.var("key_rel_h", &[2 * height - 1, per_head_key_dim], init);
        Self {
            key_rel_w,
            key_rel_h,
            height,
            width,
            num_heads,
        }
    }

    /// Height- and width-axis biases, each `[B, N_h, H*W, H*W]`, for flat
    /// queries `[B, N_h, H*W, d_kh]`.
    pub fn relative_logits(
        &self,
        q: &Tensor,
        height: i64,
        width: i64,
    ) -> Result<(Tensor, Tensor)> {
        if height != self.height || width != self.width {
            return Err(AugConvError::shape_mismatch(
                "relative_logits",
                format!("spatial extent {}x{}", self.height, self.width),
                vec![height, width],
            ));
        }
        let [_, num_heads, _, d] = dims::<4>(q, "relative_logits")?;
        if num_heads != self.num_heads {
            return Err(AugConvError::shape_mismatch(
                "relative_logits",
                format!("{} heads", self.num_heads),
                q.size(),
            ));
        }

        let rel_w = relative_logits_1d(
            q,
            &self.key_rel_w,
            height,
            width,
            num_heads,
            WIDTH_TRANSPOSE,
        )?;

        let q_t = q
            .reshape([-1, num_heads, height, width, d])
            .permute([0, 1, 3, 2, 4])
            .reshape([-1, num_heads, height * width, d]);
        // height pass: same routine with the axes swapped
        let rel_h = relative_logits_1d(
            &q_t,
            &self.key_rel_h,
            width,
            height,
            num_heads,
            HEIGHT_TRANSPOSE,
        )?;

        Ok((rel_h, rel_w))
    }

    pub fn key_rel_w(&self) -> &Tensor {
        &self.key_rel_w
    }

    pub fn key_rel_h(&self) -> &Tensor {
        &self.key_rel_h
    }
}
