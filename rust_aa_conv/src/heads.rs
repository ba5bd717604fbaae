use crate::error::{AugConvError, Result};
use crate::shape::dims;
use tch::Tensor;

/// Split the channel axis of a `[B, H, W, C]` map into heads:
/// `[B, num_heads, H, W, C / num_heads]`.
pub fn split_heads_2d(xs: &Tensor, num_heads: i64) -> Result<Tensor> {
    let [b, h, w, c] = dims::<4>(xs, "split_heads_2d")?;
    if num_heads < 1 || c % num_heads != 0 {
        return Err(AugConvError::configuration(
            "num_heads",
            format!("{c} channels cannot be split into {num_heads} heads"),
        ));
    }
    Ok(xs
        .reshape([b, h, w, num_heads, c / num_heads])
        .permute([0, 3, 1, 2, 4]))
}

/// Inverse of [`split_heads_2d`]: `[B, N_h, H, W, d]` -> `[B, H, W, N_h * d]`.
pub fn combine_heads_2d(xs: &Tensor) -> Result<Tensor> {
    let [b, num_heads, h, w, d] = dims::<5>(xs, "combine_heads_2d")?;
    Ok(xs
        .permute([0, 2, 3, 1, 4])
        .reshape([b, h, w, num_heads * d]))
}
