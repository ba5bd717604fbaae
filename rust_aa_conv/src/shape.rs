use crate::error::{AugConvError, Result};
use tch::Tensor;

/// Read the size of `xs` as a fixed-rank array, failing with a shape
/// mismatch attributed to `context` when the rank is not `N`.
pub(crate) fn dims<const N: usize>(xs: &Tensor, context: &'static str) -> Result<[i64; N]> {
    let size = xs.size();
    <[i64; N]>::try_from(size.as_slice())
        .map_err(|_| AugConvError::shape_mismatch(context, format!("rank {N}"), size))
}
