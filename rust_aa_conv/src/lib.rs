pub mod attention;
pub mod augmented;
pub mod config;
pub mod error;
pub mod heads;
pub mod qkv;
pub mod relative;
mod shape;

pub use attention::{AttentionOutput, MultiHeadAttention2d};
pub use augmented::AugmentedConv2d;
pub use config::{AugConvConfig, ConvPadding};
pub use error::{AugConvError, Result};
pub use heads::{combine_heads_2d, split_heads_2d};
pub use qkv::{FlatQkv, QkvProjection};
pub use relative::{RelativeLogits, rel_to_abs, relative_logits_1d};
