use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AugConvError, Result};

/// Padding of the plain convolution branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvPadding {
    /// No padding; the branch output shrinks by `kernel_size - 1` and is
    /// resized back to the input extent with asymmetric bilinear sampling
    /// (`src = dst * in / out`, no half-pixel offset).
    #[default]
    Valid,
    /// `(kernel_size - 1) / 2` on every side.
    Same,
}

impl ConvPadding {
    pub fn amount(self, kernel_size: i64) -> i64 {
        match self {
            ConvPadding::Valid => 0,
            ConvPadding::Same => (kernel_size - 1) / 2,
        }
    }
}

/// Hyper-parameters of one attention-augmented convolution layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugConvConfig {
    /// Channels of the concatenated output. Must exceed `value_dim`.
    pub output_channels: i64,
    /// Spatial size of the plain convolution kernel.
    pub kernel_size: i64,
    /// Total query/key depth across all heads.
    pub key_dim: i64,
    /// Total value depth across all heads; also the attention branch width.
    pub value_dim: i64,
    pub num_heads: i64,
    /// Add learned relative-position biases to the attention logits.
    pub use_relative_position: bool,
    /// Fixed batch size used to restore the head axis after attention.
    /// `None` takes the batch from the input.
    #[serde(default)]
    pub batch_size: Option<i64>,
    #[serde(default)]
    pub padding: ConvPadding,
}

impl Default for AugConvConfig {
    fn default() -> Self {
        AugConvConfig {
            output_channels: 16,
            kernel_size: 3,
            key_dim: 8,
            value_dim: 8,
            num_heads: 4,
            use_relative_position: true,
            batch_size: None,
            padding: ConvPadding::Valid,
        }
    }
}

impl AugConvConfig {
    /// Load and validate a configuration from a JSON file.
    pub fn from_json(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| AugConvError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: AugConvConfig = serde_json::from_str(&contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn to_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| AugConvError::FileWrite {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every field. Called by the layer constructor before any
    /// parameter is registered.
    pub fn validate(&self) -> Result<()> {
        if self.num_heads < 1 {
            return Err(AugConvError::configuration("num_heads", "must be >= 1"));
        }
        if self.key_dim < 1 {
            return Err(AugConvError::configuration("key_dim", "must be >= 1"));
        }
        if self.value_dim < 1 {
            return Err(AugConvError::configuration("value_dim", "must be >= 1"));
        }
        if self.key_dim % self.num_heads != 0 {
            return Err(AugConvError::configuration(
                "key_dim",
                format!(
                    "{} is not divisible by num_heads={}",
                    self.key_dim, self.num_heads
                ),
            ));
        }
        if self.value_dim % self.num_heads != 0 {
            return Err(AugConvError::configuration(
                "value_dim",
                format!(
                    "{} is not divisible by num_heads={}",
                    self.value_dim, self.num_heads
                ),
            ));
        }
        if self.output_channels <= self.value_dim {
            return Err(AugConvError::configuration(
                "output_channels",
                format!(
                    "{} must exceed value_dim={}",
                    self.output_channels, self.value_dim
                ),
            ));
        }
        if self.kernel_size < 1 {
            return Err(AugConvError::configuration("kernel_size", "must be >= 1"));
        }
        if let Some(batch) = self.batch_size {
            if batch < 1 {
                return Err(AugConvError::configuration("batch_size", "must be >= 1"));
            }
        }
        Ok(())
    }

    pub fn per_head_key_dim(&self) -> i64 {
        self.key_dim / self.num_heads
    }

    pub fn per_head_value_dim(&self) -> i64 {
        self.value_dim / self.num_heads
    }

    /// Output channels of the plain convolution branch.
    pub fn conv_channels(&self) -> i64 {
        self.output_channels - self.value_dim
    }

    /// Factor applied to queries: `per_head_key_dim^-0.5`.
    pub fn query_scale(&self) -> f64 {
        (self.per_head_key_dim() as f64).powf(-0.5)
    }
}
