use std::path::PathBuf;
use thiserror::Error;

/// Convenient `Result` alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AugConvError>;

#[derive(Debug, Error)]
pub enum AugConvError {
    /// A configuration value is out of range or inconsistent with another.
    #[error("Invalid value for `{field}`: {reason}")]
    Configuration {
        field: &'static str,
        reason: String,
    },

    /// A tensor reaching `context` does not have the expected geometry.
    #[error("Shape mismatch in {context}: expected {expected}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: Vec<i64>,
    },

    #[error("Cannot read config file `{path}`: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write config file `{path}`: {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),
}

impl AugConvError {
    /// Construct an [`AugConvError::Configuration`].
    pub fn configuration<S: Into<String>>(field: &'static str, reason: S) -> Self {
        AugConvError::Configuration {
            field,
            reason: reason.into(),
        }
    }

    /// Construct an [`AugConvError::ShapeMismatch`].
    pub fn shape_mismatch<S: Into<String>>(
        context: &'static str,
        expected: S,
        actual: Vec<i64>,
    ) -> Self {
        AugConvError::ShapeMismatch {
            context,
            expected: expected.into(),
            actual,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, AugConvError::Configuration { .. })
    }

    pub fn is_shape_mismatch(&self) -> bool {
        matches!(self, AugConvError::ShapeMismatch { .. })
    }
}
