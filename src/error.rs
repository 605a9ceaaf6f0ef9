//! Error types for VAEGAN training.

use thiserror::Error;

/// Result type for VAEGAN operations.
pub type VaeGanResult<T> = Result<T, VaeGanError>;

/// Errors that can occur while building or training a VAEGAN.
#[derive(Debug, Error)]
pub enum VaeGanError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Shape mismatch
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VaeGanError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message() {
        let err = VaeGanError::shape_mismatch("[32]", "[31]");
        assert_eq!(err.to_string(), "Shape mismatch: expected [32], got [31]");
    }

    #[test]
    fn test_candle_error_converts() {
        let err: VaeGanError = candle_core::Error::Msg("boom".into()).into();
        assert!(matches!(err, VaeGanError::Candle(_)));
    }
}
