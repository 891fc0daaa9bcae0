//! Error types for digit recognition.
//!
//! Errors are `Clone` so that a single failed model resolution can be
//! delivered to every caller waiting on it.

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for digit recognition operations.
pub type Result<T> = std::result::Result<T, DigitError>;

/// Errors that can occur while normalizing, training or serving.
#[derive(Debug, Clone, Error)]
pub enum DigitError {
    /// The raster contained no ink pixel.
    #[error("empty input: draw something first")]
    EmptyInput,

    /// Training data could not be retrieved.
    #[error("dataset unavailable: {reason}")]
    DatasetUnavailable { reason: String },

    /// Fitting or persisting a fresh model failed.
    #[error("training failed: {reason}")]
    TrainingFailed { reason: String },

    /// A persisted model could not be loaded (missing, corrupt or stale).
    #[error("persisted model load failed: {reason}")]
    PersistedLoadFailed { reason: String },

    /// Forward pass failed or produced an unexpected shape.
    #[error("inference failed: {reason}")]
    InferenceFailed { reason: String },

    /// Buffer length does not match the declared dimensions.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: String, actual: String },

    /// Tensor value outside `[0, 1]` or not finite.
    #[error("invalid pixel value at {index}: {value}")]
    InvalidPixel { index: usize, value: f32 },

    /// Configuration could not be parsed or failed validation.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// I/O error during file operations.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// Underlying aprender error.
    #[error("aprender error: {0}")]
    Aprender(String),
}

impl DigitError {
    /// Create a dataset unavailable error.
    #[must_use]
    pub fn dataset_unavailable(reason: impl Into<String>) -> Self {
        Self::DatasetUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a training failed error.
    #[must_use]
    pub fn training_failed(reason: impl Into<String>) -> Self {
        Self::TrainingFailed {
            reason: reason.into(),
        }
    }

    /// Create a persisted load failed error.
    #[must_use]
    pub fn persisted_load_failed(reason: impl Into<String>) -> Self {
        Self::PersistedLoadFailed {
            reason: reason.into(),
        }
    }

    /// Create an inference failed error.
    #[must_use]
    pub fn inference_failed(reason: impl Into<String>) -> Self {
        Self::InferenceFailed {
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a dimension mismatch error.
    #[must_use]
    pub fn dimension_mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        Self::DimensionMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Fold any error raised while producing a fresh model into
    /// `TrainingFailed`, keeping the original message as the cause.
    #[must_use]
    pub fn into_training_failure(self) -> Self {
        match self {
            Self::TrainingFailed { .. } => self,
            other => Self::training_failed(other.to_string()),
        }
    }
}

impl From<std::io::Error> for DigitError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_empty_input() {
        assert_eq!(
            DigitError::EmptyInput.to_string(),
            "empty input: draw something first"
        );
    }

    #[test]
    fn test_error_display_dataset_unavailable() {
        let err = DigitError::dataset_unavailable("label blob missing");
        assert_eq!(err.to_string(), "dataset unavailable: label blob missing");
    }

    #[test]
    fn test_error_display_dimension_mismatch() {
        let err = DigitError::dimension_mismatch(784, 783);
        assert_eq!(err.to_string(), "dimension mismatch: expected 784, got 783");
    }

    #[test]
    fn test_into_training_failure_wraps_cause() {
        let err = DigitError::dataset_unavailable("sprite not found").into_training_failure();
        match err {
            DigitError::TrainingFailed { reason } => {
                assert_eq!(reason, "dataset unavailable: sprite not found");
            }
            other => panic!("expected TrainingFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_into_training_failure_keeps_training_failed() {
        let err = DigitError::training_failed("loss diverged").into_training_failure();
        assert_eq!(err.to_string(), "training failed: loss diverged");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DigitError = io_err.into();
        assert!(err.to_string().contains("io error"));
        // Shared failures are cloned to every waiter.
        let cloned = err.clone();
        assert_eq!(cloned.to_string(), err.to_string());
    }
}
