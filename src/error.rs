//! Error types for FCN construction, weight loading and training.
//!
//! Nothing is recovered locally: every failure propagates to the caller
//! that built the model.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FcnError>;

/// Main error type.
///
/// # Examples
///
/// ```
/// use fcn::error::FcnError;
///
/// let err = FcnError::InvalidArchitecture("`filters` and `convs` differ in length".into());
/// assert!(err.to_string().contains("invalid architecture"));
/// ```
#[derive(Error, Debug)]
pub enum FcnError {
    /// An optional capability (cargo feature) needed for the operation is not compiled in.
    #[error("`{operation}` requires the `{feature}` feature")]
    MissingCapability {
        /// Operation that was attempted
        operation: &'static str,
        /// Cargo feature providing it
        feature: &'static str,
    },

    /// Filesystem failure with the offending path.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Weight archive could not be parsed.
    #[error("invalid weight archive {}: {message}", path.display())]
    Archive {
        /// Archive location
        path: PathBuf,
        /// Error description
        message: String,
    },

    /// Remote fetch failed.
    #[error("download of {url} failed: {message}")]
    Download {
        /// Origin URL
        url: String,
        /// Error description
        message: String,
    },

    /// Backend configuration file is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tensor or layer shapes are incompatible.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Where the mismatch was detected
        context: String,
        /// Expected shape description
        expected: String,
        /// Actual shape description
        actual: String,
    },

    /// Block/decoder configuration is inconsistent.
    #[error("invalid architecture: {0}")]
    InvalidArchitecture(String),

    /// No layer with the requested name exists.
    #[error("unknown layer: {0}")]
    UnknownLayer(String),

    /// Archive lists more weights for a layer than the layer owns.
    #[error("layer `{layer}` expects {expected} weights, archive provides {stored}")]
    WeightCountMismatch {
        /// Layer name
        layer: String,
        /// Weight slots on the live layer
        expected: usize,
        /// Weights stored in the archive
        stored: usize,
    },

    /// Input tensors do not match the model's inputs.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FcnError {
    /// Wraps an I/O error together with the path that caused it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Convenience constructor for archive format errors.
    pub fn archive(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Archive {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn shape(
        context: impl Into<String>,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}
