//! Core error types shared by warden components.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("JSON parse error: {reason}")]
    JsonParseFailed { reason: String },

    #[error("invalid workspace instance: {reason}")]
    InvalidInstance { reason: String },
}

impl Error {
    /// Create a JSON parse error.
    pub fn json_parse_failed(reason: impl Into<String>) -> Self {
        Self::JsonParseFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid instance error.
    pub fn invalid_instance(reason: impl Into<String>) -> Self {
        Self::InvalidInstance {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::json_parse_failed(err.to_string())
    }
}
