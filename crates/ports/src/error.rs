//! Error types for served-port observation.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for port operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Port observation errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A socket table could not be opened or read.
    #[error("cannot read socket table '{path}': {reason}")]
    SourceUnreadable { path: PathBuf, reason: String },

    /// A socket table entry could not be decoded.
    #[error("malformed socket table entry: {reason}")]
    Malformed { reason: String },
}

impl Error {
    /// Create a source unreadable error.
    pub fn source_unreadable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::SourceUnreadable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed entry error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}
