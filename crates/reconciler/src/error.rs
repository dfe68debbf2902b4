//! Error types for the reconciler crate.

use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Object does not exist in the cluster.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    /// Write lost an optimistic concurrency race.
    #[error("conflict writing {kind} '{name}': object was modified")]
    Conflict { kind: String, name: String },

    /// The watch resource version is too old; a fresh list is required.
    #[error("watch expired: {reason}")]
    WatchExpired { reason: String },

    /// Cluster API answered with an unexpected status.
    #[error("cluster API returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Request never produced a response.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// Response body could not be decoded.
    #[error("cannot decode {what}: {reason}")]
    Decode { what: String, reason: String },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Create a not found error.
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error.
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a watch expired error.
    pub fn watch_expired(reason: impl Into<String>) -> Self {
        Self::WatchExpired {
            reason: reason.into(),
        }
    }

    /// Create an API status error.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Create a decode error.
    pub fn decode(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            what: what.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// The object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// A concurrent writer won; re-read and try again.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether requeueing the same key may succeed later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { .. } | Self::Transport { .. } | Self::WatchExpired { .. } => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::NotFound { .. } | Self::Decode { .. } | Self::InvalidConfig { .. } => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::decode("response body", err.to_string())
        } else if let Some(status) = err.status() {
            Self::api(status.as_u16(), err.to_string())
        } else {
            Self::transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::decode("json", err.to_string())
    }
}
