//! Error types for the heartbeat crate.

use thiserror::Error;

/// Result type alias for heartbeat operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Handshake statuses that no amount of retrying will fix.
const PERMANENT_STATUSES: [u16; 3] = [401, 403, 404];

/// Heartbeat error types.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The server refused the link outright.
    #[error("link rejected with status {status}: {reason}")]
    Rejected { status: u16, reason: String },

    /// The link could not be established.
    #[error("cannot connect: {reason}")]
    Connect { reason: String },

    /// An operation did not finish in time.
    #[error("{operation} timed out")]
    Timeout { operation: String },

    /// The link went away while a call was outstanding.
    #[error("link closed")]
    LinkClosed,

    /// No link is currently established.
    #[error("no live link")]
    NoLink,

    /// The server answered a call with an error.
    #[error("remote call failed ({code}): {message}")]
    Rpc { code: i64, message: String },

    /// The server sent something that is not valid JSON-RPC.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Classify a failed handshake by its HTTP status.
    pub fn handshake(status: u16, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        if PERMANENT_STATUSES.contains(&status) {
            Self::Rejected { status, reason }
        } else {
            Self::Connect {
                reason: format!("handshake returned {status}: {reason}"),
            }
        }
    }

    /// Create a connect error.
    pub fn connect(reason: impl Into<String>) -> Self {
        Self::Connect {
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a remote call error.
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether the connection loop must give up instead of reconnecting.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::InvalidConfig { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_classification() {
        for status in [401, 403, 404] {
            assert!(Error::handshake(status, "nope").is_permanent(), "{status}");
        }
        for status in [400, 500, 502, 503] {
            assert!(!Error::handshake(status, "later").is_permanent(), "{status}");
        }
    }

    #[test]
    fn test_transient_errors() {
        assert!(!Error::connect("refused").is_permanent());
        assert!(!Error::timeout("handshake").is_permanent());
        assert!(!Error::LinkClosed.is_permanent());
        assert!(Error::invalid_config("bad host").is_permanent());
    }

    #[test]
    fn test_display() {
        let err = Error::handshake(403, "forbidden");
        assert_eq!(err.to_string(), "link rejected with status 403: forbidden");
    }
}
