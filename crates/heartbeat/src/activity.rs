//! Sources of [`HeartbeatState`] samples.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::state::HeartbeatState;

/// Samples local client activity once per reporting interval.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    async fn sample(&self) -> HeartbeatState;
}

/// Activity updated in place by a collaborator, e.g. an IDE plugin.
#[derive(Debug, Clone, Default)]
pub struct SharedActivity {
    connected: Arc<AtomicBool>,
    idle_secs: Arc<AtomicU64>,
}

impl SharedActivity {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn set_idle_secs(&self, secs: u64) {
        self.idle_secs.store(secs, Ordering::Release);
    }

    /// Record client input: idle time starts over.
    pub fn touch(&self) {
        self.set_idle_secs(0);
    }
}

#[async_trait]
impl ActivitySource for SharedActivity {
    async fn sample(&self) -> HeartbeatState {
        HeartbeatState::new(
            self.connected.load(Ordering::Acquire),
            self.idle_secs.load(Ordering::Acquire),
        )
    }
}

/// Reads the state from a JSON status file written by the local controller.
///
/// A missing, unreadable or malformed file reads as "not connected".
#[derive(Debug, Clone)]
pub struct StatusFileActivity {
    path: PathBuf,
}

impl StatusFileActivity {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ActivitySource for StatusFileActivity {
    async fn sample(&self) -> HeartbeatState {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Status file unreadable");
                return HeartbeatState::default();
            }
        };
        serde_json::from_slice(&raw).unwrap_or_else(|e| {
            debug!(path = %self.path.display(), error = %e, "Status file malformed");
            HeartbeatState::default()
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn test_shared_activity() {
        let activity = SharedActivity::new();
        assert_eq!(activity.sample().await, HeartbeatState::default());

        let writer = activity.clone();
        writer.set_connected(true);
        writer.set_idle_secs(7);
        assert_eq!(activity.sample().await, HeartbeatState::new(true, 7));

        writer.touch();
        assert_eq!(activity.sample().await.seconds_since_last_activity, 0);
    }

    #[tokio::test]
    async fn test_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let activity = StatusFileActivity::new(&path);

        assert!(!activity.sample().await.connected);

        std::fs::write(&path, r#"{"connected":true,"secondsSinceLastActivity":3}"#).unwrap();
        assert_eq!(activity.sample().await, HeartbeatState::new(true, 3));

        std::fs::write(&path, "not json").unwrap();
        assert!(!activity.sample().await.connected);
    }
}
