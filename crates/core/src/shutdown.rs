//! Cooperative cancellation shared by all warden loops.
//!
//! A [`ShutdownHandle`] owns the sending side of a `watch` channel; every loop
//! holds a cloned [`ShutdownSignal`] and checks it between iterations. Loops stop
//! after their current iteration; in-flight calls are left to finish.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

/// Triggers shutdown of every signal cloned from it.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stop_tx: Arc<watch::Sender<bool>>,
}

/// Observes a [`ShutdownHandle`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    stop_rx: watch::Receiver<bool>,
}

impl ShutdownHandle {
    /// Create a handle and its first signal.
    #[must_use]
    pub fn new() -> (Self, ShutdownSignal) {
        let (stop_tx, stop_rx) = watch::channel(false);
        (
            Self {
                stop_tx: Arc::new(stop_tx),
            },
            ShutdownSignal { stop_rx },
        )
    }

    /// Request shutdown. Idempotent.
    pub fn shutdown(&self) {
        if !*self.stop_tx.borrow() {
            debug!("Shutdown requested");
        }
        self.stop_tx.send_replace(true);
    }

    /// New signal tied to this handle.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            stop_rx: self.stop_tx.subscribe(),
        }
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.stop_tx.borrow()
    }
}

impl ShutdownSignal {
    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Resolve once shutdown is requested or every handle is dropped.
    pub async fn wait(&mut self) {
        // Err means every handle is gone, which also ends the scope.
        let _ = self.stop_rx.wait_for(|stopped| *stopped).await;
    }
}
