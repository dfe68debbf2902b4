//! The reconnecting link to the workspace server.
//!
//! [`ConnectionLoop`] keeps at most one [`Link`] alive and publishes it on a
//! `watch` channel. Readers take whatever link is current when they need one;
//! they never wait for a reconnect.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use warden_core::{ShutdownSignal, WorkspaceInstance};

use crate::backoff::{ReconnectBackoff, ReconnectConfig};
use crate::error::Result;

/// An established link to the workspace server.
#[async_trait]
pub trait Link: Send + Sync {
    /// Report a connectivity transition of the instance.
    async fn send_heartbeat(&self, instance_id: &str, was_closed: bool) -> Result<()>;

    /// Token identifying the workspace owner.
    async fn get_owner_token(&self, workspace_id: &str) -> Result<String>;

    /// Link other clients use to join the running instance.
    async fn get_join_link(&self, instance_id: &str) -> Result<String>;

    /// Resolve once the link has terminated, for whatever reason.
    async fn closed(&self);

    /// Tear the link down.
    async fn close(&self);
}

/// Establishes links. Instance updates pushed over a link go to `updates`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, updates: mpsc::Sender<WorkspaceInstance>) -> Result<Arc<dyn Link>>;
}

/// The current link, if any.
pub type LinkSlot = watch::Receiver<Option<Arc<dyn Link>>>;

/// Take the current link out of a slot.
#[must_use]
pub fn current_link(slot: &LinkSlot) -> Option<Arc<dyn Link>> {
    slot.borrow().clone()
}

/// Keeps one link alive, reconnecting with backoff until shutdown.
pub struct ConnectionLoop<C: ?Sized> {
    connector: Arc<C>,
    config: ReconnectConfig,
    slot: watch::Sender<Option<Arc<dyn Link>>>,
    updates: mpsc::Sender<WorkspaceInstance>,
}

impl<C: Connector + ?Sized> ConnectionLoop<C> {
    /// Create the loop and the slot its links are published on.
    pub fn new(
        connector: Arc<C>,
        config: ReconnectConfig,
        updates: mpsc::Sender<WorkspaceInstance>,
    ) -> (Self, LinkSlot) {
        let (slot, slot_rx) = watch::channel(None);
        (
            Self {
                connector,
                config,
                slot,
                updates,
            },
            slot_rx,
        )
    }

    /// A further reader of the published link.
    #[must_use]
    pub fn subscribe(&self) -> LinkSlot {
        self.slot.subscribe()
    }

    /// Run until shutdown or a permanent connection failure.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<()> {
        let mut backoff = ReconnectBackoff::from_config(&self.config);
        info!("Connection loop starting");

        loop {
            if shutdown.is_shutdown() {
                break;
            }

            let attempt = tokio::select! {
                () = shutdown.wait() => break,
                attempt = tokio::time::timeout(
                    self.config.handshake_timeout,
                    self.connector.connect(self.updates.clone()),
                ) => attempt,
            };

            match attempt {
                Ok(Ok(link)) => {
                    info!("Link established");
                    backoff.reset();
                    self.slot.send_replace(Some(Arc::clone(&link)));

                    tokio::select! {
                        () = shutdown.wait() => {
                            self.slot.send_replace(None);
                            link.close().await;
                            break;
                        }
                        () = link.closed() => {}
                    }
                    self.slot.send_replace(None);
                    warn!(delay_ms = backoff.current().as_millis(), "Link terminated, reconnecting");
                }
                Ok(Err(e)) if e.is_permanent() => {
                    error!(error = %e, "Link permanently rejected, giving up");
                    self.slot.send_replace(None);
                    return Err(e);
                }
                Ok(Err(e)) => {
                    warn!(error = %e, delay_ms = backoff.current().as_millis(), "Cannot connect, retrying");
                }
                Err(_) => {
                    warn!(
                        timeout_ms = self.config.handshake_timeout.as_millis(),
                        delay_ms = backoff.current().as_millis(),
                        "Handshake timed out, retrying"
                    );
                }
            }

            let delay = backoff.advance();
            debug!(delay_ms = delay.as_millis(), "Waiting before reconnect");
            tokio::select! {
                () = shutdown.wait() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.slot.send_replace(None);
        info!("Connection loop stopped");
        Ok(())
    }
}
