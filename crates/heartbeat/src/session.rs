//! Instance tracking and supervision of one workspace session.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use warden_core::{Phase, PhaseTracker, ShutdownHandle, ShutdownSignal, WorkspaceInstance};

use crate::activity::ActivitySource;
use crate::backoff::ReconnectConfig;
use crate::connection::{ConnectionLoop, Connector, LinkSlot, current_link};
use crate::error::Result;
use crate::reporter::{HeartbeatReporter, InstanceWatch, ReporterConfig};

/// Something collaborators of a session (e.g. a UI) are told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// An instance update advanced the phase.
    Phase { instance_id: String, phase: Phase },
    /// An update carried a failure condition.
    Failed { instance_id: String, reason: String },
    /// Owner token of the running workspace.
    OwnerToken { workspace_id: String, token: String },
    /// Join link of the running instance.
    JoinLink { instance_id: String, link: String },
    /// A detail fetch after entering `running` failed.
    FetchFailed { what: &'static str, reason: String },
    /// The instance is stopping or stopped; the session is shutting down.
    Teardown { instance_id: String, phase: Phase },
}

/// Which pushed instances a session follows. Unset ids match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSelector {
    pub instance_id: Option<String>,
    pub workspace_id: Option<String>,
}

impl InstanceSelector {
    #[must_use]
    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_workspace_id(mut self, id: impl Into<String>) -> Self {
        self.workspace_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn matches(&self, instance: &WorkspaceInstance) -> bool {
        self.instance_id.as_ref().is_none_or(|id| *id == instance.id)
            && self
                .workspace_id
                .as_ref()
                .is_none_or(|id| *id == instance.workspace_id)
    }
}

/// Consumes instance updates pushed over the link.
pub struct InstanceSession {
    link: LinkSlot,
    instance: watch::Sender<Option<WorkspaceInstance>>,
    events: mpsc::Sender<SessionEvent>,
    teardown: ShutdownHandle,
    selector: InstanceSelector,
}

impl InstanceSession {
    /// Create a session and the watch its accepted instance is published on.
    /// `teardown` is triggered once the instance stops.
    pub fn new(
        link: LinkSlot,
        events: mpsc::Sender<SessionEvent>,
        teardown: ShutdownHandle,
    ) -> (Self, InstanceWatch) {
        let (instance, instance_rx) = watch::channel(None);
        (
            Self {
                link,
                instance,
                events,
                teardown,
                selector: InstanceSelector::default(),
            },
            instance_rx,
        )
    }

    /// Ignore pushed updates the selector does not match.
    #[must_use]
    pub fn with_selector(mut self, selector: InstanceSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Apply updates until the instance stops, the queue closes or shutdown.
    pub async fn run(
        self,
        mut updates: mpsc::Receiver<WorkspaceInstance>,
        mut shutdown: ShutdownSignal,
    ) {
        let mut tracker = PhaseTracker::new();
        let mut fetched_for: Option<String> = None;

        loop {
            let update = tokio::select! {
                () = shutdown.wait() => break,
                update = updates.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };
            if !self.selector.matches(&update) {
                debug!(
                    instance = %update.id,
                    workspace = %update.workspace_id,
                    "Ignoring update for another instance"
                );
                continue;
            }

            let instance_id = update.id.clone();
            let workspace_id = update.workspace_id.clone();
            let transition = tracker.apply(update);

            if let Some(reason) = transition.failed {
                warn!(instance = %instance_id, reason = %reason, "Instance failed");
                self.emit(SessionEvent::Failed {
                    instance_id: instance_id.clone(),
                    reason,
                })
                .await;
            }
            if !transition.applied {
                continue;
            }

            info!(instance = %instance_id, phase = %transition.phase, "Instance phase changed");
            self.instance.send_replace(tracker.latest().cloned());
            self.emit(SessionEvent::Phase {
                instance_id: instance_id.clone(),
                phase: transition.phase,
            })
            .await;

            if transition.entered_running && fetched_for.as_deref() != Some(instance_id.as_str()) {
                fetched_for = Some(instance_id.clone());
                self.fetch_details(&instance_id, &workspace_id).await;
            }

            if transition.teardown {
                info!(instance = %instance_id, phase = %transition.phase, "Instance stopping, tearing down session");
                self.emit(SessionEvent::Teardown {
                    instance_id,
                    phase: transition.phase,
                })
                .await;
                self.teardown.shutdown();
                break;
            }
        }
        debug!("Instance session stopped");
    }

    async fn fetch_details(&self, instance_id: &str, workspace_id: &str) {
        let Some(link) = current_link(&self.link) else {
            warn!(instance = %instance_id, "No live link, cannot fetch session details");
            self.emit(SessionEvent::FetchFailed {
                what: "session details",
                reason: "no live link".to_string(),
            })
            .await;
            return;
        };

        match link.get_owner_token(workspace_id).await {
            Ok(token) => {
                debug!(workspace = %workspace_id, "Owner token fetched");
                self.emit(SessionEvent::OwnerToken {
                    workspace_id: workspace_id.to_string(),
                    token,
                })
                .await;
            }
            Err(e) => {
                warn!(workspace = %workspace_id, error = %e, "Cannot fetch owner token");
                self.emit(SessionEvent::FetchFailed {
                    what: "owner token",
                    reason: e.to_string(),
                })
                .await;
            }
        }

        match link.get_join_link(instance_id).await {
            Ok(join) => {
                debug!(instance = %instance_id, "Join link fetched");
                self.emit(SessionEvent::JoinLink {
                    instance_id: instance_id.to_string(),
                    link: join,
                })
                .await;
            }
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "Cannot fetch join link");
                self.emit(SessionEvent::FetchFailed {
                    what: "join link",
                    reason: e.to_string(),
                })
                .await;
            }
        }
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!("No session event listener");
        }
    }
}

/// Settings of one workspace session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub reconnect: ReconnectConfig,
    pub reporter: ReporterConfig,
    /// Instance updates buffered between link and session.
    pub update_capacity: usize,
    pub selector: InstanceSelector,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            reporter: ReporterConfig::default(),
            update_capacity: 16,
            selector: InstanceSelector::default(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: ReporterConfig) -> Self {
        self.reporter = reporter;
        self
    }

    #[must_use]
    pub const fn with_update_capacity(mut self, capacity: usize) -> Self {
        self.update_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_selector(mut self, selector: InstanceSelector) -> Self {
        self.selector = selector;
        self
    }
}

/// Connection loop, instance session and reporter under one shutdown scope.
pub struct WorkspaceSession<C: ?Sized, A: ?Sized> {
    connector: Arc<C>,
    activity: Arc<A>,
    config: SessionConfig,
}

impl<C, A> WorkspaceSession<C, A>
where
    C: Connector + ?Sized + 'static,
    A: ActivitySource + ?Sized + 'static,
{
    pub fn new(connector: Arc<C>, activity: Arc<A>, config: SessionConfig) -> Self {
        Self {
            connector,
            activity,
            config,
        }
    }

    /// Run until `shutdown`, instance teardown, or a permanent link failure.
    ///
    /// Events are delivered to `events`; the session blocks while it is full.
    pub async fn run(
        self,
        mut shutdown: ShutdownSignal,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<()> {
        let (scope, _) = ShutdownHandle::new();
        let (updates_tx, updates_rx) = mpsc::channel(self.config.update_capacity.max(1));

        let (connection, link) =
            ConnectionLoop::new(self.connector, self.config.reconnect, updates_tx);
        let (session, instance) = InstanceSession::new(link.clone(), events, scope.clone());
        let session = session.with_selector(self.config.selector);
        let reporter = HeartbeatReporter::new(self.activity, link, instance, self.config.reporter);

        let mut connection = tokio::spawn(connection.run(scope.signal()));
        let session = tokio::spawn(session.run(updates_rx, scope.signal()));
        let reporter = tokio::spawn(reporter.run(scope.signal()));
        info!("Workspace session started");

        let mut scope_signal = scope.signal();
        let outcome = tokio::select! {
            () = shutdown.wait() => None,
            () = scope_signal.wait() => None,
            joined = &mut connection => Some(joined),
        };
        scope.shutdown();

        let result = match outcome {
            Some(joined) => joined,
            None => connection.await,
        };
        if session.await.is_err() {
            warn!("Instance session task failed");
        }
        if reporter.await.is_err() {
            warn!("Heartbeat reporter task failed");
        }
        info!("Workspace session stopped");

        result.unwrap_or_else(|e| {
            warn!(error = %e, "Connection loop task failed");
            Ok(())
        })
    }
}
