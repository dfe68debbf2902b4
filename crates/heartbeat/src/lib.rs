#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # warden-heartbeat
//!
//! Reports a workspace's client connectivity to the workspace server over a
//! reconnecting link:
//!
//! - [`ConnectionLoop`]: keeps one [`Link`] alive with
//!   exponential reconnect backoff, giving up only on permanent rejection
//! - [`InstanceSession`]: applies instance updates pushed over the link and
//!   tears the session down once the instance stops
//! - [`HeartbeatReporter`]: samples [`ActivitySource`] on a jittered interval
//!   and reports "opened"/"closed" transitions in order
//! - [`WorkspaceSession`]: runs all three under one shutdown scope
//!
//! ```ignore
//! use std::sync::Arc;
//! use warden_heartbeat::{SessionConfig, StatusFileActivity, WorkspaceSession, WsConnector};
//!
//! let connector = Arc::new(WsConnector::new("https://example.com")?.with_token(token));
//! let activity = Arc::new(StatusFileActivity::new("/run/warden/status.json"));
//! let (events_tx, mut events) = tokio::sync::mpsc::channel(16);
//! WorkspaceSession::new(connector, activity, SessionConfig::default())
//!     .run(shutdown, events_tx)
//!     .await?;
//! ```

pub mod activity;
pub mod backoff;
pub mod connection;
pub mod error;
pub mod reporter;
pub mod session;
pub mod state;
pub mod ws;

pub use activity::{ActivitySource, SharedActivity, StatusFileActivity};
pub use backoff::{ReconnectBackoff, ReconnectConfig};
pub use connection::{ConnectionLoop, Connector, Link, LinkSlot, current_link};
pub use error::{Error, Result};
pub use reporter::{HeartbeatReporter, InstanceWatch, ReporterConfig};
pub use session::{
    InstanceSelector, InstanceSession, SessionConfig, SessionEvent, WorkspaceSession,
};
pub use state::{HeartbeatDecision, HeartbeatState, decide};
pub use ws::{DEFAULT_API_PATH, INSTANCE_UPDATE, WsConnector, WsLink, link_address};
