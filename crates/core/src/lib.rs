#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # warden-core
//!
//! Shared vocabulary for warden components:
//!
//! - [`Phase`]: the ordered workspace lifecycle, with a display-text table
//! - [`WorkspaceInstance`]: instance updates pushed by the control plane
//! - [`PhaseTracker`]: stale and out-of-order update suppression
//! - [`ShutdownHandle`] / [`ShutdownSignal`]: cooperative cancellation

pub mod error;
pub mod instance;
pub mod phase;
pub mod shutdown;
pub mod tracker;

pub use error::{Error, Result};
pub use instance::{InstanceConditions, InstanceStatus, WorkspaceInstance};
pub use phase::Phase;
pub use shutdown::{ShutdownHandle, ShutdownSignal};
pub use tracker::{PhaseTracker, PhaseTransition};
