//! Node readiness labels driven by daemon pod lifecycle.
//!
//! A node may host workspaces of a namespace only while the per-node
//! infrastructure daemons serving that namespace are running on it. This
//! crate keeps a readiness label on each node in step with those daemons:
//!
//! - **Filter**: only pod events in the target namespace, of the watched
//!   daemon kind, and (for updates) on the edge into `Ready` are reconciled
//! - **Reconcile**: fetch the pod, then add the label on its node or remove it
//!   from the node it was last seen on
//! - **Write**: read-modify-write the node, retrying on version conflicts
//! - **Drive**: warm up from a full listing, then follow a watch and dispatch
//!   events to per-pod sequential workers
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use warden_reconciler::{
//!     Controller, ControllerConfig, DaemonKind, KubeClient, KubeConfig, NodeLabelReconciler,
//! };
//!
//! let api = Arc::new(KubeClient::new(KubeConfig::in_cluster()?)?);
//! let reconciler = Arc::new(NodeLabelReconciler::new(api, DaemonKind::ws_daemon(), "default"));
//! Controller::new(reconciler, ControllerConfig::default())
//!     .run(shutdown)
//!     .await?;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod cluster;
pub mod controller;
pub mod error;
pub mod filter;
pub mod kube;
pub mod reconciler;
pub mod retry;
pub mod types;

// Re-export main types
pub use cluster::{
    CallCounts, ClusterApi, DEFAULT_HISTORY, InMemoryCluster, WatchStream, parse_selector,
};
pub use controller::{Controller, ControllerConfig, shard_for};
pub use error::{Error, Result};
pub use filter::{EventFilter, PodEvent};
pub use kube::{KubeClient, KubeConfig};
pub use reconciler::{NodeLabelReconciler, NodeLabelReconcilerBuilder};
pub use retry::{RetryPolicy, retry_on_conflict, retry_when};
pub use types::{
    ApiStatus, DaemonKind, LabelMode, ListMeta, Node, ObjectMeta, Pod, PodCondition, PodList,
    PodSpec, PodStatus, ReconcileAction, ReconcileResult, WatchEvent, kind_label,
    readiness_label,
};
