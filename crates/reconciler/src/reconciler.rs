//! Reconciler implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, retry_on_conflict};
use crate::types::{
    DaemonKind, LabelMode, Node, ReconcileAction, ReconcileResult, kind_label, readiness_label,
};

/// Keeps the readiness label of a namespace in step with one daemon kind.
///
/// The reconciler remembers which node each daemon pod was last seen on, so a
/// deleted pod can still be mapped back to the node whose label it justified.
/// Calls for the same pod must be serialized by the caller; calls for
/// different pods may run concurrently.
pub struct NodeLabelReconciler<C: ?Sized> {
    api: Arc<C>,
    kind: DaemonKind,
    namespace: String,
    mode: LabelMode,
    retry: RetryPolicy,
    pod_nodes: Mutex<HashMap<String, String>>,
}

impl<C: ClusterApi + ?Sized> NodeLabelReconciler<C> {
    /// Create a reconciler with the shared label mode and default retry policy.
    pub fn new(api: Arc<C>, kind: DaemonKind, namespace: impl Into<String>) -> Self {
        Self {
            api,
            kind,
            namespace: namespace.into(),
            mode: LabelMode::default(),
            retry: RetryPolicy::conflict(),
            pod_nodes: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn api(&self) -> &Arc<C> {
        &self.api
    }

    #[must_use]
    pub fn kind(&self) -> &DaemonKind {
        &self.kind
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn mode(&self) -> &LabelMode {
        &self.mode
    }

    /// Node last recorded for `pod`.
    #[must_use]
    pub fn cached_node(&self, pod: &str) -> Option<String> {
        self.cache().get(pod).cloned()
    }

    /// Number of pods with a recorded node.
    #[must_use]
    pub fn cached_pods(&self) -> usize {
        self.cache().len()
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.pod_nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reconcile one daemon pod by name.
    ///
    /// A pod that is gone, terminating or not yet scheduled removes the label
    /// from the node it was last recorded on, if any. A scheduled pod ensures
    /// the label on its node and is recorded. Fetch errors other than "not
    /// found" are returned for the caller to requeue.
    pub async fn reconcile(&self, pod_name: &str) -> Result<ReconcileResult> {
        let pod = match self.api.get_pod(&self.namespace, pod_name).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => {
                debug!(pod = pod_name, "Pod gone");
                return self.forget(pod_name).await;
            }
            Err(e) => return Err(e),
        };

        let node = match pod.node_name() {
            Some(node) if !pod.is_terminating() => node.to_string(),
            _ => {
                debug!(
                    pod = pod_name,
                    terminating = pod.is_terminating(),
                    "Pod cannot justify readiness"
                );
                return self.forget(pod_name).await;
            }
        };

        if let Some(previous) = self.cached_node(pod_name).filter(|p| *p != node) {
            warn!(pod = pod_name, %previous, %node, "Pod moved between nodes");
            self.write_label(&previous, false).await?;
        }

        let written = self.write_label(&node, true).await?;
        self.cache().insert(pod_name.to_string(), node.clone());

        Ok(ReconcileResult::new(
            pod_name,
            ReconcileAction::EnsureLabel { node },
            written,
        ))
    }

    /// Remove the label from the cached node and drop the cache entry.
    /// Without a cache entry nothing is known to remove.
    async fn forget(&self, pod_name: &str) -> Result<ReconcileResult> {
        let Some(node) = self.cached_node(pod_name) else {
            return Ok(ReconcileResult::no_op(pod_name));
        };

        // The entry stays until the label is gone so a requeue can retry.
        let written = self.write_label(&node, false).await?;
        self.cache().remove(pod_name);

        Ok(ReconcileResult::new(
            pod_name,
            ReconcileAction::RemoveLabel { node },
            written,
        ))
    }

    /// Read-modify-write the node's labels, retrying on conflict.
    async fn write_label(&self, node_name: &str, ready: bool) -> Result<bool> {
        let this = self;
        retry_on_conflict(&self.retry, move || async move {
            this.try_write_label(node_name, ready).await
        })
        .await
    }

    async fn try_write_label(&self, node_name: &str, ready: bool) -> Result<bool> {
        let mut node = match self.api.get_node(node_name).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() && !ready => {
                debug!(node = node_name, "Node gone, label already absent");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if !self.apply_label(&mut node, ready) {
            debug!(node = node_name, ready, "Label already in desired state");
            return Ok(false);
        }

        self.api.update_node(&node).await?;
        info!(
            node = node_name,
            kind = %self.kind,
            namespace = %self.namespace,
            ready,
            labels = %node.warden_labels(),
            "Updated node readiness"
        );
        Ok(true)
    }

    /// Apply the desired readiness to `node`. Returns whether it changed.
    fn apply_label(&self, node: &mut Node, ready: bool) -> bool {
        let shared = readiness_label(&self.namespace);
        match &self.mode {
            LabelMode::Shared => {
                if ready {
                    node.set_label(&shared)
                } else {
                    node.remove_label(&shared)
                }
            }
            LabelMode::PerKind { required } => {
                let own = kind_label(&self.kind.name, &self.namespace);
                let mut changed = if ready {
                    node.set_label(&own)
                } else {
                    node.remove_label(&own)
                };

                let all_ready = required
                    .iter()
                    .all(|kind| node.has_label(&kind_label(kind, &self.namespace)));
                changed |= if all_ready {
                    node.set_label(&shared)
                } else {
                    node.remove_label(&shared)
                };
                changed
            }
        }
    }
}

/// Builder for [`NodeLabelReconciler`].
pub struct NodeLabelReconcilerBuilder<C: ?Sized> {
    api: Option<Arc<C>>,
    kind: Option<DaemonKind>,
    namespace: Option<String>,
    mode: LabelMode,
    retry: RetryPolicy,
}

impl<C: ClusterApi + ?Sized> NodeLabelReconcilerBuilder<C> {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            api: None,
            kind: None,
            namespace: None,
            mode: LabelMode::default(),
            retry: RetryPolicy::conflict(),
        }
    }

    /// Set the cluster API.
    #[must_use]
    pub fn with_api(mut self, api: Arc<C>) -> Self {
        self.api = Some(api);
        self
    }

    /// Set the daemon kind.
    #[must_use]
    pub fn with_kind(mut self, kind: DaemonKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Set the namespace to watch.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the label mode.
    #[must_use]
    pub fn with_mode(mut self, mode: LabelMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the conflict retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Build the reconciler.
    pub fn build(self) -> Result<NodeLabelReconciler<C>> {
        let api = self
            .api
            .ok_or_else(|| Error::invalid_config("cluster API is required"))?;
        let kind = self
            .kind
            .ok_or_else(|| Error::invalid_config("daemon kind is required"))?;
        let namespace = self
            .namespace
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| Error::invalid_config("namespace is required"))?;

        if let LabelMode::PerKind { required } = &self.mode {
            if required.is_empty() {
                return Err(Error::invalid_config(
                    "per-kind label mode needs at least one required kind",
                ));
            }
            if !required.contains(&kind.name) {
                return Err(Error::invalid_config(format!(
                    "kind '{kind}' is not among the required kinds"
                )));
            }
        }

        let mut reconciler = NodeLabelReconciler::new(api, kind, namespace);
        reconciler.mode = self.mode;
        reconciler.retry = self.retry;
        Ok(reconciler)
    }
}

impl<C: ClusterApi + ?Sized> Default for NodeLabelReconcilerBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::types::Pod;

    fn daemon_pod(name: &str) -> Pod {
        Pod::new("default", name).with_label("component", "ws-daemon")
    }

    fn setup() -> (Arc<InMemoryCluster>, NodeLabelReconciler<InMemoryCluster>) {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_node(Node::new("node-a"));
        let reconciler =
            NodeLabelReconciler::new(Arc::clone(&cluster), DaemonKind::ws_daemon(), "default");
        (cluster, reconciler)
    }

    #[tokio::test]
    async fn test_unscheduled_pod_is_noop() {
        let (cluster, reconciler) = setup();
        cluster.apply_pod(daemon_pod("ws-daemon-1").with_ready(true));

        let result = reconciler.reconcile("ws-daemon-1").await.unwrap();
        assert_eq!(result.action, ReconcileAction::NoOp);
        assert_eq!(cluster.calls().node_gets, 0);
    }

    #[tokio::test]
    async fn test_label_already_present_skips_write() {
        let (cluster, reconciler) = setup();
        let mut node = Node::new("node-a");
        node.set_label(&readiness_label("default"));
        cluster.add_node(node);
        cluster.apply_pod(daemon_pod("ws-daemon-1").on_node("node-a"));

        let result = reconciler.reconcile("ws-daemon-1").await.unwrap();
        assert!(!result.node_written);
        assert_eq!(cluster.calls().node_updates, 0);
        assert_eq!(reconciler.cached_node("ws-daemon-1").as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn test_missing_node_on_add_is_not_found() {
        let (cluster, reconciler) = setup();
        cluster.apply_pod(daemon_pod("ws-daemon-1").on_node("node-x"));

        let err = reconciler.reconcile("ws-daemon-1").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert_eq!(reconciler.cached_pods(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflicts_are_retried() {
        let (cluster, reconciler) = setup();
        cluster.apply_pod(daemon_pod("ws-daemon-1").on_node("node-a"));
        cluster.inject_conflicts(2);

        let result = reconciler.reconcile("ws-daemon-1").await.unwrap();
        assert!(result.node_written);
        assert_eq!(cluster.calls().conflicts, 2);
        assert!(cluster
            .node("node-a")
            .unwrap()
            .has_label(&readiness_label("default")));
    }

    #[test]
    fn test_builder_validates() {
        let cluster = Arc::new(InMemoryCluster::new());

        let missing_ns = NodeLabelReconcilerBuilder::new()
            .with_api(Arc::clone(&cluster))
            .with_kind(DaemonKind::ws_daemon())
            .build();
        assert!(missing_ns.is_err());

        let bad_mode = NodeLabelReconcilerBuilder::new()
            .with_api(Arc::clone(&cluster))
            .with_kind(DaemonKind::ws_daemon())
            .with_namespace("default")
            .with_mode(LabelMode::PerKind {
                required: vec!["registry-facade".to_string()],
            })
            .build();
        assert!(bad_mode.is_err());

        let ok = NodeLabelReconcilerBuilder::new()
            .with_api(cluster)
            .with_kind(DaemonKind::ws_daemon())
            .with_namespace("default")
            .build()
            .unwrap();
        assert_eq!(ok.namespace(), "default");
        assert_eq!(ok.mode(), &LabelMode::Shared);
    }
}
