//! Core types for the reconciler.
//!
//! Pods and nodes are modelled as the subset of the Kubernetes v1 JSON the
//! reconciler reads. Nodes keep every unknown field so a full update writes
//! them back untouched.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Domain prefix of every label the reconciler writes.
pub const LABEL_DOMAIN: &str = "warden.io";

/// Label identifying the daemon a pod belongs to.
pub const COMPONENT_LABEL: &str = "component";

/// Node label value meaning "ready".
pub const LABEL_TRUE: &str = "true";

/// Label marking a node as able to host workspaces of `namespace`.
#[must_use]
pub fn readiness_label(namespace: &str) -> String {
    format!("{LABEL_DOMAIN}/ready_for_workspaces_ns_{namespace}")
}

/// Per-kind sub-label used by [`LabelMode::PerKind`].
#[must_use]
pub fn kind_label(kind: &str, namespace: &str) -> String {
    format!("{LABEL_DOMAIN}/{kind}_ready_ns_{namespace}")
}

/// Object metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Fields the reconciler does not interpret (uid, annotations, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ObjectMeta {
    /// Metadata for a namespaced object.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    /// Metadata for a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Pod scheduling spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

/// One pod condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
}

/// Pod status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PodCondition>,
}

/// A daemon pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    /// A pod in `namespace` with no node and no conditions.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            ..Self::default()
        }
    }

    /// Set a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// Assign the pod to a node.
    #[must_use]
    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.spec.node_name = Some(node.into());
        self
    }

    /// Set the `Ready` condition.
    #[must_use]
    pub fn with_ready(mut self, ready: bool) -> Self {
        let status = if ready { "True" } else { "False" };
        self.status.conditions.retain(|c| c.kind != "Ready");
        self.status.conditions.push(PodCondition {
            kind: "Ready".to_string(),
            status: status.to_string(),
        });
        self
    }

    /// Mark the pod as terminating.
    #[must_use]
    pub fn terminating(mut self) -> Self {
        self.metadata.deletion_timestamp = Some(Utc::now());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.get(key).map(String::as_str)
    }

    /// Node the pod is scheduled on, if any.
    #[must_use]
    pub fn node_name(&self) -> Option<&str> {
        self.spec.node_name.as_deref().filter(|n| !n.is_empty())
    }

    /// A deletion timestamp is set.
    #[must_use]
    pub const fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// The `Ready` condition is `True`.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status
            .conditions
            .iter()
            .find(|c| c.kind == "Ready")
            .is_some_and(|c| c.status == "True")
    }
}

/// A cluster node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Spec, status and anything else, written back verbatim.
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::cluster(name),
            rest: Map::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    #[must_use]
    pub fn has_label(&self, key: &str) -> bool {
        self.metadata.labels.contains_key(key)
    }

    /// Set `key` to `"true"`. Returns whether the node changed.
    pub fn set_label(&mut self, key: &str) -> bool {
        if self.has_label(key) {
            return false;
        }
        self.metadata
            .labels
            .insert(key.to_string(), LABEL_TRUE.to_string());
        true
    }

    /// Remove `key`. Returns whether the node changed.
    pub fn remove_label(&mut self, key: &str) -> bool {
        self.metadata.labels.remove(key).is_some()
    }

    /// Labels under [`LABEL_DOMAIN`], for logging.
    #[must_use]
    pub fn warden_labels(&self) -> String {
        self.metadata
            .labels
            .keys()
            .filter(|k| k.starts_with(LABEL_DOMAIN))
            .join(",")
    }
}

/// List metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Result of a pod list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodList {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub items: Vec<Pod>,
}

/// Status object carried by watch `ERROR` events and failed responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiStatus {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// One event of a watch stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// Progress marker; only the resource version is meaningful.
    Bookmark(T),
    Error(ApiStatus),
}

impl WatchEvent<Pod> {
    /// Resource version the stream has reached after this event.
    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            Self::Added(pod) | Self::Modified(pod) | Self::Deleted(pod) | Self::Bookmark(pod) => {
                pod.metadata.resource_version.as_deref()
            }
            Self::Error(_) => None,
        }
    }
}

/// A per-node infrastructure daemon whose readiness gates workspace placement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DaemonKind {
    /// Pod name prefix.
    pub name: String,
    /// Value of the `component` label.
    pub component: String,
}

impl DaemonKind {
    pub fn new(name: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            component: component.into(),
        }
    }

    /// Storage daemon.
    #[must_use]
    pub fn ws_daemon() -> Self {
        Self::new("ws-daemon", "ws-daemon")
    }

    /// Image registry facade.
    #[must_use]
    pub fn registry_facade() -> Self {
        Self::new("registry-facade", "registry-facade")
    }

    /// Selector for list and watch requests.
    #[must_use]
    pub fn label_selector(&self) -> String {
        format!("{COMPONENT_LABEL}={}", self.component)
    }

    /// Whether `pod` belongs to this daemon.
    #[must_use]
    pub fn matches(&self, pod: &Pod) -> bool {
        pod.name().starts_with(&self.name) && pod.label(COMPONENT_LABEL) == Some(&self.component)
    }
}

impl fmt::Display for DaemonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// How daemon readiness is written to nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum LabelMode {
    /// Every kind adds and removes the shared label on its own; last writer wins.
    #[default]
    Shared,
    /// Every kind owns a sub-label; the shared label is present only while
    /// all `required` kinds have theirs.
    PerKind { required: Vec<String> },
}

/// Actions the reconciler can take for one pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileAction {
    /// The pod's node must carry the readiness label.
    EnsureLabel { node: String },
    /// The cached node must lose the readiness label.
    RemoveLabel { node: String },
    /// Nothing is known that the pod could change.
    NoOp,
}

impl ReconcileAction {
    /// Node this action targets.
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::EnsureLabel { node } | Self::RemoveLabel { node } => Some(node),
            Self::NoOp => None,
        }
    }

    /// Get a description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::EnsureLabel { node } => format!("ensure readiness label on {node}"),
            Self::RemoveLabel { node } => format!("remove readiness label from {node}"),
            Self::NoOp => "no-op".to_string(),
        }
    }
}

/// Result of one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Pod that triggered the reconciliation.
    pub pod: String,
    /// Action decided for the pod.
    pub action: ReconcileAction,
    /// Whether a node update was written.
    pub node_written: bool,
}

impl ReconcileResult {
    pub fn new(pod: impl Into<String>, action: ReconcileAction, node_written: bool) -> Self {
        Self {
            pod: pod.into(),
            action,
            node_written,
        }
    }

    /// Nothing was decided and nothing written.
    pub fn no_op(pod: impl Into<String>) -> Self {
        Self::new(pod, ReconcileAction::NoOp, false)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_pod_from_json() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": "ws-daemon-abcde",
                "namespace": "default",
                "labels": { "component": "ws-daemon" },
                "resourceVersion": "42",
                "deletionTimestamp": "2024-05-01T10:00:00Z",
                "uid": "1234"
            },
            "spec": { "nodeName": "node-a", "containers": [] },
            "status": { "conditions": [
                { "type": "PodScheduled", "status": "True" },
                { "type": "Ready", "status": "True" }
            ]}
        }))
        .unwrap();

        assert_eq!(pod.name(), "ws-daemon-abcde");
        assert_eq!(pod.node_name(), Some("node-a"));
        assert!(pod.is_ready());
        assert!(pod.is_terminating());
        assert!(DaemonKind::ws_daemon().matches(&pod));
        assert!(!DaemonKind::registry_facade().matches(&pod));
    }

    #[test]
    fn test_empty_node_name_is_unscheduled() {
        let pod = Pod::new("default", "ws-daemon-1").on_node("");
        assert_eq!(pod.node_name(), None);
    }

    #[test]
    fn test_node_round_trips_unknown_fields() {
        let raw = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": {
                "name": "node-a",
                "resourceVersion": "7",
                "annotations": { "a": "b" },
                "labels": { "kubernetes.io/hostname": "node-a" }
            },
            "spec": { "podCIDR": "10.0.0.0/24" },
            "status": { "capacity": { "cpu": "4" } }
        });
        let mut node: Node = serde_json::from_value(raw.clone()).unwrap();
        assert!(node.set_label(&readiness_label("default")));
        assert!(!node.set_label(&readiness_label("default")));

        let back = serde_json::to_value(&node).unwrap();
        assert_eq!(back["spec"], raw["spec"]);
        assert_eq!(back["status"], raw["status"]);
        assert_eq!(back["metadata"]["annotations"], raw["metadata"]["annotations"]);
        assert_eq!(
            back["metadata"]["labels"]["warden.io/ready_for_workspaces_ns_default"],
            "true"
        );
    }

    #[test]
    fn test_watch_event_decoding() {
        let event: WatchEvent<Pod> = serde_json::from_str(
            r#"{"type":"MODIFIED","object":{"metadata":{"name":"p","resourceVersion":"9"}}}"#,
        )
        .unwrap();
        assert_eq!(event.resource_version(), Some("9"));

        let event: WatchEvent<Pod> = serde_json::from_str(
            r#"{"type":"ERROR","object":{"kind":"Status","code":410,"reason":"Expired","message":"too old"}}"#,
        )
        .unwrap();
        assert!(matches!(event, WatchEvent::Error(ApiStatus { code: 410, .. })));
    }

    #[test]
    fn test_label_keys() {
        assert_eq!(
            readiness_label("prod"),
            "warden.io/ready_for_workspaces_ns_prod"
        );
        assert_eq!(
            kind_label("ws-daemon", "prod"),
            "warden.io/ws-daemon_ready_ns_prod"
        );
    }

    #[test]
    fn test_reconcile_action_description() {
        let action = ReconcileAction::EnsureLabel {
            node: "node-a".to_string(),
        };
        assert!(action.description().contains("ensure"));
        assert_eq!(action.node(), Some("node-a"));
        assert_eq!(ReconcileAction::NoOp.node(), None);
    }
}
