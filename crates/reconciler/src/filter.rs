//! Which pod events trigger a reconciliation.

use crate::types::{DaemonKind, Pod};

/// A pod change as seen by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum PodEvent {
    Created(Pod),
    /// `old` is `None` when the previous state was never observed.
    Updated { old: Option<Pod>, new: Pod },
    Deleted(Pod),
}

impl PodEvent {
    /// Name of the pod the event is about.
    #[must_use]
    pub fn pod_name(&self) -> &str {
        match self {
            Self::Created(pod) | Self::Updated { new: pod, .. } | Self::Deleted(pod) => pod.name(),
        }
    }
}

/// Namespace and daemon-kind predicates for pod events.
///
/// Creations never pass: a pod is not ready when it is created. Updates pass
/// only on the edge into the `Ready` condition. Deletions pass whenever the
/// pod belongs to the namespace and kind.
#[derive(Debug, Clone)]
pub struct EventFilter {
    namespace: String,
    kind: DaemonKind,
}

impl EventFilter {
    pub fn new(namespace: impl Into<String>, kind: DaemonKind) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
        }
    }

    /// Whether `event` should be reconciled.
    #[must_use]
    pub fn accepts(&self, event: &PodEvent) -> bool {
        match event {
            PodEvent::Created(_) => false,
            PodEvent::Updated { old, new } => {
                let old_in_namespace = old.as_ref().is_none_or(|old| self.in_namespace(old));
                let became_ready = new.is_ready() && !old.as_ref().is_some_and(Pod::is_ready);
                old_in_namespace
                    && self.in_namespace(new)
                    && self.kind.matches(new)
                    && became_ready
            }
            PodEvent::Deleted(pod) => self.in_namespace(pod) && self.kind.matches(pod),
        }
    }

    fn in_namespace(&self, pod: &Pod) -> bool {
        pod.namespace() == Some(self.namespace.as_str())
    }
}
