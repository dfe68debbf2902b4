//! Access to the cluster's pod and node objects.
//!
//! The reconciler needs four verbs against two resource kinds: fetch by name,
//! list, watch and update with optimistic concurrency. [`InMemoryCluster`]
//! implements them for tests and local runs.

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::error::{Error, Result};
use crate::types::{ListMeta, Node, Pod, PodList, WatchEvent};

/// Stream of pod watch events.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent<Pod>>> + Send>>;

/// Read-modify-write access to pods and nodes.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch one pod.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// List pods matching a `key=value[,key=value]` selector.
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<PodList>;

    /// Watch pod changes after `resource_version`.
    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<WatchStream>;

    /// Fetch one node.
    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Replace a node. Fails with a conflict when the node's resource version
    /// is no longer current.
    async fn update_node(&self, node: &Node) -> Result<Node>;
}

/// Parse a `key=value[,key=value]` selector.
#[must_use]
pub fn parse_selector(selector: &str) -> Vec<(String, String)> {
    selector
        .split(',')
        .filter_map(|term| term.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

fn selector_matches(selector: &[(String, String)], pod: &Pod) -> bool {
    selector
        .iter()
        .all(|(key, value)| pod.label(key) == Some(value.as_str()))
}

/// Call counts of an [`InMemoryCluster`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub pod_gets: usize,
    pub node_gets: usize,
    pub node_updates: usize,
    pub conflicts: usize,
}

#[derive(Default)]
struct ClusterState {
    pods: BTreeMap<(String, String), Pod>,
    nodes: BTreeMap<String, Node>,
    revision: u64,
    log: VecDeque<(u64, WatchEvent<Pod>)>,
    /// Newest revision dropped from `log`.
    compacted: u64,
}

impl ClusterState {
    fn bump(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

/// Pod events kept for watch replay, by default.
pub const DEFAULT_HISTORY: usize = 1024;

/// In-process cluster with resource-version conflict detection.
///
/// Only the last `history` pod events are kept. Watching from an older
/// resource version fails as expired, the way a compacted API server does.
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
    history: usize,
    events: broadcast::Sender<(u64, WatchEvent<Pod>)>,
    pending_conflicts: AtomicU32,
    pod_gets: AtomicUsize,
    node_gets: AtomicUsize,
    node_updates: AtomicUsize,
    conflicts: AtomicUsize,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    /// Keep at most `history` pod events for replay.
    #[must_use]
    pub fn with_history(history: usize) -> Self {
        let history = history.max(1);
        let (events, _) = broadcast::channel(history);
        Self {
            state: Mutex::new(ClusterState::default()),
            history,
            events,
            pending_conflicts: AtomicU32::new(0),
            pod_gets: AtomicUsize::new(0),
            node_gets: AtomicUsize::new(0),
            node_updates: AtomicUsize::new(0),
            conflicts: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace a node.
    pub fn add_node(&self, node: Node) {
        let mut state = self.lock();
        let mut node = node;
        node.metadata.resource_version = Some(state.bump());
        state.nodes.insert(node.name().to_string(), node);
    }

    /// Current copy of a node.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<Node> {
        self.lock().nodes.get(name).cloned()
    }

    /// Create or update a pod, notifying watchers.
    pub fn apply_pod(&self, pod: Pod) {
        let mut state = self.lock();
        let mut pod = pod;
        let key = pod_key(&pod);
        let revision = state.bump();
        pod.metadata.resource_version = Some(revision);
        let event = if state.pods.contains_key(&key) {
            WatchEvent::Modified(pod.clone())
        } else {
            WatchEvent::Added(pod.clone())
        };
        state.pods.insert(key, pod);
        self.publish(&mut state, event);
    }

    /// Delete a pod, notifying watchers. Returns whether it existed.
    pub fn delete_pod(&self, namespace: &str, name: &str) -> bool {
        let mut state = self.lock();
        let Some(mut pod) = state
            .pods
            .remove(&(namespace.to_string(), name.to_string()))
        else {
            return false;
        };
        pod.metadata.resource_version = Some(state.bump());
        self.publish(&mut state, WatchEvent::Deleted(pod));
        true
    }

    /// Make the next `n` node updates fail with a conflict, as if another
    /// writer got there first.
    pub fn inject_conflicts(&self, n: u32) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    /// Snapshot of the call counters.
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        CallCounts {
            pod_gets: self.pod_gets.load(Ordering::SeqCst),
            node_gets: self.node_gets.load(Ordering::SeqCst),
            node_updates: self.node_updates.load(Ordering::SeqCst),
            conflicts: self.conflicts.load(Ordering::SeqCst),
        }
    }

    fn publish(&self, state: &mut ClusterState, event: WatchEvent<Pod>) {
        let revision = state.revision;
        state.log.push_back((revision, event.clone()));
        while state.log.len() > self.history {
            if let Some((dropped, _)) = state.log.pop_front() {
                state.compacted = dropped;
            }
        }
        // No receivers is fine; the log replays for later watchers.
        let _ = self.events.send((revision, event));
    }

    fn take_injected_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn pod_key(pod: &Pod) -> (String, String) {
    (
        pod.namespace().unwrap_or_default().to_string(),
        pod.name().to_string(),
    )
}

fn event_pod(event: &WatchEvent<Pod>) -> Option<&Pod> {
    match event {
        WatchEvent::Added(pod)
        | WatchEvent::Modified(pod)
        | WatchEvent::Deleted(pod)
        | WatchEvent::Bookmark(pod) => Some(pod),
        WatchEvent::Error(_) => None,
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pod_gets.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found("pod", name))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<PodList> {
        let selector = parse_selector(label_selector);
        let state = self.lock();
        let items = state
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && selector_matches(&selector, pod))
            .map(|(_, pod)| pod.clone())
            .collect();
        Ok(PodList {
            metadata: ListMeta {
                resource_version: Some(state.revision.to_string()),
            },
            items,
        })
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<WatchStream> {
        let since: u64 = resource_version.parse().unwrap_or(0);
        let selector = parse_selector(label_selector);
        let namespace = namespace.to_string();

        // Replay and subscribe under one lock so no event falls in between.
        let (replay, rx) = {
            let state = self.lock();
            if since < state.compacted {
                return Err(Error::watch_expired(format!(
                    "resource version {since} is older than {}",
                    state.compacted
                )));
            }
            let replay: Vec<_> = state
                .log
                .iter()
                .filter(|(rev, _)| *rev > since)
                .map(|(_, event)| event.clone())
                .collect();
            (replay, self.events.subscribe())
        };

        let keep = move |event: &WatchEvent<Pod>| {
            event_pod(event).is_some_and(|pod| {
                pod.namespace() == Some(namespace.as_str()) && selector_matches(&selector, pod)
            })
        };
        let keep_live = keep.clone();

        let live = stream::unfold(rx, move |mut rx| {
            let keep_live = keep_live.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((rev, event)) if rev > since && keep_live(&event) => {
                            return Some((Ok(event), rx));
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => {
                            return Some((
                                Err(Error::watch_expired(format!("watcher lagged by {n}"))),
                                rx,
                            ));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        let replayed = stream::iter(replay.into_iter().filter(keep).map(Ok));
        Ok(replayed.chain(live).boxed())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.node_gets.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("node", name))
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        let mut state = self.lock();
        let name = node.name().to_string();
        let current = state
            .nodes
            .get(&name)
            .ok_or_else(|| Error::not_found("node", &name))?;

        if self.take_injected_conflict()
            || current.metadata.resource_version != node.metadata.resource_version
        {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(Error::conflict("node", name));
        }

        let mut stored = node.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.nodes.insert(name, stored.clone());
        self.node_updates.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn daemon(name: &str) -> Pod {
        Pod::new("default", name).with_label("component", "ws-daemon")
    }

    #[tokio::test]
    async fn test_update_detects_stale_resource_version() {
        let cluster = InMemoryCluster::new();
        cluster.add_node(Node::new("n1"));

        let mut first = cluster.get_node("n1").await.unwrap();
        let mut second = first.clone();

        first.set_label("a");
        cluster.update_node(&first).await.unwrap();

        second.set_label("b");
        let err = cluster.update_node(&second).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(cluster.calls().node_updates, 1);
        assert_eq!(cluster.calls().conflicts, 1);
    }

    #[tokio::test]
    async fn test_injected_conflicts_are_consumed() {
        let cluster = InMemoryCluster::new();
        cluster.add_node(Node::new("n1"));
        cluster.inject_conflicts(1);

        let node = cluster.get_node("n1").await.unwrap();
        assert!(cluster.update_node(&node).await.unwrap_err().is_conflict());
        assert!(cluster.update_node(&node).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_filters_namespace_and_selector() {
        let cluster = InMemoryCluster::new();
        cluster.apply_pod(daemon("ws-daemon-1"));
        cluster.apply_pod(Pod::new("other", "ws-daemon-2").with_label("component", "ws-daemon"));
        cluster.apply_pod(Pod::new("default", "proxy-1").with_label("component", "proxy"));

        let list = cluster
            .list_pods("default", "component=ws-daemon")
            .await
            .unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].name(), "ws-daemon-1");
        assert_eq!(list.metadata.resource_version.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_watch_replays_then_follows() {
        let cluster = InMemoryCluster::new();
        cluster.apply_pod(daemon("ws-daemon-1"));
        let rv = cluster
            .list_pods("default", "component=ws-daemon")
            .await
            .unwrap()
            .metadata
            .resource_version
            .unwrap();

        cluster.apply_pod(daemon("ws-daemon-1").with_ready(true));
        let mut watch = cluster
            .watch_pods("default", "component=ws-daemon", &rv)
            .await
            .unwrap();
        cluster.delete_pod("default", "ws-daemon-1");

        assert!(matches!(
            watch.next().await.unwrap().unwrap(),
            WatchEvent::Modified(_)
        ));
        assert!(matches!(
            watch.next().await.unwrap().unwrap(),
            WatchEvent::Deleted(_)
        ));
    }

    #[tokio::test]
    async fn test_history_is_capped_and_old_watches_expire() {
        let cluster = InMemoryCluster::with_history(2);
        for ready in [false, true, false, true] {
            cluster.apply_pod(daemon("ws-daemon-1").with_ready(ready));
        }
        assert_eq!(cluster.lock().log.len(), 2);

        let expired = cluster
            .watch_pods("default", "component=ws-daemon", "1")
            .await
            .err()
            .unwrap();
        assert!(matches!(expired, Error::WatchExpired { .. }));

        let mut watch = cluster
            .watch_pods("default", "component=ws-daemon", "3")
            .await
            .unwrap();
        let replayed = watch.next().await.unwrap().unwrap();
        assert_eq!(replayed.resource_version(), Some("4"));
    }

    #[test]
    fn test_parse_selector() {
        assert_eq!(
            parse_selector("component=ws-daemon, app = x"),
            vec![
                ("component".to_string(), "ws-daemon".to_string()),
                ("app".to_string(), "x".to_string())
            ]
        );
        assert!(parse_selector("").is_empty());
    }
}
