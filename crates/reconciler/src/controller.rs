//! Event-driven driver for a [`NodeLabelReconciler`].
//!
//! The controller lists the daemon's pods, reconciles all of them once with
//! bounded concurrency, then follows a watch from the listed resource version.
//! Accepted events are dispatched by pod name to a fixed set of sequential
//! workers, so events for one pod are handled in order while different pods
//! proceed in parallel.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use warden_core::ShutdownSignal;

use crate::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::filter::{EventFilter, PodEvent};
use crate::reconciler::NodeLabelReconciler;
use crate::retry::{RetryPolicy, retry_when};
use crate::types::{Pod, WatchEvent};

/// Configuration for the controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of sequential workers; pods are sharded across them by name.
    pub workers: usize,
    /// Queue depth per worker. Dispatch waits when a queue is full.
    pub queue_capacity: usize,
    /// Concurrent reconciliations during the initial scan.
    pub warmup_concurrency: usize,
    /// Requeue policy for retryable reconciliation errors.
    pub requeue: RetryPolicy,
    /// Pause before re-listing or re-watching after a failure.
    pub rewatch_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 128,
            warmup_concurrency: 4,
            requeue: RetryPolicy::requeue(),
            rewatch_delay: Duration::from_secs(1),
        }
    }
}

impl ControllerConfig {
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub const fn with_warmup_concurrency(mut self, concurrency: usize) -> Self {
        self.warmup_concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_requeue(mut self, requeue: RetryPolicy) -> Self {
        self.requeue = requeue;
        self
    }

    #[must_use]
    pub const fn with_rewatch_delay(mut self, delay: Duration) -> Self {
        self.rewatch_delay = delay;
        self
    }
}

/// Worker index for `pod` among `shards` workers.
#[must_use]
pub fn shard_for(pod: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    pod.hash(&mut hasher);
    let shards = u64::try_from(shards.max(1)).unwrap_or(1);
    usize::try_from(hasher.finish() % shards).unwrap_or(0)
}

/// Drives one reconciler from the cluster's pod events.
pub struct Controller<C: ?Sized> {
    reconciler: Arc<NodeLabelReconciler<C>>,
    filter: EventFilter,
    config: ControllerConfig,
}

impl<C: ClusterApi + ?Sized + 'static> Controller<C> {
    pub fn new(reconciler: Arc<NodeLabelReconciler<C>>, config: ControllerConfig) -> Self {
        let filter = EventFilter::new(reconciler.namespace(), reconciler.kind().clone());
        Self {
            reconciler,
            filter,
            config,
        }
    }

    #[must_use]
    pub fn reconciler(&self) -> &Arc<NodeLabelReconciler<C>> {
        &self.reconciler
    }

    /// Run until `shutdown` fires or a non-retryable list/watch error occurs.
    ///
    /// Workers finish the reconciliation they are in and stop.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<()> {
        let (queues, workers) = self.spawn_workers(&shutdown);
        info!(
            kind = %self.reconciler.kind(),
            namespace = self.reconciler.namespace(),
            workers = queues.len(),
            "Controller started"
        );

        let result = self.drive(shutdown, &queues).await;

        drop(queues);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker task failed");
            }
        }
        match &result {
            Ok(()) => info!(kind = %self.reconciler.kind(), "Controller stopped"),
            Err(e) => error!(kind = %self.reconciler.kind(), error = %e, "Controller aborted"),
        }
        result
    }

    /// Reconcile `pods` once each with bounded concurrency.
    pub async fn warm_up(&self, pods: Vec<String>) {
        info!(
            kind = %self.reconciler.kind(),
            pods = pods.len(),
            "Warming up node labels"
        );
        let reconciler = &*self.reconciler;
        let policy = &self.config.requeue;
        stream::iter(pods)
            .map(|pod| async move { process(reconciler, policy, &pod).await })
            .buffer_unordered(self.config.warmup_concurrency.max(1))
            .collect::<()>()
            .await;
    }

    fn spawn_workers(
        &self,
        shutdown: &ShutdownSignal,
    ) -> (Vec<mpsc::Sender<String>>, Vec<JoinHandle<()>>) {
        (0..self.config.workers.max(1))
            .map(|id| {
                let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
                let handle = tokio::spawn(worker(
                    id,
                    Arc::clone(&self.reconciler),
                    self.config.requeue.clone(),
                    rx,
                    shutdown.clone(),
                ));
                (tx, handle)
            })
            .unzip()
    }

    async fn drive(&self, mut shutdown: ShutdownSignal, queues: &[mpsc::Sender<String>]) -> Result<()> {
        let api = Arc::clone(self.reconciler.api());
        let namespace = self.reconciler.namespace().to_string();
        let selector = self.reconciler.kind().label_selector();
        let mut last_seen: HashMap<String, Pod> = HashMap::new();
        let mut initial = true;

        'relist: loop {
            if shutdown.is_shutdown() {
                break;
            }

            let listed = tokio::select! {
                () = shutdown.wait() => break,
                listed = self.list_and_sync(&mut last_seen, queues, initial) => listed,
            };
            let mut resource_version = match listed {
                Ok(rv) => rv,
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "Listing pods failed, retrying");
                    self.pause(&mut shutdown).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            initial = false;

            loop {
                if shutdown.is_shutdown() {
                    break 'relist;
                }

                let opened = tokio::select! {
                    () = shutdown.wait() => break 'relist,
                    opened = api.watch_pods(&namespace, &selector, &resource_version) => opened,
                };
                let mut watch = match opened {
                    Ok(watch) => watch,
                    Err(Error::WatchExpired { reason }) => {
                        info!(%reason, "Watch expired, re-listing");
                        continue 'relist;
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(error = %e, "Watch failed, retrying");
                        self.pause(&mut shutdown).await;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                debug!(%resource_version, "Watching pods");

                loop {
                    let next = tokio::select! {
                        () = shutdown.wait() => break 'relist,
                        next = watch.next() => next,
                    };
                    match next {
                        None => {
                            debug!("Watch closed, resuming");
                            break;
                        }
                        Some(Ok(WatchEvent::Error(status))) if status.code == 410 => {
                            info!(message = %status.message, "Watch expired, re-listing");
                            continue 'relist;
                        }
                        Some(Ok(WatchEvent::Error(status))) => {
                            warn!(code = status.code, message = %status.message, "Watch error");
                            break;
                        }
                        Some(Ok(event)) => {
                            if let Some(rv) = event.resource_version() {
                                resource_version = rv.to_string();
                            }
                            self.handle(event, &mut last_seen, queues).await;
                        }
                        Some(Err(Error::WatchExpired { reason })) => {
                            info!(%reason, "Watch expired, re-listing");
                            continue 'relist;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Watch stream failed");
                            break;
                        }
                    }
                }
                self.pause(&mut shutdown).await;
            }
        }
        Ok(())
    }

    /// List the daemon's pods and reconcile the ready ones, plus any pod that
    /// vanished since the last listing. Returns the list's resource version.
    async fn list_and_sync(
        &self,
        last_seen: &mut HashMap<String, Pod>,
        queues: &[mpsc::Sender<String>],
        initial: bool,
    ) -> Result<String> {
        let kind = self.reconciler.kind();
        let list = self
            .reconciler
            .api()
            .list_pods(self.reconciler.namespace(), &kind.label_selector())
            .await?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();

        let listed: HashMap<String, Pod> = list
            .items
            .into_iter()
            .filter(|pod| kind.matches(pod))
            .map(|pod| (pod.name().to_string(), pod))
            .collect();
        // Unready pods wait for their edge into Ready, as with live events.
        let mut names: Vec<String> = listed
            .values()
            .filter(|pod| pod.is_ready())
            .map(|pod| pod.name().to_string())
            .collect();
        names.extend(
            last_seen
                .keys()
                .filter(|name| !listed.contains_key(*name))
                .cloned(),
        );
        *last_seen = listed;

        if initial {
            self.warm_up(names).await;
        } else {
            debug!(pods = names.len(), "Re-listed pods");
            for name in names {
                self.dispatch(queues, name).await;
            }
        }
        Ok(resource_version)
    }

    async fn handle(
        &self,
        event: WatchEvent<Pod>,
        last_seen: &mut HashMap<String, Pod>,
        queues: &[mpsc::Sender<String>],
    ) {
        let event = match event {
            WatchEvent::Added(pod) => {
                last_seen.insert(pod.name().to_string(), pod.clone());
                PodEvent::Created(pod)
            }
            WatchEvent::Modified(pod) => {
                let old = last_seen.insert(pod.name().to_string(), pod.clone());
                PodEvent::Updated { old, new: pod }
            }
            WatchEvent::Deleted(pod) => {
                last_seen.remove(pod.name());
                PodEvent::Deleted(pod)
            }
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => return,
        };

        if self.filter.accepts(&event) {
            self.dispatch(queues, event.pod_name().to_string()).await;
        }
    }

    async fn dispatch(&self, queues: &[mpsc::Sender<String>], pod: String) {
        let Some(queue) = queues.get(shard_for(&pod, queues.len())) else {
            return;
        };
        if queue.send(pod).await.is_err() {
            debug!("Worker gone, dropping event");
        }
    }

    async fn pause(&self, shutdown: &mut ShutdownSignal) {
        tokio::select! {
            () = shutdown.wait() => {}
            () = tokio::time::sleep(self.config.rewatch_delay) => {}
        }
    }
}

async fn worker<C: ClusterApi + ?Sized>(
    id: usize,
    reconciler: Arc<NodeLabelReconciler<C>>,
    policy: RetryPolicy,
    mut queue: mpsc::Receiver<String>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        let pod = tokio::select! {
            biased;
            () = shutdown.wait() => break,
            pod = queue.recv() => match pod {
                Some(pod) => pod,
                None => break,
            },
        };
        process(&*reconciler, &policy, &pod).await;
    }
    debug!(worker = id, "Worker stopped");
}

/// Reconcile one pod, requeueing retryable failures in place.
async fn process<C: ClusterApi + ?Sized>(
    reconciler: &NodeLabelReconciler<C>,
    policy: &RetryPolicy,
    pod: &str,
) {
    match retry_when(policy, Error::is_retryable, move || reconciler.reconcile(pod)).await {
        Ok(result) => debug!(
            pod,
            action = %result.action.description(),
            written = result.node_written,
            "Reconciled"
        ),
        Err(e) if e.is_not_found() => warn!(pod, error = %e, "Dropping reconciliation"),
        Err(e) => error!(pod, error = %e, "Reconciliation failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_is_stable_and_in_range() {
        for shards in 1..8 {
            let first = shard_for("ws-daemon-abc", shards);
            assert!(first < shards);
            assert_eq!(first, shard_for("ws-daemon-abc", shards));
        }
        assert_eq!(shard_for("anything", 0), 0);
    }
}
