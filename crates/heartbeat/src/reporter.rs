//! Periodic activity reporting.
//!
//! Once the instance is running, the reporter samples local activity every
//! interval plus a fresh random jitter and reports connectivity transitions
//! over whatever link is current. Reports run on one task, in order.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use warden_core::{Phase, ShutdownSignal, WorkspaceInstance};

use crate::activity::ActivitySource;
use crate::connection::{LinkSlot, current_link};
use crate::state::{HeartbeatDecision, HeartbeatState, decide};

/// Latest accepted instance, published by the instance session.
pub type InstanceWatch = watch::Receiver<Option<WorkspaceInstance>>;

/// Reporting cadence.
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Fixed part of the interval.
    pub interval: Duration,
    /// Smallest jitter added to each interval.
    pub jitter_min: Duration,
    /// Largest jitter added to each interval.
    pub jitter_max: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            jitter_min: Duration::from_secs(5),
            jitter_max: Duration::from_secs(15),
        }
    }
}

impl ReporterConfig {
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub const fn with_jitter(mut self, min: Duration, max: Duration) -> Self {
        self.jitter_min = min;
        self.jitter_max = max;
        self
    }

    /// Interval plus one freshly drawn jitter.
    #[must_use]
    pub fn next_bound(&self) -> Duration {
        let jitter = if self.jitter_max > self.jitter_min {
            rand::thread_rng().gen_range(self.jitter_min..=self.jitter_max)
        } else {
            self.jitter_min
        };
        self.interval + jitter
    }
}

fn running_id(instance: Option<&WorkspaceInstance>) -> Option<String> {
    instance
        .filter(|instance| instance.phase() == Phase::Running)
        .map(|instance| instance.id.clone())
}

/// Samples activity and reports connectivity transitions.
pub struct HeartbeatReporter<A: ?Sized> {
    activity: Arc<A>,
    link: LinkSlot,
    instance: InstanceWatch,
    config: ReporterConfig,
}

impl<A: ActivitySource + ?Sized> HeartbeatReporter<A> {
    pub fn new(
        activity: Arc<A>,
        link: LinkSlot,
        instance: InstanceWatch,
        config: ReporterConfig,
    ) -> Self {
        Self {
            activity,
            link,
            instance,
            config,
        }
    }

    /// Report until shutdown. Nothing is sampled before the instance runs.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        let Some(instance_id) = self.wait_until_running(&mut shutdown).await else {
            debug!("Stopped before the instance was running");
            return;
        };
        info!(instance = %instance_id, "Instance running, heartbeat reporting started");

        let mut previous = HeartbeatState::default();
        loop {
            let bound = self.config.next_bound();
            tokio::select! {
                () = shutdown.wait() => break,
                () = tokio::time::sleep(bound) => {}
            }

            let current = self.activity.sample().await;
            match decide(&previous, &current, bound) {
                HeartbeatDecision::Report { was_closed } => self.report(was_closed).await,
                HeartbeatDecision::Unchanged => {
                    debug!(connected = current.connected, "Activity unchanged");
                }
                HeartbeatDecision::Ambiguous => {
                    debug!(
                        idle_secs = current.seconds_since_last_activity,
                        bound_secs = bound.as_secs(),
                        "Idle past the interval, skipping report"
                    );
                }
            }
            previous = current;
        }
        info!("Heartbeat reporting stopped");
    }

    async fn wait_until_running(&mut self, shutdown: &mut ShutdownSignal) -> Option<String> {
        loop {
            let running = running_id(self.instance.borrow_and_update().as_ref());
            if running.is_some() {
                return running;
            }
            tokio::select! {
                () = shutdown.wait() => return None,
                changed = self.instance.changed() => changed.ok()?,
            }
        }
    }

    async fn report(&self, was_closed: bool) {
        let Some(instance_id) = self.instance.borrow().as_ref().map(|i| i.id.clone()) else {
            return;
        };
        let Some(link) = current_link(&self.link) else {
            warn!(instance = %instance_id, was_closed, "No live link, skipping heartbeat");
            return;
        };

        match link.send_heartbeat(&instance_id, was_closed).await {
            Ok(()) => info!(instance = %instance_id, was_closed, "Heartbeat sent"),
            Err(e) => warn!(instance = %instance_id, was_closed, error = %e, "Heartbeat failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use warden_core::ShutdownHandle;

    use super::*;
    use crate::connection::Link;
    use crate::error::{Error, Result};

    /// Plays back samples, repeating the last one.
    struct Script {
        samples: Mutex<VecDeque<HeartbeatState>>,
        taken: AtomicUsize,
    }

    impl Script {
        fn new(samples: &[HeartbeatState]) -> Arc<Self> {
            Arc::new(Self {
                samples: Mutex::new(samples.iter().copied().collect()),
                taken: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ActivitySource for Script {
        async fn sample(&self) -> HeartbeatState {
            self.taken.fetch_add(1, Ordering::SeqCst);
            let mut samples = self.samples.lock().unwrap();
            if samples.len() > 1 {
                samples.pop_front().unwrap_or_default()
            } else {
                samples.front().copied().unwrap_or_default()
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, bool)>>,
        attempts: AtomicUsize,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl Link for Recorder {
        async fn send_heartbeat(&self, instance_id: &str, was_closed: bool) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(Error::LinkClosed);
            }
            self.sent
                .lock()
                .unwrap()
                .push((instance_id.to_string(), was_closed));
            Ok(())
        }
        async fn get_owner_token(&self, _: &str) -> Result<String> {
            Ok(String::new())
        }
        async fn get_join_link(&self, _: &str) -> Result<String> {
            Ok(String::new())
        }
        async fn closed(&self) {
            std::future::pending::<()>().await;
        }
        async fn close(&self) {}
    }

    fn running() -> Option<WorkspaceInstance> {
        Some(WorkspaceInstance::new("inst-1", "ws-1", Phase::Running))
    }

    #[test]
    fn test_bound_stays_within_jitter() {
        let config = ReporterConfig::default();
        for _ in 0..100 {
            let bound = config.next_bound();
            assert!(bound >= Duration::from_secs(35) && bound <= Duration::from_secs(45));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reports_single_open() {
        let activity = Script::new(&[HeartbeatState::new(false, 0), HeartbeatState::new(true, 5)]);
        let recorder = Arc::new(Recorder::default());
        let (_link_tx, link_rx) = watch::channel(Some(Arc::clone(&recorder) as Arc<dyn Link>));
        let (_instance_tx, instance_rx) = watch::channel(running());

        let reporter = HeartbeatReporter::new(
            activity,
            link_rx,
            instance_rx,
            ReporterConfig::default(),
        );
        let (handle, signal) = ShutdownHandle::new();
        let task = tokio::spawn(reporter.run(signal));

        // Two ticks take between 70s and 90s; a third needs at least 105s.
        tokio::time::sleep(Duration::from_secs(100)).await;
        handle.shutdown();
        task.await.unwrap();

        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("inst-1".to_string(), false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_running_phase() {
        let activity = Script::new(&[HeartbeatState::new(true, 0)]);
        let (_link_tx, link_rx) = watch::channel(None);
        let (instance_tx, instance_rx) = watch::channel(Some(WorkspaceInstance::new(
            "inst-1",
            "ws-1",
            Phase::Creating,
        )));

        let reporter = HeartbeatReporter::new(
            Arc::clone(&activity),
            link_rx,
            instance_rx,
            ReporterConfig::default(),
        );
        let (handle, signal) = ShutdownHandle::new();
        let task = tokio::spawn(reporter.run(signal));

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(activity.taken.load(Ordering::SeqCst), 0);

        instance_tx.send_replace(running());
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(activity.taken.load(Ordering::SeqCst), 1);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_link_still_advances_state() {
        let activity = Script::new(&[HeartbeatState::new(true, 0)]);
        let recorder = Arc::new(Recorder::default());
        let (link_tx, link_rx) = watch::channel(None);
        let (_instance_tx, instance_rx) = watch::channel(running());

        let reporter = HeartbeatReporter::new(
            activity,
            link_rx,
            instance_rx,
            ReporterConfig::default(),
        );
        let (handle, signal) = ShutdownHandle::new();
        let task = tokio::spawn(reporter.run(signal));

        // The "opened" transition is dropped for lack of a link.
        tokio::time::sleep(Duration::from_secs(50)).await;
        link_tx.send_replace(Some(Arc::clone(&recorder) as Arc<dyn Link>));
        tokio::time::sleep(Duration::from_secs(100)).await;

        handle.shutdown();
        task.await.unwrap();
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_still_advances_state() {
        let activity = Script::new(&[
            HeartbeatState::new(true, 0),
            HeartbeatState::new(true, 0),
            HeartbeatState::new(false, 0),
        ]);
        let recorder = Arc::new(Recorder::default());
        recorder.fail_next.store(true, Ordering::SeqCst);
        let (_link_tx, link_rx) = watch::channel(Some(Arc::clone(&recorder) as Arc<dyn Link>));
        let (_instance_tx, instance_rx) = watch::channel(running());

        let config = ReporterConfig::default()
            .with_jitter(Duration::from_secs(5), Duration::from_secs(5));
        let reporter = HeartbeatReporter::new(activity, link_rx, instance_rx, config);
        let (handle, signal) = ShutdownHandle::new();
        let task = tokio::spawn(reporter.run(signal));

        // Ticks every 35s: the "opened" send fails, the repeat sample is
        // unchanged, then the disconnect is reported.
        tokio::time::sleep(Duration::from_secs(80)).await;
        assert_eq!(recorder.attempts.load(Ordering::SeqCst), 1);
        assert!(recorder.sent.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(40)).await;
        handle.shutdown();
        task.await.unwrap();

        assert_eq!(recorder.attempts.load(Ordering::SeqCst), 2);
        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("inst-1".to_string(), true)]);
    }
}
