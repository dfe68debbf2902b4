//! Polling observer for locally served ports.
//!
//! The observer re-reads every socket table on a fixed interval and pushes the
//! complete listener list; consumers replace whatever they held before.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use warden_core::ShutdownSignal;

use crate::error::{Error, Result};
use crate::table::{ServedPort, parse_table, snapshot};

/// IPv4 socket table.
pub const NET_TCP: &str = "/proc/net/tcp";
/// IPv6 socket table.
pub const NET_TCP6: &str = "/proc/net/tcp6";

/// Source of socket table contents.
#[async_trait]
pub trait TableSource: Send + Sync {
    /// Read the whole table at `path`.
    async fn read_table(&self, path: &Path) -> std::io::Result<String>;
}

/// Reads socket tables from the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsTableSource;

#[async_trait]
impl TableSource for FsTableSource {
    async fn read_table(&self, path: &Path) -> std::io::Result<String> {
        tokio::fs::read_to_string(path).await
    }
}

/// Configuration for the served port observer.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Interval between table scans.
    pub refresh_interval: Duration,
    /// Tables to read each cycle.
    pub sources: Vec<PathBuf>,
    /// Snapshot queue depth; the observer blocks when it is full.
    pub snapshot_capacity: usize,
    /// Error queue depth; new errors are dropped when it is full.
    pub error_capacity: usize,
    /// Emit every cycle instead of only when the snapshot changed.
    pub emit_unchanged: bool,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(1),
            sources: vec![PathBuf::from(NET_TCP), PathBuf::from(NET_TCP6)],
            snapshot_capacity: 4,
            error_capacity: 16,
            emit_unchanged: false,
        }
    }
}

impl ObserverConfig {
    /// Set the refresh interval.
    #[must_use]
    pub const fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Replace the table paths.
    #[must_use]
    pub fn with_sources(mut self, sources: Vec<PathBuf>) -> Self {
        self.sources = sources;
        self
    }

    /// Emit on every cycle.
    #[must_use]
    pub const fn with_emit_unchanged(mut self, emit: bool) -> Self {
        self.emit_unchanged = emit;
        self
    }
}

/// Observes served ports by polling the kernel socket tables.
pub struct PollingServedPortsObserver<S = FsTableSource> {
    source: Arc<S>,
    config: ObserverConfig,
}

impl PollingServedPortsObserver<FsTableSource> {
    /// Observer over `/proc/net/tcp*`.
    #[must_use]
    pub fn new(config: ObserverConfig) -> Self {
        Self::with_source(FsTableSource, config)
    }
}

impl<S: TableSource + 'static> PollingServedPortsObserver<S> {
    /// Observer over a custom table source.
    pub fn with_source(source: S, config: ObserverConfig) -> Self {
        Self {
            source: Arc::new(source),
            config,
        }
    }

    /// Start observing until `shutdown` fires.
    ///
    /// Entries bound to `workspace_ip` belong to the reverse proxy and are
    /// ignored. Both receivers close when the observer stops.
    pub fn observe(
        &self,
        workspace_ip: impl Into<String>,
        shutdown: ShutdownSignal,
    ) -> (mpsc::Receiver<Vec<ServedPort>>, mpsc::Receiver<Error>) {
        let (snapshot_tx, snapshot_rx) = mpsc::channel(self.config.snapshot_capacity.max(1));
        let (error_tx, error_rx) = mpsc::channel(self.config.error_capacity.max(1));

        let task = ObserveTask {
            source: Arc::clone(&self.source),
            config: self.config.clone(),
            workspace_ip: workspace_ip.into(),
            snapshot_tx,
            error_tx,
        };
        tokio::spawn(task.run(shutdown));

        (snapshot_rx, error_rx)
    }
}

struct ObserveTask<S> {
    source: Arc<S>,
    config: ObserverConfig,
    workspace_ip: String,
    snapshot_tx: mpsc::Sender<Vec<ServedPort>>,
    error_tx: mpsc::Sender<Error>,
}

impl<S: TableSource> ObserveTask<S> {
    async fn run(self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<Vec<ServedPort>> = None;

        info!(
            interval_ms = self.config.refresh_interval.as_millis(),
            workspace_ip = %self.workspace_ip,
            "Observing served ports"
        );

        loop {
            tokio::select! {
                () = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            let ports = self.scan().await;
            if !self.config.emit_unchanged && last.as_ref() == Some(&ports) {
                continue;
            }

            debug!(ports = ports.len(), "Served ports changed");
            tokio::select! {
                () = shutdown.wait() => break,
                sent = self.snapshot_tx.send(ports.clone()) => {
                    if sent.is_err() {
                        debug!("Snapshot consumer gone");
                        break;
                    }
                }
            }
            last = Some(ports);
        }

        info!("Served port observer stopped");
    }

    /// Read every source once. A failing source is reported and skipped.
    async fn scan(&self) -> Vec<ServedPort> {
        let mut entries = Vec::new();
        for path in &self.config.sources {
            match self.read_source(path).await {
                Ok(mut ports) => entries.append(&mut ports),
                Err(e) => self.report(e),
            }
        }
        snapshot(entries, &self.workspace_ip)
    }

    async fn read_source(&self, path: &Path) -> Result<Vec<ServedPort>> {
        let content = self
            .source
            .read_table(path)
            .await
            .map_err(|e| Error::source_unreadable(path, e.to_string()))?;
        parse_table(content.as_bytes(), true)
    }

    fn report(&self, err: Error) {
        warn!(error = %err, "Skipping socket table for this cycle");
        if let Err(TrySendError::Full(dropped)) = self.error_tx.try_send(err) {
            warn!(error = %dropped, "Error queue full, dropping");
        }
    }
}
