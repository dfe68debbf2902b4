//! Behaviour of the polling observer against in-memory socket tables.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use warden_core::ShutdownHandle;
use warden_ports::{Error, ObserverConfig, PollingServedPortsObserver, TableSource};

const HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n";

#[derive(Clone, Default)]
struct MemoryTables {
    tables: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl MemoryTables {
    fn set(&self, path: &str, entries: &[&str]) {
        let body = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| format!("   {i}: {entry} 00000000:00000000 00:00000000 00000000 0 0 1 1\n"))
            .collect::<String>();
        self.tables
            .lock()
            .unwrap()
            .insert(PathBuf::from(path), format!("{HEADER}{body}"));
    }

    fn remove(&self, path: &str) {
        self.tables.lock().unwrap().remove(Path::new(path));
    }
}

#[async_trait]
impl TableSource for MemoryTables {
    async fn read_table(&self, path: &Path) -> io::Result<String> {
        self.tables
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such table"))
    }
}

fn config() -> ObserverConfig {
    ObserverConfig::default()
        .with_refresh_interval(Duration::from_millis(100))
        .with_sources(vec![PathBuf::from("tcp"), PathBuf::from("tcp6")])
}

fn render(ports: &[warden_ports::ServedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|p| format!("{}:{}", p.address, p.port))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_merges_both_tables() {
    let tables = MemoryTables::default();
    tables.set(
        "tcp",
        &[
            "0100007F:0016 00000000:0000 0A",
            "00000000:1F90 00000000:0000 0A",
            "0205000A:1F90 00000000:0000 0A",
            "0100007F:0016 0100007F:C350 01",
        ],
    );
    tables.set(
        "tcp6",
        &[
            "00000000000000000000000001000000:0016 00000000000000000000000000000000:0000 0A",
            "00000000000000000000000000000000:0BB8 00000000000000000000000000000000:0000 0A",
        ],
    );

    let (handle, signal) = ShutdownHandle::new();
    let observer = PollingServedPortsObserver::with_source(tables, config());
    let (mut snapshots, _errors) = observer.observe("10.0.5.2", signal);

    let ports = snapshots.recv().await.unwrap();
    assert_eq!(
        render(&ports),
        vec!["::1:22", "127.0.0.1:22", ":::3000", "0.0.0.0:8080"]
    );
    assert!(ports[0].bound_to_localhost);
    assert!(!ports[3].bound_to_localhost);

    handle.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_source_is_skipped_not_fatal() {
    let tables = MemoryTables::default();
    tables.set("tcp", &["00000000:0BB8 00000000:0000 0A"]);

    let (handle, signal) = ShutdownHandle::new();
    let observer = PollingServedPortsObserver::with_source(tables.clone(), config());
    let (mut snapshots, mut errors) = observer.observe("10.0.5.2", signal);

    let err = errors.recv().await.unwrap();
    assert!(matches!(err, Error::SourceUnreadable { ref path, .. } if path == Path::new("tcp6")));

    let ports = snapshots.recv().await.unwrap();
    assert_eq!(render(&ports), vec!["0.0.0.0:3000"]);

    handle.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_emits_only_on_change_including_empty() {
    let tables = MemoryTables::default();
    tables.set("tcp", &["00000000:0BB8 00000000:0000 0A"]);
    tables.set("tcp6", &[]);

    let (handle, signal) = ShutdownHandle::new();
    let observer = PollingServedPortsObserver::with_source(tables.clone(), config());
    let (mut snapshots, _errors) = observer.observe("10.0.5.2", signal);

    assert_eq!(render(&snapshots.recv().await.unwrap()), vec!["0.0.0.0:3000"]);

    let quiet = tokio::time::timeout(Duration::from_secs(2), snapshots.recv()).await;
    assert!(quiet.is_err(), "unchanged snapshot must not be re-emitted");

    tables.set(
        "tcp",
        &["00000000:0BB8 00000000:0000 0A", "0100007F:1F90 00000000:0000 0A"],
    );
    assert_eq!(
        render(&snapshots.recv().await.unwrap()),
        vec!["0.0.0.0:3000", "127.0.0.1:8080"]
    );

    tables.set("tcp", &[]);
    assert!(snapshots.recv().await.unwrap().is_empty());

    handle.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_emit_unchanged_pushes_every_cycle() {
    let tables = MemoryTables::default();
    tables.set("tcp", &["00000000:0BB8 00000000:0000 0A"]);
    tables.set("tcp6", &[]);

    let (handle, signal) = ShutdownHandle::new();
    let observer =
        PollingServedPortsObserver::with_source(tables, config().with_emit_unchanged(true));
    let (mut snapshots, _errors) = observer.observe("10.0.5.2", signal);

    let first = snapshots.recv().await.unwrap();
    let second = snapshots.recv().await.unwrap();
    assert_eq!(first, second);

    handle.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_both_streams() {
    let tables = MemoryTables::default();
    tables.set("tcp", &["00000000:0BB8 00000000:0000 0A"]);
    tables.remove("tcp6");

    let (handle, signal) = ShutdownHandle::new();
    let observer = PollingServedPortsObserver::with_source(tables, config());
    let (mut snapshots, mut errors) = observer.observe("10.0.5.2", signal);

    assert!(snapshots.recv().await.is_some());
    handle.shutdown();

    while snapshots.recv().await.is_some() {}
    while errors.recv().await.is_some() {}
}
