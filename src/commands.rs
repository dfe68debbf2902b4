//! CLI command handlers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use futures::future::try_join_all;
use tokio::sync::mpsc;
use tracing::{Instrument, info, info_span, warn};
use warden_core::ShutdownSignal;
use warden_heartbeat::{SessionEvent, StatusFileActivity, WorkspaceSession, WsConnector};
use warden_ports::PollingServedPortsObserver;
use warden_reconciler::{Controller, KubeClient, KubeConfig, NodeLabelReconcilerBuilder};

use crate::cli::Commands;
use crate::config::{ClusterSection, WardenConfig};

/// Route a command to its handler.
pub async fn execute_command(
    command: Commands,
    mut config: WardenConfig,
    shutdown: ShutdownSignal,
) -> Result<()> {
    match command {
        Commands::Reconcile { namespace, kind } => {
            if let Some(namespace) = namespace {
                config.reconciler.namespace = namespace;
            }
            if !kind.is_empty() {
                config.reconciler.kinds = kind;
            }
            cmd_reconcile(&config, shutdown).await
        }

        Commands::Ports {
            workspace_ip,
            interval_ms,
        } => {
            if let Some(ip) = workspace_ip {
                config.ports.workspace_ip = ip;
            }
            if let Some(ms) = interval_ms {
                config.ports.refresh_interval = Duration::from_millis(ms);
            }
            cmd_ports(&config, shutdown).await
        }

        Commands::Heartbeat {
            server,
            status_file,
        } => {
            if let Some(server) = server {
                config.heartbeat.server_host = server;
            }
            if let Some(path) = status_file {
                config.heartbeat.status_file = path;
            }
            cmd_heartbeat(&config, shutdown).await
        }
    }
}

fn kube_config(cluster: &ClusterSection) -> Result<KubeConfig> {
    let Some(api_server) = &cluster.api_server else {
        return KubeConfig::in_cluster()
            .context("No API server configured and not running in a cluster");
    };

    let mut kube = KubeConfig::from_url(api_server)?;
    if let Some(path) = &cluster.token_file {
        kube = kube.with_token_file(path)?;
    }
    if let Some(path) = &cluster.ca_file {
        kube = kube.with_ca_file(path)?;
    }
    Ok(kube.with_request_timeout(cluster.request_timeout))
}

async fn cmd_reconcile(config: &WardenConfig, shutdown: ShutdownSignal) -> Result<()> {
    let section = &config.reconciler;
    let client = Arc::new(KubeClient::new(kube_config(&config.cluster)?)?);

    let controllers = section
        .daemon_kinds()
        .into_iter()
        .map(|kind| {
            let reconciler = NodeLabelReconcilerBuilder::new()
                .with_api(Arc::clone(&client))
                .with_kind(kind.clone())
                .with_namespace(section.namespace.clone())
                .with_mode(section.label.clone())
                .build()
                .with_context(|| format!("Invalid reconciler settings for {kind}"))?;
            let controller = Controller::new(Arc::new(reconciler), section.controller_config());
            Ok((kind, controller))
        })
        .collect::<Result<Vec<_>>>()?;

    info!(
        namespace = %section.namespace,
        controllers = controllers.len(),
        "Starting node label reconciliation"
    );

    let tasks = controllers.into_iter().map(|(kind, controller)| {
        let handle = tokio::spawn(controller.run(shutdown.clone()));
        async move {
            handle
                .await
                .with_context(|| format!("Controller for {kind} panicked"))?
                .with_context(|| format!("Controller for {kind} failed"))
        }
    });
    try_join_all(tasks).await?;

    info!("Node label reconciliation stopped");
    Ok(())
}

async fn cmd_ports(config: &WardenConfig, shutdown: ShutdownSignal) -> Result<()> {
    let observer = PollingServedPortsObserver::new(config.ports.observer_config());
    let (mut snapshots, mut errors) = observer.observe(config.ports.workspace_ip.clone(), shutdown);

    loop {
        tokio::select! {
            snapshot = snapshots.recv() => match snapshot {
                Some(ports) => println!("{}", serde_json::to_string(&ports)?),
                None => break,
            },
            Some(error) = errors.recv() => warn!(error = %error, "Cannot read socket table"),
        }
    }
    Ok(())
}

fn read_token(path: &Path) -> Result<String> {
    let token = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read token file {}", path.display()))?;
    Ok(token.trim().to_string())
}

async fn cmd_heartbeat(config: &WardenConfig, shutdown: ShutdownSignal) -> Result<()> {
    let section = &config.heartbeat;
    ensure!(
        !section.server_host.is_empty(),
        "No workspace server configured; set heartbeat.server_host or WARDEN_SERVER_HOST"
    );

    let mut connector = WsConnector::with_endpoint(&section.endpoint())?
        .with_call_timeout(section.call_timeout);
    if let Some(path) = &section.token_file {
        connector = connector.with_token(read_token(path)?);
    }
    let activity = Arc::new(StatusFileActivity::new(&section.status_file));
    let session = WorkspaceSession::new(Arc::new(connector), activity, section.session_config());

    let span = info_span!(
        "heartbeat",
        instance = section.instance_id.as_deref().unwrap_or("-"),
        workspace = section.workspace_id.as_deref().unwrap_or("-"),
    );
    info!(endpoint = %section.endpoint(), "Starting workspace session");

    let (events_tx, mut events) = mpsc::channel(16);
    let run = tokio::spawn(session.run(shutdown, events_tx).instrument(span));
    while let Some(event) = events.recv().await {
        log_event(&event);
    }

    run.await
        .context("Workspace session panicked")?
        .context("Workspace session failed")
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Phase { instance_id, phase } => {
            info!(instance = %instance_id, phase = %phase, "{}", phase.display_text());
        }
        SessionEvent::Failed {
            instance_id,
            reason,
        } => warn!(instance = %instance_id, reason = %reason, "Workspace failed"),
        SessionEvent::OwnerToken { workspace_id, .. } => {
            info!(workspace = %workspace_id, "Owner token available");
        }
        SessionEvent::JoinLink { instance_id, link } => {
            info!(instance = %instance_id, link = %link, "Join link available");
        }
        SessionEvent::FetchFailed { what, reason } => {
            warn!(what, reason = %reason, "Session detail unavailable");
        }
        SessionEvent::Teardown { instance_id, phase } => {
            info!(instance = %instance_id, phase = %phase, "Workspace stopping");
        }
    }
}
