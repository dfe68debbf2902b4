//! Configuration file and environment overrides.
//!
//! Every section is optional; missing keys take the component defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use warden_heartbeat::{InstanceSelector, ReconnectConfig, ReporterConfig, SessionConfig};
use warden_ports::{NET_TCP, NET_TCP6, ObserverConfig};
use warden_reconciler::{ControllerConfig, DaemonKind, LabelMode};

/// Top-level warden configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub cluster: ClusterSection,
    pub reconciler: ReconcilerSection,
    pub ports: PortsSection,
    pub heartbeat: HeartbeatSection,
}

/// Kubernetes API access. Unset fields fall back to in-cluster settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub api_server: Option<String>,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            api_server: None,
            token_file: None,
            ca_file: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerSection {
    pub namespace: String,
    /// Daemon kinds to watch, one controller each.
    pub kinds: Vec<String>,
    pub label: LabelMode,
    pub workers: usize,
    pub queue_capacity: usize,
    pub warmup_concurrency: usize,
    #[serde(with = "duration_ms")]
    pub rewatch_delay: Duration,
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        let controller = ControllerConfig::default();
        Self {
            namespace: "default".to_string(),
            kinds: vec!["ws-daemon".to_string(), "registry-facade".to_string()],
            label: LabelMode::default(),
            workers: controller.workers,
            queue_capacity: controller.queue_capacity,
            warmup_concurrency: controller.warmup_concurrency,
            rewatch_delay: controller.rewatch_delay,
        }
    }
}

impl ReconcilerSection {
    /// Daemon kinds by name. Unknown names use the name as component label.
    #[must_use]
    pub fn daemon_kinds(&self) -> Vec<DaemonKind> {
        self.kinds
            .iter()
            .map(|name| match name.as_str() {
                "ws-daemon" => DaemonKind::ws_daemon(),
                "registry-facade" => DaemonKind::registry_facade(),
                other => DaemonKind::new(other, other),
            })
            .collect()
    }

    #[must_use]
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig::default()
            .with_workers(self.workers)
            .with_queue_capacity(self.queue_capacity)
            .with_warmup_concurrency(self.warmup_concurrency)
            .with_rewatch_delay(self.rewatch_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsSection {
    /// Listeners bound to this address belong to the proxy and are skipped.
    pub workspace_ip: String,
    #[serde(with = "duration_ms")]
    pub refresh_interval: Duration,
    pub sources: Vec<PathBuf>,
    pub emit_unchanged: bool,
}

impl Default for PortsSection {
    fn default() -> Self {
        Self {
            workspace_ip: String::new(),
            refresh_interval: Duration::from_secs(1),
            sources: vec![PathBuf::from(NET_TCP), PathBuf::from(NET_TCP6)],
            emit_unchanged: false,
        }
    }
}

impl PortsSection {
    #[must_use]
    pub fn observer_config(&self) -> ObserverConfig {
        ObserverConfig::default()
            .with_refresh_interval(self.refresh_interval)
            .with_sources(self.sources.clone())
            .with_emit_unchanged(self.emit_unchanged)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    /// Workspace server host; any scheme is replaced by `wss://`.
    pub server_host: String,
    pub api_path: String,
    pub token_file: Option<PathBuf>,
    /// JSON activity status written by the local controller.
    pub status_file: PathBuf,
    pub instance_id: Option<String>,
    pub workspace_id: Option<String>,
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    #[serde(with = "duration_ms")]
    pub jitter_min: Duration,
    #[serde(with = "duration_ms")]
    pub jitter_max: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_min: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_max: Duration,
    pub reconnect_factor: f64,
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub call_timeout: Duration,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        let reporter = ReporterConfig::default();
        let reconnect = ReconnectConfig::default();
        Self {
            server_host: String::new(),
            api_path: warden_heartbeat::DEFAULT_API_PATH.to_string(),
            token_file: None,
            status_file: PathBuf::from("/run/warden/status.json"),
            instance_id: None,
            workspace_id: None,
            interval: reporter.interval,
            jitter_min: reporter.jitter_min,
            jitter_max: reporter.jitter_max,
            reconnect_min: reconnect.min_delay,
            reconnect_max: reconnect.max_delay,
            reconnect_factor: reconnect.factor,
            handshake_timeout: reconnect.handshake_timeout,
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl HeartbeatSection {
    /// Full link endpoint for the configured host.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!(
            "{}{}",
            warden_heartbeat::link_address(&self.server_host),
            self.api_path
        )
    }

    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_reconnect(
                ReconnectConfig::default()
                    .with_min_delay(self.reconnect_min)
                    .with_max_delay(self.reconnect_max)
                    .with_factor(self.reconnect_factor)
                    .with_handshake_timeout(self.handshake_timeout),
            )
            .with_reporter(
                ReporterConfig::default()
                    .with_interval(self.interval)
                    .with_jitter(self.jitter_min, self.jitter_max),
            )
            .with_selector(InstanceSelector {
                instance_id: self.instance_id.clone(),
                workspace_id: self.workspace_id.clone(),
            })
    }
}

impl WardenConfig {
    /// Load a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Load `path` if given, otherwise start from defaults; then apply the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Overlay `WARDEN_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    /// Overlay variables looked up through `lookup`.
    pub fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("WARDEN_NAMESPACE") {
            self.reconciler.namespace = value;
        }
        if let Some(value) = lookup("WARDEN_WORKSPACE_IP") {
            self.ports.workspace_ip = value;
        }
        if let Some(value) = lookup("WARDEN_SERVER_HOST") {
            self.heartbeat.server_host = value;
        }
        if let Some(value) = lookup("WARDEN_INSTANCE_ID") {
            self.heartbeat.instance_id = Some(value);
        }
        if let Some(value) = lookup("WARDEN_WORKSPACE_ID") {
            self.heartbeat.workspace_id = Some(value);
        }
        if let Some(value) = lookup("WARDEN_TOKEN_FILE") {
            self.heartbeat.token_file = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("WARDEN_KUBE_API") {
            self.cluster.api_server = Some(value);
        }
    }
}

/// Durations as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
