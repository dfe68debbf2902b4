//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Warden - workspace cluster control core
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version)]
#[command(about = "Node readiness labels, served-port observation and workspace heartbeats")]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, overrides RUST_LOG (e.g. "debug", "warden_reconciler=trace")
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Keep node readiness labels in step with daemon pods
    Reconcile {
        /// Namespace whose daemons are watched
        #[arg(short, long)]
        namespace: Option<String>,

        /// Daemon kinds to watch (repeatable)
        #[arg(short, long)]
        kind: Vec<String>,
    },

    /// Print served port snapshots as JSON lines
    Ports {
        /// Workspace IP whose listeners belong to the proxy
        #[arg(long)]
        workspace_ip: Option<String>,

        /// Refresh interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Report workspace activity to the workspace server
    Heartbeat {
        /// Workspace server host
        #[arg(long)]
        server: Option<String>,

        /// Activity status file
        #[arg(long)]
        status_file: Option<PathBuf>,
    },
}
