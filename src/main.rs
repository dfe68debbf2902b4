//! # warden
//!
//! Runs one warden component per invocation:
//!
//! - `warden reconcile`: node readiness labels from daemon pod lifecycle
//! - `warden ports`: served port snapshots as JSON lines on stdout
//! - `warden heartbeat`: workspace activity reports over a reconnecting link
//!
//! Ctrl+C stops every loop after its current iteration.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod cli;
mod commands;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use warden_core::ShutdownHandle;

use crate::cli::Cli;
use crate::config::WardenConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config =
        WardenConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let (handle, signal) = ShutdownHandle::new();
    tokio::spawn(wait_for_shutdown(handle));

    commands::execute_command(cli.command, config, signal).await
}

/// Initialize tracing subscriber with environment filter.
///
/// Logs go to stderr; stdout carries command output.
fn init_tracing(level: Option<&str>) {
    let filter = level.map_or_else(
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        EnvFilter::new,
    );
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Wait for Ctrl+C, then trigger shutdown.
async fn wait_for_shutdown(handle: ShutdownHandle) {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
    handle.shutdown();
}
