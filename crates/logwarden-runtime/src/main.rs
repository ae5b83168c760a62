//! logwarden daemon: tails configured instance logs, correlates failure
//! patterns, and drives the tiered remediation plus the TCP control
//! channel.

mod cli;
mod control;
mod inject;
mod monitor;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use logwarden_core::config::AppConfig;

use crate::cli::{Cli, Command, DaemonOpts};
use crate::inject::LoggingKeyInjector;
use crate::monitor::Monitor;

fn init_tracing() {
    let filter = std::env::var("LOGWARDEN_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Daemon(opts) => {
            init_tracing();
            run_daemon(&cli.config, opts).await
        }
        Command::Check => check_config(&cli.config),
    }
}

/// Parse the config and report what the daemon would watch.
fn check_config(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    println!("control port: {}", config.control_port);
    println!("key to send:  {}", config.key_to_send);
    for instance in &config.instances {
        let missing = if instance.log_path.exists() {
            ""
        } else {
            "  [log file missing]"
        };
        let disabled = if instance.enabled { "" } else { "  [disabled]" };
        println!(
            "{} ({}) -> {}{}{}",
            instance.name,
            instance.instance_id,
            instance.log_path.display(),
            disabled,
            missing,
        );
    }
    Ok(())
}

fn load_config(config_path: &Path) -> anyhow::Result<AppConfig> {
    AppConfig::load(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))
}

async fn run_daemon(config_path: &Path, opts: DaemonOpts) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let port = opts.control_port.unwrap_or(config.control_port);
    info!(
        config = %config_path.display(),
        instances = config.instances.len(),
        "logwarden starting"
    );

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let sessions = control::Sessions::new(signal_tx);
    let monitor = Monitor::new(
        config.key_to_send.clone(),
        Arc::new(LoggingKeyInjector),
        Arc::clone(&sessions),
    );

    let shutdown = CancellationToken::new();

    // The control channel is best-effort: losing both bind attempts
    // degrades remote commands, not monitoring.
    match control::bind_listener(port).await {
        Some(listener) => {
            tokio::spawn(control::serve(
                listener,
                Arc::clone(&sessions),
                shutdown.clone(),
            ));
        }
        None => warn!("running without a control channel"),
    }

    tokio::spawn(Arc::clone(&monitor).run_signal_loop(signal_rx));
    tokio::spawn(log_events(monitor.events()));

    // Disabled instances are watched too: detections still surface to
    // presentation, only the remedial actions are suppressed.
    for instance in config.instances {
        monitor.watch(instance).await;
    }

    wait_for_shutdown().await;
    info!("shutting down");
    shutdown.cancel();
    monitor.shutdown().await;
    Ok(())
}

/// Presentation stand-in: mirror every monitor event into the log as
/// structured JSON.
async fn log_events(mut events: broadcast::Receiver<logwarden_core::types::MonitorEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Ok(json) = serde_json::to_string(&event) {
                    info!(event = %json, "monitor event");
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "sigterm handler unavailable, using ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
