//! socketgate-server: stateful WebSocket gateway.
//!
//! Accepts authenticated WebSocket clients, reports their presence, relays
//! client messages to the broker, and delivers control-plane messages back
//! to individual connections.

mod auth;
mod config;
mod control;
mod pump;
mod relay;
mod rpc;
mod server;
mod session;
mod transport;

use anyhow::Context as _;
use clap::Parser;
use config::{CliOverrides, ServerConfig};
use relay::Registry;
use server::Gateway;
use socketgate_core::StatsRecorder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// socketgate-server: WebSocket gateway
#[derive(Parser, Debug)]
#[command(name = "socketgate-server", version, about = "WebSocket gateway")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.socketgate/config.toml")]
    config: String,

    /// Listen address for both endpoints
    #[arg(long)]
    bind: Option<String>,

    /// WebSocket listen port
    #[arg(long)]
    ws_port: Option<u16>,

    /// Control-plane HTTP port
    #[arg(long)]
    control_port: Option<u16>,

    /// Presence service base URL
    #[arg(long)]
    presence_url: Option<String>,

    /// Broker service base URL
    #[arg(long)]
    broker_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting socketgate-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        bind: cli.bind,
        ws_port: cli.ws_port,
        control_port: cli.control_port,
        presence_url: cli.presence_url,
        broker_url: cli.broker_url,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(server_config).await {
        error!(error = %format_args!("{e:#}"), "server error");
        std::process::exit(1);
    }

    info!("socketgate-server stopped");
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let stats = StatsRecorder::new();
    let shutdown = CancellationToken::new();

    let (registry, registry_loop) = Registry::new();
    let registry_task = tokio::spawn(registry_loop.run());

    let gateway = Gateway::new(
        &config,
        registry.clone(),
        Arc::new(stats.clone()),
        shutdown.clone(),
    )
    .context("failed to create gateway")?;
    let listeners = gateway.bind().await.context("failed to bind listeners")?;

    if let Some(every) = config.report_interval {
        tokio::spawn(report_stats(stats, registry.clone(), every, shutdown.clone()));
    }

    let mut serving = tokio::spawn(gateway.serve(listeners));
    tokio::select! {
        result = &mut serving => {
            shutdown.cancel();
            registry.close();
            result.context("gateway task failed")??;
            return Ok(());
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    shutdown.cancel();
    let result = serving.await;
    registry.close();
    if let Err(e) = registry_task.await {
        debug!(error = %e, "registry loop ended abnormally");
    }
    result.context("gateway task failed")??;
    Ok(())
}

/// Log counters, timers and the live connection count at a fixed interval.
async fn report_stats(
    stats: StatsRecorder,
    registry: Registry,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let connections = registry.len().await.unwrap_or(0);
        let snapshot = stats.snapshot();
        info!(
            connections,
            counters = snapshot.counters.len(),
            timers = snapshot.timers.len(),
            "stats report"
        );
        for (name, value) in &snapshot.counters {
            info!(name = %name, value, "counter");
        }
        for (name, total) in &snapshot.timers {
            debug!(name = %name, total_ms = total.as_millis() as u64, "timer");
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
