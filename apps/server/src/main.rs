//! Router Server - standalone headless binary for the networked audio
//! router core.
//!
//! Loads a YAML desired-state file, constructs the engine, applies the
//! startup topology once, and runs until a shutdown signal arrives. The
//! HTTP/REST control surface that would let a live caller re-run
//! `apply_state` is out of scope for this crate (spec 1 "Explicitly out of
//! scope") - this binary exists to prove the engine boots and streams, not
//! to be the production control plane.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use router_core::Engine;

use crate::config::ServerConfig;

/// Router Server - headless networked audio router.
#[derive(Parser, Debug)]
#[command(name = "router-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "ROUTER_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind IP for receivers (overrides config file).
    #[arg(short = 'b', long, env = "ROUTER_BIND_IP")]
    bind_ip: Option<std::net::IpAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("router-server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(ip) = args.bind_ip {
        config.bind_ip = ip;
    }

    log::info!(
        "Configuration: bind_ip={}, {} scream receiver(s), {} rtp receiver(s), {} sink(s), {} path(s)",
        config.bind_ip,
        config.scream_receiver_ports.len(),
        config.rtp_receivers.len(),
        config.sinks.len(),
        config.paths.len(),
    );

    let engine_config = config.to_engine_config();
    let runtime_handle = tokio::runtime::Handle::current();
    let engine =
        Engine::new(engine_config, runtime_handle).context("Failed to construct engine")?;

    log::info!("Engine constructed, applying startup topology");

    let errors = engine.apply_state(config.to_desired_state());
    for error in &errors {
        log::warn!("apply_state rejected an item at startup: {error}");
    }

    log::info!("Engine running");

    shutdown_signal().await;

    log::info!("Shutdown signal received, stopping engine");
    engine.stop();
    log::info!("Shutdown complete");

    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
