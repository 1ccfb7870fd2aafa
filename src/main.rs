#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # vnbridge
//!
//! Serial-to-TCP PPP bridge for vintage computers.
//!
//! vnbridge presents a serial endpoint (physical port, Unix socket or TCP
//! null-modem) to a vintage client and connects it to a VesperNet PPP access
//! concentrator. By default it emulates a Hayes modem — the client dials
//! with `ATDT`, the bridge opens the TCP session — or, with `--direct`, it
//! authenticates immediately and passes PPP through transparently.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use vnbridge::config::Config;
use vnbridge::supervisor;

/// Serial-to-TCP PPP bridge with Hayes modem emulation.
#[derive(Parser)]
#[command(name = "vnbridge", version)]
struct Cli {
    /// Path to TOML config file (default: vnbridge.toml in CWD).
    #[arg(long)]
    config: Option<String>,
    /// Override the serial device string.
    #[arg(long)]
    device: Option<String>,
    /// Skip modem emulation: authenticate and bridge PPP immediately.
    #[arg(long)]
    direct: bool,
    /// Verbose logging (same as RUST_LOG=debug).
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref());
    if let Some(device) = cli.device {
        config.serial.device = device;
    }
    if cli.direct {
        config.modem.emulate = false;
    }

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.debug || config.logging.debug {
            "debug".to_string()
        } else {
            config.logging.level.clone()
        }
    });
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    // Validate config before proceeding
    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            tracing::error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("vnbridge v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Server: {}:{}, device: {}, mode: {}",
        config.server.host,
        config.server.port,
        config.serial.device,
        if config.modem.emulate {
            "modem emulation"
        } else {
            "direct"
        }
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // SIGINT/SIGTERM flip the shutdown channel; the bridge unblocks and the
    // supervisor closes both endpoints.
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        let _ = shutdown_tx.send(true);
    });

    let code = supervisor::run(Arc::new(config), shutdown_rx).await;
    info!("Goodbye");
    std::process::exit(code);
}
