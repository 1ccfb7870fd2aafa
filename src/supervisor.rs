//! Top-level lifecycle: opens the serial endpoint, picks the operating mode,
//! and turns bridge outcomes into an exit code.
//!
//! In emulation mode the TCP session belongs to the modem and is created on
//! dial; the supervisor only opens the serial side and hands it over. In
//! direct mode the supervisor dials the server itself (with exponential
//! back-off across `connection_retries` attempts), runs the handshake, and
//! invokes the bridge with escape detection disabled.
//!
//! The shutdown `watch` channel is the only cancellation mechanism; flipping
//! it unblocks the bridge (which returns `IoError`) and both endpoints are
//! closed on the way out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::bridge::{self, BridgeSettings};
use crate::config::Config;
use crate::endpoint::{self, Endpoint};
use crate::handshake;
use crate::modem::HayesModem;
use crate::transport;

/// Deadline for the direct-mode TCP connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the bridge in the configured mode. Returns the process exit code:
/// 0 for a normal shutdown, 1 for a fatal error.
pub async fn run(config: Arc<Config>, cancel: watch::Receiver<bool>) -> i32 {
    let serial = match endpoint::open(
        &config.serial.device,
        config.serial.baud_rate,
        config.read_timeout(),
        config.write_timeout(),
    )
    .await
    {
        Ok(serial) => serial,
        Err(e) => {
            error!("Cannot open serial device {}: {e}", config.serial.device);
            return 1;
        }
    };

    if config.modem.emulate {
        run_emulation(config, serial, cancel).await
    } else {
        run_direct(config, serial, cancel).await
    }
}

async fn run_emulation(
    config: Arc<Config>,
    serial: Endpoint,
    cancel: watch::Receiver<bool>,
) -> i32 {
    info!("Starting modem emulation");
    let modem = HayesModem::new(config, cancel);
    match modem.run(serial).await {
        Ok(()) => 0,
        Err(e) => {
            error!("Modem emulation failed: {e}");
            1
        }
    }
}

async fn run_direct(config: Arc<Config>, mut serial: Endpoint, cancel: watch::Receiver<bool>) -> i32 {
    info!("Starting direct bridge");
    let server = &config.server;

    let mut link = {
        let mut attempt: u32 = 0;
        loop {
            match transport::dial(
                &server.host,
                server.port,
                CONNECT_TIMEOUT,
                config.read_timeout(),
                config.write_timeout(),
            )
            .await
            {
                Ok(link) => break link,
                Err(e) => {
                    attempt += 1;
                    if attempt >= config.bridge.connection_retries {
                        error!("Cannot dial {}:{}: {e}", server.host, server.port);
                        return 1;
                    }
                    let backoff = Duration::from_secs(1 << attempt);
                    warn!(
                        "Dial attempt {attempt} failed: {e}, retrying in {}s",
                        backoff.as_secs()
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
            if *cancel.borrow() {
                return 0;
            }
        }
    };

    let carry = match handshake::authenticate(&mut link, &server.username, &server.password).await {
        Ok(carry) => carry,
        Err(e) => {
            error!("Direct bridge authentication failed: {e}");
            link.close().await;
            return 1;
        }
    };

    // Direct mode has no fallback: a server that will not negotiate is fatal
    let leftover = match handshake::negotiate(&mut link, carry).await {
        Ok((negotiated, leftover)) => {
            info!(
                "Speed negotiation successful for direct bridge: {} bps ({})",
                negotiated.speed, negotiated.connection_type
            );
            leftover
        }
        Err(e) => {
            error!("Speed negotiation failed: {e}");
            link.close().await;
            return 1;
        }
    };
    link.set_read_timeout(config.read_timeout());

    if !leftover.is_empty() {
        if let Err(e) = serial.write(&leftover).await {
            error!("Cannot write to serial endpoint: {e}");
            link.close().await;
            return 1;
        }
    }

    info!("Direct bridge ready - starting PPP data bridging");
    let settings = BridgeSettings {
        escape_enabled: false,
        buffer_size: config.bridge.buffer_size,
        inactivity_timeout: config.inactivity_timeout(),
        codec: None,
    };
    let (outcome, mut serial, mut link) = bridge::run(serial, link, &settings, cancel).await;
    info!("Direct bridge ended: {}", outcome.as_str());

    serial.close().await;
    link.close().await;
    0
}
