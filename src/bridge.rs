//! The PPP bridge engine.
//!
//! Two copy tasks run concurrently — serial→server and server→serial — plus
//! a watchdog. All three share a one-shot stop signal (a `watch` channel)
//! and a first-outcome-wins slot; whichever task detects a stop condition
//! first decides the [`BridgeOutcome`], and the others drain out at their
//! next read deadline. Reads race the stop signal; writes always run to
//! completion before a cancel is honoured, so no frame is ever cut in half.
//!
//! The engine never inspects frame contents beyond two sniffs: the Hayes
//! `+++` escape (serial side, emulation mode only) and the LCP
//! Terminate-Request/Ack patterns (server side). Both sniffs ride on small
//! trailing rings so a pattern split across reads is still caught, and both
//! are non-destructive — sniffed bytes flow to the peer unchanged, except
//! for a recognised escape, which is swallowed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::codec::StreamCodec;
use crate::endpoint::{Endpoint, EndpointReader, EndpointWriter};

/// PPP address/control/protocol prefix plus LCP code 5 (Terminate-Request).
pub const LCP_TERMINATE_REQUEST: [u8; 5] = [0xFF, 0x03, 0xC0, 0x21, 0x05];
/// PPP address/control/protocol prefix plus LCP code 6 (Terminate-Ack).
pub const LCP_TERMINATE_ACK: [u8; 5] = [0xFF, 0x03, 0xC0, 0x21, 0x06];

/// Text dropped on the serial line when the carrier goes away.
const NO_CARRIER: &[u8] = b"\r\nNO CARRIER\r\n";

/// Capacity of the per-direction sniff rings.
const SNIFF_RING_CAP: usize = 20;

/// Quiet interval required after `+++` before it counts as an escape.
const ESCAPE_QUIET_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive I/O errors tolerated per direction before giving up.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Back-off between tolerated I/O errors.
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Watchdog poll cadence.
const WATCHDOG_TICK: Duration = Duration::from_secs(1);

/// Server silence threshold while the client is still talking.
const SERVER_SILENT_AFTER_MS: u64 = 60_000;

/// How recently the client must have spoken for SERVER_SILENT to apply.
const CLIENT_RECENT_WINDOW_MS: u64 = 30_000;

/// Why the bridge stopped. These are normal returns, not errors; the modem
/// or supervisor decides what happens next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Hayes `+++` with a quiet second behind it; carrier stays up.
    EscapeToCommand,
    /// `~.` spotted in the serial stream.
    ClientHangup,
    /// LCP Terminate-Request/Ack from the server.
    LcpTerminate,
    /// Orderly TCP close by the server.
    PeerClosed,
    /// Nothing moved in either direction for the configured timeout.
    Inactivity,
    /// Server quiet for a minute while the client kept talking.
    ServerSilent,
    /// Too many I/O errors, or external cancellation.
    IoError,
}

impl BridgeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EscapeToCommand => "escape to command mode",
            Self::ClientHangup => "client hangup",
            Self::LcpTerminate => "LCP terminate",
            Self::PeerClosed => "server closed connection",
            Self::Inactivity => "inactivity timeout",
            Self::ServerSilent => "server silent",
            Self::IoError => "I/O error",
        }
    }
}

/// Engine knobs, fixed for the duration of one bridge run.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Sniff the serial side for `+++`/`~.` (emulation mode). Direct mode
    /// runs fully transparent.
    pub escape_enabled: bool,
    /// Per-read buffer size.
    pub buffer_size: usize,
    /// INACTIVITY threshold.
    pub inactivity_timeout: Duration,
    /// Armed codec, if both ends agreed during command-mode setup.
    pub codec: Option<StreamCodec>,
}

struct Shared {
    stop_tx: watch::Sender<bool>,
    outcome: Mutex<Option<BridgeOutcome>>,
    started: tokio::time::Instant,
    /// Milliseconds since `started`, per traffic class.
    last_activity_ms: AtomicU64,
    last_serial_ms: AtomicU64,
    last_server_ms: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            outcome: Mutex::new(None),
            started: tokio::time::Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            last_serial_ms: AtomicU64::new(0),
            last_server_ms: AtomicU64::new(0),
        }
    }

    fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// First caller wins; later signals are ignored.
    fn signal(&self, outcome: BridgeOutcome) {
        let mut slot = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            debug!("Bridge stop: {}", outcome.as_str());
            *slot = Some(outcome);
            let _ = self.stop_tx.send(true);
        }
    }

    fn outcome(&self) -> BridgeOutcome {
        self.outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or(BridgeOutcome::IoError)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn touch_serial(&self) {
        let now = self.elapsed_ms();
        self.last_activity_ms.store(now, Ordering::Relaxed);
        self.last_serial_ms.store(now, Ordering::Relaxed);
    }

    fn touch_server(&self) {
        let now = self.elapsed_ms();
        self.last_activity_ms.store(now, Ordering::Relaxed);
        self.last_server_ms.store(now, Ordering::Relaxed);
    }
}

/// Append `data` to a trailing ring, keeping at most [`SNIFF_RING_CAP`] bytes.
fn push_ring(ring: &mut Vec<u8>, data: &[u8]) {
    ring.extend_from_slice(data);
    if ring.len() > SNIFF_RING_CAP {
        let cut = ring.len() - SNIFF_RING_CAP;
        ring.drain(..cut);
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Run the bridge until a stop condition fires.
///
/// Ownership of both endpoints transfers in and back out; the caller decides
/// whether to keep the server link (escape) or close it (everything else).
/// The external `cancel` handle maps to [`BridgeOutcome::IoError`], matching
/// an orderly process shutdown.
pub async fn run(
    serial: Endpoint,
    link: Endpoint,
    settings: &BridgeSettings,
    cancel: watch::Receiver<bool>,
) -> (BridgeOutcome, Endpoint, Endpoint) {
    info!(
        "Starting PPP data bridging ({} <-> {})",
        serial.id(),
        link.id()
    );

    let shared = Arc::new(Shared::new());
    let (serial_reader, serial_writer) = serial.split();
    let (link_reader, link_writer) = link.split();

    let a_task = tokio::spawn(serial_to_server(
        serial_reader,
        link_writer,
        shared.clone(),
        settings.clone(),
    ));
    let b_task = tokio::spawn(server_to_serial(
        link_reader,
        serial_writer,
        shared.clone(),
        settings.clone(),
    ));
    let watchdog_task = tokio::spawn(watchdog(
        shared.clone(),
        settings.inactivity_timeout,
        cancel,
    ));

    // Tasks only stop via the shared signal, so join order does not matter.
    let (serial_reader, link_writer) = a_task.await.expect("serial copy task panicked");
    let (link_reader, mut serial_writer) = b_task.await.expect("server copy task panicked");
    watchdog_task.abort();

    let outcome = shared.outcome();
    info!("PPP bridge session ended: {}", outcome.as_str());

    // Carrier-loss outcomes announce themselves on the serial line. The
    // escape and client-hangup cases are the modem's business.
    match outcome {
        BridgeOutcome::LcpTerminate => {
            // Let the client finish processing the terminate frame first
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = serial_writer.write(NO_CARRIER).await;
        }
        BridgeOutcome::PeerClosed | BridgeOutcome::Inactivity | BridgeOutcome::ServerSilent => {
            let _ = serial_writer.write(NO_CARRIER).await;
        }
        _ => {}
    }

    (
        outcome,
        Endpoint::reunite(serial_reader, serial_writer),
        Endpoint::reunite(link_reader, link_writer),
    )
}

/// Serial→server copy direction. Owns the serial reader and the server
/// writer; sniffs for `+++` and `~.` when escape semantics are enabled.
async fn serial_to_server(
    mut reader: EndpointReader,
    mut writer: EndpointWriter,
    shared: Arc<Shared>,
    settings: BridgeSettings,
) -> (EndpointReader, EndpointWriter) {
    let mut stop = shared.stop_rx();
    let mut ring: Vec<u8> = Vec::with_capacity(SNIFF_RING_CAP);
    let mut errors: u32 = 0;

    loop {
        let result = tokio::select! {
            biased;
            _ = stop.changed() => break,
            r = reader.read(settings.buffer_size) => r,
        };

        match result {
            Ok(data) if data.is_empty() => {
                if !reader.is_alive() {
                    shared.signal(BridgeOutcome::IoError);
                    break;
                }
                tokio::task::yield_now().await;
            }
            Ok(mut data) => {
                errors = 0;
                shared.touch_serial();
                debug!(
                    "Serial->Server: {} bytes: {:02x?}",
                    data.len(),
                    &data[..data.len().min(20)]
                );
                push_ring(&mut ring, &data);

                if settings.escape_enabled {
                    if contains(&ring, b"~.") {
                        info!("Client hangup sequence detected");
                        shared.signal(BridgeOutcome::ClientHangup);
                        break;
                    }
                    if ring.ends_with(b"+++") {
                        // Swallow the trailing plus-run pending the quiet check
                        let run = data.iter().rev().take_while(|&&b| b == b'+').count().min(3);
                        let kept: Vec<u8> = data.drain(data.len() - run..).collect();
                        if !data.is_empty() {
                            forward(&mut writer, &data, &settings, &shared, &mut errors).await;
                        }
                        tokio::time::sleep(ESCAPE_QUIET_INTERVAL).await;
                        match reader.read(settings.buffer_size).await {
                            Ok(more) if more.is_empty() => {
                                info!("Hayes escape sequence detected");
                                shared.signal(BridgeOutcome::EscapeToCommand);
                                break;
                            }
                            Ok(more) => {
                                // Not an escape after all — release the plusses
                                shared.touch_serial();
                                push_ring(&mut ring, &more);
                                let mut rest = kept;
                                rest.extend_from_slice(&more);
                                forward(&mut writer, &rest, &settings, &shared, &mut errors).await;
                            }
                            Err(e) => {
                                warn!("Serial read failed during escape check: {e}");
                                shared.signal(BridgeOutcome::IoError);
                                break;
                            }
                        }
                        if *stop.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                forward(&mut writer, &data, &settings, &shared, &mut errors).await;
                if *stop.borrow() {
                    break;
                }
            }
            Err(e) => {
                errors += 1;
                warn!("Error reading from serial ({errors}): {e}");
                if errors >= MAX_CONSECUTIVE_ERRORS {
                    shared.signal(BridgeOutcome::IoError);
                    break;
                }
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }

    (reader, writer)
}

/// Write one chunk toward the server, compressing when armed. Write failures
/// count toward the per-direction error budget.
async fn forward(
    writer: &mut EndpointWriter,
    data: &[u8],
    settings: &BridgeSettings,
    shared: &Shared,
    errors: &mut u32,
) {
    let payload = match settings.codec {
        Some(codec) => codec.compress(data),
        None => data.to_vec(),
    };
    match writer.write(&payload).await {
        Ok(_) => {}
        Err(e) => {
            *errors += 1;
            warn!("Failed to send data to server ({errors}): {e}");
            if *errors >= MAX_CONSECUTIVE_ERRORS {
                shared.signal(BridgeOutcome::IoError);
            } else {
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }
}

/// Server→serial copy direction. Owns the server reader and the serial
/// writer; sniffs for the LCP terminate patterns and watches for the
/// server's orderly close.
async fn server_to_serial(
    mut reader: EndpointReader,
    mut writer: EndpointWriter,
    shared: Arc<Shared>,
    settings: BridgeSettings,
) -> (EndpointReader, EndpointWriter) {
    let mut stop = shared.stop_rx();
    let mut ring: Vec<u8> = Vec::with_capacity(SNIFF_RING_CAP);
    let mut errors: u32 = 0;

    loop {
        let result = tokio::select! {
            biased;
            _ = stop.changed() => break,
            r = reader.read(settings.buffer_size) => r,
        };

        match result {
            Ok(data) if data.is_empty() => {
                if !reader.is_alive() {
                    info!("Server closed connection");
                    shared.signal(BridgeOutcome::PeerClosed);
                    break;
                }
                tokio::task::yield_now().await;
            }
            Ok(data) => {
                errors = 0;
                shared.touch_server();
                debug!(
                    "Server->Serial: {} bytes: {:02x?}",
                    data.len(),
                    &data[..data.len().min(20)]
                );

                let payload = match settings.codec {
                    Some(codec) => match codec.decompress(&data) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            errors += 1;
                            warn!("Codec failed on server data ({errors}): {e}");
                            if errors >= MAX_CONSECUTIVE_ERRORS {
                                shared.signal(BridgeOutcome::IoError);
                                break;
                            }
                            continue;
                        }
                    },
                    None => data,
                };

                // Sniff across the ring tail so a pattern split over two
                // reads is still seen
                let mut scan = ring.clone();
                scan.extend_from_slice(&payload);
                let terminated = contains(&scan, &LCP_TERMINATE_REQUEST)
                    || contains(&scan, &LCP_TERMINATE_ACK);
                push_ring(&mut ring, &payload);

                match writer.write(&payload).await {
                    Ok(_) => {}
                    Err(e) => {
                        errors += 1;
                        warn!("Failed to write to serial ({errors}): {e}");
                        if errors >= MAX_CONSECUTIVE_ERRORS {
                            shared.signal(BridgeOutcome::IoError);
                            break;
                        }
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }

                if terminated {
                    info!("LCP termination detected");
                    shared.signal(BridgeOutcome::LcpTerminate);
                    break;
                }
                if *stop.borrow() {
                    break;
                }
            }
            Err(e) => {
                errors += 1;
                warn!("Error reading from server ({errors}): {e}");
                if errors >= MAX_CONSECUTIVE_ERRORS {
                    shared.signal(BridgeOutcome::IoError);
                    break;
                }
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }

    (reader, writer)
}

/// Shared watchdog: inactivity, server-silence, and external cancellation.
async fn watchdog(
    shared: Arc<Shared>,
    inactivity_timeout: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let mut stop = shared.stop_rx();
    let mut tick = tokio::time::interval(WATCHDOG_TICK);
    #[allow(clippy::cast_possible_truncation)]
    let inactivity_ms = inactivity_timeout.as_millis() as u64;

    if *cancel.borrow() {
        shared.signal(BridgeOutcome::IoError);
        return;
    }

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    info!("Bridge cancelled by supervisor");
                    shared.signal(BridgeOutcome::IoError);
                    break;
                }
            }
            _ = tick.tick() => {
                let now = shared.elapsed_ms();
                let last_activity = shared.last_activity_ms.load(Ordering::Relaxed);
                if now.saturating_sub(last_activity) > inactivity_ms {
                    info!("Connection timeout due to inactivity");
                    shared.signal(BridgeOutcome::Inactivity);
                    break;
                }
                let last_server = shared.last_server_ms.load(Ordering::Relaxed);
                let last_serial = shared.last_serial_ms.load(Ordering::Relaxed);
                if now.saturating_sub(last_server) > SERVER_SILENT_AFTER_MS
                    && now.saturating_sub(last_serial) < CLIENT_RECENT_WINDOW_MS
                {
                    info!("Server went silent while client is active");
                    shared.signal(BridgeOutcome::ServerSilent);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (Endpoint, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        let ep = Endpoint::from_tcp(
            client,
            "tcp:test".to_string(),
            Duration::from_millis(50),
            Duration::from_secs(2),
        );
        (ep, peer)
    }

    fn settings(escape: bool) -> BridgeSettings {
        BridgeSettings {
            escape_enabled: escape,
            buffer_size: 4096,
            inactivity_timeout: Duration::from_secs(300),
            codec: None,
        }
    }

    fn idle_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the whole test process
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn bytes_flow_both_ways_unchanged() {
        let (serial_ep, mut client) = tcp_pair().await;
        let (link_ep, mut server) = tcp_pair().await;

        let run_settings = settings(false);
        let bridge = tokio::spawn(async move {
            run(serial_ep, link_ep, &run_settings, idle_cancel()).await
        });

        client.write_all(b"HELLO").await.unwrap();
        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"HELLO");

        server.write_all(&[0x7e, 0x21, 0x45, 0x7e]).await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x7e, 0x21, 0x45, 0x7e]);

        // Server closes: bridge ends with PeerClosed and NO CARRIER on serial
        drop(server);
        let (outcome, _serial, _link) = bridge.await.unwrap();
        assert_eq!(outcome, BridgeOutcome::PeerClosed);
        let mut tail = Vec::new();
        client.read_to_end(&mut tail).await.unwrap();
        assert_eq!(tail, b"\r\nNO CARRIER\r\n");
    }

    #[tokio::test]
    async fn escape_sequence_returns_to_command_mode() {
        let (serial_ep, mut client) = tcp_pair().await;
        let (link_ep, mut server) = tcp_pair().await;

        let run_settings = settings(true);
        let bridge = tokio::spawn(async move {
            run(serial_ep, link_ep, &run_settings, idle_cancel()).await
        });

        client.write_all(b"payload before").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.write_all(b"+++").await.unwrap();

        let (outcome, _serial, link) = bridge.await.unwrap();
        assert_eq!(outcome, BridgeOutcome::EscapeToCommand);
        // Carrier stays up
        assert!(link.is_alive());

        // The escape itself never reached the server
        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"payload before");
    }

    #[tokio::test]
    async fn plusses_followed_by_data_are_forwarded() {
        let (serial_ep, mut client) = tcp_pair().await;
        let (link_ep, mut server) = tcp_pair().await;

        let run_settings = settings(true);
        let bridge = tokio::spawn(async move {
            run(serial_ep, link_ep, &run_settings, idle_cancel()).await
        });

        client.write_all(b"+++").await.unwrap();
        // Break the quiet interval
        tokio::time::sleep(Duration::from_millis(300)).await;
        client.write_all(b"more").await.unwrap();

        let mut collected = Vec::new();
        let mut buf = [0u8; 64];
        while collected.len() < 7 {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0, "server connection closed early");
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"+++more");

        drop(server);
        let (outcome, _, _) = bridge.await.unwrap();
        assert_eq!(outcome, BridgeOutcome::PeerClosed);
    }

    #[tokio::test]
    async fn lcp_terminate_forwards_frame_then_drops_carrier() {
        let (serial_ep, mut client) = tcp_pair().await;
        let (link_ep, mut server) = tcp_pair().await;

        let run_settings = settings(true);
        let bridge = tokio::spawn(async move {
            run(serial_ep, link_ep, &run_settings, idle_cancel()).await
        });

        let frame = [0xFF, 0x03, 0xC0, 0x21, 0x05, 0x00, 0x00, 0x04];
        server.write_all(&frame).await.unwrap();

        let (outcome, _serial, _link) = bridge.await.unwrap();
        assert_eq!(outcome, BridgeOutcome::LcpTerminate);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        let mut expected = frame.to_vec();
        expected.extend_from_slice(b"\r\nNO CARRIER\r\n");
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn lcp_pattern_split_across_reads_is_caught() {
        let (serial_ep, _client) = tcp_pair().await;
        let (link_ep, mut server) = tcp_pair().await;

        let run_settings = settings(true);
        let bridge = tokio::spawn(async move {
            run(serial_ep, link_ep, &run_settings, idle_cancel()).await
        });

        server.write_all(&[0xFF, 0x03, 0xC0]).await.unwrap();
        server.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        server.write_all(&[0x21, 0x06, 0x00]).await.unwrap();

        let (outcome, _, _) = bridge.await.unwrap();
        assert_eq!(outcome, BridgeOutcome::LcpTerminate);
    }

    #[tokio::test]
    async fn tilde_dot_hangs_up() {
        let (serial_ep, mut client) = tcp_pair().await;
        let (link_ep, _server) = tcp_pair().await;

        let run_settings = settings(true);
        let bridge = tokio::spawn(async move {
            run(serial_ep, link_ep, &run_settings, idle_cancel()).await
        });

        client.write_all(b"~.").await.unwrap();
        let (outcome, _, _) = bridge.await.unwrap();
        assert_eq!(outcome, BridgeOutcome::ClientHangup);
    }

    #[tokio::test]
    async fn idle_link_trips_inactivity_watchdog() {
        let (serial_ep, mut client) = tcp_pair().await;
        let (link_ep, _server) = tcp_pair().await;

        let run_settings = BridgeSettings {
            inactivity_timeout: Duration::from_secs(2),
            ..settings(false)
        };
        let started = tokio::time::Instant::now();
        let (outcome, _, _) = run(serial_ep, link_ep, &run_settings, idle_cancel()).await;
        assert_eq!(outcome, BridgeOutcome::Inactivity);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(4));

        let mut tail = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut tail))
            .await
            .ok();
        assert!(tail.ends_with(b"\r\nNO CARRIER\r\n"));
    }

    #[tokio::test]
    async fn supervisor_cancel_stops_the_bridge() {
        let (serial_ep, _client) = tcp_pair().await;
        let (link_ep, _server) = tcp_pair().await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let run_settings = settings(false);
        let bridge =
            tokio::spawn(async move { run(serial_ep, link_ep, &run_settings, cancel_rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_tx.send(true).unwrap();

        let (outcome, _, _) = bridge.await.unwrap();
        assert_eq!(outcome, BridgeOutcome::IoError);
    }

    #[tokio::test]
    async fn codec_round_trips_across_the_bridge() {
        let (serial_ep, mut client) = tcp_pair().await;
        let (link_ep, mut server) = tcp_pair().await;

        let run_settings = BridgeSettings {
            codec: Some(StreamCodec::new()),
            ..settings(false)
        };
        let bridge = tokio::spawn(async move {
            run(serial_ep, link_ep, &run_settings, idle_cancel()).await
        });

        // Repetitive chunk small enough to arrive in one read: compressed on
        // the wire, identical at the far end
        let chunk = vec![b'Q'; 1024];
        client.write_all(&chunk).await.unwrap();

        let mut on_wire = vec![0u8; 4096];
        let n = server.read(&mut on_wire).await.unwrap();
        assert!(n < chunk.len(), "chunk should shrink on the wire");

        // Echo the compressed form back: the bridge decompresses it for serial
        server.write_all(&on_wire[..n]).await.unwrap();
        let mut back = Vec::new();
        while back.len() < chunk.len() {
            let n = client.read(&mut on_wire).await.unwrap();
            assert!(n > 0);
            back.extend_from_slice(&on_wire[..n]);
        }
        assert_eq!(back, chunk);

        drop(server);
        let (outcome, _, _) = bridge.await.unwrap();
        assert_eq!(outcome, BridgeOutcome::PeerClosed);
    }
}
