//! Credential and speed-negotiation exchange with the VesperNet server.
//!
//! The wire protocol is plain text: the client opens with
//! `<username>:<password>\r\n`, the server may answer with a line containing
//! `Authentication failed` (silence means success), and then advertises the
//! session speed as a single LF-terminated `NEGOTIATE:<speed>:<type>` line,
//! or `ERROR:<reason>` when the PPP daemon cannot take the call.
//!
//! The handshake owns its read buffer. Everything up to and including the
//! negotiation line is consumed here; whatever follows it in the same read
//! is returned to the caller so the first PPP bytes are not lost. Handshake
//! text never reaches the serial side.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, EndpointError};

/// Window for the auth rejection line. Silence is tentative success.
const AUTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Overall deadline for the negotiation line.
const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-read deadline while waiting for negotiation.
const NEGOTIATE_READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Speed and connection type advertised by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Line speed in bits per second.
    pub speed: u32,
    /// Connection type token, e.g. `V.34+`, `V.90`, `ISDN-128`.
    pub connection_type: String,
}

/// Handshake failures, surfaced to the supervisor or the modem.
#[derive(Debug)]
pub enum HandshakeError {
    /// Server answered with `Authentication failed`.
    AuthRejected,
    /// Server advertised an `ERROR:` line instead of negotiating.
    NegotiationRejected(String),
    /// No negotiation line arrived within the overall deadline.
    NegotiationTimeout,
    /// The connection died or misbehaved mid-handshake.
    Endpoint(EndpointError),
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::AuthRejected => write!(f, "authentication rejected"),
            HandshakeError::NegotiationRejected(line) => {
                write!(f, "negotiation rejected: {line}")
            }
            HandshakeError::NegotiationTimeout => write!(f, "speed negotiation timed out"),
            HandshakeError::Endpoint(e) => write!(f, "handshake I/O failed: {e}"),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<EndpointError> for HandshakeError {
    fn from(e: EndpointError) -> Self {
        HandshakeError::Endpoint(e)
    }
}

/// Send credentials and watch the 2-second window for a rejection.
///
/// The server stays silent on success, so a read deadline counts as
/// tentative acceptance. Any non-rejection bytes that arrive in the window
/// are returned — servers commonly splice the negotiation line right behind
/// the accept, and those bytes must seed [`negotiate`].
pub async fn authenticate(
    link: &mut Endpoint,
    username: &str,
    password: &str,
) -> Result<Vec<u8>, HandshakeError> {
    let credentials = format!("{username}:{password}\r\n");
    link.write(credentials.as_bytes()).await?;
    info!("Sent authentication for user: {username}");

    link.set_read_timeout(AUTH_TIMEOUT);
    let response = link.read(1024).await?;
    if response
        .windows(b"Authentication failed".len())
        .any(|w| w == b"Authentication failed")
    {
        warn!("Server rejected credentials for {username}");
        return Err(HandshakeError::AuthRejected);
    }
    if response.is_empty() {
        debug!("No auth response within {AUTH_TIMEOUT:?}, assuming success");
    }
    Ok(response)
}

/// Wait for the `NEGOTIATE:<speed>:<type>` line. `carry` holds bytes already
/// read during [`authenticate`].
///
/// Returns the negotiation record plus any bytes that followed the line in
/// the same read — those belong to the PPP stream and must be forwarded to
/// the serial side by the caller.
pub async fn negotiate(
    link: &mut Endpoint,
    carry: Vec<u8>,
) -> Result<(Negotiated, Vec<u8>), HandshakeError> {
    link.set_read_timeout(NEGOTIATE_READ_TIMEOUT);
    let deadline = tokio::time::Instant::now() + NEGOTIATE_TIMEOUT;
    let mut buffer = carry;

    loop {
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim();

            if let Some(rest) = line.strip_prefix("NEGOTIATE:") {
                if let Some(negotiated) = parse_negotiation(rest) {
                    info!(
                        "Received speed negotiation: {} bps ({})",
                        negotiated.speed, negotiated.connection_type
                    );
                    return Ok((negotiated, std::mem::take(&mut buffer)));
                }
                debug!("Unparseable negotiation line: {line:?}");
            } else if line.starts_with("ERROR:") {
                warn!("PPP daemon reported error: {line}");
                return Err(HandshakeError::NegotiationRejected(line.to_string()));
            } else if !line.is_empty() {
                debug!("Ignoring pre-negotiation line: {line:?}");
            }
        }

        if tokio::time::Instant::now() >= deadline {
            break;
        }
        let chunk = link.read(1024).await?;
        if chunk.is_empty() {
            if !link.is_alive() {
                return Err(HandshakeError::Endpoint(EndpointError::Closed));
            }
            continue;
        }
        buffer.extend_from_slice(&chunk);
    }

    warn!("No speed negotiation received from server");
    Err(HandshakeError::NegotiationTimeout)
}

/// Parse the colon-separated tail of a `NEGOTIATE:` line: `<speed>:<type>`.
fn parse_negotiation(rest: &str) -> Option<Negotiated> {
    let mut parts = rest.splitn(2, ':');
    let speed: u32 = parts.next()?.trim().parse().ok()?;
    let connection_type = parts.next()?.trim();
    if connection_type.is_empty() {
        return None;
    }
    Some(Negotiated {
        speed,
        connection_type: connection_type.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (Endpoint, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        let ep = Endpoint::from_tcp(
            client,
            "tcp:test".to_string(),
            Duration::from_millis(100),
            Duration::from_secs(2),
        );
        (ep, peer)
    }

    #[test]
    fn parses_negotiation_tail() {
        let n = parse_negotiation("33600:V.34+").unwrap();
        assert_eq!(n.speed, 33600);
        assert_eq!(n.connection_type, "V.34+");

        let n = parse_negotiation(" 128000 : ISDN-128 ").unwrap();
        assert_eq!(n.speed, 128_000);
        assert_eq!(n.connection_type, "ISDN-128");

        assert!(parse_negotiation("fast:V.90").is_none());
        assert!(parse_negotiation("33600").is_none());
        assert!(parse_negotiation("33600:").is_none());
    }

    #[tokio::test]
    async fn silent_server_means_auth_accepted() {
        let (mut ep, mut peer) = pair().await;
        let carry = authenticate(&mut ep, "u", "p").await.unwrap();
        assert!(carry.is_empty());

        let mut buf = [0u8; 32];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"u:p\r\n");
    }

    #[tokio::test]
    async fn negotiation_spliced_behind_auth_window_is_not_lost() {
        let (mut ep, mut peer) = pair().await;
        let server = tokio::spawn(async move {
            let mut buf = [0u8; 32];
            let _ = peer.read(&mut buf).await.unwrap();
            peer.write_all(b"NEGOTIATE:33600:V.34+\n").await.unwrap();
            peer
        });

        let carry = authenticate(&mut ep, "u", "p").await.unwrap();
        let (negotiated, leftover) = negotiate(&mut ep, carry).await.unwrap();
        assert_eq!(negotiated.speed, 33600);
        assert!(leftover.is_empty());
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn rejection_line_fails_auth() {
        let (mut ep, mut peer) = pair().await;
        let server = tokio::spawn(async move {
            let mut buf = [0u8; 32];
            let _ = peer.read(&mut buf).await.unwrap();
            peer.write_all(b"Authentication failed\r\n").await.unwrap();
            peer
        });

        let err = authenticate(&mut ep, "u", "wrong").await.unwrap_err();
        assert!(matches!(err, HandshakeError::AuthRejected));
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn negotiation_line_is_consumed_and_tail_returned() {
        let (mut ep, mut peer) = pair().await;
        peer.write_all(b"Welcome to VesperNet\nNEGOTIATE:28800:V.34\n\x7e\xff\x03")
            .await
            .unwrap();

        let (negotiated, leftover) = negotiate(&mut ep, Vec::new()).await.unwrap();
        assert_eq!(negotiated.speed, 28800);
        assert_eq!(negotiated.connection_type, "V.34");
        assert_eq!(leftover, b"\x7e\xff\x03");
    }

    #[tokio::test]
    async fn error_line_rejects_negotiation() {
        let (mut ep, mut peer) = pair().await;
        peer.write_all(b"ERROR: no lines available\n").await.unwrap();

        let err = negotiate(&mut ep, Vec::new()).await.unwrap_err();
        assert!(matches!(err, HandshakeError::NegotiationRejected(_)));
    }

    #[tokio::test]
    async fn peer_close_mid_negotiation_is_an_endpoint_error() {
        let (mut ep, peer) = pair().await;
        drop(peer);

        let err = negotiate(&mut ep, Vec::new()).await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Endpoint(EndpointError::Closed)
        ));
    }
}
