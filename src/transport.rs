//! Outbound TCP transport to the VesperNet server.
//!
//! [`dial`] resolves the server name with its own deadline, preferring IPv4
//! addresses (broken IPv6 routes on home networks otherwise stall the
//! connect for minutes), tries each address under the connect deadline, and
//! configures TCP keepalive on the winning socket so a silent NAT expiry is
//! noticed within ~30s.

use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::endpoint::Endpoint;

/// Deadline for DNS resolution.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from dialing the server.
#[derive(Debug)]
pub enum DialError {
    /// No address accepted the connection within the deadline.
    Timeout,
    /// The server actively refused the connection.
    Refused,
    /// No route to the server.
    Unreachable,
    /// DNS resolution failed or timed out.
    Resolve(String),
    /// Anything else the socket layer reported.
    Io(std::io::Error),
}

impl std::fmt::Display for DialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialError::Timeout => write!(f, "connection timed out"),
            DialError::Refused => write!(f, "connection refused"),
            DialError::Unreachable => write!(f, "server unreachable"),
            DialError::Resolve(host) => write!(f, "cannot resolve {host}"),
            DialError::Io(e) => write!(f, "connect failed: {e}"),
        }
    }
}

impl std::error::Error for DialError {}

/// Configure TCP keepalive on a connected stream.
///
/// Parameters: start probing after `idle` seconds, probe every `interval`
/// seconds, give up after `count` failed probes.
#[allow(clippy::cast_possible_wrap)]
fn set_tcp_keepalive(stream: &TcpStream, idle: u32, interval: u32, count: u32) {
    use std::ptr;

    let fd = stream.as_raw_fd();
    let sz = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    unsafe {
        let enable: libc::c_int = 1;
        let idle = idle as libc::c_int;
        let interval = interval as libc::c_int;
        let count = count as libc::c_int;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            ptr::addr_of!(enable).cast(),
            sz,
        );
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPIDLE,
                ptr::addr_of!(idle).cast(),
                sz,
            );
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPINTVL,
                ptr::addr_of!(interval).cast(),
                sz,
            );
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPCNT,
                ptr::addr_of!(count).cast(),
                sz,
            );
        }
    }
}

/// Dial the server and wrap the connection as an [`Endpoint`].
///
/// `connect_timeout` bounds each individual address attempt. The returned
/// endpoint uses the given per-operation deadlines.
pub async fn dial(
    host: &str,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<Endpoint, DialError> {
    let host_port = format!("{host}:{port}");

    // Resolve with timeout — DNS can hang on broken resolvers
    let mut addrs: Vec<SocketAddr> = tokio::time::timeout(
        RESOLVE_TIMEOUT,
        tokio::net::lookup_host(&host_port),
    )
    .await
    .map_err(|_| DialError::Resolve(host.to_string()))?
    .map_err(|_| DialError::Resolve(host.to_string()))?
    .collect();

    // Sort: IPv4 first, then IPv6
    addrs.sort_by_key(|a| i32::from(!a.is_ipv4()));

    if addrs.is_empty() {
        return Err(DialError::Resolve(host.to_string()));
    }

    let mut last_err = DialError::Timeout;
    for addr in &addrs {
        match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                // Probe after 15s idle, every 5s, 3 probes before dead.
                set_tcp_keepalive(&stream, 15, 5, 3);
                stream.set_nodelay(true).ok();
                info!("Connected to {addr}");
                return Ok(Endpoint::from_tcp(
                    stream,
                    format!("tcp:{host_port}"),
                    read_timeout,
                    write_timeout,
                ));
            }
            Ok(Err(e)) => {
                warn!("Connect to {addr} failed: {e}");
                last_err = classify(e);
            }
            Err(_) => {
                warn!("Connect to {addr} timed out");
                last_err = DialError::Timeout;
            }
        }
    }

    Err(last_err)
}

fn classify(e: std::io::Error) -> DialError {
    if matches!(
        e.raw_os_error(),
        Some(libc::EHOSTUNREACH | libc::ENETUNREACH)
    ) {
        return DialError::Unreachable;
    }
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => DialError::Refused,
        std::io::ErrorKind::TimedOut => DialError::Timeout,
        _ => DialError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_reaches_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let ep = dial(
            "127.0.0.1",
            port,
            Duration::from_secs(2),
            Duration::from_millis(100),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(ep.is_alive());
        let (_peer, _) = listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn refused_port_reports_refused() {
        // Bind then drop to find a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = dial(
            "127.0.0.1",
            port,
            Duration::from_secs(2),
            Duration::from_millis(100),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DialError::Refused));
    }

    #[tokio::test]
    async fn bogus_name_reports_resolve() {
        let err = dial(
            "no-such-host.invalid",
            6060,
            Duration::from_secs(2),
            Duration::from_millis(100),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DialError::Resolve(_)));
    }
}
