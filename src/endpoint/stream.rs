//! Socket-backed pseudo-serial endpoints.
//!
//! Emulators commonly expose their guest serial port as a Unix domain socket
//! (`unix:<path>`) or a TCP listener (`tcp:<host>:<port>`). Both map onto the
//! same [`Endpoint`] contract as a physical port; there is no baud rate and
//! liveness comes from the socket itself (a zero-length read is an orderly
//! peer close).

use std::time::Duration;

use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tracing::info;

use crate::endpoint::{Endpoint, EndpointError};

/// Deadline for the initial socket connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect to a Unix-domain-socket pseudo-serial device.
pub async fn connect_unix(
    path: &str,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<Endpoint, EndpointError> {
    let stream = match timeout(CONNECT_TIMEOUT, UnixStream::connect(path)).await {
        Err(_) => {
            return Err(EndpointError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {path} timed out"),
            )))
        }
        Ok(Err(e)) => return Err(connect_error(path, e)),
        Ok(Ok(stream)) => stream,
    };

    info!("Serial unix:{path}: connected");
    Ok(Endpoint::from_unix(
        stream,
        format!("unix:{path}"),
        read_timeout,
        write_timeout,
    ))
}

/// Connect to a TCP pseudo-serial device (an emulator's null-modem listener).
pub async fn connect_tcp(
    host: &str,
    port: u16,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<Endpoint, EndpointError> {
    let addr = format!("{host}:{port}");
    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
        Err(_) => {
            return Err(EndpointError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            )))
        }
        Ok(Err(e)) => return Err(connect_error(&addr, e)),
        Ok(Ok(stream)) => stream,
    };
    stream.set_nodelay(true).ok();

    info!("Serial tcp:{addr}: connected");
    Ok(Endpoint::from_tcp(
        stream,
        format!("tcp:{addr}"),
        read_timeout,
        write_timeout,
    ))
}

fn connect_error(target: &str, e: std::io::Error) -> EndpointError {
    match e.kind() {
        std::io::ErrorKind::NotFound => EndpointError::NotFound(target.to_string()),
        std::io::ErrorKind::PermissionDenied => EndpointError::PermissionDenied(target.to_string()),
        _ => EndpointError::Io(e),
    }
}
