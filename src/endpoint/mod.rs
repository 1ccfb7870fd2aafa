//! Byte-stream endpoint abstraction.
//!
//! One [`Endpoint`] type covers the three concrete serial-side kinds plus the
//! server-side TCP session. The kind is selected by the device string:
//!
//! - `COM<n>`, `/dev/<name>` or a bare name — physical serial port
//! - `unix:<path>` — Unix domain socket (pseudo-serial, e.g. an emulator)
//! - `tcp:<host>:<port>` — outbound TCP socket (pseudo-serial)
//!
//! Reads are deadline-bounded and return an empty buffer on expiry. An
//! orderly peer close also returns empty but flips the shared liveness flag,
//! which is monotonic true→false. Writes retry internally until the whole
//! buffer is out or the write deadline expires. After [`Endpoint::close`]
//! every read returns empty and every write returns zero.
//!
//! The bridge engine owns the two halves of each endpoint separately; see
//! [`Endpoint::split`] and [`Endpoint::reunite`].

pub mod serial;
pub mod stream;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{tcp, unix};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Errors surfaced by endpoint construction and I/O.
#[derive(Debug)]
pub enum EndpointError {
    /// Device or socket path does not exist.
    NotFound(String),
    /// Exclusive open refused; another process holds the device.
    Busy(String),
    /// Insufficient permissions to open the device.
    PermissionDenied(String),
    /// Unsupported baud rate or malformed device string.
    InvalidConfig(String),
    /// Transient read/write failure.
    Io(std::io::Error),
    /// Operation on an endpoint that was already closed.
    Closed,
}

impl std::fmt::Display for EndpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointError::NotFound(what) => write!(f, "not found: {what}"),
            EndpointError::Busy(what) => write!(f, "device busy: {what}"),
            EndpointError::PermissionDenied(what) => write!(f, "permission denied: {what}"),
            EndpointError::InvalidConfig(what) => write!(f, "invalid configuration: {what}"),
            EndpointError::Io(e) => write!(f, "I/O error: {e}"),
            EndpointError::Closed => write!(f, "endpoint closed"),
        }
    }
}

impl std::error::Error for EndpointError {}

impl From<std::io::Error> for EndpointError {
    fn from(e: std::io::Error) -> Self {
        EndpointError::Io(e)
    }
}

/// Concrete endpoint kind named by a device string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    /// Physical serial port path (`/dev/ttyUSB0`, `COM3`, `ttyS0`).
    Physical(String),
    /// Unix domain socket path.
    UnixSocket(String),
    /// Outbound TCP host and port.
    TcpSocket(String, u16),
}

/// Parse a device string into its [`DeviceKind`].
pub fn parse_device(device: &str) -> Result<DeviceKind, EndpointError> {
    if let Some(path) = device.strip_prefix("unix:") {
        if path.is_empty() {
            return Err(EndpointError::InvalidConfig(
                "unix: device needs a socket path".to_string(),
            ));
        }
        return Ok(DeviceKind::UnixSocket(path.to_string()));
    }
    if let Some(addr) = device.strip_prefix("tcp:") {
        let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
            EndpointError::InvalidConfig(format!("tcp: device needs host:port, got {addr:?}"))
        })?;
        let port: u16 = port.parse().map_err(|_| {
            EndpointError::InvalidConfig(format!("tcp: device has a bad port in {addr:?}"))
        })?;
        if host.is_empty() {
            return Err(EndpointError::InvalidConfig(
                "tcp: device needs a host".to_string(),
            ));
        }
        return Ok(DeviceKind::TcpSocket(host.to_string(), port));
    }
    if device.is_empty() {
        return Err(EndpointError::InvalidConfig(
            "empty device string".to_string(),
        ));
    }
    Ok(DeviceKind::Physical(device.to_string()))
}

/// Open the serial-side endpoint named by `device`.
///
/// `baud_rate` applies to physical ports only. The deadlines become the
/// endpoint's initial per-operation read and write timeouts.
pub async fn open(
    device: &str,
    baud_rate: u32,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<Endpoint, EndpointError> {
    match parse_device(device)? {
        DeviceKind::Physical(path) => serial::open(&path, baud_rate, read_timeout, write_timeout),
        DeviceKind::UnixSocket(path) => {
            stream::connect_unix(&path, read_timeout, write_timeout).await
        }
        DeviceKind::TcpSocket(host, port) => {
            stream::connect_tcp(&host, port, read_timeout, write_timeout).await
        }
    }
}

#[derive(Debug)]
enum ReadInner {
    Tcp(tcp::OwnedReadHalf),
    Unix(unix::OwnedReadHalf),
    Serial {
        rx: mpsc::Receiver<Vec<u8>>,
        pending: Vec<u8>,
    },
}

#[derive(Debug)]
enum WriteInner {
    Tcp(tcp::OwnedWriteHalf),
    Unix(unix::OwnedWriteHalf),
    Serial(Option<mpsc::Sender<Vec<u8>>>),
}

/// Read half of an endpoint. Reads are deadline-bounded and non-destructive
/// of liveness: expiry returns empty with the flag untouched, orderly close
/// returns empty and clears it.
#[derive(Debug)]
pub struct EndpointReader {
    id: String,
    inner: ReadInner,
    timeout: Duration,
    alive: Arc<AtomicBool>,
    closed: bool,
}

/// Write half of an endpoint. Writes retry internally until complete.
#[derive(Debug)]
pub struct EndpointWriter {
    id: String,
    inner: WriteInner,
    timeout: Duration,
    alive: Arc<AtomicBool>,
    closed: bool,
}

impl EndpointReader {
    /// Read up to `max` bytes under the current read deadline.
    ///
    /// Returns an empty buffer on deadline expiry and on orderly peer close;
    /// the two cases are distinguished by [`EndpointReader::is_alive`].
    pub async fn read(&mut self, max: usize) -> Result<Vec<u8>, EndpointError> {
        if self.closed || !self.alive.load(Ordering::Relaxed) {
            return Ok(Vec::new());
        }
        match &mut self.inner {
            ReadInner::Tcp(half) => {
                let mut buf = vec![0u8; max];
                match timeout(self.timeout, half.read(&mut buf)).await {
                    Err(_) => Ok(Vec::new()),
                    Ok(Ok(0)) => {
                        self.alive.store(false, Ordering::Relaxed);
                        Ok(Vec::new())
                    }
                    Ok(Ok(n)) => {
                        buf.truncate(n);
                        Ok(buf)
                    }
                    Ok(Err(e)) => {
                        self.alive.store(false, Ordering::Relaxed);
                        Err(EndpointError::Io(e))
                    }
                }
            }
            ReadInner::Unix(half) => {
                let mut buf = vec![0u8; max];
                match timeout(self.timeout, half.read(&mut buf)).await {
                    Err(_) => Ok(Vec::new()),
                    Ok(Ok(0)) => {
                        self.alive.store(false, Ordering::Relaxed);
                        Ok(Vec::new())
                    }
                    Ok(Ok(n)) => {
                        buf.truncate(n);
                        Ok(buf)
                    }
                    Ok(Err(e)) => {
                        self.alive.store(false, Ordering::Relaxed);
                        Err(EndpointError::Io(e))
                    }
                }
            }
            ReadInner::Serial { rx, pending } => {
                if !pending.is_empty() {
                    let take = pending.len().min(max);
                    let rest = pending.split_off(take);
                    let chunk = std::mem::replace(pending, rest);
                    return Ok(chunk);
                }
                match timeout(self.timeout, rx.recv()).await {
                    Err(_) => Ok(Vec::new()),
                    Ok(None) => {
                        // I/O thread exited: device unplugged or closed
                        self.alive.store(false, Ordering::Relaxed);
                        Ok(Vec::new())
                    }
                    Ok(Some(mut chunk)) => {
                        if chunk.len() > max {
                            *pending = chunk.split_off(max);
                        }
                        Ok(chunk)
                    }
                }
            }
        }
    }

    /// Best-effort liveness. Monotonic: once false, never true again.
    pub fn is_alive(&self) -> bool {
        !self.closed && self.alive.load(Ordering::Relaxed)
    }

    /// Replace the per-read deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn close(&mut self) {
        self.closed = true;
        self.alive.store(false, Ordering::Relaxed);
        if let ReadInner::Serial { rx, .. } = &mut self.inner {
            rx.close();
        }
    }
}

impl EndpointWriter {
    /// Write the whole buffer under the current write deadline.
    ///
    /// Partial writes are retried internally; on success the return value
    /// equals `data.len()`. Returns 0 after close.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, EndpointError> {
        if self.closed {
            return Ok(0);
        }
        if data.is_empty() {
            return Ok(0);
        }
        match &mut self.inner {
            WriteInner::Tcp(half) => match timeout(self.timeout, half.write_all(data)).await {
                Err(_) => Err(EndpointError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write deadline expired",
                ))),
                Ok(Ok(())) => Ok(data.len()),
                Ok(Err(e)) => {
                    self.alive.store(false, Ordering::Relaxed);
                    Err(EndpointError::Io(e))
                }
            },
            WriteInner::Unix(half) => match timeout(self.timeout, half.write_all(data)).await {
                Err(_) => Err(EndpointError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write deadline expired",
                ))),
                Ok(Ok(())) => Ok(data.len()),
                Ok(Err(e)) => {
                    self.alive.store(false, Ordering::Relaxed);
                    Err(EndpointError::Io(e))
                }
            },
            WriteInner::Serial(tx) => {
                let Some(sender) = tx.as_ref() else {
                    return Ok(0);
                };
                match timeout(self.timeout, sender.send(data.to_vec())).await {
                    Err(_) => Err(EndpointError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "write deadline expired",
                    ))),
                    Ok(Ok(())) => Ok(data.len()),
                    Ok(Err(_)) => {
                        // I/O thread gone
                        self.alive.store(false, Ordering::Relaxed);
                        Err(EndpointError::Closed)
                    }
                }
            }
        }
    }

    /// Best-effort liveness. Monotonic: once false, never true again.
    pub fn is_alive(&self) -> bool {
        !self.closed && self.alive.load(Ordering::Relaxed)
    }

    /// Replace the per-write deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn close(&mut self) {
        self.closed = true;
        self.alive.store(false, Ordering::Relaxed);
        match &mut self.inner {
            WriteInner::Tcp(half) => {
                let _ = half.shutdown().await;
            }
            WriteInner::Unix(half) => {
                let _ = half.shutdown().await;
            }
            WriteInner::Serial(tx) => {
                // Dropping the sender lets the writer thread drain and exit
                tx.take();
            }
        }
    }
}

/// A bidirectional byte-stream endpoint.
#[derive(Debug)]
pub struct Endpoint {
    reader: EndpointReader,
    writer: EndpointWriter,
}

impl Endpoint {
    pub(crate) fn from_tcp(
        stream: tokio::net::TcpStream,
        id: String,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let alive = Arc::new(AtomicBool::new(true));
        Self {
            reader: EndpointReader {
                id: id.clone(),
                inner: ReadInner::Tcp(read_half),
                timeout: read_timeout,
                alive: alive.clone(),
                closed: false,
            },
            writer: EndpointWriter {
                id,
                inner: WriteInner::Tcp(write_half),
                timeout: write_timeout,
                alive,
                closed: false,
            },
        }
    }

    pub(crate) fn from_unix(
        stream: tokio::net::UnixStream,
        id: String,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let alive = Arc::new(AtomicBool::new(true));
        Self {
            reader: EndpointReader {
                id: id.clone(),
                inner: ReadInner::Unix(read_half),
                timeout: read_timeout,
                alive: alive.clone(),
                closed: false,
            },
            writer: EndpointWriter {
                id,
                inner: WriteInner::Unix(write_half),
                timeout: write_timeout,
                alive,
                closed: false,
            },
        }
    }

    pub(crate) fn from_serial_channels(
        rx: mpsc::Receiver<Vec<u8>>,
        tx: mpsc::Sender<Vec<u8>>,
        id: String,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        let alive = Arc::new(AtomicBool::new(true));
        Self {
            reader: EndpointReader {
                id: id.clone(),
                inner: ReadInner::Serial {
                    rx,
                    pending: Vec::new(),
                },
                timeout: read_timeout,
                alive: alive.clone(),
                closed: false,
            },
            writer: EndpointWriter {
                id,
                inner: WriteInner::Serial(Some(tx)),
                timeout: write_timeout,
                alive,
                closed: false,
            },
        }
    }

    /// Identifier used in logs (`serial:/dev/ttyUSB0`, `tcp:host:port`).
    pub fn id(&self) -> &str {
        &self.reader.id
    }

    /// Read up to `max` bytes under the read deadline. See [`EndpointReader::read`].
    pub async fn read(&mut self, max: usize) -> Result<Vec<u8>, EndpointError> {
        self.reader.read(max).await
    }

    /// Write the whole buffer under the write deadline. See [`EndpointWriter::write`].
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, EndpointError> {
        self.writer.write(data).await
    }

    /// Best-effort liveness. Monotonic: once false, never true again.
    pub fn is_alive(&self) -> bool {
        self.reader.is_alive() && self.writer.is_alive()
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.reader.set_timeout(timeout);
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.writer.set_timeout(timeout);
    }

    /// Close both halves. Idempotent; subsequent reads return empty and
    /// writes return zero.
    pub async fn close(&mut self) {
        self.reader.close();
        self.writer.close().await;
    }

    /// Tear the endpoint into independently-owned halves, one per bridge
    /// direction.
    pub fn split(self) -> (EndpointReader, EndpointWriter) {
        (self.reader, self.writer)
    }

    /// Reassemble an endpoint from halves previously produced by
    /// [`Endpoint::split`].
    pub fn reunite(reader: EndpointReader, writer: EndpointWriter) -> Self {
        Self { reader, writer }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_physical_devices() {
        assert_eq!(
            parse_device("/dev/ttyUSB0").unwrap(),
            DeviceKind::Physical("/dev/ttyUSB0".to_string())
        );
        assert_eq!(
            parse_device("COM3").unwrap(),
            DeviceKind::Physical("COM3".to_string())
        );
        assert_eq!(
            parse_device("ttyS0").unwrap(),
            DeviceKind::Physical("ttyS0".to_string())
        );
    }

    #[test]
    fn parses_unix_device() {
        assert_eq!(
            parse_device("unix:/tmp/vmodem.sock").unwrap(),
            DeviceKind::UnixSocket("/tmp/vmodem.sock".to_string())
        );
    }

    #[test]
    fn parses_tcp_device() {
        assert_eq!(
            parse_device("tcp:localhost:6400").unwrap(),
            DeviceKind::TcpSocket("localhost".to_string(), 6400)
        );
    }

    #[test]
    fn rejects_malformed_devices() {
        assert!(matches!(
            parse_device(""),
            Err(EndpointError::InvalidConfig(_))
        ));
        assert!(matches!(
            parse_device("tcp:nohost"),
            Err(EndpointError::InvalidConfig(_))
        ));
        assert!(matches!(
            parse_device("tcp:host:notaport"),
            Err(EndpointError::InvalidConfig(_))
        ));
        assert!(matches!(
            parse_device("unix:"),
            Err(EndpointError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn tcp_endpoint_read_deadline_returns_empty() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (_peer, _) = listener.accept().await.unwrap();

        let mut ep = Endpoint::from_tcp(
            client,
            "tcp:test".to_string(),
            Duration::from_millis(20),
            Duration::from_secs(1),
        );
        let data = ep.read(64).await.unwrap();
        assert!(data.is_empty());
        assert!(ep.is_alive());
    }

    #[tokio::test]
    async fn tcp_endpoint_orderly_close_clears_liveness() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);

        let mut ep = Endpoint::from_tcp(
            client,
            "tcp:test".to_string(),
            Duration::from_millis(200),
            Duration::from_secs(1),
        );
        let data = ep.read(64).await.unwrap();
        assert!(data.is_empty());
        assert!(!ep.is_alive());
    }

    #[tokio::test]
    async fn closed_endpoint_reads_empty_and_writes_zero() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (_peer, _) = listener.accept().await.unwrap();

        let mut ep = Endpoint::from_tcp(
            client,
            "tcp:test".to_string(),
            Duration::from_millis(20),
            Duration::from_secs(1),
        );
        ep.close().await;
        assert!(ep.read(64).await.unwrap().is_empty());
        assert_eq!(ep.write(b"data").await.unwrap(), 0);
        assert!(!ep.is_alive());
    }

    #[tokio::test]
    async fn split_halves_share_liveness() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);

        let ep = Endpoint::from_tcp(
            client,
            "tcp:test".to_string(),
            Duration::from_millis(200),
            Duration::from_secs(1),
        );
        let (mut reader, writer) = ep.split();
        assert!(reader.read(64).await.unwrap().is_empty());
        assert!(!writer.is_alive());
        let ep = Endpoint::reunite(reader, writer);
        assert!(!ep.is_alive());
    }
}
