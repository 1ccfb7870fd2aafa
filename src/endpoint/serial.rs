//! Physical serial port endpoint.
//!
//! The fd is owned by a pair of dedicated `std::thread`s (one reading, one
//! writing on a dup'd fd) configured for raw 8N1 with `VMIN=0, VTIME=1`, so
//! every blocking read returns within ~100 ms. The async side talks to the
//! threads through bounded `mpsc` channels; dropping the endpoint drains and
//! stops both threads, which close their fds on the way out.
//!
//! Liveness is probed without touching the line: a read error ends the
//! reader thread, and for `/dev/*` paths the thread also checks periodically
//! that the device node still exists (pseudo-terminals vanish when the
//! emulator side exits).

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use nix::unistd;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, EndpointError};

/// Read buffer size for the reader thread.
const READ_BUF_SIZE: usize = 4096;

/// Channel depth between the async side and the I/O threads.
const CHANNEL_DEPTH: usize = 64;

/// Helper to get a `BorrowedFd` from a `RawFd` for nix calls.
///
/// # Safety
/// The caller must ensure `fd` is a valid open file descriptor.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

/// Open a physical serial device and spawn its I/O threads.
pub fn open(
    device: &str,
    baud_rate: u32,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<Endpoint, EndpointError> {
    let baud = map_baud(baud_rate).ok_or_else(|| {
        EndpointError::InvalidConfig(format!("unsupported baud rate {baud_rate}"))
    })?;

    let fd = fcntl::open(
        device,
        OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
        Mode::empty(),
    )
    .map_err(|e| open_error(device, e))?;

    // Clear O_NONBLOCK now that we have the fd — we want blocking reads
    // with the VTIME timeout in the reader thread.
    let setup = (|| -> nix::Result<()> {
        let flags = fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL)?;
        let mut oflags = OFlag::from_bits_truncate(flags);
        oflags.remove(OFlag::O_NONBLOCK);
        fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(oflags))?;
        configure_termios(fd, baud)?;
        // SAFETY: fd is valid — we just opened it
        unsafe {
            termios::tcflush(borrow_fd(fd), termios::FlushArg::TCIOFLUSH)?;
        }
        Ok(())
    })();
    if let Err(e) = setup {
        let _ = unistd::close(fd);
        return Err(EndpointError::Io(std::io::Error::from_raw_os_error(
            e as i32,
        )));
    }

    let write_fd = match unistd::dup(fd) {
        Ok(dup) => dup,
        Err(e) => {
            let _ = unistd::close(fd);
            return Err(EndpointError::Io(std::io::Error::from_raw_os_error(
                e as i32,
            )));
        }
    };

    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);

    let dev = device.to_string();
    std::thread::Builder::new()
        .name(format!("serial-rd-{dev}"))
        .spawn(move || reader_thread(fd, &out_tx, &dev))
        .map_err(EndpointError::Io)?;

    let dev = device.to_string();
    std::thread::Builder::new()
        .name(format!("serial-wr-{dev}"))
        .spawn(move || writer_thread(write_fd, in_rx, &dev))
        .map_err(EndpointError::Io)?;

    info!("Serial {device}: opened at {baud_rate} baud (8N1, raw)");

    Ok(Endpoint::from_serial_channels(
        out_rx,
        in_tx,
        format!("serial:{device}"),
        read_timeout,
        write_timeout,
    ))
}

/// Map a numeric baud rate to its termios constant.
fn map_baud(baud_rate: u32) -> Option<BaudRate> {
    match baud_rate {
        300 => Some(BaudRate::B300),
        1200 => Some(BaudRate::B1200),
        2400 => Some(BaudRate::B2400),
        4800 => Some(BaudRate::B4800),
        9600 => Some(BaudRate::B9600),
        19200 => Some(BaudRate::B19200),
        38400 => Some(BaudRate::B38400),
        57600 => Some(BaudRate::B57600),
        115200 => Some(BaudRate::B115200),
        230400 => Some(BaudRate::B230400),
        _ => None,
    }
}

fn open_error(device: &str, errno: Errno) -> EndpointError {
    match errno {
        Errno::ENOENT => EndpointError::NotFound(device.to_string()),
        Errno::EACCES => EndpointError::PermissionDenied(device.to_string()),
        Errno::EBUSY => EndpointError::Busy(device.to_string()),
        other => EndpointError::Io(std::io::Error::from_raw_os_error(other as i32)),
    }
}

/// Configure termios: raw mode, requested baud, 8N1, no flow control.
/// VMIN=0, VTIME=1 → reads return after 100ms of silence.
fn configure_termios(fd: RawFd, baud: BaudRate) -> nix::Result<()> {
    // SAFETY: fd is valid — caller just opened it
    let borrowed = unsafe { borrow_fd(fd) };

    let mut tio = termios::tcgetattr(borrowed)?;

    termios::cfmakeraw(&mut tio);

    termios::cfsetispeed(&mut tio, baud)?;
    termios::cfsetospeed(&mut tio, baud)?;

    // 8N1, CLOCAL (ignore modem control), CREAD (enable receiver)
    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS; // no hardware flow control

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio)?;

    Ok(())
}

/// Blocking reader: forwards chunks from the fd into the async channel.
/// Exits when the endpoint is dropped, the device vanishes, or a read fails.
fn reader_thread(fd: RawFd, out_tx: &mpsc::Sender<Vec<u8>>, device: &str) {
    let mut buf = [0u8; READ_BUF_SIZE];
    let probe_path = device.starts_with("/dev/").then(|| Path::new(device));
    let mut idle_ticks: u32 = 0;

    loop {
        if out_tx.is_closed() {
            break;
        }
        match unistd::read(fd, &mut buf) {
            // VTIME expired with no data
            Ok(0) | Err(Errno::EAGAIN) => {
                idle_ticks += 1;
                // ~5s cadence at VTIME=1
                if idle_ticks % 50 == 0 {
                    if let Some(path) = probe_path {
                        if !path.exists() {
                            warn!("Serial {device}: device node vanished");
                            break;
                        }
                    }
                }
            }
            Ok(n) => {
                idle_ticks = 0;
                if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(Errno::EINTR) => {}
            Err(e) => {
                warn!("Serial {device}: read failed: {e}");
                break;
            }
        }
    }

    debug!("Serial {device}: reader thread exiting");
    let _ = unistd::close(fd);
}

/// Blocking writer: drains the async channel onto the fd, retrying partial
/// writes until each chunk is fully out.
fn writer_thread(fd: RawFd, mut in_rx: mpsc::Receiver<Vec<u8>>, device: &str) {
    while let Some(chunk) = in_rx.blocking_recv() {
        if let Err(e) = write_all(fd, &chunk) {
            warn!("Serial {device}: write failed: {e}");
            break;
        }
    }

    debug!("Serial {device}: writer thread exiting");
    let _ = unistd::close(fd);
}

fn write_all(fd: RawFd, mut data: &[u8]) -> nix::Result<()> {
    // SAFETY: fd is valid — owned by the writer thread for its entire lifetime
    let bfd = unsafe { borrow_fd(fd) };
    while !data.is_empty() {
        match unistd::write(bfd, data) {
            Ok(n) => data = &data[n..],
            Err(Errno::EINTR | Errno::EAGAIN) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
