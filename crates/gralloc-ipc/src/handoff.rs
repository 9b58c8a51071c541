//! Frame handoff wire exchange.
//!
//! # Protocol Overview
//!
//! One request and one reply per connection over a `SOCK_STREAM` Unix socket:
//!
//! 1. **Request**: a single byte (value irrelevant) carrying exactly one
//!    file descriptor as `SCM_RIGHTS` ancillary data.
//! 2. **Reply**: a single byte (value irrelevant) acknowledging the frame.
//!
//! There is no length prefix and no pipelining; the connection is closed
//! after the reply.

use crate::{IpcError, Result};
use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
    recvmsg, sendmsg, socket,
};
use std::io::{ErrorKind, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Payload byte of a frame request
pub const REQUEST_BYTE: u8 = 0;
/// Payload byte of a frame acknowledgement
pub const ACK_BYTE: u8 = 1;

/// Pause between connect attempts while the listener's backlog is full
const CONNECT_RETRY: Duration = Duration::from_millis(10);

/// Connect to a frame endpoint and arm the reply deadline
///
/// `timeout` bounds the connect as well: a listener whose backlog stays full
/// past the deadline is reported as a connect failure with `ETIMEDOUT`.
pub fn connect(path: &Path, timeout: Duration) -> Result<UnixStream> {
    let connect_err = |errno: Errno| IpcError::Connect {
        path: path.to_path_buf(),
        source: std::io::Error::from(errno),
    };

    let addr = UnixAddr::new(path).map_err(connect_err)?;
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )?;

    let deadline = Instant::now() + timeout;
    loop {
        match nix::sys::socket::connect(fd.as_raw_fd(), &addr) {
            Ok(()) => break,
            Err(Errno::EINTR) => continue,
            // Linux reports a full backlog on a nonblocking unix socket as EAGAIN
            Err(Errno::EAGAIN) if Instant::now() < deadline => {
                std::thread::sleep(CONNECT_RETRY.min(deadline.saturating_duration_since(Instant::now())));
            }
            Err(Errno::EAGAIN) => {
                warn!("Frame endpoint {:?} backlog full for {:?}", path, timeout);
                return Err(connect_err(Errno::ETIMEDOUT));
            }
            Err(errno) => return Err(connect_err(errno)),
        }
    }

    let stream = UnixStream::from(fd);
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(timeout))?;
    Ok(stream)
}

/// Send the one-byte frame request with `fd` attached
pub fn send_frame(stream: &UnixStream, fd: BorrowedFd<'_>) -> Result<()> {
    let payload = [REQUEST_BYTE];
    let fds = [fd.as_raw_fd()];
    let iov = [IoSlice::new(&payload)];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    let sent = sendmsg::<()>(
        stream.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::MSG_NOSIGNAL,
        None,
    )?;
    if sent != payload.len() {
        return Err(IpcError::ShortWrite {
            sent,
            expected: payload.len(),
        });
    }

    debug!("Sent frame request with fd {}", fds[0]);
    Ok(())
}

/// Wait for the one-byte acknowledgement
///
/// Honors the read timeout set on the stream; an expired deadline is
/// reported as [`IpcError::TimedOut`], an orderly close as [`IpcError::Closed`].
pub fn recv_ack(stream: &mut UnixStream) -> Result<u8> {
    let mut reply = [0u8; 1];
    loop {
        match stream.read(&mut reply) {
            Ok(0) => return Err(IpcError::Closed),
            Ok(_) => return Ok(reply[0]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(IpcError::TimedOut);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Receive one byte plus its attached descriptor
///
/// Returns the payload byte and every descriptor carried with it. Received
/// descriptors are marked close-on-exec.
pub fn recv_with_fds(stream: &UnixStream, buf: &mut [u8]) -> Result<(usize, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; 4]);

    let msg = loop {
        match recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => break msg,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Err(IpcError::TimedOut),
            Err(e) => return Err(e.into()),
        }
    };

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(raw) = cmsg {
            // SAFETY: SCM_RIGHTS hands us freshly installed descriptors we now own.
            fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }
    Ok((msg.bytes, fds))
}

/// Receive a frame request, returning the transferred descriptor
pub fn recv_frame(stream: &UnixStream) -> Result<OwnedFd> {
    let mut payload = [0u8; 1];
    let (len, fds) = recv_with_fds(stream, &mut payload)?;
    if len == 0 {
        return Err(IpcError::Closed);
    }

    let mut fds = fds.into_iter();
    let fd = fds.next().ok_or(IpcError::MissingDescriptor)?;
    if fds.len() > 0 {
        warn!("Frame request carried {} extra descriptors, closing them", fds.len());
    }
    Ok(fd)
}

/// Receiving end of the frame handoff, bound to the well-known endpoint
pub struct FrameSink {
    listener: UnixListener,
    path: PathBuf,
    request_timeout: Option<Duration>,
}

impl FrameSink {
    /// Bind the endpoint, replacing any stale socket file
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Remove existing socket if present
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path)?;
        info!("Frame sink listening on {:?}", path);

        Ok(Self {
            listener,
            path,
            request_timeout: None,
        })
    }

    /// Bound the wait for the request byte after a client connects
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one connection and receive its frame
    pub fn accept_frame(&self) -> Result<ReceivedFrame> {
        let (stream, _) = self.listener.accept()?;
        stream.set_read_timeout(self.request_timeout)?;
        let fd = recv_frame(&stream)?;
        debug!("Received frame fd {}", fd.as_raw_fd());
        Ok(ReceivedFrame { stream, fd })
    }
}

impl Drop for FrameSink {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A frame received by [`FrameSink`], waiting to be acknowledged
///
/// Dropping it without calling [`ReceivedFrame::ack`] closes the connection
/// without a reply.
pub struct ReceivedFrame {
    stream: UnixStream,
    fd: OwnedFd,
}

impl ReceivedFrame {
    pub fn fd(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.fd.as_fd()
    }

    /// Reply with the acknowledgement byte and keep the descriptor
    pub fn ack(mut self) -> Result<OwnedFd> {
        self.stream.write_all(&[ACK_BYTE])?;
        Ok(self.fd)
    }
}
