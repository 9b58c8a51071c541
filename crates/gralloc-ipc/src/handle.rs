//! Transmissible form of a buffer handle.
//!
//! A [`NativeHandle`] is the metadata of a buffer ([`BufferDescriptor`]) plus
//! an owned descriptor for its memory. On the wire the metadata travels as a
//! length-prefixed JSON message and the descriptor rides along as
//! `SCM_RIGHTS` ancillary data on the same `sendmsg`.

use crate::handoff::recv_with_fds;
use crate::{IpcError, Result};
use nix::sys::socket::{ControlMessage, MsgFlags, sendmsg};
use serde::{Deserialize, Serialize};
use std::io::{IoSlice, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;

/// Upper bound for an encoded descriptor
const MAX_DESCRIPTOR_LEN: usize = 64 * 1024;

/// Serialized buffer metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    /// Protocol sync marker, see [`BufferDescriptor::MAGIC`]
    pub magic: u32,
    /// Process that allocated the buffer
    pub owner_pid: u32,
    /// Buffer id within the owning process
    pub id: u64,
    pub width: u32,
    pub height: u32,
    /// Pixel format code
    pub format: i32,
    /// Usage bits requested at allocation
    pub usage: u32,
    /// Row stride in bytes
    pub stride: u32,
    /// Size of the backing memory in bytes
    pub size: u64,
}

impl BufferDescriptor {
    pub const MAGIC: u32 = 0x4742_4d31; // "GBM1"

    /// Encode with a 4-byte big-endian length prefix
    pub fn encode(&self) -> Result<Vec<u8>> {
        let data = serde_json::to_vec(self)?;
        let len = data.len() as u32;
        let mut buf = Vec::with_capacity(4 + data.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&data);
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Buffer metadata plus an owned descriptor for its memory
#[derive(Debug)]
pub struct NativeHandle {
    pub descriptor: BufferDescriptor,
    pub fd: OwnedFd,
}

impl NativeHandle {
    pub fn new(descriptor: BufferDescriptor, fd: OwnedFd) -> Self {
        Self { descriptor, fd }
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Duplicate the handle, including its descriptor
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            descriptor: self.descriptor.clone(),
            fd: self.fd.try_clone()?,
        })
    }
}

/// Send a native handle over a connected Unix stream
pub fn send_native_handle(stream: &UnixStream, handle: &NativeHandle) -> Result<()> {
    let encoded = handle.descriptor.encode()?;
    let fds = [handle.fd.as_raw_fd()];
    let iov = [IoSlice::new(&encoded)];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    let sent = sendmsg::<()>(
        stream.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::MSG_NOSIGNAL,
        None,
    )?;
    if sent != encoded.len() {
        return Err(IpcError::ShortWrite {
            sent,
            expected: encoded.len(),
        });
    }
    Ok(())
}

/// Receive a native handle sent with [`send_native_handle`]
pub fn recv_native_handle(stream: &UnixStream) -> Result<NativeHandle> {
    let mut len_buf = [0u8; 4];
    let (read, fds) = recv_with_fds(stream, &mut len_buf)?;
    if read == 0 {
        return Err(IpcError::Closed);
    }
    let fd = fds.into_iter().next().ok_or(IpcError::MissingDescriptor)?;

    // The ancillary data rides on the first byte; the rest is plain stream data
    let mut reader = stream;
    if read < len_buf.len() {
        reader.read_exact(&mut len_buf[read..])?;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_DESCRIPTOR_LEN {
        return Err(IpcError::MessageTooLarge(len));
    }

    let mut msg_buf = vec![0u8; len];
    reader.read_exact(&mut msg_buf)?;
    let descriptor = BufferDescriptor::decode(&msg_buf)?;

    Ok(NativeHandle { descriptor, fd })
}
