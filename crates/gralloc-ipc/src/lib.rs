//! gralloc IPC protocol
//!
//! Shared wire layer between the allocator (`gralloc-gbm`) and the external
//! display process (`gralloc-sink`): the frame handoff exchange and the
//! transmissible form of a buffer handle.

pub mod handle;
pub mod handoff;

pub use handle::{BufferDescriptor, NativeHandle, recv_native_handle, send_native_handle};
pub use handoff::{FrameSink, ReceivedFrame};

use std::path::PathBuf;
use thiserror::Error;

/// File name of the well-known frame endpoint inside the runtime directory
pub const ENDPOINT_NAME: &str = "gralloc-frame.sock";

/// Socket path of the frame endpoint
pub fn endpoint_path() -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));
    PathBuf::from(runtime_dir).join(ENDPOINT_NAME)
}

/// Errors raised by the wire layer
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("failed to connect to {path:?}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("short write: {sent} of {expected} bytes accepted")]
    ShortWrite { sent: usize, expected: usize },

    #[error("timed out waiting for peer")]
    TimedOut,

    #[error("peer closed the connection")]
    Closed,

    #[error("message arrived without a file descriptor")]
    MissingDescriptor,

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("malformed buffer descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),

    #[error(transparent)]
    Sys(#[from] nix::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IpcError>;
