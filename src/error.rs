//! Error taxonomy shared by every device entry point.

use gralloc_ipc::IpcError;
use thiserror::Error;

/// Errors returned by the allocator, buffer and display entry points
#[derive(Debug, Error)]
pub enum Error {
    #[error("buffer allocator unavailable: {0}")]
    AllocatorUnavailable(#[source] std::io::Error),

    #[error("allocation failed (errno {code})")]
    AllocationFailed { code: i32 },

    #[error("unsupported pixel format {0:#x}")]
    UnsupportedFormat(i32),

    #[error("invalid buffer handle")]
    InvalidHandle,

    #[error("region {x},{y} {w}x{h} outside {width}x{height} buffer")]
    InvalidRegion {
        x: i32,
        y: i32,
        w: i32,
        h: i32,
        width: u32,
        height: u32,
    },

    #[error("buffer is not locked")]
    NotLocked,

    #[error("buffer already freed")]
    DoubleFree,

    #[error("lock usage {requested:#x} not permitted (allowed {allowed:#x})")]
    UsageMismatch { requested: u32, allowed: u32 },

    #[error("frame endpoint unreachable: {0}")]
    ConnectUnreachable(#[source] std::io::Error),

    #[error("frame request not fully sent")]
    SendIncomplete,

    #[error("timed out waiting for frame acknowledgement")]
    TimedOut,

    #[error("frame endpoint closed without acknowledging")]
    ReplyMissing,

    #[error("unknown device {0:?}")]
    UnknownDevice(String),

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build an allocation failure from the allocator's I/O error
    pub fn allocation(err: &std::io::Error) -> Self {
        Error::AllocationFailed {
            code: err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Negative errno equivalent, for C-style status returns
    pub fn errno(&self) -> i32 {
        let code = match self {
            Error::AllocatorUnavailable(_) => libc::ENODEV,
            Error::AllocationFailed { code } => *code,
            Error::UnsupportedFormat(_) => libc::EINVAL,
            Error::InvalidHandle => libc::EINVAL,
            Error::InvalidRegion { .. } => libc::EINVAL,
            Error::NotLocked => libc::EINVAL,
            Error::DoubleFree => libc::EINVAL,
            Error::UsageMismatch { .. } => libc::EINVAL,
            Error::ConnectUnreachable(_) => libc::ECONNREFUSED,
            Error::SendIncomplete => libc::EIO,
            Error::TimedOut => libc::ETIMEDOUT,
            Error::ReplyMissing => libc::EPIPE,
            Error::UnknownDevice(_) => libc::EINVAL,
            Error::Unimplemented(_) => libc::ENOSYS,
            Error::InvalidArgument(_) => libc::EINVAL,
        };
        -code.abs()
    }
}

impl From<IpcError> for Error {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::Connect { source, .. } => Error::ConnectUnreachable(source),
            IpcError::ShortWrite { .. } => Error::SendIncomplete,
            IpcError::TimedOut => Error::TimedOut,
            IpcError::Closed => Error::ReplyMissing,
            IpcError::Sys(_) => Error::SendIncomplete,
            IpcError::Io(_) => Error::ReplyMissing,
            IpcError::MissingDescriptor
            | IpcError::MessageTooLarge(_)
            | IpcError::Descriptor(_) => Error::InvalidHandle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_is_negative() {
        assert_eq!(Error::InvalidHandle.errno(), -libc::EINVAL);
        assert_eq!(Error::TimedOut.errno(), -libc::ETIMEDOUT);
        assert_eq!(
            Error::AllocationFailed { code: libc::ENOMEM }.errno(),
            -libc::ENOMEM
        );
        assert_eq!(Error::Unimplemented("usage query").errno(), -libc::ENOSYS);
    }

    #[test]
    fn test_allocation_failure_keeps_os_code() {
        let err = std::io::Error::from_raw_os_error(libc::ENOMEM);
        assert!(matches!(
            Error::allocation(&err),
            Error::AllocationFailed { code } if code == libc::ENOMEM
        ));
    }

    #[test]
    fn test_ipc_errors_map_to_handoff_taxonomy() {
        assert!(matches!(Error::from(IpcError::TimedOut), Error::TimedOut));
        assert!(matches!(Error::from(IpcError::Closed), Error::ReplyMissing));
        assert!(matches!(
            Error::from(IpcError::ShortWrite { sent: 0, expected: 1 }),
            Error::SendIncomplete
        ));
    }
}
