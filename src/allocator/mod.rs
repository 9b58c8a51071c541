//! Buffer memory allocator capability
//!
//! The device context only talks to the allocator through these traits;
//! closing a connection or freeing a backing object is `Drop`.

pub mod memfd;

pub use memfd::MemfdAllocator;

use crate::format::{BufferUsage, PixelFormat};
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;

/// Parameters of a new allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
}

/// Layout of a buffer being imported from another process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportRequest {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: u32,
    pub size: u64,
}

/// Opens the process-wide allocator connection
pub trait AllocatorOpener: Send + Sync {
    fn open(&self) -> io::Result<Box<dyn AllocatorConnection>>;
}

/// An open allocator connection
pub trait AllocatorConnection: Send {
    /// Descriptor of the underlying device
    fn fd(&self) -> BorrowedFd<'_>;

    /// Allocate a new backing object
    fn alloc(&mut self, request: &AllocRequest) -> io::Result<Box<dyn BackingObject>>;

    /// Adopt a backing object exported by another process
    fn import(&mut self, fd: OwnedFd, request: &ImportRequest)
    -> io::Result<Box<dyn BackingObject>>;
}

/// Device memory behind one buffer
pub trait BackingObject: Send {
    /// Row stride in bytes
    fn stride(&self) -> u32;

    /// Total size in bytes
    fn size(&self) -> u64;

    /// Export a new descriptor referring to this object's memory
    fn export_fd(&self) -> io::Result<OwnedFd>;

    /// Map the whole object for CPU access, reusing an existing mapping
    fn map(&mut self) -> io::Result<NonNull<u8>>;

    /// Drop the CPU mapping, if any
    fn unmap(&mut self);
}

#[cfg(test)]
pub(crate) mod testing {
    //! Allocator wrappers used to provoke failures and contention.

    use super::*;
    use std::time::Duration;

    /// Opener whose `open` always fails
    pub struct UnavailableAllocator;

    impl AllocatorOpener for UnavailableAllocator {
        fn open(&self) -> io::Result<Box<dyn AllocatorConnection>> {
            Err(io::Error::from_raw_os_error(libc::ENODEV))
        }
    }

    /// Memfd allocator whose mappings take `delay` to establish
    pub struct SlowMapAllocator {
        pub inner: MemfdAllocator,
        pub delay: Duration,
    }

    impl AllocatorOpener for SlowMapAllocator {
        fn open(&self) -> io::Result<Box<dyn AllocatorConnection>> {
            Ok(Box::new(SlowConnection {
                inner: self.inner.open()?,
                delay: self.delay,
            }))
        }
    }

    struct SlowConnection {
        inner: Box<dyn AllocatorConnection>,
        delay: Duration,
    }

    impl AllocatorConnection for SlowConnection {
        fn fd(&self) -> BorrowedFd<'_> {
            self.inner.fd()
        }

        fn alloc(&mut self, request: &AllocRequest) -> io::Result<Box<dyn BackingObject>> {
            Ok(Box::new(SlowObject {
                inner: self.inner.alloc(request)?,
                delay: self.delay,
            }))
        }

        fn import(
            &mut self,
            fd: OwnedFd,
            request: &ImportRequest,
        ) -> io::Result<Box<dyn BackingObject>> {
            self.inner.import(fd, request)
        }
    }

    struct SlowObject {
        inner: Box<dyn BackingObject>,
        delay: Duration,
    }

    impl BackingObject for SlowObject {
        fn stride(&self) -> u32 {
            self.inner.stride()
        }

        fn size(&self) -> u64 {
            self.inner.size()
        }

        fn export_fd(&self) -> io::Result<OwnedFd> {
            self.inner.export_fd()
        }

        fn map(&mut self) -> io::Result<NonNull<u8>> {
            std::thread::sleep(self.delay);
            self.inner.map()
        }

        fn unmap(&mut self) {
            self.inner.unmap()
        }
    }
}
