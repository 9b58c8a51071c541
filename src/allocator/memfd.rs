//! memfd-backed allocator
//!
//! Every backing object is an anonymous `memfd` whose rows are padded to the
//! configured stride alignment. The connection descriptor is an empty anchor
//! memfd so capability queries have something real to hand out.

use super::{AllocRequest, AllocatorConnection, AllocatorOpener, BackingObject, ImportRequest};
use crate::config::AllocatorConfig;
use std::ffi::CStr;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use tracing::debug;

/// Allocator capability backed by anonymous shared memory
#[derive(Debug, Clone)]
pub struct MemfdAllocator {
    stride_align: u32,
    max_buffer_bytes: u64,
}

impl MemfdAllocator {
    pub fn new(config: &AllocatorConfig) -> Self {
        Self {
            stride_align: config.stride_align.max(1),
            max_buffer_bytes: config.max_buffer_bytes,
        }
    }
}

impl Default for MemfdAllocator {
    fn default() -> Self {
        Self::new(&AllocatorConfig::default())
    }
}

impl AllocatorOpener for MemfdAllocator {
    fn open(&self) -> io::Result<Box<dyn AllocatorConnection>> {
        let anchor = create_memfd(c"gralloc-device", 0)?;
        debug!("Opened memfd allocator, anchor fd {}", anchor.as_raw_fd());
        Ok(Box::new(MemfdDevice {
            anchor,
            stride_align: self.stride_align,
            max_buffer_bytes: self.max_buffer_bytes,
        }))
    }
}

struct MemfdDevice {
    anchor: OwnedFd,
    stride_align: u32,
    max_buffer_bytes: u64,
}

impl MemfdDevice {
    fn layout(&self, request: &AllocRequest) -> io::Result<(u32, u64)> {
        let bpp = u64::from(request.format.bytes_per_pixel());
        if bpp == 0 || request.width == 0 || request.height == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let row = u64::from(request.width) * bpp;
        let align = u64::from(self.stride_align);
        let stride = row.div_ceil(align) * align;
        let stride = u32::try_from(stride).map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))?;

        let size = u64::from(stride)
            .checked_mul(request.format.total_rows(request.height))
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EOVERFLOW))?;
        if size > self.max_buffer_bytes {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        Ok((stride, size))
    }
}

impl AllocatorConnection for MemfdDevice {
    fn fd(&self) -> BorrowedFd<'_> {
        self.anchor.as_fd()
    }

    fn alloc(&mut self, request: &AllocRequest) -> io::Result<Box<dyn BackingObject>> {
        let (stride, size) = self.layout(request)?;
        let fd = create_memfd(c"gralloc-buffer", size)?;
        debug!(
            "memfd bo {}x{} stride {} size {} fd {}",
            request.width,
            request.height,
            stride,
            size,
            fd.as_raw_fd()
        );
        Ok(Box::new(MemfdBuffer::new(fd, stride, size)))
    }

    fn import(
        &mut self,
        fd: OwnedFd,
        request: &ImportRequest,
    ) -> io::Result<Box<dyn BackingObject>> {
        let actual = File::from(fd.try_clone()?).metadata()?.len();
        let min_row = u64::from(request.width) * u64::from(request.format.bytes_per_pixel());
        let needed = u64::from(request.stride) * request.format.total_rows(request.height);
        if request.size == 0
            || u64::from(request.stride) < min_row
            || request.size < needed
            || actual < request.size
        {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(Box::new(MemfdBuffer::new(fd, request.stride, request.size)))
    }
}

struct MemfdBuffer {
    fd: OwnedFd,
    stride: u32,
    size: u64,
    mapping: Option<NonNull<u8>>,
}

// SAFETY: the mapping pointer is only dereferenced by lock holders; the
// object itself is moved between threads under the device mutex.
unsafe impl Send for MemfdBuffer {}

impl MemfdBuffer {
    fn new(fd: OwnedFd, stride: u32, size: u64) -> Self {
        Self {
            fd,
            stride,
            size,
            mapping: None,
        }
    }
}

impl BackingObject for MemfdBuffer {
    fn stride(&self) -> u32 {
        self.stride
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn export_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }

    fn map(&mut self) -> io::Result<NonNull<u8>> {
        if let Some(ptr) = self.mapping {
            return Ok(ptr);
        }

        let len = usize::try_from(self.size).map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))?;
        // SAFETY: fresh shared mapping of a descriptor we own, sized to the file.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))?;
        self.mapping = Some(ptr);
        Ok(ptr)
    }

    fn unmap(&mut self) {
        if let Some(ptr) = self.mapping.take() {
            // SAFETY: ptr/size describe the mapping created in `map`.
            unsafe {
                libc::munmap(ptr.as_ptr().cast(), self.size as usize);
            }
        }
    }
}

impl Drop for MemfdBuffer {
    fn drop(&mut self) {
        self.unmap();
    }
}

fn create_memfd(name: &CStr, size: u64) -> io::Result<OwnedFd> {
    // SAFETY: name is NUL terminated; the returned descriptor is checked below.
    let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: memfd_create returned a new descriptor owned by nobody else.
    let file = File::from(unsafe { OwnedFd::from_raw_fd(raw) });
    file.set_len(size)?;
    Ok(file.into())
}
