//! Allocation endpoint (`gpu0`)

use crate::buffer::BufferHandle;
use crate::device::DeviceContext;
use crate::error::Result;
use crate::format::{BufferUsage, PixelFormat};
use std::sync::Arc;
use tracing::{debug, warn};

/// Buffer owned by whoever allocated it
///
/// Released exactly once: by [`AllocDevice::free`], or on drop if it was
/// never freed explicitly.
pub struct OwnedBuffer {
    ctx: Arc<DeviceContext>,
    handle: BufferHandle,
    released: bool,
}

impl OwnedBuffer {
    /// Logical handle for lock/unlock/post; clones do not own the buffer
    pub fn handle(&self) -> &BufferHandle {
        &self.handle
    }

    fn release(mut self) -> Result<()> {
        self.released = true;
        self.ctx.destroy(self.handle.clone())
    }
}

impl std::fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedBuffer").field("handle", &self.handle).finish()
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        debug!("Releasing unfreed buffer {:?}", self.handle.id());
        if let Err(e) = self.ctx.destroy(self.handle.clone()) {
            warn!("Failed to release buffer on drop: {}", e);
        }
    }
}

/// Allocation endpoint bound to a device context
pub struct AllocDevice {
    ctx: Arc<DeviceContext>,
}

impl AllocDevice {
    /// Open the endpoint; the allocator connection is opened if needed
    pub fn open(ctx: Arc<DeviceContext>) -> Result<Self> {
        ctx.ensure_ready()?;
        Ok(Self { ctx })
    }

    /// Allocate a buffer, returning it with its row stride in pixels
    pub fn alloc(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> Result<(OwnedBuffer, u32)> {
        let handle = self.ctx.create(width, height, format, usage)?;
        let buffer = OwnedBuffer {
            ctx: Arc::clone(&self.ctx),
            handle,
            released: false,
        };
        let stride = buffer.handle().info().stride_pixels()?;
        debug!("alloc {:?} stride {} px", buffer.handle().id(), stride);
        Ok((buffer, stride))
    }

    /// Release a buffer's memory and descriptor
    pub fn free(&self, buffer: OwnedBuffer) -> Result<()> {
        buffer.release()
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Close the endpoint and the allocator connection
    pub fn close(self) {
        self.ctx.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::MemfdAllocator;
    use crate::buffer::Region;
    use crate::error::Error;

    fn device() -> AllocDevice {
        AllocDevice::open(DeviceContext::new(MemfdAllocator::default())).unwrap()
    }

    #[test]
    fn test_display_sized_rgba() {
        let dev = device();
        let (buffer, stride) = dev
            .alloc(720, 1280, PixelFormat::Rgba8888, BufferUsage::empty())
            .unwrap();

        assert!(buffer.handle().info().stride >= 720 * 4);
        assert!(stride >= 720);
        assert_eq!(stride, buffer.handle().info().stride / 4);
        dev.free(buffer).unwrap();
    }

    #[test]
    fn test_unsized_format_is_rejected() {
        let dev = device();
        for format in [PixelFormat::Blob, PixelFormat::ImplementationDefined] {
            assert!(matches!(
                dev.alloc(64, 64, format, BufferUsage::empty()),
                Err(Error::UnsupportedFormat(_))
            ));
        }
        assert_eq!(dev.context().live_buffers(), 0);
    }

    #[test]
    fn test_free_releases_once() {
        let dev = device();
        let (buffer, _) = dev
            .alloc(32, 32, PixelFormat::Rgb565, BufferUsage::SW_WRITE_OFTEN)
            .unwrap();
        let stale = buffer.handle().clone();

        dev.free(buffer).unwrap();
        assert_eq!(dev.context().live_buffers(), 0);
        assert!(matches!(
            dev.context().lock(&stale, BufferUsage::SW_WRITE_OFTEN, Region::new(0, 0, 1, 1)),
            Err(Error::InvalidHandle)
        ));
    }

    #[test]
    fn test_drop_releases_unfreed_buffer() {
        let dev = device();
        {
            let _buffer = dev
                .alloc(8, 8, PixelFormat::Rgba8888, BufferUsage::empty())
                .unwrap();
            assert_eq!(dev.context().live_buffers(), 1);
        }
        assert_eq!(dev.context().live_buffers(), 0);
    }

    #[test]
    fn test_zero_sized_allocation_fails() {
        let dev = device();
        assert!(matches!(
            dev.alloc(0, 16, PixelFormat::Rgba8888, BufferUsage::empty()),
            Err(Error::AllocationFailed { .. })
        ));
    }
}
