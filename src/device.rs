//! Device context
//!
//! Owns the process's single allocator connection and the buffer table, both
//! behind one mutex. Every buffer operation, allocation and frame post in the
//! crate goes through [`DeviceContext`], so all of them are serialized
//! against each other, including operations on unrelated buffers.

use crate::allocator::{AllocatorConnection, AllocatorOpener};
use crate::buffer::{BufferHandle, BufferTable, CpuMapping, Region};
use crate::error::{Error, Result};
use crate::format::{BufferUsage, PixelFormat};
use gralloc_ipc::NativeHandle;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// State guarded by the device mutex
pub(crate) struct DeviceState {
    connection: Option<Box<dyn AllocatorConnection>>,
    buffers: BufferTable,
}

impl DeviceState {
    /// Open connection and buffer table, borrowed together
    fn split(&mut self) -> Result<(&mut dyn AllocatorConnection, &mut BufferTable)> {
        let DeviceState {
            connection,
            buffers,
        } = self;
        // Only reachable through `DeviceContext::ready`, which opened it
        let connection = connection.as_deref_mut().ok_or_else(|| {
            Error::AllocatorUnavailable(std::io::Error::from_raw_os_error(libc::ENODEV))
        })?;
        Ok((connection, buffers))
    }
}

/// Shared allocator connection plus the device-wide mutex
pub struct DeviceContext {
    opener: Box<dyn AllocatorOpener>,
    state: Mutex<DeviceState>,
}

impl DeviceContext {
    /// Create an uninitialized context; the connection opens on first use
    pub fn new(opener: impl AllocatorOpener + 'static) -> Arc<Self> {
        Arc::new(Self {
            opener: Box::new(opener),
            state: Mutex::new(DeviceState {
                connection: None,
                buffers: BufferTable::default(),
            }),
        })
    }

    /// Acquire the device mutex
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        // The guarded state is bookkeeping that stays consistent across panics
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the device mutex, opening the allocator connection if needed
    fn ready(&self) -> Result<MutexGuard<'_, DeviceState>> {
        let mut state = self.lock_state();
        if state.connection.is_none() {
            let connection = self.opener.open().map_err(Error::AllocatorUnavailable)?;
            info!("Allocator connection opened (fd {})", connection.fd().as_raw_fd());
            state.connection = Some(connection);
        }
        Ok(state)
    }

    /// Open the allocator connection unless it already is
    pub fn ensure_ready(&self) -> Result<()> {
        self.ready().map(|_| ())
    }

    pub fn is_ready(&self) -> bool {
        self.lock_state().connection.is_some()
    }

    /// Descriptor of the allocator connection
    pub fn fd(&self) -> Result<RawFd> {
        let mut state = self.ready()?;
        let (connection, _) = state.split()?;
        Ok(connection.fd().as_raw_fd())
    }

    /// Close the allocator connection
    ///
    /// Buffers still alive at this point are released first, so no backing
    /// object outlives the connection it came from.
    pub fn teardown(&self) {
        let mut state = self.lock_state();
        let leaked = state.buffers.clear();
        if leaked > 0 {
            warn!("Tearing down allocator with {} live buffers", leaked);
        }
        if state.connection.take().is_some() {
            info!("Allocator connection closed");
        }
    }

    /// Number of buffers currently known to this process
    pub fn live_buffers(&self) -> usize {
        self.lock_state().buffers.len()
    }

    /// Allocate a buffer
    pub fn create(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> Result<BufferHandle> {
        debug!("create {}x{} {:?} usage {:#x}", width, height, format, usage.bits());
        let mut state = self.ready()?;
        let (connection, buffers) = state.split()?;
        buffers.create(connection, width, height, format, usage)
    }

    /// Release a buffer's backing object and descriptor
    ///
    /// A second destroy through a stale clone fails with [`Error::DoubleFree`].
    pub fn destroy(&self, handle: BufferHandle) -> Result<()> {
        debug!("destroy {:?}", handle.id());
        self.lock_state().buffers.destroy(&handle)
    }

    /// Serialize a live handle for transfer to another process
    pub fn export(&self, handle: &BufferHandle) -> Result<NativeHandle> {
        self.lock_state().buffers.export(handle)
    }

    /// Import a handle, possibly received from another process
    pub fn register(&self, native: &NativeHandle) -> Result<BufferHandle> {
        debug!("register buffer {} from pid {}", native.descriptor.id, native.descriptor.owner_pid);
        let mut state = self.ready()?;
        let (connection, buffers) = state.split()?;
        buffers.register(connection, native)
    }

    /// Drop one registration of a handle
    pub fn unregister(&self, handle: &BufferHandle) -> Result<()> {
        debug!("unregister {:?}", handle.id());
        self.lock_state().buffers.unregister(handle)
    }

    /// Map a region of the buffer for CPU access
    pub fn lock(&self, handle: &BufferHandle, usage: BufferUsage, region: Region) -> Result<CpuMapping> {
        let mapping = self.lock_state().buffers.lock(handle, usage, region)?;
        debug!("buffer {:?} lock usage = {:#010x}", handle.id(), usage.bits());
        Ok(mapping)
    }

    /// Release one lock taken with [`DeviceContext::lock`]
    pub fn unlock(&self, handle: &BufferHandle) -> Result<()> {
        debug!("unlock {:?}", handle.id());
        self.lock_state().buffers.unlock(handle)
    }

    /// Run `f` with the buffer's descriptor while holding the device mutex
    pub fn with_prime_fd<T>(&self, handle: &BufferHandle, f: impl FnOnce(BorrowedFd<'_>) -> T) -> Result<T> {
        let state = self.lock_state();
        let fd = state.buffers.prime_fd(handle)?;
        Ok(f(fd))
    }

    /// Duplicate the buffer's descriptor
    pub fn dup_prime_fd(&self, handle: &BufferHandle) -> Result<OwnedFd> {
        self.with_prime_fd(handle, |fd| fd.try_clone_to_owned())?
            .map_err(|e| Error::allocation(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::MemfdAllocator;
    use crate::allocator::testing::{SlowMapAllocator, UnavailableAllocator};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    const RW: BufferUsage = BufferUsage::SW_READ_OFTEN.union(BufferUsage::SW_WRITE_OFTEN);

    #[test]
    fn test_lazy_idempotent_init() {
        let ctx = DeviceContext::new(MemfdAllocator::default());
        assert!(!ctx.is_ready());

        ctx.ensure_ready().unwrap();
        let fd = ctx.fd().unwrap();
        ctx.ensure_ready().unwrap();
        assert_eq!(ctx.fd().unwrap(), fd);
        assert!(ctx.is_ready());
    }

    #[test]
    fn test_concurrent_init_opens_once() {
        let ctx = DeviceContext::new(MemfdAllocator::default());
        let fds: Vec<RawFd> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8).map(|_| scope.spawn(|| ctx.fd().unwrap())).collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert!(fds.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn test_unavailable_allocator() {
        let ctx = DeviceContext::new(UnavailableAllocator);
        assert!(matches!(ctx.ensure_ready(), Err(Error::AllocatorUnavailable(_))));
        assert!(matches!(
            ctx.create(16, 16, PixelFormat::Rgba8888, RW),
            Err(Error::AllocatorUnavailable(_))
        ));
        assert!(!ctx.is_ready());
    }

    #[test]
    fn test_create_destroy_round_trip() {
        let ctx = DeviceContext::new(MemfdAllocator::default());
        let handle = ctx.create(64, 64, PixelFormat::Rgb888, RW).unwrap();
        let stale = handle.clone();
        ctx.destroy(handle).unwrap();

        assert!(matches!(ctx.lock(&stale, RW, Region::new(0, 0, 1, 1)), Err(Error::InvalidHandle)));
        assert!(matches!(ctx.unlock(&stale), Err(Error::InvalidHandle)));
        assert!(matches!(ctx.export(&stale), Err(Error::InvalidHandle)));
        assert!(matches!(ctx.destroy(stale), Err(Error::DoubleFree)));
        assert_eq!(ctx.live_buffers(), 0);
    }

    #[test]
    fn test_teardown_releases_outstanding_buffers() {
        let ctx = DeviceContext::new(MemfdAllocator::default());
        let handle = ctx.create(8, 8, PixelFormat::Rgba8888, RW).unwrap();
        ctx.teardown();

        assert!(!ctx.is_ready());
        assert_eq!(ctx.live_buffers(), 0);
        assert!(matches!(ctx.lock(&handle, RW, Region::new(0, 0, 1, 1)), Err(Error::InvalidHandle)));
    }

    #[test]
    fn test_locks_on_different_buffers_are_serialized() {
        let delay = Duration::from_millis(300);
        let ctx = DeviceContext::new(SlowMapAllocator {
            inner: MemfdAllocator::default(),
            delay,
        });
        let a = ctx.create(16, 16, PixelFormat::Rgba8888, RW).unwrap();
        let b = ctx.create(16, 16, PixelFormat::Rgba8888, RW).unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        std::thread::scope(|scope| {
            let ctx_a = &ctx;
            let a = &a;
            scope.spawn(move || {
                started_tx.send(Instant::now()).unwrap();
                ctx_a.lock(a, RW, Region::full(a.info())).unwrap();
                done_tx.send(Instant::now()).unwrap();
                ctx_a.unlock(a).unwrap();
            });

            let a_started = started_rx.recv().unwrap();
            // Let thread 1 get into its (slow) mapping before competing
            std::thread::sleep(Duration::from_millis(50));
            ctx.lock(&b, RW, Region::full(b.info())).unwrap();
            let b_returned = Instant::now();

            let a_done = done_rx.recv().unwrap();
            assert!(b_returned >= a_done, "lock(B) returned before lock(A) released the device");
            assert!(b_returned - a_started >= delay * 2);
            ctx.unlock(&b).unwrap();
        });
    }
}
