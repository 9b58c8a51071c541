//! Buffer handles and the per-process buffer table
//!
//! The table is plain bookkeeping; every method expects the caller to hold
//! the device mutex (see [`crate::device::DeviceContext`]).

use crate::allocator::{AllocRequest, AllocatorConnection, BackingObject, ImportRequest};
use crate::error::{Error, Result};
use crate::format::{BufferUsage, PixelFormat};
use gralloc_ipc::{BufferDescriptor, NativeHandle};
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Process-local buffer id, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Immutable properties of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
    /// Row stride in bytes
    pub stride: u32,
    pub size: u64,
}

impl BufferInfo {
    pub fn bytes_per_pixel(&self) -> u32 {
        self.format.bytes_per_pixel()
    }

    /// Row stride in pixels
    pub fn stride_pixels(&self) -> Result<u32> {
        Ok(self.stride / self.format.checked_bytes_per_pixel()?)
    }
}

/// Logical handle of a live buffer
///
/// Cheap to clone; a clone that outlives the buffer is rejected with
/// [`Error::InvalidHandle`] by every operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferHandle {
    id: BufferId,
    info: BufferInfo,
}

impl BufferHandle {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn info(&self) -> &BufferInfo {
        &self.info
    }
}

/// Sub-rectangle of a buffer requested for CPU access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Region {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    /// The whole buffer
    pub fn full(info: &BufferInfo) -> Self {
        Self::new(
            0,
            0,
            i32::try_from(info.width).unwrap_or(i32::MAX),
            i32::try_from(info.height).unwrap_or(i32::MAX),
        )
    }

    fn check(&self, info: &BufferInfo) -> Result<()> {
        let inside = self.x >= 0
            && self.y >= 0
            && self.w >= 0
            && self.h >= 0
            && i64::from(self.x) + i64::from(self.w) <= i64::from(info.width)
            && i64::from(self.y) + i64::from(self.h) <= i64::from(info.height);
        if inside {
            Ok(())
        } else {
            Err(Error::InvalidRegion {
                x: self.x,
                y: self.y,
                w: self.w,
                h: self.h,
                width: info.width,
                height: info.height,
            })
        }
    }
}

/// CPU view of a locked region
///
/// Points at the first pixel of the region; rows are `stride` bytes apart.
/// Valid until the matching unlock or the buffer's destruction.
#[derive(Debug)]
pub struct CpuMapping {
    ptr: NonNull<u8>,
    len: usize,
    stride: usize,
}

impl CpuMapping {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Bytes reachable from the region origin: `(h - 1) * stride + w * bpp`
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// # Safety
    ///
    /// The buffer must stay locked for the lifetime of the slice, and no
    /// other mapping of it may be written concurrently.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr..ptr+len lies inside the locked mapping (caller contract).
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// (device, inode) of the file behind a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    fn of(fd: BorrowedFd<'_>) -> std::io::Result<Self> {
        let meta = File::from(fd.try_clone_to_owned()?).metadata()?;
        Ok(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Allocated,
    Imported,
}

struct BufferEntry {
    info: BufferInfo,
    backing: Box<dyn BackingObject>,
    prime_fd: OwnedFd,
    identity: FileIdentity,
    origin: Origin,
    registrations: u32,
    lock_count: u32,
    locked_for: BufferUsage,
}

impl BufferEntry {
    fn new(
        info: BufferInfo,
        backing: Box<dyn BackingObject>,
        origin: Origin,
        registrations: u32,
    ) -> Result<Self> {
        let prime_fd = backing.export_fd().map_err(|e| Error::allocation(&e))?;
        let identity = FileIdentity::of(prime_fd.as_fd()).map_err(|e| Error::allocation(&e))?;
        Ok(Self {
            info,
            backing,
            prime_fd,
            identity,
            origin,
            registrations,
            lock_count: 0,
            locked_for: BufferUsage::empty(),
        })
    }
}

/// Every buffer known to this process
#[derive(Default)]
pub(crate) struct BufferTable {
    next_id: u64,
    entries: HashMap<BufferId, BufferEntry>,
}

impl BufferTable {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every entry, returning how many were still alive
    pub(crate) fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    fn insert(&mut self, entry: BufferEntry) -> BufferHandle {
        self.next_id += 1;
        let id = BufferId(self.next_id);
        let handle = BufferHandle {
            id,
            info: entry.info,
        };
        self.entries.insert(id, entry);
        handle
    }

    fn entry(&self, handle: &BufferHandle) -> Result<&BufferEntry> {
        self.entries.get(&handle.id).ok_or(Error::InvalidHandle)
    }

    fn entry_mut(&mut self, handle: &BufferHandle) -> Result<&mut BufferEntry> {
        self.entries.get_mut(&handle.id).ok_or(Error::InvalidHandle)
    }

    pub(crate) fn create(
        &mut self,
        conn: &mut dyn AllocatorConnection,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> Result<BufferHandle> {
        format.checked_bytes_per_pixel()?;

        let request = AllocRequest {
            width,
            height,
            format,
            usage,
        };
        let backing = conn.alloc(&request).map_err(|e| Error::allocation(&e))?;
        let info = BufferInfo {
            width,
            height,
            format,
            usage,
            stride: backing.stride(),
            size: backing.size(),
        };

        let handle = self.insert(BufferEntry::new(info, backing, Origin::Allocated, 0)?);
        debug!("Created buffer {:?}: {:?}", handle.id, info);
        Ok(handle)
    }

    pub(crate) fn destroy(&mut self, handle: &BufferHandle) -> Result<()> {
        match self.entries.get(&handle.id) {
            None if handle.id.0 <= self.next_id => return Err(Error::DoubleFree),
            None => return Err(Error::InvalidHandle),
            Some(entry) if entry.origin == Origin::Imported => return Err(Error::InvalidHandle),
            Some(_) => {}
        }

        if let Some(entry) = self.entries.remove(&handle.id) {
            if entry.lock_count > 0 {
                warn!("Destroying buffer {:?} while locked {} times", handle.id, entry.lock_count);
            }
            // Backing object and exported descriptor close here, once
            drop(entry);
        }
        debug!("Destroyed buffer {:?}", handle.id);
        Ok(())
    }

    /// Transmissible form of a live handle
    pub(crate) fn export(&self, handle: &BufferHandle) -> Result<NativeHandle> {
        let entry = self.entry(handle)?;
        let fd = entry.prime_fd.try_clone().map_err(|e| Error::allocation(&e))?;
        let descriptor = BufferDescriptor {
            magic: BufferDescriptor::MAGIC,
            owner_pid: std::process::id(),
            id: handle.id.0,
            width: entry.info.width,
            height: entry.info.height,
            format: entry.info.format.code(),
            usage: entry.info.usage.bits(),
            stride: entry.info.stride,
            size: entry.info.size,
        };
        Ok(NativeHandle::new(descriptor, fd))
    }

    pub(crate) fn register(
        &mut self,
        conn: &mut dyn AllocatorConnection,
        native: &NativeHandle,
    ) -> Result<BufferHandle> {
        let info = validate_descriptor(&native.descriptor)?;
        let identity = FileIdentity::of(native.fd()).map_err(|_| Error::InvalidHandle)?;

        if native.descriptor.owner_pid == std::process::id() {
            // One of ours: the id must still be live and name the same memory
            let id = BufferId(native.descriptor.id);
            let entry = self.entries.get_mut(&id).ok_or(Error::InvalidHandle)?;
            if entry.identity != identity {
                return Err(Error::InvalidHandle);
            }
            entry.registrations += 1;
            return Ok(BufferHandle { id, info: entry.info });
        }

        if let Some((id, entry)) = self
            .entries
            .iter_mut()
            .find(|(_, entry)| entry.identity == identity)
        {
            entry.registrations += 1;
            debug!("Buffer {:?} registered again ({})", id, entry.registrations);
            return Ok(BufferHandle {
                id: *id,
                info: entry.info,
            });
        }

        let request = ImportRequest {
            width: info.width,
            height: info.height,
            format: info.format,
            stride: info.stride,
            size: info.size,
        };
        let fd = native.fd.try_clone().map_err(|_| Error::InvalidHandle)?;
        let backing = conn.import(fd, &request).map_err(|e| {
            debug!("Import rejected: {}", e);
            Error::InvalidHandle
        })?;

        let handle = self.insert(BufferEntry::new(info, backing, Origin::Imported, 1)?);
        debug!("Imported buffer {:?} from pid {}", handle.id, native.descriptor.owner_pid);
        Ok(handle)
    }

    pub(crate) fn unregister(&mut self, handle: &BufferHandle) -> Result<()> {
        let entry = self.entry_mut(handle)?;
        if entry.registrations == 0 {
            return Err(Error::InvalidHandle);
        }
        entry.registrations -= 1;

        if entry.origin == Origin::Imported && entry.registrations == 0 {
            if let Some(entry) = self.entries.remove(&handle.id) {
                if entry.lock_count > 0 {
                    warn!("Unregistering buffer {:?} while locked", handle.id);
                }
            }
            debug!("Released imported buffer {:?}", handle.id);
        }
        Ok(())
    }

    pub(crate) fn lock(
        &mut self,
        handle: &BufferHandle,
        usage: BufferUsage,
        region: Region,
    ) -> Result<CpuMapping> {
        let entry = self.entry_mut(handle)?;
        region.check(&entry.info)?;

        // Nested locks must stay within what the buffer is already locked for
        if entry.lock_count > 0 && !entry.locked_for.contains(usage) {
            return Err(Error::UsageMismatch {
                requested: usage.bits(),
                allowed: entry.locked_for.bits(),
            });
        }

        let base = entry.backing.map().map_err(|e| Error::allocation(&e))?;
        let bpp = entry.info.bytes_per_pixel() as usize;
        let stride = entry.info.stride as usize;
        let (x, y, w, h) = (
            region.x as usize,
            region.y as usize,
            region.w as usize,
            region.h as usize,
        );
        // An empty region anchored on the far edge would point past the
        // mapping, so empty regions map at the base instead
        let (offset, len) = if w == 0 || h == 0 {
            (0, 0)
        } else {
            (y * stride + x * bpp, (h - 1) * stride + w * bpp)
        };

        entry.lock_count += 1;
        entry.locked_for |= usage;

        // SAFETY: a non-empty region was bounds-checked, so offset stays
        // inside the mapping.
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) };
        Ok(CpuMapping { ptr, len, stride })
    }

    pub(crate) fn unlock(&mut self, handle: &BufferHandle) -> Result<()> {
        let entry = self.entry_mut(handle)?;
        if entry.lock_count == 0 {
            return Err(Error::NotLocked);
        }

        entry.lock_count -= 1;
        if entry.lock_count == 0 {
            entry.backing.unmap();
            entry.locked_for = BufferUsage::empty();
        }
        Ok(())
    }

    /// Descriptor of a live buffer's memory
    pub(crate) fn prime_fd(&self, handle: &BufferHandle) -> Result<BorrowedFd<'_>> {
        Ok(self.entry(handle)?.prime_fd.as_fd())
    }
}

fn validate_descriptor(d: &BufferDescriptor) -> Result<BufferInfo> {
    if d.magic != BufferDescriptor::MAGIC || d.width == 0 || d.height == 0 || d.size == 0 {
        return Err(Error::InvalidHandle);
    }
    let format = PixelFormat::from_code(d.format).map_err(|_| Error::InvalidHandle)?;
    let bpp = format.checked_bytes_per_pixel().map_err(|_| Error::InvalidHandle)?;
    if u64::from(d.stride) < u64::from(d.width) * u64::from(bpp) {
        return Err(Error::InvalidHandle);
    }

    Ok(BufferInfo {
        width: d.width,
        height: d.height,
        format,
        usage: BufferUsage::from_bits_retain(d.usage),
        stride: d.stride,
        size: d.size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{AllocatorOpener, MemfdAllocator};

    const RW: BufferUsage = BufferUsage::SW_READ_OFTEN.union(BufferUsage::SW_WRITE_OFTEN);

    fn setup() -> (Box<dyn AllocatorConnection>, BufferTable) {
        (MemfdAllocator::default().open().unwrap(), BufferTable::default())
    }

    fn foreign(native: &NativeHandle) -> NativeHandle {
        let mut copy = native.try_clone().unwrap();
        copy.descriptor.owner_pid = copy.descriptor.owner_pid.wrapping_add(1);
        copy
    }

    #[test]
    fn test_unsupported_format_is_rejected_before_allocating() {
        let (mut conn, mut table) = setup();
        for format in PixelFormat::ALL.into_iter().filter(|f| !f.is_supported()) {
            let result = table.create(conn.as_mut(), 64, 64, format, RW);
            assert!(matches!(result, Err(Error::UnsupportedFormat(_))));
        }
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_destroyed_handle_is_invalid() {
        let (mut conn, mut table) = setup();
        let handle = table
            .create(conn.as_mut(), 32, 32, PixelFormat::Rgba8888, RW)
            .unwrap();
        let native = table.export(&handle).unwrap();
        table.destroy(&handle).unwrap();

        assert!(matches!(
            table.lock(&handle, RW, Region::new(0, 0, 1, 1)),
            Err(Error::InvalidHandle)
        ));
        assert!(matches!(table.unlock(&handle), Err(Error::InvalidHandle)));
        assert!(matches!(
            table.register(conn.as_mut(), &native),
            Err(Error::InvalidHandle)
        ));
        assert!(matches!(table.destroy(&handle), Err(Error::DoubleFree)));
    }

    #[test]
    fn test_region_bounds() {
        let (mut conn, mut table) = setup();
        let handle = table
            .create(conn.as_mut(), 16, 8, PixelFormat::Rgba8888, RW)
            .unwrap();

        for region in [
            Region::new(-1, 0, 1, 1),
            Region::new(0, -1, 1, 1),
            Region::new(10, 0, 7, 1),
            Region::new(0, 4, 1, 5),
            Region::new(0, 0, -1, 1),
            Region::new(i32::MAX, 0, i32::MAX, 1),
        ] {
            assert!(matches!(
                table.lock(&handle, RW, region),
                Err(Error::InvalidRegion { .. })
            ));
        }

        let mapping = table.lock(&handle, RW, Region::new(2, 3, 4, 5)).unwrap();
        assert_eq!(mapping.len(), 4 * handle.info().stride as usize + 4 * 4);
        table.unlock(&handle).unwrap();

        let full = table.lock(&handle, RW, Region::full(handle.info())).unwrap();
        assert!(full.len() <= handle.info().size as usize);
        table.unlock(&handle).unwrap();
    }

    #[test]
    fn test_region_pointer_offset() {
        let (mut conn, mut table) = setup();
        let handle = table
            .create(conn.as_mut(), 8, 8, PixelFormat::Rgb565, RW)
            .unwrap();

        let full = table.lock(&handle, RW, Region::full(handle.info())).unwrap();
        let sub = table.lock(&handle, RW, Region::new(3, 2, 1, 1)).unwrap();
        let expected = 2 * handle.info().stride as usize + 3 * 2;
        assert_eq!(sub.as_ptr() as usize - full.as_ptr() as usize, expected);
        table.unlock(&handle).unwrap();
        table.unlock(&handle).unwrap();
    }

    #[test]
    fn test_lock_ignores_allocation_usage() {
        let (mut conn, mut table) = setup();
        let handle = table
            .create(conn.as_mut(), 720, 1280, PixelFormat::Rgba8888, BufferUsage::empty())
            .unwrap();

        let mut mapping = table
            .lock(&handle, BufferUsage::SW_WRITE_OFTEN, Region::new(0, 0, 1, 1))
            .unwrap();
        unsafe { mapping.as_mut_slice()[0] = 0xff };
        table.unlock(&handle).unwrap();
        table.destroy(&handle).unwrap();
    }

    #[test]
    fn test_nested_lock_usage_rules() {
        let (mut conn, mut table) = setup();
        let handle = table
            .create(
                conn.as_mut(),
                8,
                8,
                PixelFormat::Rgba8888,
                BufferUsage::SW_READ_OFTEN | BufferUsage::HW_TEXTURE,
            )
            .unwrap();
        let region = Region::full(handle.info());

        table.lock(&handle, BufferUsage::SW_READ_RARELY, region).unwrap();
        // Nested lock asking for more than the outstanding lock holds
        assert!(matches!(
            table.lock(&handle, BufferUsage::SW_WRITE_OFTEN, region),
            Err(Error::UsageMismatch { .. })
        ));
        table.lock(&handle, BufferUsage::SW_READ_RARELY, region).unwrap();

        table.unlock(&handle).unwrap();
        table.unlock(&handle).unwrap();
        assert!(matches!(table.unlock(&handle), Err(Error::NotLocked)));

        // Once fully unlocked any usage is accepted again
        table.lock(&handle, BufferUsage::SW_WRITE_OFTEN, region).unwrap();
        table.unlock(&handle).unwrap();
    }

    #[test]
    fn test_empty_region_maps_at_base() {
        let (mut conn, mut table) = setup();
        let handle = table
            .create(conn.as_mut(), 16, 8, PixelFormat::Rgba8888, RW)
            .unwrap();

        let full = table.lock(&handle, RW, Region::full(handle.info())).unwrap();
        for region in [
            Region::new(16, 8, 0, 0),
            Region::new(0, 8, 16, 0),
            Region::new(16, 0, 0, 8),
        ] {
            let empty = table.lock(&handle, RW, region).unwrap();
            assert!(empty.is_empty());
            assert_eq!(empty.as_ptr(), full.as_ptr());
            table.unlock(&handle).unwrap();
        }
        table.unlock(&handle).unwrap();
    }

    #[test]
    fn test_local_register_unregister_pairs() {
        let (mut conn, mut table) = setup();
        let handle = table
            .create(conn.as_mut(), 8, 8, PixelFormat::Rgba8888, RW)
            .unwrap();
        let native = table.export(&handle).unwrap();

        assert!(matches!(table.unregister(&handle), Err(Error::InvalidHandle)));

        let first = table.register(conn.as_mut(), &native).unwrap();
        let second = table.register(conn.as_mut(), &native).unwrap();
        assert_eq!(first, handle);
        assert_eq!(second, handle);

        table.unregister(&first).unwrap();
        table.unregister(&second).unwrap();
        assert!(matches!(table.unregister(&handle), Err(Error::InvalidHandle)));

        // Registration bookkeeping never touches the allocation itself
        table.lock(&handle, RW, Region::new(0, 0, 1, 1)).unwrap();
        table.unlock(&handle).unwrap();
        table.destroy(&handle).unwrap();
    }

    #[test]
    fn test_foreign_descriptor_imported_once() {
        let (mut conn, mut exporter) = setup();
        let source = exporter
            .create(conn.as_mut(), 8, 8, PixelFormat::Rgba8888, RW)
            .unwrap();
        let native = foreign(&exporter.export(&source).unwrap());

        let mut table = BufferTable::default();
        let a = table.register(conn.as_mut(), &native).unwrap();
        let b = table.register(conn.as_mut(), &native).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(table.len(), 1);

        // Imported proxies are released through unregister, not destroy
        assert!(matches!(table.destroy(&a), Err(Error::InvalidHandle)));

        table.unregister(&a).unwrap();
        assert_eq!(table.len(), 1);
        table.unregister(&b).unwrap();
        assert_eq!(table.len(), 0);
        assert!(matches!(table.unregister(&b), Err(Error::InvalidHandle)));

        // The exporter's allocation is untouched
        exporter.lock(&source, RW, Region::new(0, 0, 1, 1)).unwrap();
        exporter.unlock(&source).unwrap();
    }

    #[test]
    fn test_imported_memory_is_shared() {
        let (mut conn, mut exporter) = setup();
        let source = exporter
            .create(conn.as_mut(), 4, 4, PixelFormat::Rgba8888, RW)
            .unwrap();
        let native = foreign(&exporter.export(&source).unwrap());

        let mut table = BufferTable::default();
        let imported = table.register(conn.as_mut(), &native).unwrap();

        let mut w = exporter.lock(&source, RW, Region::new(1, 1, 1, 1)).unwrap();
        unsafe { w.as_mut_slice()[0] = 0x5a };
        exporter.unlock(&source).unwrap();

        let mut r = table.lock(&imported, RW, Region::new(1, 1, 1, 1)).unwrap();
        assert_eq!(unsafe { r.as_mut_slice()[0] }, 0x5a);
        table.unlock(&imported).unwrap();
    }

    #[test]
    fn test_malformed_descriptor_is_invalid_handle() {
        let (mut conn, mut table) = setup();
        let handle = table
            .create(conn.as_mut(), 8, 8, PixelFormat::Rgba8888, RW)
            .unwrap();
        let native = foreign(&table.export(&handle).unwrap());

        let mutations: [fn(&mut BufferDescriptor); 6] = [
            |d: &mut BufferDescriptor| d.magic = 0,
            |d: &mut BufferDescriptor| d.width = 0,
            |d: &mut BufferDescriptor| d.format = PixelFormat::Blob.code(),
            |d: &mut BufferDescriptor| d.format = 0x7777,
            |d: &mut BufferDescriptor| d.stride = 4,
            |d: &mut BufferDescriptor| d.size *= 4,
        ];

        let mut cases = Vec::new();
        for mutate in mutations {
            let mut bad = native.try_clone().unwrap();
            mutate(&mut bad.descriptor);
            cases.push(bad);
        }

        let mut fresh = BufferTable::default();
        for bad in &cases {
            assert!(matches!(
                fresh.register(conn.as_mut(), bad),
                Err(Error::InvalidHandle)
            ));
        }
        assert_eq!(fresh.len(), 0);
    }
}
