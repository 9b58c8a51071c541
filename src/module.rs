//! Module entry points
//!
//! One [`GrallocModule`] per process owns the device context; both endpoints
//! opened through it share that context and therefore its mutex.

use crate::alloc_device::AllocDevice;
use crate::allocator::{AllocatorOpener, MemfdAllocator};
use crate::buffer::{BufferHandle, CpuMapping, Region};
use crate::config::Config;
use crate::device::DeviceContext;
use crate::error::{Error, Result};
use crate::format::BufferUsage;
use crate::framebuffer::FramebufferDevice;
use gralloc_ipc::NativeHandle;
use std::os::fd::RawFd;
use std::sync::Arc;
use tracing::{debug, info};

/// Device name of the allocation endpoint
pub const GPU0: &str = "gpu0";
/// Device name of the display output endpoint
pub const FB0: &str = "fb0";

/// Static module description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub author: &'static str,
    pub version_major: u16,
    pub version_minor: u16,
}

pub const MODULE_INFO: ModuleInfo = ModuleInfo {
    id: "gralloc",
    name: "GBM Memory Allocator",
    author: "gralloc-gbm contributors",
    version_major: 1,
    version_minor: 0,
};

/// An opened endpoint
pub enum Device {
    Alloc(AllocDevice),
    Framebuffer(FramebufferDevice),
}

/// Capability queries understood by [`GrallocModule::perform`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    /// Descriptor of the allocator connection
    DeviceFd,
    /// Usage bits the allocator can honor
    Usage,
}

/// Answers to [`Query`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    DeviceFd(RawFd),
}

pub struct GrallocModule {
    ctx: Arc<DeviceContext>,
    config: Config,
}

impl GrallocModule {
    /// Module backed by the memfd allocator
    pub fn new(config: Config) -> Self {
        let opener = MemfdAllocator::new(&config.allocator);
        Self::with_allocator(config, opener)
    }

    pub fn with_allocator(config: Config, opener: impl AllocatorOpener + 'static) -> Self {
        info!("{} v{}.{} loaded", MODULE_INFO.name, MODULE_INFO.version_major, MODULE_INFO.version_minor);
        Self {
            ctx: DeviceContext::new(opener),
            config,
        }
    }

    pub fn info(&self) -> &'static ModuleInfo {
        &MODULE_INFO
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Open an endpoint by name
    pub fn open_device(&self, name: &str) -> Result<Device> {
        debug!("open_device {:?}", name);
        match name {
            GPU0 => AllocDevice::open(Arc::clone(&self.ctx)).map(Device::Alloc),
            FB0 => FramebufferDevice::open(
                Arc::clone(&self.ctx),
                &self.config.display,
                &self.config.handoff,
            )
            .map(Device::Framebuffer),
            other => Err(Error::UnknownDevice(other.to_string())),
        }
    }

    pub fn open_alloc(&self) -> Result<AllocDevice> {
        match self.open_device(GPU0)? {
            Device::Alloc(dev) => Ok(dev),
            Device::Framebuffer(_) => Err(Error::UnknownDevice(GPU0.to_string())),
        }
    }

    pub fn open_framebuffer(&self) -> Result<FramebufferDevice> {
        match self.open_device(FB0)? {
            Device::Framebuffer(dev) => Ok(dev),
            Device::Alloc(_) => Err(Error::UnknownDevice(FB0.to_string())),
        }
    }

    /// Import a handle received from another process (or this one)
    pub fn register_buffer(&self, native: &NativeHandle) -> Result<BufferHandle> {
        self.ctx.register(native)
    }

    pub fn unregister_buffer(&self, handle: &BufferHandle) -> Result<()> {
        self.ctx.unregister(handle)
    }

    pub fn lock(&self, handle: &BufferHandle, usage: BufferUsage, region: Region) -> Result<CpuMapping> {
        self.ctx.lock(handle, usage, region)
    }

    pub fn unlock(&self, handle: &BufferHandle) -> Result<()> {
        self.ctx.unlock(handle)
    }

    /// Transmissible form of a handle, for sending to another process
    pub fn export_buffer(&self, handle: &BufferHandle) -> Result<NativeHandle> {
        self.ctx.export(handle)
    }

    pub fn perform(&self, query: Query) -> Result<Reply> {
        match query {
            Query::DeviceFd => self.ctx.fd().map(Reply::DeviceFd),
            Query::Usage => Err(Error::Unimplemented("usage query")),
        }
    }
}
