//! gralloc-gbm
//!
//! Graphics buffer manager for a display pipeline: allocates shared-memory
//! buffers, exposes them as handles that can cross process boundaries,
//! arbitrates CPU access to their pixels, and hands finished frames to an
//! external display process over a Unix socket.
//!
//! Everything hangs off one [`DeviceContext`]; a [`GrallocModule`] owns it and
//! opens the `gpu0` allocation endpoint and the `fb0` display endpoint.

pub mod alloc_device;
pub mod allocator;
pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod framebuffer;
pub mod handoff;
pub mod logging;
pub mod module;

pub use alloc_device::{AllocDevice, OwnedBuffer};
pub use buffer::{BufferHandle, BufferId, BufferInfo, CpuMapping, Region};
pub use config::{Config, HandoffMode};
pub use device::DeviceContext;
pub use error::{Error, Result};
pub use format::{BufferUsage, PixelFormat};
pub use framebuffer::{DisplayGeometry, FramebufferDevice};
pub use handoff::HandoffCounters;
pub use module::{Device, GrallocModule, MODULE_INFO, Query, Reply};

pub use gralloc_ipc::NativeHandle;
