//! Display output endpoint (`fb0`)
//!
//! A virtual output with fixed geometry. Posting a frame runs the frame
//! handoff; its outcome never reaches the caller.

use crate::buffer::BufferHandle;
use crate::config::{DisplayConfig, HandoffConfig, HandoffMode};
use crate::device::DeviceContext;
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::handoff::{FrameHandoff, HandoffCounters, HandoffWorker};
use std::sync::Arc;
use tracing::{debug, info};

/// Fixed properties of the virtual output
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayGeometry {
    pub width: u32,
    pub height: u32,
    /// Row stride in pixels
    pub stride: u32,
    pub format: PixelFormat,
    pub xdpi: f32,
    pub ydpi: f32,
    pub fps: f32,
    pub min_swap_interval: i32,
    pub max_swap_interval: i32,
    pub flags: u32,
}

impl DisplayGeometry {
    pub fn from_config(config: &DisplayConfig) -> Result<Self> {
        let format = PixelFormat::from_code(config.format)?;
        format.checked_bytes_per_pixel()?;

        if config.stride < config.width {
            return Err(Error::InvalidArgument(format!(
                "display stride {} narrower than width {}",
                config.stride, config.width
            )));
        }
        if config.min_swap_interval > config.max_swap_interval {
            return Err(Error::InvalidArgument(format!(
                "swap interval range {}..={} is empty",
                config.min_swap_interval, config.max_swap_interval
            )));
        }

        Ok(Self {
            width: config.width,
            height: config.height,
            stride: config.stride,
            format,
            xdpi: config.xdpi,
            ydpi: config.ydpi,
            fps: config.fps,
            min_swap_interval: config.min_swap_interval,
            max_swap_interval: config.max_swap_interval,
            flags: 0,
        })
    }
}

enum Delivery {
    Inline,
    Worker(HandoffWorker),
}

/// Display output endpoint bound to a device context
pub struct FramebufferDevice {
    ctx: Arc<DeviceContext>,
    geometry: DisplayGeometry,
    handoff: FrameHandoff,
    delivery: Delivery,
}

impl FramebufferDevice {
    pub fn open(
        ctx: Arc<DeviceContext>,
        display: &DisplayConfig,
        handoff: &HandoffConfig,
    ) -> Result<Self> {
        let geometry = DisplayGeometry::from_config(display)?;
        ctx.ensure_ready()?;

        let frames = FrameHandoff::new(handoff);
        let delivery = match handoff.mode {
            HandoffMode::Inline => Delivery::Inline,
            HandoffMode::Worker => Delivery::Worker(
                HandoffWorker::spawn(frames.clone(), handoff.queue_depth())
                    .map_err(|e| Error::allocation(&e))?,
            ),
        };

        info!(
            "Framebuffer {}x{} {:?} @ {} fps, frames go to {:?} ({:?})",
            geometry.width,
            geometry.height,
            geometry.format,
            geometry.fps,
            frames.endpoint(),
            handoff.mode
        );

        Ok(Self {
            ctx,
            geometry,
            handoff: frames,
            delivery,
        })
    }

    pub fn geometry(&self) -> &DisplayGeometry {
        &self.geometry
    }

    /// Hand a finished frame to the display process
    ///
    /// Fails only when `handle` is not a live buffer. Handoff failures are
    /// logged and counted in [`FramebufferDevice::stats`].
    ///
    /// Inline delivery holds the device mutex for the whole exchange, up to
    /// the reply timeout, so concurrent posts and every other buffer
    /// operation wait for it.
    pub fn post(&self, handle: &BufferHandle) -> Result<()> {
        debug!("post {:?}", handle.id());
        match &self.delivery {
            Delivery::Inline => self.ctx.with_prime_fd(handle, |fd| self.handoff.post(fd)),
            Delivery::Worker(worker) => {
                let fd = self.ctx.dup_prime_fd(handle)?;
                worker.submit(fd)
            }
        }
    }

    /// Accepted only within the geometry's swap interval bounds; has no other effect
    pub fn set_swap_interval(&self, interval: i32) -> Result<()> {
        let range = self.geometry.min_swap_interval..=self.geometry.max_swap_interval;
        if !range.contains(&interval) {
            return Err(Error::InvalidArgument(format!(
                "swap interval {} outside {}..={}",
                interval, self.geometry.min_swap_interval, self.geometry.max_swap_interval
            )));
        }
        Ok(())
    }

    pub fn stats(&self) -> HandoffCounters {
        self.handoff.stats()
    }

    /// Close the endpoint, draining any queued frames first
    ///
    /// Returns the final handoff counters.
    pub fn close(self) -> HandoffCounters {
        let Self {
            handoff, delivery, ..
        } = self;
        drop(delivery);
        handoff.stats()
    }
}
