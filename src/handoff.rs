//! Frame handoff client
//!
//! Each delivery opens its own connection to the display endpoint, sends the
//! buffer descriptor with a one-byte request and waits for a one-byte reply:
//!
//! `Idle -> Connecting -> Sending -> AwaitingAck -> {Acked, TimedOut, Failed}`
//!
//! The connection is closed on every path. Failures are counted and logged,
//! never returned to whoever posted the frame.

use crate::config::HandoffConfig;
use crate::error::{Error, Result};
use gralloc_ipc::handoff;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

/// Counters of frame handoff outcomes
#[derive(Debug, Default)]
pub struct HandoffStats {
    posted: AtomicU64,
    acked: AtomicU64,
    connect_unreachable: AtomicU64,
    send_incomplete: AtomicU64,
    timed_out: AtomicU64,
    reply_missing: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`HandoffStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandoffCounters {
    pub posted: u64,
    pub acked: u64,
    pub connect_unreachable: u64,
    pub send_incomplete: u64,
    pub timed_out: u64,
    pub reply_missing: u64,
    /// Frames discarded because the worker queue was full
    pub dropped: u64,
}

impl HandoffCounters {
    pub fn failed(&self) -> u64 {
        self.connect_unreachable + self.send_incomplete + self.timed_out + self.reply_missing
    }
}

impl HandoffStats {
    fn record(&self, result: &Result<u8>) {
        let counter = match result {
            Ok(_) => &self.acked,
            Err(Error::ConnectUnreachable(_)) => &self.connect_unreachable,
            Err(Error::SendIncomplete) => &self.send_incomplete,
            Err(Error::TimedOut) => &self.timed_out,
            Err(_) => &self.reply_missing,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HandoffCounters {
        HandoffCounters {
            posted: self.posted.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            connect_unreachable: self.connect_unreachable.load(Ordering::Relaxed),
            send_incomplete: self.send_incomplete.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            reply_missing: self.reply_missing.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Delivers frames to the display endpoint
#[derive(Debug, Clone)]
pub struct FrameHandoff {
    endpoint: PathBuf,
    timeout: Duration,
    stats: Arc<HandoffStats>,
}

impl FrameHandoff {
    pub fn new(config: &HandoffConfig) -> Self {
        Self {
            endpoint: config.endpoint(),
            timeout: config.timeout(),
            stats: Arc::new(HandoffStats::default()),
        }
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn stats(&self) -> HandoffCounters {
        self.stats.snapshot()
    }

    /// Run one exchange and report how it ended
    pub fn deliver(&self, fd: BorrowedFd<'_>) -> Result<u8> {
        debug!("handoff: connecting to {:?}", self.endpoint);
        let mut stream = handoff::connect(&self.endpoint, self.timeout)?;

        debug!("handoff: sending");
        handoff::send_frame(&stream, fd)?;

        debug!("handoff: awaiting ack ({:?})", self.timeout);
        let reply = handoff::recv_ack(&mut stream)?;

        debug!("handoff: acked ({:#04x})", reply);
        Ok(reply)
        // stream closes here and on every early return above
    }

    /// Deliver a frame, recording the outcome instead of returning it
    pub fn post(&self, fd: BorrowedFd<'_>) {
        self.stats.posted.fetch_add(1, Ordering::Relaxed);
        let result = self.deliver(fd);
        self.stats.record(&result);

        match result {
            Ok(_) => {}
            Err(e @ Error::ConnectUnreachable(_)) => warn!("Frame not delivered: {}", e),
            Err(e) => error!("Frame handoff failed: {}", e),
        }
    }
}

/// Dedicated thread running frame handoffs outside the device mutex
///
/// Frames are queued as duplicated descriptors, so the buffer itself may be
/// reused or freed as soon as `submit` returns. At most `capacity` frames
/// wait in the queue; a frame posted while it is full is dropped and counted.
pub struct HandoffWorker {
    tx: Option<mpsc::Sender<OwnedFd>>,
    stats: Arc<HandoffStats>,
    thread: Option<JoinHandle<()>>,
}

impl HandoffWorker {
    pub fn spawn(handoff: FrameHandoff, capacity: usize) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::channel::<OwnedFd>(capacity.max(1));
        let stats = Arc::clone(&handoff.stats);

        let thread = std::thread::Builder::new()
            .name("gralloc-handoff".into())
            .spawn(move || {
                while let Some(fd) = rx.blocking_recv() {
                    handoff.post(fd.as_fd());
                }
                debug!("Handoff worker exiting");
            })?;

        info!("Handoff worker started (queue depth {})", capacity.max(1));
        Ok(Self {
            tx: Some(tx),
            stats,
            thread: Some(thread),
        })
    }

    /// Queue a frame; returns immediately
    ///
    /// A full queue drops the frame, which closes its descriptor.
    pub fn submit(&self, fd: OwnedFd) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::SendIncomplete)?;
        match tx.try_send(fd) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Handoff queue full, dropping frame");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(Error::SendIncomplete),
        }
    }
}

impl Drop for HandoffWorker {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit
        drop(self.tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Handoff worker panicked");
            }
        }
    }
}
