//! The producer-facing input of an encoder.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use camfeed_capture::{CapturedFrame, FrameSink};
use camfeed_ipc::Size;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Frames the drain thread may fall behind by before new ones are dropped.
pub const INPUT_QUEUE_CAPACITY: usize = 4;

/// A bounded frame queue in front of a codec.
///
/// Writers never block: when the queue is full the incoming frame is
/// dropped. Once closed the surface ignores every frame.
pub struct EncoderInputSurface {
    tx: Sender<CapturedFrame>,
    size: Mutex<Size>,
    closed: AtomicBool,
    queued: AtomicU64,
    dropped: AtomicU64,
}

impl EncoderInputSurface {
    pub(crate) fn new(size: Size) -> (Self, Receiver<CapturedFrame>) {
        let (tx, rx) = crossbeam_channel::bounded(INPUT_QUEUE_CAPACITY);
        let surface = Self {
            tx,
            size: Mutex::new(size),
            closed: AtomicBool::new(false),
            queued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        };
        (surface, rx)
    }

    pub fn size(&self) -> Size {
        *self.size.lock()
    }

    /// Frames accepted into the queue.
    pub fn frames_queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Frames dropped because the queue was full.
    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Encoder input surface closed");
        }
    }
}

impl FrameSink for EncoderInputSurface {
    fn queue_frame(&self, frame: CapturedFrame) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let sequence = frame.sequence;
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(sequence, dropped, "Encoder input full, dropping frame");
            }
            Err(TrySendError::Disconnected(_)) => {
                trace!(sequence, "Encoder drain gone");
                self.close();
            }
        }
    }

    fn set_default_buffer_size(&self, size: Size) {
        *self.size.lock() = size;
    }

    fn is_valid(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}
