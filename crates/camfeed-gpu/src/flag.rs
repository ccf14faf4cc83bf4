//! Single-slot update flag shared between a producer and its consumer.

use std::sync::atomic::{AtomicBool, Ordering};

/// A latest-wins "new frame ready" indicator.
///
/// Not a queue: any number of raises between two takes collapse into one
/// pending update, and the consumer then pulls whatever frame is newest.
/// Frames arriving faster than the consumer drains are dropped.
#[derive(Debug, Default)]
pub struct PendingUpdateFlag(AtomicBool);

impl PendingUpdateFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Mark an update pending. Returns true if it was not already pending,
    /// in which case the caller owns scheduling the consumer.
    pub fn raise(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    /// Clear the flag, returning whether an update was pending.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
