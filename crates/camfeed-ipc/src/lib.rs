//! Shared types, pipeline events and message loops for camfeed.
//!
//! This crate defines the value types exchanged between the capture,
//! GPU and render execution contexts, the configuration surface, and the
//! single-consumer message loop every execution context is built on.

mod config;
mod events;
mod looper;
mod state;
mod types;

pub use config::{ConfigError, PipelineConfig};
pub use events::PipelineEvent;
pub use looper::{LoopControl, LoopError, LoopHandle, MessageLoop};
pub use state::SessionState;
pub use types::{
    CaptureRequest, DisplayRotation, Facing, FocusMode, FrameRateRange, NegotiatedFormat,
    PipelineMetrics, ScaleMode, Size,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for pipeline events (pipeline → host).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<PipelineEvent>, Receiver<PipelineEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
