//! Camera preview lifecycle.
//!
//! [`CameraPreview`] owns the capture session, the frame surface bridge,
//! the render thread and the GPU context, and wires them together: the
//! bridge's published frames are distributed to the display and any
//! encoders, observers are notified after every frame, and capture is
//! started and stopped around the display surface's lifetime.

mod distributor;
mod error;
mod listeners;
mod metrics;
mod preview;

pub use distributor::{Distributor, PublishHook};
pub use error::EngineError;
pub use listeners::{FrameListener, FrameListeners, ListenerId, ListenerResult};
pub use metrics::MetricsCollector;
pub use preview::{CameraPreview, GPU_THREAD_NAME};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
