//! Events sent from the pipeline to its host.

use serde::{Deserialize, Serialize};

use crate::state::SessionState;
use crate::types::{NegotiatedFormat, PipelineMetrics, ScaleMode, Size};

/// Events that the pipeline can send to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// Capture session state has changed.
    SessionStateChanged {
        previous: SessionState,
        current: SessionState,
    },

    /// The device accepted a format.
    Negotiated(NegotiatedFormat),

    /// Opening or configuring the device failed; preview is not running.
    PreviewFailed { message: String },

    /// Content size changed (already rotation adjusted).
    VideoSizeChanged(Size),

    /// Scale policy changed.
    ScaleModeChanged(ScaleMode),

    /// A frame-available observer was dropped after failing.
    ListenerRemoved { id: u64 },

    /// The display surface cannot be used on this device.
    RenderFatal { message: String },

    /// Periodic counters.
    Metrics(PipelineMetrics),
}
