//! Error types for the capture module.

use std::time::Duration;

use camfeed_ipc::LoopError;
use thiserror::Error;

/// Errors that can occur during capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// I/O failure while talking to the device.
    #[error("Capture device I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The platform rejected an operation at runtime.
    #[error("Capture device error: {0}")]
    Device(String),

    /// The device advertises no size of the given kind.
    #[error("No supported {0} size")]
    NoSupportedSize(&'static str),

    /// The device advertises no frame rate range.
    #[error("No supported frame rate range")]
    NoFrameRateRange,

    /// A device is already open in this session.
    #[error("Capture device already open")]
    AlreadyOpen,

    /// No device is open.
    #[error("Capture device not open")]
    NotOpen,

    /// The pipeline has no input surface to bind the device output to.
    #[error("No input surface available: {0}")]
    NoInputSurface(String),

    /// The session's owner has been dropped.
    #[error("Session host is gone")]
    HostGone,

    /// The capture context did not confirm termination in time.
    #[error("Capture context did not stop within {0:?}")]
    StopTimeout(Duration),

    /// The capture context no longer accepts messages.
    #[error("Capture context unavailable: {0}")]
    Loop(#[from] LoopError),
}

impl CaptureError {
    /// Returns true for failures raised by the device itself.
    pub fn is_device_failure(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Device(_))
    }
}
