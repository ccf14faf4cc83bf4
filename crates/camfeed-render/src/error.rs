//! Error types for the render module.

use camfeed_gpu::GpuError;
use camfeed_ipc::LoopError;
use thiserror::Error;

/// Errors that can occur while rendering the preview.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The display context cannot sample external images. Fatal.
    #[error("This system does not support {0}")]
    MissingExtension(&'static str),

    /// A GPU operation failed.
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    /// No display surface exists.
    #[error("No display surface")]
    NoSurface,

    /// The render thread no longer accepts requests.
    #[error("Render thread unavailable: {0}")]
    ThreadGone(#[from] LoopError),
}

impl RenderError {
    /// Returns true for conditions no retry can fix on this device.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingExtension(_))
    }
}
