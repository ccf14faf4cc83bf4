//! Error types for the GPU module.

use camfeed_ipc::LoopError;
use thiserror::Error;

/// Errors that can occur during GPU operations.
#[derive(Debug, Error)]
pub enum GpuError {
    /// Operation called before initialization or after release.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A required extension is not advertised by the context.
    #[error("Required extension {0} is not supported")]
    MissingExtension(&'static str),

    /// The context has been released or lost.
    #[error("GPU context lost: {0}")]
    ContextLost(String),

    /// The producer surface has been released.
    #[error("Producer surface released")]
    SurfaceReleased,

    /// The GPU execution context no longer accepts work.
    #[error("GPU executor unavailable: {0}")]
    Executor(#[from] LoopError),
}
