//! Error types for the engine module.

use camfeed_capture::CaptureError;
use camfeed_encoder::EncoderError;
use camfeed_gpu::GpuError;
use camfeed_ipc::ConfigError;
use camfeed_render::RenderError;
use thiserror::Error;

/// Errors raised by the preview pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    /// The id is reserved for the display preview.
    #[error("Surface id {0} is reserved")]
    ReservedSurfaceId(u32),
}
