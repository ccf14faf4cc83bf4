//! GPU contexts, texture lifecycle and the frame surface bridge.
//!
//! Every GPU context is owned by exactly one execution context (a
//! [`GpuManager`]); all work touching GPU objects is posted to it. Producer
//! threads only ever raise a [`PendingUpdateFlag`].

mod bridge;
mod context;
mod error;
mod flag;
pub mod headless;
mod matrix;

pub use bridge::{
    BridgeCallback, BridgeMode, BridgeStats, FrameConsumer, FrameSnapshot, FrameSurfaceBridge,
};
pub use context::{
    FrameAvailableListener, GpuContext, GpuHandle, GpuManager, ProducerSurface, TextureId,
    EXTERNAL_IMAGE_EXTENSION,
};
pub use error::GpuError;
pub use flag::PendingUpdateFlag;
pub use headless::HeadlessGpu;
pub use matrix::Mat4;

/// Result type for GPU operations.
pub type GpuResult<T> = Result<T, GpuError>;
