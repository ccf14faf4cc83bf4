//! Capture device session and format negotiation.
//!
//! A [`CaptureSession`] owns the capture device exclusively and runs every
//! device operation on its own message loop, so open, configure, start and
//! stop can never race with each other or with teardown.

mod device;
mod error;
mod frame;
pub mod negotiate;
mod session;
pub mod virtual_camera;

pub use device::{
    CaptureDevice, DeviceCapabilities, DeviceInfo, DeviceParameters, DeviceProvider, FrameSink,
};
pub use error::CaptureError;
pub use frame::{CaptureTimestamp, CapturedFrame};
pub use session::{CaptureSession, SessionConfig, SessionHost, PREVIEW_SURFACE_ID};
pub use virtual_camera::{VirtualCameraConfig, VirtualCameraProvider, VirtualCameraStats};

/// Default capture device index.
pub const DEFAULT_CAMERA_ID: u32 = 0;

/// Result type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;
