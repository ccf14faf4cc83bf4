//! Capture device abstraction.

use std::sync::Arc;

use camfeed_ipc::{Facing, FocusMode, FrameRateRange, Size};

use crate::frame::CapturedFrame;
use crate::CaptureResult;

/// Anything a capture device can write frames into.
///
/// `queue_frame` is called on the device's producer thread. Implementations
/// must not touch GPU state there; they record the frame and signal their
/// consumer.
pub trait FrameSink: Send + Sync {
    /// Hand over the newest frame.
    fn queue_frame(&self, frame: CapturedFrame);

    /// Size the producer should write at.
    fn set_default_buffer_size(&self, size: Size);

    /// False once the sink has been released.
    fn is_valid(&self) -> bool;
}

/// Static facts about a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub facing: Facing,
    /// Sensor mounting orientation in degrees.
    pub orientation: u32,
}

/// What a device says it supports. List order is the device's own order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub focus_modes: Vec<FocusMode>,
    pub frame_rate_ranges: Vec<FrameRateRange>,
    pub preview_sizes: Vec<Size>,
    pub picture_sizes: Vec<Size>,
}

/// Operating parameters, applied atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceParameters {
    pub focus_mode: Option<FocusMode>,
    pub frame_rate: FrameRateRange,
    pub preview_size: Size,
    pub picture_size: Size,
    pub recording_hint: bool,
}

/// An open capture device.
///
/// Only ever used from the owning session's capture thread.
pub trait CaptureDevice: Send {
    fn info(&self) -> DeviceInfo;

    fn capabilities(&self) -> CaptureResult<DeviceCapabilities>;

    /// Parameters currently in effect, which may differ from the last request.
    fn parameters(&self) -> CaptureResult<DeviceParameters>;

    fn apply_parameters(&mut self, params: &DeviceParameters) -> CaptureResult<()>;

    fn set_display_orientation(&mut self, degrees: u32) -> CaptureResult<()>;

    /// Bind the device output to a sink.
    fn set_output(&mut self, sink: Arc<dyn FrameSink>) -> CaptureResult<()>;

    fn start_streaming(&mut self) -> CaptureResult<()>;

    fn stop_streaming(&mut self);

    /// Release the hardware handle. Safe to call more than once.
    fn release(&mut self);
}

/// Opens capture devices by index.
pub trait DeviceProvider: Send + Sync {
    fn open(&self, camera_id: u32) -> CaptureResult<Box<dyn CaptureDevice>>;
}
