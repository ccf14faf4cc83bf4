//! Captured frame types.

use bytes::Bytes;
use std::time::Instant;

use camfeed_ipc::Size;

/// Timestamp for a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTimestamp {
    /// Monotonic timestamp when the frame was captured.
    pub capture_time: Instant,

    /// Nanoseconds since the device started streaming.
    pub timestamp_ns: u64,
}

impl CaptureTimestamp {
    /// Create a timestamp relative to `start_time`.
    pub fn now(start_time: Instant) -> Self {
        let capture_time = Instant::now();
        let timestamp_ns = capture_time.duration_since(start_time).as_nanos() as u64;

        Self {
            capture_time,
            timestamp_ns,
        }
    }
}

/// A frame written by a capture device into a sink.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// NV12 pixel data.
    pub data: Bytes,

    /// Frame width in pixels.
    pub width: u32,

    /// Frame height in pixels.
    pub height: u32,

    /// Capture timestamp.
    pub timestamp: CaptureTimestamp,

    /// Monotonically increasing sequence number.
    pub sequence: u64,
}

impl CapturedFrame {
    /// Create a new captured frame.
    pub fn new(
        data: Bytes,
        width: u32,
        height: u32,
        timestamp: CaptureTimestamp,
        sequence: u64,
    ) -> Self {
        Self {
            data,
            width,
            height,
            timestamp,
            sequence,
        }
    }

    /// A flat NV12 frame whose luma encodes the sequence number and whose
    /// chroma plane is neutral gray.
    pub fn test_pattern(size: Size, timestamp: CaptureTimestamp, sequence: u64) -> Self {
        let y_size = (size.width * size.height) as usize;
        let mut data = vec![128u8; Self::nv12_buffer_size(size.width, size.height)];
        data[..y_size].fill((sequence % 256) as u8);
        Self::new(Bytes::from(data), size.width, size.height, timestamp, sequence)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Calculate expected NV12 buffer size for given dimensions.
    pub fn nv12_buffer_size(width: u32, height: u32) -> usize {
        // Y plane (width * height) + interleaved UV plane (width * height / 2)
        let y_size = (width * height) as usize;
        y_size + y_size / 2
    }

    /// Validate that the frame data matches expected dimensions.
    pub fn is_valid(&self) -> bool {
        self.data.len() == Self::nv12_buffer_size(self.width, self.height)
    }
}
