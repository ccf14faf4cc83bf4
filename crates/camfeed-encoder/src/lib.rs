//! Encoder input surfaces and the asynchronous encode drain.
//!
//! An encoder is an [`EncodeSink`]: it hands out a producer-facing input
//! surface, reports whether it is ready, and produces encoded output on its
//! own thread. The pipeline only ever writes frames into the surface.

mod codec;
mod encoder;
mod error;
mod surface;

pub use codec::{RawVideoCodec, VideoCodec};
pub use encoder::{EncoderStats, SurfaceEncoder};
pub use error::EncoderError;
pub use surface::{EncoderInputSurface, INPUT_QUEUE_CAPACITY};

use std::sync::Arc;

use bytes::Bytes;
use camfeed_capture::FrameSink;

/// Channel capacity for encoded packets.
pub const ENCODED_CHANNEL_CAPACITY: usize = 8;

/// Result type for encoder operations.
pub type EncoderResult<T> = Result<T, EncoderError>;

/// A downstream consumer that encodes frames written into its surface.
///
/// The surface returned by `input_surface` stays alive for as long as any
/// clone of it is held, even after the encoder stops; a stopped encoder's
/// surface reports itself invalid and ignores frames.
pub trait EncodeSink: Send + Sync {
    fn name(&self) -> &str;

    /// The surface frames are written into. Fails unless the encoder is
    /// ready.
    fn input_surface(&self) -> EncoderResult<Arc<dyn FrameSink>>;

    fn is_ready(&self) -> bool;
}

/// Video encoding configuration.
#[derive(Debug, Clone)]
pub struct VideoEncoderConfig {
    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,

    /// Target frames per second.
    pub fps: u32,

    /// Keyframe interval in seconds.
    pub keyframe_interval_secs: u32,
}

impl Default for VideoEncoderConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 60,
            keyframe_interval_secs: 2,
        }
    }
}

/// An encoded video packet.
#[derive(Debug, Clone)]
pub struct EncodedVideoPacket {
    /// Encoded data.
    pub data: Bytes,

    /// Presentation timestamp in 100ns units.
    pub pts_100ns: u64,

    /// Decode timestamp in 100ns units.
    pub dts_100ns: u64,

    /// Whether this is a keyframe.
    pub is_keyframe: bool,

    /// Frame type for priority ordering.
    pub frame_type: FrameType,
}

/// Video frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameType {
    /// I-frame (keyframe) - highest priority.
    I = 0,

    /// P-frame - medium priority.
    P = 1,
}
