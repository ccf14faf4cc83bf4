//! Codecs fed by the drain thread.

use camfeed_capture::CapturedFrame;
use tracing::{debug, instrument, trace};

use crate::error::EncoderError;
use crate::{EncodedVideoPacket, EncoderResult, FrameType, VideoEncoderConfig};

/// A video codec. Owned and driven by exactly one drain thread.
pub trait VideoCodec: Send {
    /// Encode one NV12 frame.
    ///
    /// Returns `None` while the codec is buffering.
    fn encode(&mut self, frame: &CapturedFrame) -> EncoderResult<Option<EncodedVideoPacket>>;

    /// Emit any buffered packets. Called once when the encoder stops.
    fn flush(&mut self) -> EncoderResult<Vec<EncodedVideoPacket>>;

    /// Codec name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Passes NV12 frames through unchanged, tagging a keyframe every
/// keyframe interval.
pub struct RawVideoCodec {
    config: VideoEncoderConfig,
    frame_count: u64,
    keyframe_interval: u64,
}

impl RawVideoCodec {
    #[instrument(name = "raw_codec_new", skip_all)]
    pub fn new(config: VideoEncoderConfig) -> EncoderResult<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(EncoderError::InvalidInput(format!(
                "frame size {}x{} is empty",
                config.width, config.height
            )));
        }
        let keyframe_interval = u64::from(config.fps * config.keyframe_interval_secs).max(1);
        debug!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            keyframe_interval,
            "Raw video codec initialized"
        );
        Ok(Self {
            config,
            frame_count: 0,
            keyframe_interval,
        })
    }
}

impl VideoCodec for RawVideoCodec {
    fn encode(&mut self, frame: &CapturedFrame) -> EncoderResult<Option<EncodedVideoPacket>> {
        let expected_size =
            CapturedFrame::nv12_buffer_size(self.config.width, self.config.height);
        if frame.width != self.config.width
            || frame.height != self.config.height
            || frame.data.len() != expected_size
        {
            return Err(EncoderError::InvalidInput(format!(
                "Expected {} bytes ({}x{} NV12), got {} bytes ({}x{})",
                expected_size,
                self.config.width,
                self.config.height,
                frame.data.len(),
                frame.width,
                frame.height
            )));
        }

        let is_keyframe = self.frame_count % self.keyframe_interval == 0;
        let pts_100ns = frame.timestamp.timestamp_ns / 100;
        trace!(frame = self.frame_count, pts = pts_100ns, is_keyframe, "Encoding frame");
        self.frame_count += 1;

        Ok(Some(EncodedVideoPacket {
            data: frame.data.clone(),
            pts_100ns,
            dts_100ns: pts_100ns,
            is_keyframe,
            frame_type: if is_keyframe { FrameType::I } else { FrameType::P },
        }))
    }

    fn flush(&mut self) -> EncoderResult<Vec<EncodedVideoPacket>> {
        debug!(frames = self.frame_count, "Flushing raw video codec");
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "raw-nv12"
    }
}
