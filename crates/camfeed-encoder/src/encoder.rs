//! An encoder fed through an input surface and drained on its own thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camfeed_capture::{CapturedFrame, FrameSink};
use camfeed_ipc::Size;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::codec::{RawVideoCodec, VideoCodec};
use crate::error::EncoderError;
use crate::surface::EncoderInputSurface;
use crate::{
    EncodeSink, EncodedVideoPacket, EncoderResult, VideoEncoderConfig, ENCODED_CHANNEL_CAPACITY,
};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Counters kept by the drain thread.
#[derive(Debug, Default)]
pub struct EncoderStats {
    frames_encoded: AtomicU64,
    packets_dropped: AtomicU64,
    encode_errors: AtomicU64,
}

impl EncoderStats {
    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded.load(Ordering::Relaxed)
    }

    /// Packets dropped because nobody was reading the output channel.
    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }

    pub fn encode_errors(&self) -> u64 {
        self.encode_errors.load(Ordering::Relaxed)
    }
}

struct Drain {
    should_stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Pulls frames from its input surface, feeds them to a [`VideoCodec`]
/// and publishes the packets on a bounded channel.
pub struct SurfaceEncoder {
    name: String,
    input: Arc<EncoderInputSurface>,
    frames_rx: Receiver<CapturedFrame>,
    packets_tx: Sender<EncodedVideoPacket>,
    packets_rx: Receiver<EncodedVideoPacket>,
    codec: Mutex<Option<Box<dyn VideoCodec>>>,
    drain: Mutex<Option<Drain>>,
    stats: Arc<EncoderStats>,
}

impl SurfaceEncoder {
    pub fn new(name: impl Into<String>, codec: Box<dyn VideoCodec>, size: Size) -> Self {
        let (input, frames_rx) = EncoderInputSurface::new(size);
        let (packets_tx, packets_rx) = crossbeam_channel::bounded(ENCODED_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            input: Arc::new(input),
            frames_rx,
            packets_tx,
            packets_rx,
            codec: Mutex::new(Some(codec)),
            drain: Mutex::new(None),
            stats: Arc::new(EncoderStats::default()),
        }
    }

    /// An encoder passing raw NV12 frames through.
    pub fn raw(name: impl Into<String>, config: VideoEncoderConfig) -> EncoderResult<Self> {
        let size = Size::new(config.width, config.height);
        let codec = RawVideoCodec::new(config)?;
        Ok(Self::new(name, Box::new(codec), size))
    }

    /// Spawn the drain thread.
    #[instrument(name = "encoder_start", skip(self), fields(encoder = %self.name))]
    pub fn start(&self) -> EncoderResult<()> {
        let mut drain = self.drain.lock();
        if drain.is_some() {
            return Err(EncoderError::AlreadyStarted(self.name.clone()));
        }
        let Some(codec) = self.codec.lock().take() else {
            return Err(EncoderError::NotReady(self.name.clone()));
        };

        let should_stop = Arc::new(AtomicBool::new(false));
        let worker = DrainWorker {
            codec,
            frames: self.frames_rx.clone(),
            packets: self.packets_tx.clone(),
            should_stop: Arc::clone(&should_stop),
            stats: Arc::clone(&self.stats),
        };
        let thread = thread::Builder::new()
            .name(format!("camfeed-encode-{}", self.name))
            .spawn(move || worker.run())
            .map_err(|e| EncoderError::Encoding(format!("failed to spawn drain thread: {e}")))?;

        *drain = Some(Drain {
            should_stop,
            thread,
        });
        info!("Encoder started");
        Ok(())
    }

    /// Close the input, encode what is queued, flush the codec and join the
    /// drain thread. Calling it again is a no-op.
    #[instrument(name = "encoder_stop", skip(self), fields(encoder = %self.name))]
    pub fn stop(&self) {
        self.input.close();
        let Some(drain) = self.drain.lock().take() else {
            return;
        };
        drain.should_stop.store(true, Ordering::SeqCst);
        if drain.thread.join().is_err() {
            warn!("Encoder drain thread panicked");
        }
        info!(
            frames_encoded = self.stats.frames_encoded(),
            frames_dropped = self.input.frames_dropped(),
            "Encoder stopped"
        );
    }

    /// Encoded output. Every clone competes for the same packets.
    pub fn packets(&self) -> Receiver<EncodedVideoPacket> {
        self.packets_rx.clone()
    }

    /// The input surface, whether or not the encoder is running.
    pub fn input(&self) -> Arc<EncoderInputSurface> {
        Arc::clone(&self.input)
    }

    pub fn stats(&self) -> Arc<EncoderStats> {
        Arc::clone(&self.stats)
    }
}

impl EncodeSink for SurfaceEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_surface(&self) -> EncoderResult<Arc<dyn FrameSink>> {
        if !self.is_ready() {
            return Err(EncoderError::NotReady(self.name.clone()));
        }
        let input: Arc<dyn FrameSink> = self.input();
        Ok(input)
    }

    fn is_ready(&self) -> bool {
        self.drain.lock().is_some() && self.input.is_valid()
    }
}

impl Drop for SurfaceEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

struct DrainWorker {
    codec: Box<dyn VideoCodec>,
    frames: Receiver<CapturedFrame>,
    packets: Sender<EncodedVideoPacket>,
    should_stop: Arc<AtomicBool>,
    stats: Arc<EncoderStats>,
}

impl DrainWorker {
    fn run(mut self) {
        debug!(codec = self.codec.name(), "Encoder drain started");
        while !self.should_stop.load(Ordering::SeqCst) {
            match self.frames.recv_timeout(DRAIN_POLL_INTERVAL) {
                Ok(frame) => self.encode(&frame),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // The input is closed by now; encode whatever made it into the queue.
        while let Ok(frame) = self.frames.try_recv() {
            self.encode(&frame);
        }
        match self.codec.flush() {
            Ok(packets) => {
                for packet in packets {
                    self.forward(packet);
                }
            }
            Err(e) => warn!(error = %e, "Codec flush failed"),
        }
        debug!("Encoder drain finished");
    }

    fn encode(&mut self, frame: &CapturedFrame) {
        match self.codec.encode(frame) {
            Ok(Some(packet)) => {
                self.stats.frames_encoded.fetch_add(1, Ordering::Relaxed);
                self.forward(packet);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(sequence = frame.sequence, error = %e, "Encode error");
                self.stats.encode_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn forward(&self, packet: EncodedVideoPacket) {
        match self.packets.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Encoded packet channel full, dropping packet");
            }
            Err(TrySendError::Disconnected(_)) => {
                trace!("{}", EncoderError::ChannelDisconnected);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::INPUT_QUEUE_CAPACITY;
    use crate::FrameType;
    use camfeed_capture::CaptureTimestamp;
    use std::time::Instant;

    fn config() -> VideoEncoderConfig {
        VideoEncoderConfig {
            width: 8,
            height: 4,
            fps: 30,
            keyframe_interval_secs: 1,
        }
    }

    fn frame(size: Size, sequence: u64) -> CapturedFrame {
        CapturedFrame::test_pattern(size, CaptureTimestamp::now(Instant::now()), sequence)
    }

    #[test]
    fn test_lifecycle() {
        let encoder = SurfaceEncoder::raw("test", config()).unwrap();
        assert!(!encoder.is_ready());
        assert!(matches!(
            encoder.input_surface(),
            Err(EncoderError::NotReady(_))
        ));

        encoder.start().unwrap();
        assert!(encoder.is_ready());
        assert!(matches!(
            encoder.start(),
            Err(EncoderError::AlreadyStarted(_))
        ));

        let surface = encoder.input_surface().unwrap();
        let packets = encoder.packets();
        for sequence in 0..3 {
            surface.queue_frame(frame(Size::new(8, 4), sequence));
            let packet = packets.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(packet.data.len(), CapturedFrame::nv12_buffer_size(8, 4));
            assert_eq!(packet.is_keyframe, sequence == 0);
        }

        encoder.stop();
        encoder.stop();
        assert!(!encoder.is_ready());
        assert!(!surface.is_valid());
        surface.queue_frame(frame(Size::new(8, 4), 3));
        assert_eq!(encoder.input().frames_queued(), 3);
        assert_eq!(encoder.stats().frames_encoded(), 3);
        assert!(matches!(encoder.start(), Err(EncoderError::NotReady(_))));
    }

    #[test]
    fn test_full_input_drops_newest_frames() {
        let encoder = SurfaceEncoder::raw("full", config()).unwrap();
        let input = encoder.input();
        for sequence in 0..(INPUT_QUEUE_CAPACITY as u64 + 2) {
            input.queue_frame(frame(Size::new(8, 4), sequence));
        }
        assert_eq!(input.frames_queued(), INPUT_QUEUE_CAPACITY as u64);
        assert_eq!(input.frames_dropped(), 2);

        encoder.start().unwrap();
        let packets = encoder.packets();
        let types: Vec<FrameType> = (0..INPUT_QUEUE_CAPACITY)
            .map(|_| packets.recv_timeout(Duration::from_secs(2)).unwrap().frame_type)
            .collect();
        assert_eq!(types[0], FrameType::I);
        assert!(types[1..].iter().all(|t| *t == FrameType::P));
    }

    #[test]
    fn test_encode_errors_are_counted() {
        let encoder = SurfaceEncoder::raw("errors", config()).unwrap();
        encoder.start().unwrap();
        encoder
            .input_surface()
            .unwrap()
            .queue_frame(frame(Size::new(4, 4), 0));
        encoder.stop();
        assert_eq!(encoder.stats().encode_errors(), 1);
        assert_eq!(encoder.stats().frames_encoded(), 0);
        assert!(encoder.packets().try_recv().is_err());
    }
}
