//! A software capture device.
//!
//! Produces NV12 test-pattern frames on its own producer thread at the
//! negotiated frame rate. Used for headless runs and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camfeed_ipc::{Facing, FocusMode, FrameRateRange, Size};
use tracing::{debug, info, instrument, trace};

use crate::device::{
    CaptureDevice, DeviceCapabilities, DeviceInfo, DeviceParameters, DeviceProvider, FrameSink,
};
use crate::error::CaptureError;
use crate::frame::{CaptureTimestamp, CapturedFrame};
use crate::CaptureResult;

/// What the virtual device reports and how it misbehaves.
#[derive(Debug, Clone)]
pub struct VirtualCameraConfig {
    pub facing: Facing,
    pub orientation: u32,
    pub focus_modes: Vec<FocusMode>,
    pub frame_rate_ranges: Vec<FrameRateRange>,
    pub preview_sizes: Vec<Size>,
    pub picture_sizes: Vec<Size>,
    /// Fail `open` with a device error.
    pub fail_open: bool,
    /// Fail `apply_parameters` with a device error.
    pub fail_apply: bool,
    /// Report and produce this preview size whatever was applied.
    pub forced_preview_size: Option<Size>,
    /// Override the interval derived from the applied frame rate.
    pub frame_interval: Option<Duration>,
}

impl Default for VirtualCameraConfig {
    fn default() -> Self {
        Self {
            facing: Facing::Back,
            orientation: 90,
            focus_modes: vec![FocusMode::Auto, FocusMode::ContinuousVideo, FocusMode::Fixed],
            frame_rate_ranges: vec![
                FrameRateRange::new(15_000, 15_000),
                FrameRateRange::new(15_000, 30_000),
                FrameRateRange::new(30_000, 30_000),
            ],
            preview_sizes: vec![
                Size::new(320, 240),
                Size::new(640, 480),
                Size::new(1280, 720),
                Size::new(1920, 1080),
            ],
            picture_sizes: vec![Size::new(1280, 960), Size::new(1920, 1080), Size::new(4032, 3024)],
            fail_open: false,
            fail_apply: false,
            forced_preview_size: None,
            frame_interval: None,
        }
    }
}

/// Counters shared by every device a provider opens.
#[derive(Debug, Default)]
pub struct VirtualCameraStats {
    pub opened: AtomicU64,
    pub released: AtomicU64,
    pub frames_produced: AtomicU64,
}

impl VirtualCameraStats {
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames_produced.load(Ordering::Relaxed)
    }

    /// Devices opened and not yet released.
    pub fn open_devices(&self) -> u64 {
        self.opened().saturating_sub(self.released())
    }
}

/// Opens [`VirtualCamera`] devices.
pub struct VirtualCameraProvider {
    config: VirtualCameraConfig,
    stats: Arc<VirtualCameraStats>,
}

impl VirtualCameraProvider {
    pub fn new(config: VirtualCameraConfig) -> Self {
        Self {
            config,
            stats: Arc::new(VirtualCameraStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<VirtualCameraStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for VirtualCameraProvider {
    fn default() -> Self {
        Self::new(VirtualCameraConfig::default())
    }
}

impl DeviceProvider for VirtualCameraProvider {
    #[instrument(name = "virtual_camera_open", skip(self))]
    fn open(&self, camera_id: u32) -> CaptureResult<Box<dyn CaptureDevice>> {
        if self.config.fail_open {
            return Err(CaptureError::Device(format!(
                "virtual camera {camera_id} failed to open"
            )));
        }
        self.stats.opened.fetch_add(1, Ordering::Relaxed);
        info!("Opened virtual camera");
        Ok(Box::new(VirtualCamera::new(
            self.config.clone(),
            Arc::clone(&self.stats),
        )))
    }
}

/// A running producer thread.
struct Producer {
    should_stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// A virtual capture device.
pub struct VirtualCamera {
    config: VirtualCameraConfig,
    stats: Arc<VirtualCameraStats>,
    params: DeviceParameters,
    orientation_degrees: u32,
    output: Option<Arc<dyn FrameSink>>,
    producer: Option<Producer>,
    released: bool,
}

impl VirtualCamera {
    fn new(config: VirtualCameraConfig, stats: Arc<VirtualCameraStats>) -> Self {
        let preview_size = config
            .preview_sizes
            .first()
            .copied()
            .unwrap_or(Size::new(640, 480));
        let picture_size = config.picture_sizes.first().copied().unwrap_or(preview_size);
        let frame_rate = config
            .frame_rate_ranges
            .first()
            .copied()
            .unwrap_or(FrameRateRange::exact(30_000));
        Self {
            params: DeviceParameters {
                focus_mode: None,
                frame_rate,
                preview_size,
                picture_size,
                recording_hint: false,
            },
            config,
            stats,
            orientation_degrees: 0,
            output: None,
            producer: None,
            released: false,
        }
    }

    fn ensure_open(&self) -> CaptureResult<()> {
        if self.released {
            return Err(CaptureError::NotOpen);
        }
        Ok(())
    }

    fn frame_interval(&self) -> Duration {
        self.config.frame_interval.unwrap_or_else(|| {
            let fps_milli = self.params.frame_rate.max.max(1);
            Duration::from_micros(1_000_000_000 / u64::from(fps_milli))
        })
    }

    fn produced_size(&self) -> Size {
        self.config
            .forced_preview_size
            .unwrap_or(self.params.preview_size)
    }

    /// Display orientation most recently applied.
    pub fn display_orientation(&self) -> u32 {
        self.orientation_degrees
    }
}

impl CaptureDevice for VirtualCamera {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            facing: self.config.facing,
            orientation: self.config.orientation,
        }
    }

    fn capabilities(&self) -> CaptureResult<DeviceCapabilities> {
        self.ensure_open()?;
        Ok(DeviceCapabilities {
            focus_modes: self.config.focus_modes.clone(),
            frame_rate_ranges: self.config.frame_rate_ranges.clone(),
            preview_sizes: self.config.preview_sizes.clone(),
            picture_sizes: self.config.picture_sizes.clone(),
        })
    }

    fn parameters(&self) -> CaptureResult<DeviceParameters> {
        self.ensure_open()?;
        Ok(DeviceParameters {
            preview_size: self.produced_size(),
            ..self.params
        })
    }

    fn apply_parameters(&mut self, params: &DeviceParameters) -> CaptureResult<()> {
        self.ensure_open()?;
        if self.config.fail_apply {
            return Err(CaptureError::Device("parameters rejected".into()));
        }
        debug!(preview = %params.preview_size, "Applying virtual camera parameters");
        self.params = *params;
        Ok(())
    }

    fn set_display_orientation(&mut self, degrees: u32) -> CaptureResult<()> {
        self.ensure_open()?;
        self.orientation_degrees = degrees;
        Ok(())
    }

    fn set_output(&mut self, sink: Arc<dyn FrameSink>) -> CaptureResult<()> {
        self.ensure_open()?;
        self.output = Some(sink);
        Ok(())
    }

    #[instrument(name = "virtual_camera_start", skip(self))]
    fn start_streaming(&mut self) -> CaptureResult<()> {
        self.ensure_open()?;
        if self.producer.is_some() {
            return Ok(());
        }
        let sink = self
            .output
            .clone()
            .ok_or_else(|| CaptureError::NoInputSurface("no output bound".into()))?;

        let should_stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&should_stop);
        let stats = Arc::clone(&self.stats);
        let size = self.produced_size();
        let interval = self.frame_interval();

        let thread = thread::Builder::new()
            .name("virtual-camera".into())
            .spawn(move || produce_frames(sink, size, interval, thread_stop, stats))?;

        info!(%size, ?interval, "Virtual camera streaming");
        self.producer = Some(Producer {
            should_stop,
            thread,
        });
        Ok(())
    }

    fn stop_streaming(&mut self) {
        let Some(producer) = self.producer.take() else {
            return;
        };
        producer.should_stop.store(true, Ordering::SeqCst);
        if producer.thread.join().is_err() {
            debug!("Virtual camera producer panicked");
        }
        debug!("Virtual camera stopped streaming");
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.stop_streaming();
        self.output = None;
        self.released = true;
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        info!("Virtual camera released");
    }
}

impl Drop for VirtualCamera {
    fn drop(&mut self) {
        self.release();
    }
}

fn produce_frames(
    sink: Arc<dyn FrameSink>,
    size: Size,
    interval: Duration,
    should_stop: Arc<AtomicBool>,
    stats: Arc<VirtualCameraStats>,
) {
    let start_time = Instant::now();
    let mut next_frame = start_time;
    let mut sequence = 0u64;

    while !should_stop.load(Ordering::SeqCst) {
        if !sink.is_valid() {
            debug!("Output surface released, stopping producer");
            break;
        }

        let timestamp = CaptureTimestamp::now(start_time);
        sink.queue_frame(CapturedFrame::test_pattern(size, timestamp, sequence));
        stats.frames_produced.fetch_add(1, Ordering::Relaxed);
        trace!(sequence, "Produced frame");
        sequence += 1;

        next_frame += interval;
        let now = Instant::now();
        if next_frame > now {
            thread::sleep(next_frame - now);
        } else {
            next_frame = now;
        }
    }
}
