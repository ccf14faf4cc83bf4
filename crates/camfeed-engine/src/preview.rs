//! The camera preview: owns every execution context of the pipeline and
//! wires them together.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use camfeed_capture::{
    CaptureError, CaptureResult, CaptureSession, DeviceProvider, FrameSink, SessionConfig,
    SessionHost, PREVIEW_SURFACE_ID,
};
use camfeed_encoder::EncodeSink;
use camfeed_gpu::{
    BridgeCallback, BridgeMode, FrameConsumer, FrameSurfaceBridge, GpuContext, GpuManager,
};
use camfeed_ipc::{
    DisplayRotation, NegotiatedFormat, PipelineConfig, PipelineEvent, PipelineMetrics, ScaleMode,
    SessionState, Size,
};
use camfeed_render::{DisplaySurface, RenderError, RenderHost, RenderThread, ViewportLayout};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::distributor::Distributor;
use crate::error::EngineError;
use crate::listeners::{FrameListener, FrameListeners, ListenerId};
use crate::metrics::MetricsCollector;
use crate::EngineResult;

/// Name of the pipeline's GPU thread.
pub const GPU_THREAD_NAME: &str = "camfeed-gpu";

/// Logs bridge input surface lifecycle.
struct BridgeLog;

impl BridgeCallback for BridgeLog {
    fn on_create(&self, _surface: Arc<dyn FrameSink>) {
        debug!("Bridge input surface ready");
    }

    fn on_destroy(&self) {
        debug!("Bridge input surface destroyed");
    }
}

/// A camera preview pipeline.
///
/// The host drives it with surface and lifecycle calls (`surface_created`,
/// `surface_changed`, `surface_destroyed`, `on_resume`, `on_pause`).
/// Capture starts once the display surface has a size, and the device is
/// always released before the display surface goes away.
///
/// The capture session and the renderer hold only weak references back to
/// the preview. Drop the last `Arc` to shut everything down.
pub struct CameraPreview {
    this: Weak<CameraPreview>,
    config: PipelineConfig,
    provider: Arc<dyn DeviceProvider>,
    // Field order is drop order: capture, then render, then the bridge and
    // the context it runs on.
    session: Mutex<Option<CaptureSession>>,
    render: RenderThread,
    bridge: FrameSurfaceBridge,
    gpu: GpuManager,
    distributor: Arc<Distributor>,
    listeners: FrameListeners,
    video_size: RwLock<Size>,
    // Device output size before rotation, as last negotiated.
    negotiated_size: RwLock<Option<Size>>,
    rotation: AtomicU32,
    scale_mode: RwLock<ScaleMode>,
    display_rotation: RwLock<DisplayRotation>,
    metrics: MetricsCollector,
    event_tx: Sender<PipelineEvent>,
    event_rx: Receiver<PipelineEvent>,
}

impl CameraPreview {
    /// Build the pipeline on `gpu_context`, rendering into `display`.
    ///
    /// Spawns the GPU and render threads. No device is opened until the
    /// display surface is created and sized.
    #[instrument(name = "camera_preview_new", skip_all)]
    pub fn new(
        config: PipelineConfig,
        provider: Arc<dyn DeviceProvider>,
        gpu_context: Arc<dyn GpuContext>,
        display: Box<dyn DisplaySurface>,
    ) -> EngineResult<Arc<Self>> {
        config.validate()?;

        let render_context = gpu_context.create_shared()?;
        let gpu = GpuManager::new(gpu_context, GPU_THREAD_NAME)?;
        let mode = if config.shared_gpu_context {
            BridgeMode::OwnedShared
        } else {
            BridgeMode::Attached
        };
        let bridge =
            FrameSurfaceBridge::new(&gpu, config.preview_size(), mode, Some(Arc::new(BridgeLog)))?;
        let render = RenderThread::spawn(display, render_context, config.clear_color)?;
        let (event_tx, event_rx) = camfeed_ipc::event_channel();

        let preview = Arc::new_cyclic(|this: &Weak<CameraPreview>| {
            let published = this.clone();
            let distributor = Distributor::new(Box::new(move || {
                if let Some(preview) = published.upgrade() {
                    preview.call_on_frame_available();
                }
            }));
            CameraPreview {
                this: this.clone(),
                provider,
                session: Mutex::new(None),
                render,
                bridge,
                gpu,
                distributor: Arc::new(distributor),
                listeners: FrameListeners::new(),
                video_size: RwLock::new(config.preview_size()),
                negotiated_size: RwLock::new(None),
                rotation: AtomicU32::new(0),
                scale_mode: RwLock::new(config.scale_mode),
                display_rotation: RwLock::new(DisplayRotation::default()),
                metrics: MetricsCollector::new(),
                event_tx,
                event_rx,
                config,
            }
        });

        let consumer: Arc<dyn FrameConsumer> = preview.distributor.clone();
        preview.bridge.add_consumer(consumer);
        let host: Weak<dyn RenderHost> = preview.this.clone();
        preview.render.set_host(host)?;

        info!(
            preview = %preview.config.preview_size(),
            ?mode,
            scale_mode = %preview.config.scale_mode,
            "Camera preview created"
        );
        Ok(preview)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // Host lifecycle

    /// Restart capture if the display surface exists and nothing is running.
    #[instrument(name = "preview_resume", skip(self))]
    pub fn on_resume(&self) -> EngineResult<()> {
        if !self.render.has_surface() {
            debug!("No display surface yet, capture starts when it is sized");
            return Ok(());
        }
        if self.is_capturing() {
            return Ok(());
        }
        self.start_preview()
    }

    /// Stop capture and wait for the device to be released.
    #[instrument(name = "preview_pause", skip(self))]
    pub fn on_pause(&self) -> EngineResult<()> {
        self.stop_preview()
    }

    /// The display surface exists. Blocks until the renderer has set up its
    /// texture; a missing capability is also reported as
    /// [`PipelineEvent::RenderFatal`].
    pub fn surface_created(&self) -> EngineResult<()> {
        self.render.surface_created()?;
        Ok(())
    }

    /// The display surface was resized.
    pub fn surface_changed(&self, width: u32, height: u32) -> EngineResult<()> {
        self.render.surface_changed(width, height)?;
        Ok(())
    }

    /// The display surface is going away.
    ///
    /// Capture is stopped and awaited first so the device never writes into
    /// a released surface, then the renderer releases its GPU objects.
    #[instrument(name = "preview_surface_destroyed", skip(self))]
    pub fn surface_destroyed(&self) -> EngineResult<()> {
        let stopped = self.stop_preview();
        self.render.surface_destroyed();
        // A surface-ready handled just before the destroy may have started a session.
        self.stop_preview()?;
        stopped
    }

    // Capture

    fn start_preview(&self) -> EngineResult<()> {
        let mut session = self.session.lock();
        if let Some(existing) = session.as_ref().filter(|s| s.is_running()) {
            existing.start(self.config.preview_width, self.config.preview_height)?;
            return Ok(());
        }

        let host: Weak<dyn SessionHost> = self.this.clone();
        let created = CaptureSession::spawn(
            Arc::clone(&self.provider),
            host,
            SessionConfig::from(&self.config),
        )?;
        created.start(self.config.preview_width, self.config.preview_height)?;
        *session = Some(created);
        info!(requested = %self.config.preview_size(), "Preview start requested");
        Ok(())
    }

    fn stop_preview(&self) -> EngineResult<()> {
        // Never wait on the capture thread while holding the lock.
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        session.stop(true)?;
        debug!("Preview stopped");
        Ok(())
    }

    /// True while a capture session thread is alive.
    pub fn is_capturing(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(CaptureSession::is_running)
    }

    pub fn session_state(&self) -> SessionState {
        self.session
            .lock()
            .as_ref()
            .map_or(SessionState::Idle, CaptureSession::state)
    }

    /// Tell the pipeline the display rotated. An open device gets its
    /// orientation recomputed on the capture thread, and the content size
    /// follows the new rotation.
    pub fn set_display_rotation(&self, rotation: DisplayRotation) -> EngineResult<()> {
        {
            let mut current = self.display_rotation.write();
            if *current == rotation {
                return Ok(());
            }
            *current = rotation;
        }
        debug!(degrees = rotation.degrees(), "Display rotation changed");
        if let Some(session) = self.session.lock().as_ref() {
            session.update_rotation()?;
        }
        Ok(())
    }

    /// Rotation applied to the device, in degrees.
    pub fn rotation(&self) -> u32 {
        self.rotation.load(Ordering::Acquire)
    }

    // Configuration

    /// Change the scale policy. The viewport is recomputed only when the
    /// mode actually changes.
    pub fn set_scale_mode(&self, mode: ScaleMode) -> EngineResult<()> {
        {
            let mut current = self.scale_mode.write();
            if *current == mode {
                return Ok(());
            }
            *current = mode;
        }
        info!(%mode, "Scale mode changed");
        self.render.update_viewport()?;
        self.send_event(PipelineEvent::ScaleModeChanged(mode));
        Ok(())
    }

    pub fn scale_mode(&self) -> ScaleMode {
        *self.scale_mode.read()
    }

    /// Set the content size. Width and height are swapped when the current
    /// rotation is 90 or 270 degrees.
    pub fn set_video_size(&self, width: u32, height: u32) -> EngineResult<()> {
        let mut size = Size::new(width, height);
        if self.rotation() % 180 != 0 {
            size = size.swapped();
        }
        *self.video_size.write() = size;
        debug!(%size, "Video size set");
        self.render.update_viewport()?;
        self.send_event(PipelineEvent::VideoSizeChanged(size));
        Ok(())
    }

    pub fn video_size(&self) -> Size {
        *self.video_size.read()
    }

    pub fn width(&self) -> u32 {
        self.video_size().width
    }

    pub fn height(&self) -> u32 {
        self.video_size().height
    }

    /// The renderer's current viewport and model transform.
    pub fn layout(&self) -> Option<ViewportLayout> {
        self.render.layout()
    }

    // Surfaces

    /// Render every published frame into `surface` as well.
    pub fn add_surface(&self, id: u32, surface: Arc<dyn FrameSink>, recordable: bool) {
        self.distributor.add_surface(id, surface, recordable);
    }

    pub fn remove_surface(&self, id: u32) -> bool {
        self.distributor.remove_surface(id)
    }

    /// Feed `encoder` with every published frame under `id`.
    pub fn attach_encoder(&self, id: u32, encoder: &dyn EncodeSink) -> EngineResult<()> {
        if id == PREVIEW_SURFACE_ID {
            return Err(EngineError::ReservedSurfaceId(id));
        }
        let surface = encoder.input_surface()?;
        self.add_surface(id, surface, true);
        info!(id, encoder = encoder.name(), "Encoder attached");
        Ok(())
    }

    /// Ids of the surfaces frames are currently distributed to.
    pub fn surface_ids(&self) -> Vec<u32> {
        self.distributor.surface_ids()
    }

    /// Ids of the surfaces registered as recording targets.
    pub fn recording_surface_ids(&self) -> Vec<u32> {
        self.distributor.recordable_ids()
    }

    // Frame-available observers

    pub fn add_listener(&self, listener: Arc<dyn FrameListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Notify every observer; failing observers are removed.
    pub fn call_on_frame_available(&self) {
        let removed = self.listeners.call_on_frame_available();
        if removed.is_empty() {
            return;
        }
        self.metrics.record_listener_removals(removed.len() as u64);
        for id in removed {
            self.send_event(PipelineEvent::ListenerRemoved { id });
        }
    }

    // Events and metrics

    /// Pipeline events. Every clone competes for the same events.
    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.event_rx.clone()
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.metrics
            .snapshot(self.bridge.stats(), self.render.frames_rendered())
    }

    /// Publish a metrics event and restart the rate window.
    pub fn report_metrics(&self) -> PipelineMetrics {
        let metrics = self.metrics();
        self.send_event(PipelineEvent::Metrics(metrics.clone()));
        self.metrics.mark_reported(metrics.frames_materialized);
        metrics
    }

    fn send_event(&self, event: PipelineEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }

    /// Stop capture, then release the renderer, the bridge and the GPU
    /// context. Calling it again is a no-op.
    #[instrument(name = "preview_shutdown", skip(self))]
    pub fn shutdown(&self) {
        if let Err(e) = self.stop_preview() {
            warn!(error = %e, "Capture did not stop cleanly");
        }
        self.render.surface_destroyed();
        self.render.shutdown();
        self.bridge.release();
        self.gpu.release();
        debug!("Camera preview shut down");
    }
}

impl Drop for CameraPreview {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SessionHost for CameraPreview {
    fn display_rotation(&self) -> DisplayRotation {
        *self.display_rotation.read()
    }

    fn on_state_changed(&self, previous: SessionState, current: SessionState) {
        self.send_event(PipelineEvent::SessionStateChanged { previous, current });
    }

    fn on_negotiated(&self, format: &NegotiatedFormat) {
        self.rotation
            .store(format.rotation_degrees, Ordering::Release);
        let actual = format.actual_size();
        *self.negotiated_size.write() = Some(actual);
        if let Err(e) = self.set_video_size(actual.width, actual.height) {
            warn!(error = %e, "Failed to apply negotiated video size");
        }
        if let Err(e) = self.bridge.resize(actual.width, actual.height) {
            warn!(error = %e, "Failed to resize bridge");
        }
        self.send_event(PipelineEvent::Negotiated(format.clone()));
    }

    fn on_rotation_changed(&self, degrees: u32) {
        self.rotation.store(degrees, Ordering::Release);
        let Some(negotiated) = *self.negotiated_size.read() else {
            return;
        };
        if let Err(e) = self.set_video_size(negotiated.width, negotiated.height) {
            warn!(error = %e, "Failed to apply rotated video size");
        }
    }

    fn on_preview_failed(&self, error: &CaptureError) {
        warn!(error = %error, "Preview not started");
        self.send_event(PipelineEvent::PreviewFailed {
            message: error.to_string(),
        });
    }

    fn preview_surface(&self) -> Option<Arc<dyn FrameSink>> {
        self.render.preview_surface()
    }

    fn add_surface(&self, id: u32, surface: Arc<dyn FrameSink>, recordable: bool) {
        self.distributor.add_surface(id, surface, recordable);
    }

    fn input_surface(&self) -> CaptureResult<Arc<dyn FrameSink>> {
        self.bridge
            .wait_until_ready(self.config.bridge_ready_timeout())
            .map_err(|e| CaptureError::NoInputSurface(e.to_string()))
    }
}

impl RenderHost for CameraPreview {
    fn content_size(&self) -> Size {
        self.video_size()
    }

    fn scale_mode(&self) -> ScaleMode {
        *self.scale_mode.read()
    }

    fn on_surface_ready(&self, view: Size) {
        debug!(%view, "Display surface ready, starting capture");
        if let Err(e) = self.start_preview() {
            error!(error = %e, "Failed to start preview");
        }
    }

    fn on_render_fatal(&self, error: &RenderError) {
        error!(error = %error, "Rendering cannot continue");
        self.send_event(PipelineEvent::RenderFatal {
            message: error.to_string(),
        });
    }
}
