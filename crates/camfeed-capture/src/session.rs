//! Capture session management.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use camfeed_ipc::{
    CaptureRequest, DisplayRotation, LoopControl, LoopError, MessageLoop, NegotiatedFormat,
    PipelineConfig, SessionState, Size,
};
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::device::{CaptureDevice, DeviceProvider, FrameSink};
use crate::error::CaptureError;
use crate::negotiate;
use crate::CaptureResult;

/// Surface id under which the display-side preview surface is registered.
pub const PREVIEW_SURFACE_ID: u32 = 1;

/// The owner of a capture session.
///
/// Called from the capture thread. The session holds only a weak reference,
/// so every call is skipped once the owner is gone.
pub trait SessionHost: Send + Sync {
    /// Current rotation of the display the preview is shown on.
    fn display_rotation(&self) -> DisplayRotation;

    fn on_state_changed(&self, previous: SessionState, current: SessionState);

    /// The device accepted a format. Implementations hand this to their UI context.
    fn on_negotiated(&self, format: &NegotiatedFormat);

    /// Display orientation was recomputed for an open device.
    fn on_rotation_changed(&self, degrees: u32);

    /// Opening or configuring the device failed; preview is not running.
    fn on_preview_failed(&self, error: &CaptureError);

    /// The display-side surface, if the display currently exists.
    fn preview_surface(&self) -> Option<Arc<dyn FrameSink>>;

    /// Register a surface to receive every published frame.
    fn add_surface(&self, id: u32, surface: Arc<dyn FrameSink>, recordable: bool);

    /// The pipeline's own input surface the device writes into.
    fn input_surface(&self) -> CaptureResult<Arc<dyn FrameSink>>;
}

/// Capture session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub camera_id: u32,
    /// Frame rate target in frames per 1000 seconds.
    pub target_fps_milli: u32,
    pub stop_retry: Duration,
    pub stop_deadline: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for SessionConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            camera_id: config.camera_id,
            target_fps_milli: config.target_fps_milli,
            stop_retry: config.stop_retry(),
            stop_deadline: config.stop_deadline(),
        }
    }
}

enum SessionMessage {
    StartPreview { width: u32, height: u32 },
    UpdateRotation,
    StopPreview,
}

/// Owns the capture device on a dedicated thread.
///
/// A session is single use: `stop` terminates its thread, and a new session
/// is spawned for the next preview.
pub struct CaptureSession {
    looper: MessageLoop<SessionMessage>,
    state: Arc<RwLock<SessionState>>,
    config: SessionConfig,
    // Set once a stop has waited out its deadline; later stops do not wait again.
    wait_abandoned: AtomicBool,
}

impl CaptureSession {
    /// Spawn the capture thread. No device is opened until `start`.
    #[instrument(name = "capture_session_spawn", skip_all, fields(camera_id = config.camera_id))]
    pub fn spawn(
        provider: Arc<dyn DeviceProvider>,
        host: Weak<dyn SessionHost>,
        config: SessionConfig,
    ) -> CaptureResult<Self> {
        let state = Arc::new(RwLock::new(SessionState::Idle));
        let mut worker = SessionWorker {
            provider,
            host,
            config,
            device: None,
            state: Arc::clone(&state),
        };

        let looper = MessageLoop::spawn("capture", move |msg| worker.handle(msg))?;
        debug!("Capture session spawned");

        Ok(Self {
            looper,
            state,
            config,
            wait_abandoned: AtomicBool::new(false),
        })
    }

    /// Request the device be opened and negotiated against `width`x`height`.
    ///
    /// Returns once the request is queued. Ignored if a device is already open.
    pub fn start(&self, width: u32, height: u32) -> CaptureResult<()> {
        debug!(width, height, "Queueing start preview");
        self.looper
            .send(SessionMessage::StartPreview { width, height })?;
        Ok(())
    }

    /// Recompute the device display orientation from the current display rotation.
    pub fn update_rotation(&self) -> CaptureResult<()> {
        self.looper.send(SessionMessage::UpdateRotation)?;
        Ok(())
    }

    /// Release the device and terminate the capture thread.
    ///
    /// With `wait_for_completion` the caller blocks until the thread confirms
    /// termination, so the device is no longer writing into any surface when
    /// this returns. Calling it again is a no-op.
    ///
    /// On the capture thread itself the stop is only queued: it runs once the
    /// current message has been handled. Once a wait has timed out, later
    /// calls report the timeout without waiting again.
    #[instrument(name = "capture_session_stop", skip(self))]
    pub fn stop(&self, wait_for_completion: bool) -> CaptureResult<()> {
        match self.looper.send(SessionMessage::StopPreview) {
            Ok(()) => {}
            Err(LoopError::Terminated(_)) => {
                debug!("Capture context already terminated");
            }
            Err(e) => return Err(e.into()),
        }

        if self.looper.is_loop_thread() {
            debug!("Stop requested from the capture thread, not waiting");
            return Ok(());
        }

        if !wait_for_completion {
            return Ok(());
        }

        let stopped = if self.wait_abandoned.load(Ordering::Acquire) {
            !self.looper.is_running()
        } else {
            debug!("Waiting for capture context to terminate");
            let stopped = self
                .looper
                .wait_for_termination(self.config.stop_retry, self.config.stop_deadline);
            if !stopped {
                warn!(deadline = ?self.config.stop_deadline, "Capture context did not stop in time");
                self.wait_abandoned.store(true, Ordering::Release);
            }
            stopped
        };
        if !stopped {
            return Err(CaptureError::StopTimeout(self.config.stop_deadline));
        }
        self.looper.join();
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// True until the capture thread has exited.
    pub fn is_running(&self) -> bool {
        self.looper.is_running()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        let _ = self.stop(true);
    }
}

/// State owned by the capture thread.
struct SessionWorker {
    provider: Arc<dyn DeviceProvider>,
    host: Weak<dyn SessionHost>,
    config: SessionConfig,
    device: Option<Box<dyn CaptureDevice>>,
    state: Arc<RwLock<SessionState>>,
}

impl SessionWorker {
    fn handle(&mut self, msg: SessionMessage) -> LoopControl {
        match msg {
            SessionMessage::StartPreview { width, height } => {
                self.handle_start_preview(Size::new(width, height));
                LoopControl::Continue
            }
            SessionMessage::UpdateRotation => {
                self.handle_update_rotation();
                LoopControl::Continue
            }
            SessionMessage::StopPreview => {
                self.handle_stop_preview();
                LoopControl::Quit
            }
        }
    }

    fn transition(&self, next: SessionState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if !previous.can_transition_to(next) {
            warn!(previous = previous.name(), current = next.name(), "Unexpected session transition");
        }
        info!(previous = previous.name(), current = next.name(), "Session state transition");
        if let Some(host) = self.host.upgrade() {
            host.on_state_changed(previous, next);
        }
    }

    fn handle_start_preview(&mut self, requested: Size) {
        let Some(host) = self.host.upgrade() else {
            debug!(error = %CaptureError::HostGone, "Ignoring start request");
            return;
        };
        if self.device.is_some() {
            error!(error = %CaptureError::AlreadyOpen, "Ignoring start request");
            return;
        }

        self.transition(SessionState::Opening);
        match self.open_and_configure(host.as_ref(), requested) {
            Ok(device) => {
                self.device = Some(device);
                self.transition(SessionState::Previewing);
            }
            Err(e) => {
                error!(error = %e, "Failed to start preview");
                self.transition(SessionState::Idle);
                host.on_preview_failed(&e);
            }
        }
    }

    /// Open the device; release it again if anything after the open fails.
    fn open_and_configure(
        &self,
        host: &dyn SessionHost,
        requested: Size,
    ) -> CaptureResult<Box<dyn CaptureDevice>> {
        let mut device = self.provider.open(self.config.camera_id)?;
        match self.configure(host, device.as_mut(), requested) {
            Ok(()) => Ok(device),
            Err(e) => {
                device.release();
                Err(e)
            }
        }
    }

    fn configure(
        &self,
        host: &dyn SessionHost,
        device: &mut dyn CaptureDevice,
        requested: Size,
    ) -> CaptureResult<()> {
        let caps = device.capabilities()?;
        let request =
            CaptureRequest::new(requested.width, requested.height, self.config.target_fps_milli);
        let plan = negotiate::plan(&caps, &request, device.info(), host.display_rotation())?;
        info!(
            preview = %plan.params.preview_size,
            picture = %plan.params.picture_size,
            fps_min = plan.params.frame_rate.min,
            fps_max = plan.params.frame_rate.max,
            focus = ?plan.params.focus_mode,
            rotation = plan.rotation_degrees,
            "Negotiated capture parameters"
        );

        device.set_display_orientation(plan.rotation_degrees)?;
        device.apply_parameters(&plan.params)?;

        // The device may not honor the request exactly.
        let actual = device.parameters()?;
        info!(preview = %actual.preview_size, "Actual preview size");
        host.on_negotiated(&NegotiatedFormat {
            actual_width: actual.preview_size.width,
            actual_height: actual.preview_size.height,
            frame_rate: actual.frame_rate,
            rotation_degrees: plan.rotation_degrees,
            picture_size: actual.picture_size,
            focus_mode: actual.focus_mode,
        });

        match host.preview_surface() {
            Some(preview) => {
                preview.set_default_buffer_size(actual.preview_size);
                host.add_surface(PREVIEW_SURFACE_ID, preview, false);
            }
            None => warn!("No preview surface, frames will not be displayed"),
        }

        let input = host.input_surface()?;
        input.set_default_buffer_size(actual.preview_size);
        device.set_output(input)?;
        device.start_streaming()?;
        Ok(())
    }

    fn handle_update_rotation(&mut self) {
        let (Some(host), Some(device)) = (self.host.upgrade(), self.device.as_mut()) else {
            return;
        };
        let degrees = negotiate::display_orientation(device.info(), host.display_rotation());
        match device.set_display_orientation(degrees) {
            Ok(()) => {
                info!(degrees, "Display orientation updated");
                host.on_rotation_changed(degrees);
            }
            Err(e) => warn!(error = %e, "Failed to update display orientation"),
        }
    }

    fn handle_stop_preview(&mut self) {
        self.transition(SessionState::Stopping);
        if let Some(mut device) = self.device.take() {
            device.stop_streaming();
            device.release();
            debug!("Capture device released");
        }
        self.transition(SessionState::Idle);
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.stop_streaming();
            device.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CapturedFrame;
    use crate::virtual_camera::{VirtualCameraConfig, VirtualCameraProvider};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Instant;

    #[derive(Default)]
    struct TestSink {
        frames: AtomicU64,
        buffer_size: Mutex<Option<Size>>,
    }

    impl FrameSink for TestSink {
        fn queue_frame(&self, _frame: CapturedFrame) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }

        fn set_default_buffer_size(&self, size: Size) {
            *self.buffer_size.lock() = Some(size);
        }

        fn is_valid(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct TestHost {
        transitions: Mutex<Vec<(SessionState, SessionState)>>,
        negotiated: Mutex<Option<NegotiatedFormat>>,
        failures: Mutex<Vec<String>>,
        added: Mutex<Vec<(u32, bool)>>,
        rotation: Mutex<Option<u32>>,
        preview: Arc<TestSink>,
        input: Arc<TestSink>,
        // Stopped from inside `on_negotiated`, on the capture thread.
        stop_on_negotiated: Mutex<Option<Arc<CaptureSession>>>,
        stop_result: Mutex<Option<CaptureResult<()>>>,
        input_delay: Mutex<Option<Duration>>,
    }

    impl SessionHost for TestHost {
        fn display_rotation(&self) -> DisplayRotation {
            DisplayRotation::Rotation0
        }

        fn on_state_changed(&self, previous: SessionState, current: SessionState) {
            self.transitions.lock().push((previous, current));
        }

        fn on_negotiated(&self, format: &NegotiatedFormat) {
            *self.negotiated.lock() = Some(*format);
            let session = self.stop_on_negotiated.lock().take();
            if let Some(session) = session {
                *self.stop_result.lock() = Some(session.stop(true));
            }
        }

        fn on_rotation_changed(&self, degrees: u32) {
            *self.rotation.lock() = Some(degrees);
        }

        fn on_preview_failed(&self, error: &CaptureError) {
            self.failures.lock().push(error.to_string());
        }

        fn preview_surface(&self) -> Option<Arc<dyn FrameSink>> {
            Some(self.preview.clone())
        }

        fn add_surface(&self, id: u32, _surface: Arc<dyn FrameSink>, recordable: bool) {
            self.added.lock().push((id, recordable));
        }

        fn input_surface(&self) -> CaptureResult<Arc<dyn FrameSink>> {
            let delay = *self.input_delay.lock();
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            Ok(self.input.clone())
        }
    }

    fn fast_camera() -> VirtualCameraConfig {
        VirtualCameraConfig {
            frame_interval: Some(Duration::from_millis(2)),
            ..Default::default()
        }
    }

    fn spawn_session(
        config: VirtualCameraConfig,
    ) -> (CaptureSession, Arc<TestHost>, Arc<VirtualCameraProvider>) {
        let host = Arc::new(TestHost::default());
        let (session, provider) = spawn_session_for(&host, config, Duration::from_secs(5));
        (session, host, provider)
    }

    fn spawn_session_for(
        host: &Arc<TestHost>,
        config: VirtualCameraConfig,
        stop_deadline: Duration,
    ) -> (CaptureSession, Arc<VirtualCameraProvider>) {
        let provider = Arc::new(VirtualCameraProvider::new(config));
        let weak_host: Weak<dyn SessionHost> = Arc::downgrade(host) as Weak<dyn SessionHost>;
        let session = CaptureSession::spawn(
            provider.clone(),
            weak_host,
            SessionConfig {
                stop_retry: Duration::from_millis(20),
                stop_deadline,
                ..Default::default()
            },
        )
        .unwrap();
        (session, provider)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_start_negotiates_and_streams() {
        let (session, host, provider) = spawn_session(fast_camera());
        session.start(1280, 720).unwrap();

        assert!(wait_until(|| session.state().is_previewing()));
        let format = host.negotiated.lock().unwrap();
        assert_eq!(format.actual_size(), Size::new(1280, 720));
        assert_eq!(format.rotation_degrees, 90);
        assert_eq!(*host.added.lock(), vec![(PREVIEW_SURFACE_ID, false)]);
        assert_eq!(*host.preview.buffer_size.lock(), Some(Size::new(1280, 720)));
        assert!(wait_until(|| host.input.frames.load(Ordering::SeqCst) > 3));

        session.stop(true).unwrap();
        assert!(!session.is_running());
        assert!(session.state().is_idle());
        assert_eq!(provider.stats().open_devices(), 0);

        let frames = host.input.frames.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(host.input.frames.load(Ordering::SeqCst), frames);

        assert_eq!(
            *host.transitions.lock(),
            vec![
                (SessionState::Idle, SessionState::Opening),
                (SessionState::Opening, SessionState::Previewing),
                (SessionState::Previewing, SessionState::Stopping),
                (SessionState::Stopping, SessionState::Idle),
            ]
        );
    }

    #[test]
    fn test_actual_size_reported_when_device_overrides_request() {
        let (session, host, _provider) = spawn_session(VirtualCameraConfig {
            forced_preview_size: Some(Size::new(640, 480)),
            ..fast_camera()
        });
        session.start(1280, 720).unwrap();
        assert!(wait_until(|| session.state().is_previewing()));
        let format = host.negotiated.lock().unwrap();
        assert_eq!((format.actual_width, format.actual_height), (640, 480));
        assert_eq!(*host.input.buffer_size.lock(), Some(Size::new(640, 480)));
    }

    #[test]
    fn test_open_failure_reports_and_returns_to_idle() {
        let (session, host, provider) = spawn_session(VirtualCameraConfig {
            fail_open: true,
            ..fast_camera()
        });
        session.start(1280, 720).unwrap();
        assert!(wait_until(|| host.failures.lock().len() == 1));
        assert!(session.state().is_idle());
        assert!(session.is_running());
        assert_eq!(provider.stats().opened(), 0);
        assert!(host.negotiated.lock().is_none());
    }

    #[test]
    fn test_configure_failure_releases_device() {
        let (session, host, provider) = spawn_session(VirtualCameraConfig {
            fail_apply: true,
            ..fast_camera()
        });
        session.start(1280, 720).unwrap();
        assert!(wait_until(|| host.failures.lock().len() == 1));
        let stats = provider.stats();
        assert_eq!((stats.opened(), stats.released()), (1, 1));
    }

    #[test]
    fn test_second_start_is_ignored_while_open() {
        let (session, host, provider) = spawn_session(fast_camera());
        session.start(1280, 720).unwrap();
        session.start(640, 480).unwrap();
        session.update_rotation().unwrap();
        assert!(wait_until(|| host.rotation.lock().is_some()));
        assert_eq!(provider.stats().opened(), 1);
        assert_eq!(host.negotiated.lock().unwrap().actual_width, 1280);
        assert!(host.failures.lock().is_empty());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (session, _host, _provider) = spawn_session(fast_camera());
        session.stop(true).unwrap();
        session.stop(true).unwrap();
        session.stop(false).unwrap();
        assert!(!session.is_running());
        assert!(matches!(
            session.start(640, 480),
            Err(CaptureError::Loop(LoopError::Terminated(_)))
        ));
    }

    #[test]
    fn test_start_after_host_dropped_is_ignored() {
        let (session, host, provider) = spawn_session(fast_camera());
        drop(host);
        session.start(1280, 720).unwrap();
        session.stop(true).unwrap();
        assert_eq!(provider.stats().opened(), 0);
    }

    #[test]
    fn test_stop_from_capture_thread_is_queued() {
        let host = Arc::new(TestHost::default());
        let (session, provider) = spawn_session_for(&host, fast_camera(), Duration::from_secs(5));
        let session = Arc::new(session);
        *host.stop_on_negotiated.lock() = Some(Arc::clone(&session));

        session.start(1280, 720).unwrap();
        assert!(wait_until(|| host.stop_result.lock().is_some()));
        assert!(matches!(*host.stop_result.lock(), Some(Ok(()))));

        // The stop runs after the start that queued it.
        assert!(wait_until(|| !session.is_running()));
        assert!(session.state().is_idle());
        let stats = provider.stats();
        assert_eq!(stats.opened(), 1);
        assert!(wait_until(|| stats.open_devices() == 0));
    }

    #[test]
    fn test_timed_out_stop_does_not_wait_again() {
        let host = Arc::new(TestHost::default());
        *host.input_delay.lock() = Some(Duration::from_secs(1));
        let (session, provider) =
            spawn_session_for(&host, fast_camera(), Duration::from_millis(200));

        session.start(1280, 720).unwrap();
        assert!(wait_until(|| host.negotiated.lock().is_some()));

        let started = Instant::now();
        assert!(matches!(session.stop(true), Err(CaptureError::StopTimeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(200));

        let started = Instant::now();
        assert!(matches!(session.stop(true), Err(CaptureError::StopTimeout(_))));
        drop(session);
        assert!(started.elapsed() < Duration::from_millis(150));

        // The capture thread releases the device once the slow start returns.
        let stats = provider.stats();
        assert!(wait_until(|| stats.open_devices() == 0));
        assert_eq!(stats.opened(), 1);
    }
}
