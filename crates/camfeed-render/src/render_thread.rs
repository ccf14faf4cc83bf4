//! The render thread: demand-driven drawing on its own execution context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use camfeed_capture::FrameSink;
use camfeed_gpu::GpuContext;
use camfeed_ipc::{LoopControl, LoopError, LoopHandle, MessageLoop, Size};
use crossbeam_channel::Sender;
use tracing::{debug, error, info, instrument, trace};

use crate::coordinator::{RenderCoordinator, RenderHost, RenderStatus};
use crate::display::DisplaySurface;
use crate::viewport::ViewportLayout;
use crate::RenderResult;

/// Name of the render thread.
pub const RENDER_THREAD_NAME: &str = "camfeed-render";

enum RenderMessage {
    SetHost(Weak<dyn RenderHost>),
    SurfaceCreated(Sender<RenderResult<()>>),
    SurfaceChanged(Size),
    UpdateViewport,
    DrawFrame,
    SurfaceDestroyed(Sender<()>),
    Quit,
}

/// Requests a redraw. Requests made while one is queued are merged.
#[derive(Clone)]
pub struct RenderRequester {
    requested: Arc<AtomicBool>,
    looper: LoopHandle<RenderMessage>,
}

impl RenderRequester {
    /// Queue one draw unless a draw is already queued.
    pub fn request_render(&self) {
        if self.requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.looper.send(RenderMessage::DrawFrame).is_err() {
            self.requested.store(false, Ordering::Release);
            trace!("Render thread gone, dropping draw request");
        }
    }
}

/// Owns the render thread and its [`RenderCoordinator`].
///
/// Every GPU object of the preview is created, used and released on the
/// render thread. `surface_created` and `surface_destroyed` block until the
/// render thread has handled them; everything else is fire-and-forget.
///
/// The owner is attached with `set_host` after spawning, since the owner
/// usually holds the render thread itself.
pub struct RenderThread {
    looper: MessageLoop<RenderMessage>,
    requester: RenderRequester,
    status: Arc<RenderStatus>,
}

impl RenderThread {
    #[instrument(name = "render_thread_spawn", skip_all)]
    pub fn spawn(
        display: Box<dyn DisplaySurface>,
        context: Arc<dyn GpuContext>,
        clear_color: [f32; 4],
    ) -> RenderResult<Self> {
        let requester_cell: Arc<OnceLock<RenderRequester>> = Arc::new(OnceLock::new());
        let wake_cell = Arc::clone(&requester_cell);
        let mut coordinator = RenderCoordinator::new(
            display,
            context,
            clear_color,
            Arc::new(move || {
                if let Some(requester) = wake_cell.get() {
                    requester.request_render();
                }
            }),
        );
        let status = coordinator.status();
        let requested = Arc::new(AtomicBool::new(false));
        let thread_requested = Arc::clone(&requested);

        let looper = MessageLoop::spawn(RENDER_THREAD_NAME, move |msg| match msg {
            RenderMessage::SetHost(host) => {
                coordinator.set_host(host);
                LoopControl::Continue
            }
            RenderMessage::SurfaceCreated(reply) => {
                let result = coordinator.on_surface_created();
                if let Err(e) = &result {
                    error!(error = %e, fatal = e.is_fatal(), "Failed to create preview surface");
                    if let Some(host) = coordinator.host() {
                        host.on_render_fatal(e);
                    }
                }
                let _ = reply.send(result);
                LoopControl::Continue
            }
            RenderMessage::SurfaceChanged(size) => {
                coordinator.on_surface_changed(size.width, size.height);
                LoopControl::Continue
            }
            RenderMessage::UpdateViewport => {
                coordinator.update_viewport();
                LoopControl::Continue
            }
            RenderMessage::DrawFrame => {
                thread_requested.store(false, Ordering::Release);
                coordinator.draw_frame();
                LoopControl::Continue
            }
            RenderMessage::SurfaceDestroyed(reply) => {
                coordinator.on_surface_destroyed();
                let _ = reply.send(());
                LoopControl::Continue
            }
            RenderMessage::Quit => {
                coordinator.on_surface_destroyed();
                coordinator.context().release();
                debug!("Render context released");
                LoopControl::Quit
            }
        })?;

        let requester = RenderRequester {
            requested,
            looper: looper.handle(),
        };
        let _ = requester_cell.set(requester.clone());
        info!("Render thread started");

        Ok(Self {
            looper,
            requester,
            status,
        })
    }

    /// Attach the owner. Takes effect before any later request.
    pub fn set_host(&self, host: Weak<dyn RenderHost>) -> RenderResult<()> {
        self.looper.send(RenderMessage::SetHost(host))?;
        Ok(())
    }

    /// Create the preview texture and surface. Blocks until done.
    ///
    /// A failure has already been reported to the host when this returns.
    pub fn surface_created(&self) -> RenderResult<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.looper.send(RenderMessage::SurfaceCreated(tx))?;
        rx.recv().map_err(|_| self.gone())?
    }

    pub fn surface_changed(&self, width: u32, height: u32) -> RenderResult<()> {
        self.looper
            .send(RenderMessage::SurfaceChanged(Size::new(width, height)))?;
        Ok(())
    }

    /// Recompute the viewport on the render thread.
    pub fn update_viewport(&self) -> RenderResult<()> {
        self.looper.send(RenderMessage::UpdateViewport)?;
        Ok(())
    }

    pub fn request_render(&self) {
        self.requester.request_render();
    }

    pub fn requester(&self) -> RenderRequester {
        self.requester.clone()
    }

    /// Release the preview's GPU objects. Blocks until done.
    pub fn surface_destroyed(&self) {
        if self.looper.handle().is_loop_thread() {
            return;
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        if self.looper.send(RenderMessage::SurfaceDestroyed(tx)).is_err() {
            return;
        }
        let _ = rx.recv();
    }

    pub fn preview_surface(&self) -> Option<Arc<dyn FrameSink>> {
        self.status.preview_surface()
    }

    pub fn has_surface(&self) -> bool {
        self.status.has_surface()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.status.frames_rendered()
    }

    pub fn layout(&self) -> Option<ViewportLayout> {
        self.status.layout()
    }

    pub fn is_running(&self) -> bool {
        self.looper.is_running()
    }

    /// Destroy the surface, release the context and stop the thread.
    pub fn shutdown(&self) {
        if self.looper.send(RenderMessage::Quit).is_ok() {
            debug!("Render thread shutdown requested");
        }
        self.looper.join();
    }

    fn gone(&self) -> LoopError {
        LoopError::Terminated(self.looper.name().to_owned())
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;
    use crate::headless::RecordingDisplay;
    use camfeed_capture::{CaptureTimestamp, CapturedFrame};
    use camfeed_gpu::HeadlessGpu;
    use camfeed_ipc::ScaleMode;
    use crossbeam_channel::Receiver;
    use parking_lot::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct TestHost {
        gate: Mutex<Option<Receiver<()>>>,
        ready: Mutex<Vec<Size>>,
        fatal: Mutex<Vec<String>>,
    }

    impl RenderHost for TestHost {
        fn content_size(&self) -> Size {
            Size::new(1280, 720)
        }

        fn scale_mode(&self) -> ScaleMode {
            ScaleMode::KeepAspect
        }

        fn on_surface_ready(&self, view: Size) {
            self.ready.lock().push(view);
            let gate = self.gate.lock().take();
            if let Some(gate) = gate {
                let _ = gate.recv_timeout(Duration::from_secs(5));
            }
        }

        fn on_render_fatal(&self, error: &RenderError) {
            self.fatal.lock().push(error.to_string());
        }
    }

    fn spawn(gpu: &HeadlessGpu, host: &Arc<TestHost>) -> (RenderThread, crate::headless::DisplayLog) {
        let (display, log) = RecordingDisplay::new();
        let render =
            RenderThread::spawn(Box::new(display), gpu.context(), [1.0, 1.0, 0.0, 1.0]).unwrap();
        render
            .set_host(Arc::downgrade(host) as Weak<dyn RenderHost>)
            .unwrap();
        (render, log)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn frame(sequence: u64) -> CapturedFrame {
        CapturedFrame::test_pattern(
            Size::new(4, 4),
            CaptureTimestamp::now(Instant::now()),
            sequence,
        )
    }

    #[test]
    fn test_new_frame_triggers_draw_on_render_thread() {
        let gpu = HeadlessGpu::new();
        let host = Arc::new(TestHost::default());
        let (render, log) = spawn(&gpu, &host);
        render.surface_created().unwrap();
        render.surface_changed(640, 480).unwrap();
        assert!(wait_until(|| !host.ready.lock().is_empty()));
        assert_eq!(*host.ready.lock(), vec![Size::new(640, 480)]);
        assert!(render.layout().is_some());

        render.preview_surface().unwrap().queue_frame(frame(7));
        assert!(wait_until(|| render.frames_rendered() >= 1));
        assert!(log.presents() >= 1);

        let pulls = gpu.pulls();
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].sequence, 7);
        assert_eq!(pulls[0].thread.as_deref(), Some(RENDER_THREAD_NAME));
    }

    #[test]
    fn test_requests_merge_while_draw_is_queued() {
        let gpu = HeadlessGpu::new();
        let host = Arc::new(TestHost::default());
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(1);
        *host.gate.lock() = Some(gate_rx);
        let (render, _log) = spawn(&gpu, &host);
        render.surface_created().unwrap();

        // The render thread blocks inside on_surface_ready.
        render.surface_changed(640, 480).unwrap();
        assert!(wait_until(|| !host.ready.lock().is_empty()));
        for _ in 0..10 {
            render.request_render();
        }
        gate_tx.send(()).unwrap();

        assert!(wait_until(|| render.frames_rendered() == 1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(render.frames_rendered(), 1);

        render.request_render();
        assert!(wait_until(|| render.frames_rendered() == 2));
    }

    #[test]
    fn test_missing_extension_is_reported_to_host() {
        let gpu = HeadlessGpu::without_external_image();
        let host = Arc::new(TestHost::default());
        let (render, _log) = spawn(&gpu, &host);
        let err = render.surface_created().unwrap_err();
        assert!(matches!(err, RenderError::MissingExtension(_)));
        assert_eq!(host.fatal.lock().len(), 1);
        assert!(!render.has_surface());
    }

    #[test]
    fn test_shutdown_releases_gpu_objects() {
        let gpu = HeadlessGpu::new();
        let host = Arc::new(TestHost::default());
        let (render, _log) = spawn(&gpu, &host);
        render.surface_created().unwrap();
        assert_eq!(gpu.live_textures(), 1);

        render.surface_destroyed();
        assert_eq!(gpu.live_textures(), 0);
        render.surface_created().unwrap();
        assert_eq!(gpu.live_textures(), 1);

        render.shutdown();
        render.shutdown();
        assert!(!render.is_running());
        assert_eq!(gpu.live_textures(), 0);
        assert_eq!(gpu.live_contexts(), 0);
        assert!(matches!(
            render.surface_created(),
            Err(RenderError::ThreadGone(_))
        ));
        render.request_render();
    }
}
