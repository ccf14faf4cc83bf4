//! Render-thread state: the preview texture, its surface and the drawer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use camfeed_capture::FrameSink;
use camfeed_gpu::{
    FrameAvailableListener, GpuContext, Mat4, PendingUpdateFlag, ProducerSurface, TextureId,
    EXTERNAL_IMAGE_EXTENSION,
};
use camfeed_ipc::{ScaleMode, Size};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::display::DisplaySurface;
use crate::drawer::QuadDrawer;
use crate::error::RenderError;
use crate::viewport::{ViewportLayout, ViewportState};
use crate::RenderResult;

/// What the renderer needs to know about its owner.
///
/// Held weakly; once the owner is gone every callback is skipped.
pub trait RenderHost: Send + Sync {
    /// Current content (video) size.
    fn content_size(&self) -> Size;

    fn scale_mode(&self) -> ScaleMode;

    /// The display surface has a usable size. Called on the render thread.
    fn on_surface_ready(&self, view: Size);

    /// Rendering cannot continue.
    fn on_render_fatal(&self, error: &RenderError);
}

/// State shared between the render thread and everyone else.
#[derive(Default)]
pub struct RenderStatus {
    surface: Mutex<Option<Arc<dyn ProducerSurface>>>,
    pending: PendingUpdateFlag,
    frames_rendered: AtomicU64,
    layout: Mutex<Option<ViewportLayout>>,
}

impl RenderStatus {
    /// Producer side of the preview texture, if it exists.
    pub fn preview_surface(&self) -> Option<Arc<dyn FrameSink>> {
        self.surface
            .lock()
            .as_ref()
            .map(|surface| Arc::clone(surface).as_frame_sink())
    }

    pub fn has_surface(&self) -> bool {
        self.surface.lock().is_some()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    /// Most recently applied viewport.
    pub fn layout(&self) -> Option<ViewportLayout> {
        *self.layout.lock()
    }

    /// True when a frame has arrived that no draw has latched yet.
    pub fn update_pending(&self) -> bool {
        self.pending.is_set()
    }
}

/// Owns every GPU object of the preview. Lives on the render thread.
pub struct RenderCoordinator {
    display: Box<dyn DisplaySurface>,
    context: Arc<dyn GpuContext>,
    host: Option<Weak<dyn RenderHost>>,
    status: Arc<RenderStatus>,
    clear_color: [f32; 4],
    wake: FrameAvailableListener,
    drawer: Option<QuadDrawer>,
    texture: Option<TextureId>,
    tex_matrix: Mat4,
    view: Size,
    started_for: Option<Size>,
}

impl RenderCoordinator {
    /// `wake` is invoked from the producer's thread after every new frame.
    pub fn new(
        display: Box<dyn DisplaySurface>,
        context: Arc<dyn GpuContext>,
        clear_color: [f32; 4],
        wake: FrameAvailableListener,
    ) -> Self {
        Self {
            display,
            context,
            host: None,
            status: Arc::new(RenderStatus::default()),
            clear_color,
            wake,
            drawer: None,
            texture: None,
            tex_matrix: Mat4::IDENTITY,
            view: Size::default(),
            started_for: None,
        }
    }

    pub fn status(&self) -> Arc<RenderStatus> {
        Arc::clone(&self.status)
    }

    pub fn context(&self) -> &Arc<dyn GpuContext> {
        &self.context
    }

    pub fn set_host(&mut self, host: Weak<dyn RenderHost>) {
        self.host = Some(host);
    }

    /// The owner, if it is still alive.
    pub fn host(&self) -> Option<Arc<dyn RenderHost>> {
        self.host.as_ref().and_then(Weak::upgrade)
    }

    /// Create the preview texture, its producer surface and the drawer.
    ///
    /// Fails with [`RenderError::MissingExtension`] when the context cannot
    /// sample external images.
    #[instrument(name = "render_surface_created", skip(self))]
    pub fn on_surface_created(&mut self) -> RenderResult<()> {
        self.context.make_current()?;
        if !self.context.supports_extension(EXTERNAL_IMAGE_EXTENSION) {
            return Err(RenderError::MissingExtension(EXTERNAL_IMAGE_EXTENSION));
        }
        if self.status.has_surface() {
            debug!("Preview surface already exists");
            return Ok(());
        }

        let mut drawer = QuadDrawer::new(self.display.as_mut())?;
        if let Some(layout) = self.status.layout() {
            drawer.set_mvp(layout.mvp);
        }
        let texture = match self.context.create_external_texture() {
            Ok(texture) => texture,
            Err(e) => {
                drawer.release(self.display.as_mut());
                return Err(e.into());
            }
        };
        let content = self
            .host()
            .map(|host| host.content_size())
            .unwrap_or_default();
        let surface = match self.context.create_producer_surface(texture, content) {
            Ok(surface) => surface,
            Err(e) => {
                self.context.delete_texture(texture);
                drawer.release(self.display.as_mut());
                return Err(e.into());
            }
        };

        let status = Arc::downgrade(&self.status);
        let wake = Arc::clone(&self.wake);
        surface.set_frame_available_listener(Some(Arc::new(move || {
            let Some(status) = status.upgrade() else {
                return;
            };
            status.pending.raise();
            wake();
        })));

        self.display.set_clear_color(self.clear_color);
        self.drawer = Some(drawer);
        self.texture = Some(texture);
        self.tex_matrix = Mat4::IDENTITY;
        *self.status.surface.lock() = Some(surface);
        info!(texture, %content, "Preview surface created");
        Ok(())
    }

    /// The display was resized. Zero sizes are ignored.
    ///
    /// The host is told the surface is ready once per content size, so a
    /// plain resize does not restart capture.
    #[instrument(name = "render_surface_changed", skip(self))]
    pub fn on_surface_changed(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            debug!("Ignoring empty display size");
            return;
        }
        self.view = Size::new(width, height);
        self.update_viewport();
        let Some(host) = self.host() else {
            return;
        };
        let content = host.content_size();
        if self.started_for != Some(content) {
            self.started_for = Some(content);
            host.on_surface_ready(self.view);
        }
    }

    /// Recompute the viewport from the display size, content size and scale
    /// mode, and clear the display.
    pub fn update_viewport(&mut self) {
        if self.view.is_empty() {
            trace!("No display size yet");
            return;
        }
        let Some(host) = self.host() else {
            return;
        };
        let state = ViewportState::new(self.view, host.content_size(), host.scale_mode());
        let layout = state.compute();
        self.display.set_viewport(layout.viewport);
        self.display.clear();
        if let Some(drawer) = self.drawer.as_mut() {
            drawer.set_mvp(layout.mvp);
        }
        *self.status.layout.lock() = Some(layout);
        debug!(
            view = %state.view,
            content = %state.content,
            mode = %state.mode,
            viewport = ?layout.viewport,
            "Viewport updated"
        );
    }

    /// Draw one frame, latching a new image first if one arrived.
    pub fn draw_frame(&mut self) {
        let Some(surface) = self.status.surface.lock().clone() else {
            return;
        };
        let (Some(drawer), Some(texture)) = (self.drawer.as_ref(), self.texture) else {
            return;
        };

        self.display.clear();
        if self.status.pending.take() {
            match surface.update_tex_image() {
                Ok(_) => self.tex_matrix = surface.transform_matrix(),
                Err(e) => warn!(error = %e, "Failed to latch preview frame"),
            }
        }
        drawer.draw(self.display.as_mut(), texture, &self.tex_matrix);
        self.display.present();
        self.status.frames_rendered.fetch_add(1, Ordering::Relaxed);
    }

    /// Release the drawer, texture and surface. Safe to call repeatedly.
    #[instrument(name = "render_surface_destroyed", skip(self))]
    pub fn on_surface_destroyed(&mut self) {
        let surface = self.status.surface.lock().take();
        if let Some(surface) = surface {
            surface.set_frame_available_listener(None);
            surface.release();
        }
        if let Some(drawer) = self.drawer.take() {
            drawer.release(self.display.as_mut());
        }
        if let Some(texture) = self.texture.take() {
            self.context.delete_texture(texture);
            debug!(texture, "Preview texture deleted");
        }
        self.status.pending.take();
        *self.status.layout.lock() = None;
        self.view = Size::default();
        self.started_for = None;
    }
}
