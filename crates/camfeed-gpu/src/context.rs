//! GPU contexts and the execution contexts that own them.

use std::sync::Arc;

use camfeed_capture::FrameSink;
use camfeed_ipc::{LoopControl, LoopHandle, MessageLoop, Size};
use tracing::{debug, instrument, warn};

use crate::error::GpuError;
use crate::matrix::Mat4;
use crate::GpuResult;

/// Name of a GPU texture object.
pub type TextureId = u32;

/// Extension required to sample externally sourced images.
pub const EXTERNAL_IMAGE_EXTENSION: &str = "OES_EGL_image_external";

/// Called from the producer's thread whenever a new image is queued.
pub type FrameAvailableListener = Arc<dyn Fn() + Send + Sync>;

/// A GPU context.
///
/// Object-creating and drawing calls require the context to be current on
/// the calling thread. Contexts created through `create_shared` see the same
/// textures.
pub trait GpuContext: Send + Sync {
    /// Bind the context to the calling thread.
    fn make_current(&self) -> GpuResult<()>;

    fn supports_extension(&self, name: &str) -> bool;

    /// Allocate a texture bound to the external-image target.
    fn create_external_texture(&self) -> GpuResult<TextureId>;

    fn delete_texture(&self, texture: TextureId);

    /// Create a producer-facing surface that streams into `texture`.
    fn create_producer_surface(
        &self,
        texture: TextureId,
        size: Size,
    ) -> GpuResult<Arc<dyn ProducerSurface>>;

    /// A new context sharing GPU objects with this one.
    fn create_shared(&self) -> GpuResult<Arc<dyn GpuContext>>;

    /// Render the current contents of `texture` into `target`.
    fn draw_texture(
        &self,
        texture: TextureId,
        tex_matrix: &Mat4,
        target: &dyn FrameSink,
    ) -> GpuResult<()>;

    fn release(&self);

    fn is_valid(&self) -> bool;
}

/// The producer side of a texture.
///
/// Producers write through the [`FrameSink`] half on any thread. The
/// consumer pulls the newest image into the texture with `update_tex_image`
/// on a thread where the owning context is current.
pub trait ProducerSurface: FrameSink {
    fn set_frame_available_listener(&self, listener: Option<FrameAvailableListener>);

    /// Latch the newest queued image into the texture.
    ///
    /// Returns false if nothing new was queued since the last call.
    fn update_tex_image(&self) -> GpuResult<bool>;

    /// Texture coordinate transform for the latched image.
    fn transform_matrix(&self) -> Mat4;

    /// Timestamp of the latched image.
    fn timestamp_ns(&self) -> u64;

    fn texture(&self) -> TextureId;

    fn release(&self);

    fn as_frame_sink(self: Arc<Self>) -> Arc<dyn FrameSink>;
}

type GpuTask = Box<dyn FnOnce(&dyn GpuContext) + Send>;

enum GpuMessage {
    Run(GpuTask),
    Quit,
}

/// A cloneable way to post work onto a GPU execution context.
#[derive(Clone)]
pub struct GpuHandle {
    looper: LoopHandle<GpuMessage>,
    context: Arc<dyn GpuContext>,
}

impl GpuHandle {
    /// Run `task` on the GPU thread with the context current.
    pub fn post<F>(&self, task: F) -> GpuResult<()>
    where
        F: FnOnce(&dyn GpuContext) + Send + 'static,
    {
        self.looper.send(GpuMessage::Run(Box::new(task)))?;
        Ok(())
    }

    pub fn context(&self) -> &Arc<dyn GpuContext> {
        &self.context
    }

    /// True while both the context and its thread are alive.
    pub fn is_valid(&self) -> bool {
        self.looper.is_running() && self.context.is_valid()
    }

    pub fn is_gpu_thread(&self) -> bool {
        self.looper.is_loop_thread()
    }
}

/// Owns a GPU context and the thread it is current on.
pub struct GpuManager {
    looper: MessageLoop<GpuMessage>,
    handle: GpuHandle,
}

impl GpuManager {
    /// Spawn a GPU thread for `context`. The context is made current
    /// before any task runs and released when the manager shuts down.
    #[instrument(name = "gpu_manager_new", skip(context))]
    pub fn new(context: Arc<dyn GpuContext>, name: &str) -> GpuResult<Self> {
        let thread_context = Arc::clone(&context);
        let mut current = false;
        let looper = MessageLoop::spawn(name, move |msg| match msg {
            GpuMessage::Run(task) => {
                if !current {
                    match thread_context.make_current() {
                        Ok(()) => current = true,
                        Err(e) => {
                            warn!(error = %e, "Failed to make GPU context current");
                            return LoopControl::Continue;
                        }
                    }
                }
                task(thread_context.as_ref());
                LoopControl::Continue
            }
            GpuMessage::Quit => {
                thread_context.release();
                debug!("GPU context released");
                LoopControl::Quit
            }
        })?;

        let handle = GpuHandle {
            looper: looper.handle(),
            context,
        };
        Ok(Self { looper, handle })
    }

    pub fn handle(&self) -> GpuHandle {
        self.handle.clone()
    }

    pub fn context(&self) -> &Arc<dyn GpuContext> {
        self.handle.context()
    }

    pub fn post<F>(&self, task: F) -> GpuResult<()>
    where
        F: FnOnce(&dyn GpuContext) + Send + 'static,
    {
        self.handle.post(task)
    }

    /// A manager with its own thread and a context shared with this one.
    pub fn create_shared(&self, name: &str) -> GpuResult<GpuManager> {
        if !self.is_valid() {
            return Err(GpuError::ContextLost("parent context released".into()));
        }
        let shared = self.context().create_shared()?;
        GpuManager::new(shared, name)
    }

    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// Release the context after all previously posted work has run.
    ///
    /// Calling it again is a no-op.
    pub fn release(&self) {
        if self.looper.send(GpuMessage::Quit).is_err() {
            return;
        }
        debug!(name = %self.looper.name(), "GPU manager release requested");
    }
}

impl Drop for GpuManager {
    fn drop(&mut self) {
        self.release();
        self.looper.join();
    }
}
