//! A GPU backend without a GPU.
//!
//! Textures hold the last frame latched into them, producer surfaces are
//! single-slot mailboxes, and drawing a texture into a sink hands the
//! latched frame over. Context currency is enforced per thread, so code
//! that touches GPU objects from the wrong thread fails here the same way
//! it would on a real driver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use camfeed_capture::{CapturedFrame, FrameSink};
use camfeed_ipc::Size;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::context::{
    FrameAvailableListener, GpuContext, ProducerSurface, TextureId, EXTERNAL_IMAGE_EXTENSION,
};
use crate::error::GpuError;
use crate::matrix::Mat4;
use crate::GpuResult;

/// One `update_tex_image` call that latched a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRecord {
    pub texture: TextureId,
    pub thread: Option<String>,
    pub sequence: u64,
}

/// Objects shared by a context and every context created from it.
#[derive(Default)]
struct Namespace {
    next_texture: AtomicU32,
    textures: Mutex<HashMap<TextureId, Option<CapturedFrame>>>,
    extensions: Vec<&'static str>,
    pulls: Mutex<Vec<PullRecord>>,
    double_frees: AtomicU64,
    contexts_created: AtomicU64,
    contexts_released: AtomicU64,
}

struct ContextState {
    namespace: Arc<Namespace>,
    valid: AtomicBool,
    current: Mutex<Option<ThreadId>>,
}

impl ContextState {
    fn new(namespace: Arc<Namespace>) -> Arc<Self> {
        namespace.contexts_created.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            namespace,
            valid: AtomicBool::new(true),
            current: Mutex::new(None),
        })
    }

    fn check_current(&self) -> GpuResult<()> {
        if !self.valid.load(Ordering::Acquire) {
            return Err(GpuError::ContextLost("context released".into()));
        }
        if *self.current.lock() != Some(thread::current().id()) {
            return Err(GpuError::InvalidState(
                "context is not current on this thread".into(),
            ));
        }
        Ok(())
    }
}

/// Entry point for the headless backend.
pub struct HeadlessGpu {
    root: Arc<ContextState>,
}

impl HeadlessGpu {
    /// A backend advertising external-image support.
    pub fn new() -> Self {
        Self::with_extensions(vec![EXTERNAL_IMAGE_EXTENSION])
    }

    /// A backend that cannot sample external images.
    pub fn without_external_image() -> Self {
        Self::with_extensions(Vec::new())
    }

    fn with_extensions(extensions: Vec<&'static str>) -> Self {
        let namespace = Arc::new(Namespace {
            next_texture: AtomicU32::new(1),
            extensions,
            ..Default::default()
        });
        Self {
            root: ContextState::new(namespace),
        }
    }

    /// The root context. Every call returns the same context.
    pub fn context(&self) -> Arc<dyn GpuContext> {
        Arc::new(HeadlessContext {
            state: Arc::clone(&self.root),
        })
    }

    /// Textures allocated and not yet deleted, across all shared contexts.
    pub fn live_textures(&self) -> usize {
        self.root.namespace.textures.lock().len()
    }

    /// Deletes of textures that did not exist.
    pub fn double_frees(&self) -> u64 {
        self.root.namespace.double_frees.load(Ordering::Relaxed)
    }

    /// Contexts created and not yet released, including the root.
    pub fn live_contexts(&self) -> u64 {
        let ns = &self.root.namespace;
        ns.contexts_created.load(Ordering::Relaxed) - ns.contexts_released.load(Ordering::Relaxed)
    }

    pub fn pulls(&self) -> Vec<PullRecord> {
        self.root.namespace.pulls.lock().clone()
    }
}

impl Default for HeadlessGpu {
    fn default() -> Self {
        Self::new()
    }
}

/// A headless context.
pub struct HeadlessContext {
    state: Arc<ContextState>,
}

impl GpuContext for HeadlessContext {
    fn make_current(&self) -> GpuResult<()> {
        if !self.state.valid.load(Ordering::Acquire) {
            return Err(GpuError::ContextLost("context released".into()));
        }
        *self.state.current.lock() = Some(thread::current().id());
        Ok(())
    }

    fn supports_extension(&self, name: &str) -> bool {
        self.state
            .namespace
            .extensions
            .iter()
            .any(|ext| ext.contains(name))
    }

    fn create_external_texture(&self) -> GpuResult<TextureId> {
        self.state.check_current()?;
        if !self.supports_extension(EXTERNAL_IMAGE_EXTENSION) {
            return Err(GpuError::MissingExtension(EXTERNAL_IMAGE_EXTENSION));
        }
        let ns = &self.state.namespace;
        let texture = ns.next_texture.fetch_add(1, Ordering::Relaxed);
        ns.textures.lock().insert(texture, None);
        trace!(texture, "Created external texture");
        Ok(texture)
    }

    fn delete_texture(&self, texture: TextureId) {
        if let Err(e) = self.state.check_current() {
            warn!(texture, error = %e, "Deleting texture without a current context");
        }
        let ns = &self.state.namespace;
        if ns.textures.lock().remove(&texture).is_none() {
            warn!(texture, "Deleting unknown texture");
            ns.double_frees.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn create_producer_surface(
        &self,
        texture: TextureId,
        size: Size,
    ) -> GpuResult<Arc<dyn ProducerSurface>> {
        self.state.check_current()?;
        if !self.state.namespace.textures.lock().contains_key(&texture) {
            return Err(GpuError::InvalidState(format!("unknown texture {texture}")));
        }
        debug!(texture, %size, "Created producer surface");
        Ok(Arc::new(HeadlessSurface {
            context: Arc::clone(&self.state),
            texture,
            size: Mutex::new(size),
            slot: Mutex::new(None),
            latched_timestamp_ns: AtomicU64::new(0),
            listener: Mutex::new(None),
            released: AtomicBool::new(false),
        }))
    }

    fn create_shared(&self) -> GpuResult<Arc<dyn GpuContext>> {
        if !self.is_valid() {
            return Err(GpuError::ContextLost("parent context released".into()));
        }
        Ok(Arc::new(HeadlessContext {
            state: ContextState::new(Arc::clone(&self.state.namespace)),
        }))
    }

    fn draw_texture(
        &self,
        texture: TextureId,
        _tex_matrix: &Mat4,
        target: &dyn FrameSink,
    ) -> GpuResult<()> {
        self.state.check_current()?;
        let frame = match self.state.namespace.textures.lock().get(&texture) {
            Some(frame) => frame.clone(),
            None => return Err(GpuError::InvalidState(format!("unknown texture {texture}"))),
        };
        if let Some(frame) = frame {
            if target.is_valid() {
                target.queue_frame(frame);
            }
        }
        Ok(())
    }

    fn release(&self) {
        if self.state.valid.swap(false, Ordering::AcqRel) {
            *self.state.current.lock() = None;
            self.state
                .namespace
                .contexts_released
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn is_valid(&self) -> bool {
        self.state.valid.load(Ordering::Acquire)
    }
}

/// A single-slot producer surface.
struct HeadlessSurface {
    context: Arc<ContextState>,
    texture: TextureId,
    size: Mutex<Size>,
    slot: Mutex<Option<CapturedFrame>>,
    latched_timestamp_ns: AtomicU64,
    listener: Mutex<Option<FrameAvailableListener>>,
    released: AtomicBool,
}

impl FrameSink for HeadlessSurface {
    fn queue_frame(&self, frame: CapturedFrame) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        // Overwrites whatever the consumer has not latched yet.
        *self.slot.lock() = Some(frame);
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener();
        }
    }

    fn set_default_buffer_size(&self, size: Size) {
        *self.size.lock() = size;
    }

    fn is_valid(&self) -> bool {
        !self.released.load(Ordering::Acquire) && self.context.valid.load(Ordering::Acquire)
    }
}

impl ProducerSurface for HeadlessSurface {
    fn set_frame_available_listener(&self, listener: Option<FrameAvailableListener>) {
        *self.listener.lock() = listener;
    }

    fn update_tex_image(&self) -> GpuResult<bool> {
        if self.released.load(Ordering::Acquire) {
            return Err(GpuError::SurfaceReleased);
        }
        self.context.check_current()?;
        let Some(frame) = self.slot.lock().take() else {
            return Ok(false);
        };

        let ns = &self.context.namespace;
        let mut textures = ns.textures.lock();
        let Some(content) = textures.get_mut(&self.texture) else {
            return Err(GpuError::InvalidState(format!(
                "texture {} was deleted",
                self.texture
            )));
        };
        self.latched_timestamp_ns
            .store(frame.timestamp.timestamp_ns, Ordering::Release);
        ns.pulls.lock().push(PullRecord {
            texture: self.texture,
            thread: thread::current().name().map(str::to_owned),
            sequence: frame.sequence,
        });
        *content = Some(frame);
        Ok(true)
    }

    fn transform_matrix(&self) -> Mat4 {
        Mat4::flip_vertical()
    }

    fn timestamp_ns(&self) -> u64 {
        self.latched_timestamp_ns.load(Ordering::Acquire)
    }

    fn texture(&self) -> TextureId {
        self.texture
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slot.lock().take();
        self.listener.lock().take();
        trace!(texture = self.texture, "Producer surface released");
    }

    fn as_frame_sink(self: Arc<Self>) -> Arc<dyn FrameSink> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camfeed_capture::CaptureTimestamp;
    use std::time::Instant;

    fn frame(sequence: u64) -> CapturedFrame {
        CapturedFrame::test_pattern(
            Size::new(4, 4),
            CaptureTimestamp::now(Instant::now()),
            sequence,
        )
    }

    #[test]
    fn test_objects_require_current_context() {
        let gpu = HeadlessGpu::new();
        let ctx = gpu.context();
        assert!(matches!(
            ctx.create_external_texture(),
            Err(GpuError::InvalidState(_))
        ));
        ctx.make_current().unwrap();
        assert!(ctx.create_external_texture().is_ok());
        ctx.release();
        assert!(matches!(ctx.make_current(), Err(GpuError::ContextLost(_))));
        assert_eq!(gpu.live_contexts(), 0);
    }

    #[test]
    fn test_missing_extension() {
        let gpu = HeadlessGpu::without_external_image();
        let ctx = gpu.context();
        ctx.make_current().unwrap();
        assert!(!ctx.supports_extension(EXTERNAL_IMAGE_EXTENSION));
        assert!(matches!(
            ctx.create_external_texture(),
            Err(GpuError::MissingExtension(_))
        ));
    }

    #[test]
    fn test_surface_keeps_only_newest_frame() {
        let gpu = HeadlessGpu::new();
        let ctx = gpu.context();
        ctx.make_current().unwrap();
        let texture = ctx.create_external_texture().unwrap();
        let surface = ctx.create_producer_surface(texture, Size::new(4, 4)).unwrap();

        assert!(!surface.update_tex_image().unwrap());
        for sequence in 0..5 {
            surface.queue_frame(frame(sequence));
        }
        assert!(surface.update_tex_image().unwrap());
        assert!(!surface.update_tex_image().unwrap());
        let pulls = gpu.pulls();
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].sequence, 4);

        surface.release();
        surface.release();
        assert!(!surface.is_valid());
        assert!(matches!(
            surface.update_tex_image(),
            Err(GpuError::SurfaceReleased)
        ));
    }

    #[test]
    fn test_draw_hands_latched_frame_to_target() {
        let gpu = HeadlessGpu::new();
        let ctx = gpu.context();
        ctx.make_current().unwrap();
        let source_tex = ctx.create_external_texture().unwrap();
        let source = ctx.create_producer_surface(source_tex, Size::new(4, 4)).unwrap();
        let target_tex = ctx.create_external_texture().unwrap();
        let target = ctx.create_producer_surface(target_tex, Size::new(4, 4)).unwrap();
        let target_sink = Arc::clone(&target).as_frame_sink();

        ctx.draw_texture(source_tex, &Mat4::IDENTITY, target_sink.as_ref()).unwrap();
        assert!(!target.update_tex_image().unwrap());

        source.queue_frame(frame(7));
        source.update_tex_image().unwrap();
        ctx.draw_texture(source_tex, &Mat4::IDENTITY, target_sink.as_ref()).unwrap();
        assert!(target.update_tex_image().unwrap());
        assert_eq!(gpu.pulls().last().map(|p| p.sequence), Some(7));

        ctx.delete_texture(source_tex);
        ctx.delete_texture(source_tex);
        assert_eq!(gpu.double_frees(), 1);
    }
}
