//! Bridges frames from a producer thread into a GPU texture.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use camfeed_capture::FrameSink;
use camfeed_ipc::Size;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::context::{GpuContext, GpuHandle, GpuManager, ProducerSurface, TextureId};
use crate::error::GpuError;
use crate::flag::PendingUpdateFlag;
use crate::matrix::Mat4;
use crate::GpuResult;

/// Thread name for the bridge's own GPU context.
const SHARED_CONTEXT_THREAD: &str = "camfeed-bridge";

/// Told when the bridge input surface is created or destroyed.
///
/// Both are called on the bridge's GPU thread.
pub trait BridgeCallback: Send + Sync {
    fn on_create(&self, surface: Arc<dyn FrameSink>);

    fn on_destroy(&self);
}

/// Receives every materialized frame on the bridge's GPU thread.
pub trait FrameConsumer: Send + Sync {
    fn on_frame(&self, ctx: &dyn GpuContext, frame: &FrameSnapshot);
}

/// The texture and its transform as of one update.
///
/// The matrix is only meaningful for the texture contents of that update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSnapshot {
    pub texture: TextureId,
    pub matrix: Mat4,
    pub timestamp_ns: u64,
    /// Number of frames materialized before this one.
    pub generation: u64,
}

/// Where the bridge runs its GPU work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    /// On the caller's GPU context and thread.
    Attached,
    /// On a dedicated context shared with the caller's, with its own thread.
    OwnedShared,
}

/// Frame counters for a bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Frame-available signals from the producer.
    pub notified: u64,
    /// Frames pulled into the texture and published.
    pub materialized: u64,
    /// Signals that arrived while an update was already pending.
    pub coalesced: u64,
}

struct BridgeInput {
    texture: TextureId,
    surface: Arc<dyn ProducerSurface>,
}

struct BridgeShared {
    gpu: GpuHandle,
    size: Mutex<Size>,
    input: Mutex<Option<BridgeInput>>,
    ready: Condvar,
    pending: PendingUpdateFlag,
    released: AtomicBool,
    callback: Option<Arc<dyn BridgeCallback>>,
    consumers: Mutex<Vec<Arc<dyn FrameConsumer>>>,
    latest: Mutex<Option<FrameSnapshot>>,
    notified: AtomicU64,
    materialized: AtomicU64,
    coalesced: AtomicU64,
}

impl BridgeShared {
    fn is_valid(&self) -> bool {
        !self.released.load(Ordering::Acquire)
            && self.gpu.is_valid()
            && self
                .input
                .lock()
                .as_ref()
                .is_some_and(|input| input.surface.is_valid())
    }

    /// Producer thread. Never touches GPU state.
    fn on_frame_available(self: &Arc<Self>) {
        self.notified.fetch_add(1, Ordering::Relaxed);
        if !self.is_valid() {
            return;
        }
        if !self.pending.raise() {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let shared = Arc::clone(self);
        if let Err(e) = self.gpu.post(move |ctx| shared.update_texture(ctx)) {
            self.pending.take();
            debug!(error = %e, "Dropping frame, GPU context gone");
        }
    }

    fn update_texture(&self, ctx: &dyn GpuContext) {
        if !self.pending.take() {
            return;
        }
        let Some(surface) = self
            .input
            .lock()
            .as_ref()
            .map(|input| Arc::clone(&input.surface))
        else {
            return;
        };

        match surface.update_tex_image() {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(error = %e, "Failed to update texture image");
                return;
            }
        }

        let snapshot = FrameSnapshot {
            texture: surface.texture(),
            matrix: surface.transform_matrix(),
            timestamp_ns: surface.timestamp_ns(),
            generation: self.materialized.fetch_add(1, Ordering::Relaxed),
        };
        trace!(generation = snapshot.generation, "Frame materialized");
        *self.latest.lock() = Some(snapshot);

        let consumers = self.consumers.lock().clone();
        for consumer in consumers {
            consumer.on_frame(ctx, &snapshot);
        }
    }

    fn recreate_input(self: &Arc<Self>, ctx: &dyn GpuContext) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        self.release_input(ctx);

        let size = *self.size.lock();
        let created = ctx.create_external_texture().and_then(|texture| {
            match ctx.create_producer_surface(texture, size) {
                Ok(surface) => Ok((texture, surface)),
                Err(e) => {
                    ctx.delete_texture(texture);
                    Err(e)
                }
            }
        });
        let (texture, surface) = match created {
            Ok(created) => created,
            Err(e) => {
                error!(error = %e, "Failed to create bridge input surface");
                return;
            }
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        surface.set_frame_available_listener(Some(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.on_frame_available();
            }
        })));
        surface.set_default_buffer_size(size);

        *self.input.lock() = Some(BridgeInput {
            texture,
            surface: Arc::clone(&surface),
        });
        self.ready.notify_all();
        info!(texture, %size, "Bridge input surface created");

        if let Some(callback) = &self.callback {
            callback.on_create(surface.as_frame_sink());
        }
    }

    /// Surface first, then texture.
    fn release_input(&self, ctx: &dyn GpuContext) {
        let Some(input) = self.input.lock().take() else {
            return;
        };
        if let Some(callback) = &self.callback {
            callback.on_destroy();
        }
        input.surface.set_frame_available_listener(None);
        input.surface.release();
        ctx.delete_texture(input.texture);
        self.pending.take();
        debug!(texture = input.texture, "Bridge input surface released");
    }

    fn resize_input(self: &Arc<Self>, ctx: &dyn GpuContext, size: Size) {
        let valid = self
            .input
            .lock()
            .as_ref()
            .is_some_and(|input| input.surface.is_valid());
        if !valid {
            self.recreate_input(ctx);
        }
        if let Some(input) = self.input.lock().as_ref() {
            input.surface.set_default_buffer_size(size);
        }
        debug!(%size, "Bridge resized");
    }
}

/// Receives frames on any thread and materializes them into a texture on
/// its GPU execution context.
///
/// Frames that arrive while an update is pending are dropped; the update
/// pulls whichever frame is newest when it runs.
pub struct FrameSurfaceBridge {
    shared: Arc<BridgeShared>,
    owned: Option<GpuManager>,
}

impl FrameSurfaceBridge {
    /// Create a bridge on `manager`'s context, or on a new context shared
    /// with it when `mode` is [`BridgeMode::OwnedShared`].
    ///
    /// The input surface is created asynchronously; see `wait_until_ready`.
    #[instrument(name = "bridge_new", skip(manager, callback))]
    pub fn new(
        manager: &GpuManager,
        size: Size,
        mode: BridgeMode,
        callback: Option<Arc<dyn BridgeCallback>>,
    ) -> GpuResult<Self> {
        let owned = match mode {
            BridgeMode::Attached => None,
            BridgeMode::OwnedShared => Some(manager.create_shared(SHARED_CONTEXT_THREAD)?),
        };
        let gpu = owned
            .as_ref()
            .map_or_else(|| manager.handle(), GpuManager::handle);

        let shared = Arc::new(BridgeShared {
            gpu,
            size: Mutex::new(size),
            input: Mutex::new(None),
            ready: Condvar::new(),
            pending: PendingUpdateFlag::new(),
            released: AtomicBool::new(false),
            callback,
            consumers: Mutex::new(Vec::new()),
            latest: Mutex::new(None),
            notified: AtomicU64::new(0),
            materialized: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        });

        let task_shared = Arc::clone(&shared);
        shared.gpu.post(move |ctx| task_shared.recreate_input(ctx))?;

        Ok(Self { shared, owned })
    }

    /// The execution context this bridge runs on.
    pub fn gpu(&self) -> &GpuHandle {
        &self.shared.gpu
    }

    fn check_valid(&self) -> GpuResult<()> {
        if self.shared.released.load(Ordering::Acquire) || !self.shared.gpu.is_valid() {
            return Err(GpuError::InvalidState("bridge already released".into()));
        }
        Ok(())
    }

    /// Update the logical frame size. Only an actual change is applied.
    pub fn resize(&self, width: u32, height: u32) -> GpuResult<()> {
        self.check_valid()?;
        let size = Size::new(width, height);
        {
            let mut current = self.shared.size.lock();
            if size.is_empty() || *current == size {
                return Ok(());
            }
            *current = size;
        }
        let shared = Arc::clone(&self.shared);
        self.shared
            .gpu
            .post(move |ctx| shared.resize_input(ctx, size))?;
        Ok(())
    }

    pub fn size(&self) -> Size {
        *self.shared.size.lock()
    }

    /// The surface producers write into.
    pub fn input_surface(&self) -> GpuResult<Arc<dyn FrameSink>> {
        self.check_valid()?;
        self.shared
            .input
            .lock()
            .as_ref()
            .map(|input| Arc::clone(&input.surface).as_frame_sink())
            .ok_or_else(|| GpuError::InvalidState("input surface not created yet".into()))
    }

    /// The texture the input surface streams into.
    pub fn input_texture(&self) -> GpuResult<TextureId> {
        self.check_valid()?;
        self.shared
            .input
            .lock()
            .as_ref()
            .map(|input| input.texture)
            .ok_or_else(|| GpuError::InvalidState("input surface not created yet".into()))
    }

    /// Block until the input surface exists, at most `timeout`.
    pub fn wait_until_ready(&self, timeout: Duration) -> GpuResult<Arc<dyn FrameSink>> {
        let deadline = Instant::now() + timeout;
        let mut input = self.shared.input.lock();
        loop {
            self.check_valid()?;
            if let Some(input) = input.as_ref() {
                return Ok(Arc::clone(&input.surface).as_frame_sink());
            }
            if self.shared.ready.wait_until(&mut input, deadline).timed_out() {
                return Err(GpuError::InvalidState(format!(
                    "input surface not created within {timeout:?}"
                )));
            }
        }
    }

    /// The most recently published frame.
    pub fn latest_frame(&self) -> Option<FrameSnapshot> {
        *self.shared.latest.lock()
    }

    /// Publish every materialized frame to `consumer`.
    pub fn add_consumer(&self, consumer: Arc<dyn FrameConsumer>) {
        self.shared.consumers.lock().push(consumer);
    }

    /// True while the context is alive and the input surface is usable.
    pub fn is_valid(&self) -> bool {
        self.shared.is_valid()
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            notified: self.shared.notified.load(Ordering::Relaxed),
            materialized: self.shared.materialized.load(Ordering::Relaxed),
            coalesced: self.shared.coalesced.load(Ordering::Relaxed),
        }
    }

    /// Release the input surface, then the texture, then (owned mode) the
    /// context. Safe to call more than once.
    #[instrument(name = "bridge_release", skip(self))]
    pub fn release(&self) {
        if self.shared.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        if let Err(e) = self.shared.gpu.post(move |ctx| shared.release_input(ctx)) {
            debug!(error = %e, "GPU context gone before bridge release");
        }
        if let Some(owned) = &self.owned {
            owned.release();
        }
        self.shared.consumers.lock().clear();
        self.shared.ready.notify_all();
        info!("Bridge released");
    }
}

impl Drop for FrameSurfaceBridge {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessGpu;
    use camfeed_capture::{CaptureTimestamp, CapturedFrame};

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn frame(sequence: u64) -> CapturedFrame {
        CapturedFrame::test_pattern(
            Size::new(8, 8),
            CaptureTimestamp::now(Instant::now()),
            sequence,
        )
    }

    /// Block until everything posted to `gpu` so far has run.
    fn barrier(gpu: &GpuHandle) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        gpu.post(move |_| tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(TIMEOUT).unwrap();
    }

    /// Park the GPU thread until the returned sender is used or dropped.
    fn block(gpu: &GpuHandle) -> crossbeam_channel::Sender<()> {
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        gpu.post(move |_| {
            let _ = rx.recv();
        })
        .unwrap();
        tx
    }

    #[derive(Default)]
    struct Recorder {
        created: AtomicU64,
        destroyed: AtomicU64,
        frames: Mutex<Vec<FrameSnapshot>>,
    }

    impl BridgeCallback for Recorder {
        fn on_create(&self, _surface: Arc<dyn FrameSink>) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }

        fn on_destroy(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl FrameConsumer for Recorder {
        fn on_frame(&self, _ctx: &dyn GpuContext, frame: &FrameSnapshot) {
            self.frames.lock().push(*frame);
        }
    }

    #[test]
    fn test_frames_materialize_on_gpu_thread() {
        let gpu = HeadlessGpu::new();
        let manager = GpuManager::new(gpu.context(), "gpu-attached").unwrap();
        let recorder = Arc::new(Recorder::default());
        let bridge = FrameSurfaceBridge::new(
            &manager,
            Size::new(8, 8),
            BridgeMode::Attached,
            Some(recorder.clone()),
        )
        .unwrap();
        bridge.add_consumer(recorder.clone());

        let input = bridge.wait_until_ready(TIMEOUT).unwrap();
        assert!(bridge.is_valid());
        assert_eq!(recorder.created.load(Ordering::SeqCst), 1);

        let producer = std::thread::spawn(move || input.queue_frame(frame(42)));
        producer.join().unwrap();
        barrier(bridge.gpu());

        let frames = recorder.frames.lock().clone();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].texture, bridge.input_texture().unwrap());
        assert_eq!(frames[0].matrix, Mat4::flip_vertical());
        assert_eq!(bridge.latest_frame(), Some(frames[0]));

        let pulls = gpu.pulls();
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].thread.as_deref(), Some("gpu-attached"));
        assert_eq!(pulls[0].sequence, 42);
    }

    #[test]
    fn test_notifications_between_ticks_coalesce() {
        let gpu = HeadlessGpu::new();
        let manager = GpuManager::new(gpu.context(), "gpu-coalesce").unwrap();
        let bridge =
            FrameSurfaceBridge::new(&manager, Size::new(8, 8), BridgeMode::Attached, None).unwrap();
        let input = bridge.wait_until_ready(TIMEOUT).unwrap();

        let gate = block(bridge.gpu());
        for sequence in 0..10 {
            input.queue_frame(frame(sequence));
        }
        drop(gate);
        barrier(bridge.gpu());

        assert_eq!(
            bridge.stats(),
            BridgeStats {
                notified: 10,
                materialized: 1,
                coalesced: 9,
            }
        );
        let pulls = gpu.pulls();
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].sequence, 9);
    }

    #[test]
    fn test_invalid_state_before_init_and_after_release() {
        let gpu = HeadlessGpu::new();
        let manager = GpuManager::new(gpu.context(), "gpu-state").unwrap();
        let recorder = Arc::new(Recorder::default());
        let gate = block(&manager.handle());
        let bridge = FrameSurfaceBridge::new(
            &manager,
            Size::new(8, 8),
            BridgeMode::Attached,
            Some(recorder.clone()),
        )
        .unwrap();

        assert!(matches!(bridge.input_surface(), Err(GpuError::InvalidState(_))));
        assert!(matches!(bridge.input_texture(), Err(GpuError::InvalidState(_))));
        assert!(!bridge.is_valid());
        drop(gate);
        bridge.wait_until_ready(TIMEOUT).unwrap();
        assert_eq!(gpu.live_textures(), 1);

        bridge.release();
        bridge.release();
        barrier(&manager.handle());
        assert!(matches!(bridge.input_surface(), Err(GpuError::InvalidState(_))));
        assert!(matches!(bridge.resize(16, 16), Err(GpuError::InvalidState(_))));
        assert_eq!(recorder.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(gpu.live_textures(), 0);
        assert_eq!(gpu.double_frees(), 0);
    }

    #[test]
    fn test_frames_after_release_are_ignored() {
        let gpu = HeadlessGpu::new();
        let manager = GpuManager::new(gpu.context(), "gpu-late").unwrap();
        let bridge =
            FrameSurfaceBridge::new(&manager, Size::new(8, 8), BridgeMode::Attached, None).unwrap();
        let input = bridge.wait_until_ready(TIMEOUT).unwrap();
        bridge.release();
        barrier(&manager.handle());
        input.queue_frame(frame(1));
        barrier(&manager.handle());
        assert_eq!(bridge.stats().materialized, 0);
        assert!(gpu.pulls().is_empty());
    }

    #[test]
    fn test_resize_applies_only_changes() {
        let gpu = HeadlessGpu::new();
        let manager = GpuManager::new(gpu.context(), "gpu-resize").unwrap();
        let recorder = Arc::new(Recorder::default());
        let bridge = FrameSurfaceBridge::new(
            &manager,
            Size::new(8, 8),
            BridgeMode::Attached,
            Some(recorder.clone()),
        )
        .unwrap();
        bridge.wait_until_ready(TIMEOUT).unwrap();

        bridge.resize(8, 8).unwrap();
        bridge.resize(0, 16).unwrap();
        assert_eq!(bridge.size(), Size::new(8, 8));
        bridge.resize(16, 16).unwrap();
        barrier(bridge.gpu());
        assert_eq!(bridge.size(), Size::new(16, 16));
        // The surface was still valid, so it was resized in place.
        assert_eq!(recorder.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_owned_shared_mode_runs_on_its_own_context() {
        let gpu = HeadlessGpu::new();
        let manager = GpuManager::new(gpu.context(), "gpu-parent").unwrap();
        let bridge =
            FrameSurfaceBridge::new(&manager, Size::new(8, 8), BridgeMode::OwnedShared, None)
                .unwrap();
        assert_eq!(gpu.live_contexts(), 2);
        let input = bridge.wait_until_ready(TIMEOUT).unwrap();
        input.queue_frame(frame(3));
        barrier(bridge.gpu());
        assert_eq!(
            gpu.pulls()[0].thread.as_deref(),
            Some(SHARED_CONTEXT_THREAD)
        );

        drop(bridge);
        assert_eq!(gpu.live_contexts(), 1);
        assert_eq!(gpu.live_textures(), 0);
        assert!(manager.is_valid());
    }
}
