//! Renders each published frame into every registered surface.

use std::sync::Arc;

use camfeed_capture::FrameSink;
use camfeed_gpu::{FrameConsumer, FrameSnapshot, GpuContext};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

/// Called on the GPU thread after a frame has been distributed.
pub type PublishHook = Box<dyn Fn() + Send + Sync>;

#[derive(Clone)]
struct RegisteredSurface {
    id: u32,
    sink: Arc<dyn FrameSink>,
    recordable: bool,
}

/// Fans the bridge texture out to registered surfaces.
///
/// Surfaces are drawn in registration order. A surface that has been
/// released is skipped but stays registered until removed, so it can be
/// replaced under the same id.
pub struct Distributor {
    surfaces: Mutex<Vec<RegisteredSurface>>,
    on_published: PublishHook,
}

impl Distributor {
    pub fn new(on_published: PublishHook) -> Self {
        Self {
            surfaces: Mutex::new(Vec::new()),
            on_published,
        }
    }

    /// Register `sink` under `id`, replacing any surface with that id.
    pub fn add_surface(&self, id: u32, sink: Arc<dyn FrameSink>, recordable: bool) {
        let mut surfaces = self.surfaces.lock();
        let entry = RegisteredSurface {
            id,
            sink,
            recordable,
        };
        match surfaces.iter_mut().find(|surface| surface.id == id) {
            Some(existing) => {
                *existing = entry;
                debug!(id, recordable, "Surface replaced");
            }
            None => {
                surfaces.push(entry);
                debug!(id, recordable, "Surface added");
            }
        }
    }

    /// Returns false if no surface had `id`.
    pub fn remove_surface(&self, id: u32) -> bool {
        let mut surfaces = self.surfaces.lock();
        let before = surfaces.len();
        surfaces.retain(|surface| surface.id != id);
        let removed = surfaces.len() != before;
        if removed {
            debug!(id, "Surface removed");
        }
        removed
    }

    pub fn surface_ids(&self) -> Vec<u32> {
        self.surfaces.lock().iter().map(|surface| surface.id).collect()
    }

    /// Ids of surfaces registered as recording targets.
    pub fn recordable_ids(&self) -> Vec<u32> {
        self.surfaces
            .lock()
            .iter()
            .filter(|surface| surface.recordable)
            .map(|surface| surface.id)
            .collect()
    }
}

impl FrameConsumer for Distributor {
    fn on_frame(&self, ctx: &dyn GpuContext, frame: &FrameSnapshot) {
        let surfaces = self.surfaces.lock().clone();
        for surface in &surfaces {
            if !surface.sink.is_valid() {
                trace!(id = surface.id, "Skipping released surface");
                continue;
            }
            if let Err(e) = ctx.draw_texture(frame.texture, &frame.matrix, surface.sink.as_ref()) {
                warn!(id = surface.id, error = %e, "Failed to draw into surface");
            }
        }
        (self.on_published)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camfeed_capture::{CaptureTimestamp, CapturedFrame};
    use camfeed_gpu::{GpuManager, HeadlessGpu, Mat4};
    use camfeed_ipc::Size;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct CountingSink {
        frames: AtomicU64,
        released: std::sync::atomic::AtomicBool,
    }

    impl FrameSink for CountingSink {
        fn queue_frame(&self, _frame: CapturedFrame) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }

        fn set_default_buffer_size(&self, _size: Size) {}

        fn is_valid(&self) -> bool {
            !self.released.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_replace_and_remove() {
        let distributor = Distributor::new(Box::new(|| {}));
        distributor.add_surface(1, Arc::new(CountingSink::default()), false);
        distributor.add_surface(2, Arc::new(CountingSink::default()), true);
        distributor.add_surface(1, Arc::new(CountingSink::default()), false);
        assert_eq!(distributor.surface_ids(), vec![1, 2]);
        assert_eq!(distributor.recordable_ids(), vec![2]);
        assert!(distributor.remove_surface(2));
        assert!(!distributor.remove_surface(2));
        assert_eq!(distributor.surface_ids(), vec![1]);
    }

    #[test]
    fn test_draws_into_valid_surfaces_then_publishes() {
        let gpu = HeadlessGpu::new();
        let manager = GpuManager::new(gpu.context(), "distributor-test").unwrap();
        let published = Arc::new(AtomicU64::new(0));
        let hook = Arc::clone(&published);
        let distributor = Arc::new(Distributor::new(Box::new(move || {
            hook.fetch_add(1, Ordering::SeqCst);
        })));

        let live = Arc::new(CountingSink::default());
        let released = Arc::new(CountingSink::default());
        released.released.store(true, Ordering::SeqCst);
        distributor.add_surface(1, live.clone(), false);
        distributor.add_surface(2, released.clone(), true);

        let (tx, rx) = crossbeam_channel::bounded(1);
        let consumer = Arc::clone(&distributor);
        manager
            .post(move |ctx| {
                // Latch one frame into a texture the way the bridge would.
                let texture = ctx.create_external_texture().unwrap();
                let surface = ctx.create_producer_surface(texture, Size::new(4, 4)).unwrap();
                surface.queue_frame(CapturedFrame::test_pattern(
                    Size::new(4, 4),
                    CaptureTimestamp::now(Instant::now()),
                    1,
                ));
                surface.update_tex_image().unwrap();
                let snapshot = FrameSnapshot {
                    texture,
                    matrix: Mat4::IDENTITY,
                    timestamp_ns: 0,
                    generation: 0,
                };
                consumer.on_frame(ctx, &snapshot);
                tx.send(()).unwrap();
            })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        assert_eq!(live.frames.load(Ordering::SeqCst), 1);
        assert_eq!(released.frames.load(Ordering::SeqCst), 0);
        assert_eq!(published.load(Ordering::SeqCst), 1);
    }
}
