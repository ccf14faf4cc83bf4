//! Frame-available observers.

use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

/// Handle returned when an observer is registered.
pub type ListenerId = u64;

/// What an observer reports back. An error removes the observer.
pub type ListenerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Notified after every frame the pipeline publishes.
///
/// Called on the bridge's GPU thread, so implementations should return
/// quickly. Returning an error or panicking removes the observer.
pub trait FrameListener: Send + Sync {
    fn on_frame_available(&self) -> ListenerResult;
}

impl<F> FrameListener for F
where
    F: Fn() -> ListenerResult + Send + Sync,
{
    fn on_frame_available(&self) -> ListenerResult {
        self()
    }
}

/// The registered observers.
#[derive(Default)]
pub struct FrameListeners {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn FrameListener>)>>,
}

impl FrameListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn FrameListener>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.listeners.lock().push((id, listener));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Notify every observer and drop the ones that failed.
    ///
    /// A failing observer does not stop delivery to the others. Returns the
    /// ids that were removed.
    pub fn call_on_frame_available(&self) -> Vec<ListenerId> {
        // Observers may add or remove observers while being notified.
        let snapshot = self.listeners.lock().clone();
        let mut failed = Vec::new();
        for (id, listener) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| listener.on_frame_available())) {
                Ok(Ok(())) => trace!(id, "Listener notified"),
                Ok(Err(e)) => {
                    warn!(id, error = %e, "Frame listener failed, removing it");
                    failed.push(id);
                }
                Err(_) => {
                    warn!(id, "Frame listener panicked, removing it");
                    failed.push(id);
                }
            }
        }
        if !failed.is_empty() {
            self.listeners
                .lock()
                .retain(|(id, _)| !failed.contains(id));
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> (Arc<AtomicU64>, Arc<dyn FrameListener>) {
        let count = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&count);
        let listener: Arc<dyn FrameListener> = Arc::new(move || -> ListenerResult {
            seen.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        (count, listener)
    }

    #[test]
    fn test_failing_listeners_are_removed() {
        let listeners = FrameListeners::new();
        let (first, listener) = counter();
        listeners.add(listener);
        let failing = listeners.add(Arc::new(|| -> ListenerResult { Err("boom".into()) }));
        let panicking = listeners.add(Arc::new(|| -> ListenerResult { panic!("listener panic") }));
        let (last, listener) = counter();
        listeners.add(listener);

        let removed = listeners.call_on_frame_available();
        assert_eq!(removed, vec![failing, panicking]);
        assert_eq!(listeners.len(), 2);
        assert_eq!(first.load(Ordering::Relaxed), 1);
        assert_eq!(last.load(Ordering::Relaxed), 1);

        assert!(listeners.call_on_frame_available().is_empty());
        assert_eq!(first.load(Ordering::Relaxed), 2);
        assert_eq!(last.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_remove_by_id() {
        let listeners = FrameListeners::new();
        let (count, listener) = counter();
        let id = listeners.add(listener);
        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        assert!(listeners.is_empty());
        listeners.call_on_frame_available();
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }
}
