//! Metrics collection and reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use camfeed_gpu::BridgeStats;
use camfeed_ipc::PipelineMetrics;
use parking_lot::RwLock;

/// Collects pipeline counters.
///
/// Frame counters live where the frames flow (bridge, renderer); the
/// collector combines them into a [`PipelineMetrics`] snapshot and tracks
/// the rate between reports.
pub struct MetricsCollector {
    start_time: Instant,
    listener_removals: AtomicU64,
    last_report_time: RwLock<Instant>,
    last_materialized: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            listener_removals: AtomicU64::new(0),
            last_report_time: RwLock::new(now),
            last_materialized: AtomicU64::new(0),
        }
    }

    /// Record observers dropped from the fan-out.
    pub fn record_listener_removals(&self, count: u64) {
        self.listener_removals.fetch_add(count, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self, bridge: BridgeStats, frames_rendered: u64) -> PipelineMetrics {
        let now = Instant::now();

        let elapsed = now.duration_since(*self.last_report_time.read());
        let last_materialized = self.last_materialized.load(Ordering::Relaxed);
        let fps = if elapsed.as_secs_f32() > 0.0 {
            bridge.materialized.saturating_sub(last_materialized) as f32 / elapsed.as_secs_f32()
        } else {
            0.0
        };

        PipelineMetrics {
            frames_notified: bridge.notified,
            frames_materialized: bridge.materialized,
            frames_coalesced: bridge.coalesced,
            frames_rendered,
            listener_removals: self.listener_removals.load(Ordering::Relaxed),
            fps,
            uptime_seconds: now.duration_since(self.start_time).as_secs(),
        }
    }

    /// Update last report time for FPS calculation.
    pub fn mark_reported(&self, materialized: u64) {
        *self.last_report_time.write() = Instant::now();
        self.last_materialized.store(materialized, Ordering::Relaxed);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_snapshot_combines_counters() {
        let metrics = MetricsCollector::new();
        metrics.record_listener_removals(2);
        let bridge = BridgeStats {
            notified: 10,
            materialized: 4,
            coalesced: 6,
        };
        let snapshot = metrics.snapshot(bridge, 3);
        assert_eq!(snapshot.frames_notified, 10);
        assert_eq!(snapshot.frames_materialized, 4);
        assert_eq!(snapshot.frames_coalesced, 6);
        assert_eq!(snapshot.frames_rendered, 3);
        assert_eq!(snapshot.listener_removals, 2);
    }

    #[test]
    fn test_fps_counts_since_last_report() {
        let metrics = MetricsCollector::new();
        metrics.mark_reported(100);
        thread::sleep(Duration::from_millis(20));
        let bridge = BridgeStats {
            materialized: 100,
            ..Default::default()
        };
        assert_eq!(metrics.snapshot(bridge, 0).fps, 0.0);
        let bridge = BridgeStats {
            materialized: 101,
            ..Default::default()
        };
        assert!(metrics.snapshot(bridge, 0).fps > 0.0);
    }
}
