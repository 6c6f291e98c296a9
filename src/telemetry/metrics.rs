//! Metrics collection for scheduler monitoring.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Scheduler metrics collector
#[derive(Debug)]
pub struct Metrics {
    // Task counters
    body_calls: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_canceled: AtomicU64,
    tasks_panicked: AtomicU64,
    slow_bodies: AtomicU64,
    forced_runs: AtomicU64,

    // Body latency histogram (protected by RwLock for interior mutability)
    body_histogram: RwLock<Histogram<u64>>,

    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        // 3 significant figures, max value of 1 hour in nanoseconds
        let histogram = Histogram::new_with_max(3_600_000_000_000, 3)
            .expect("histogram bounds are constant and valid");

        Self {
            body_calls: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_canceled: AtomicU64::new(0),
            tasks_panicked: AtomicU64::new(0),
            slow_bodies: AtomicU64::new(0),
            forced_runs: AtomicU64::new(0),
            body_histogram: RwLock::new(histogram),
            start_time: Instant::now(),
        }
    }

    /// Record one `body` call with its duration
    pub fn record_body(&self, duration_ns: u64) {
        self.body_calls.fetch_add(1, Ordering::Relaxed);

        if let Some(mut hist) = self.body_histogram.try_write() {
            let _ = hist.record(duration_ns.min(3_600_000_000_000));
        }
    }

    pub fn record_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_canceled(&self) {
        self.tasks_canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.tasks_panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slow_body(&self) {
        self.slow_bodies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forced_run(&self) {
        self.forced_runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let histogram = self.body_histogram.read();

        MetricsSnapshot {
            uptime: self.start_time.elapsed(),
            body_calls: self.body_calls.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_canceled: self.tasks_canceled.load(Ordering::Relaxed),
            tasks_panicked: self.tasks_panicked.load(Ordering::Relaxed),
            slow_bodies: self.slow_bodies.load(Ordering::Relaxed),
            forced_runs: self.forced_runs.load(Ordering::Relaxed),
            avg_body_ns: if histogram.len() > 0 {
                histogram.mean() as u64
            } else {
                0
            },
            p50_body_ns: histogram.value_at_quantile(0.50),
            p99_body_ns: histogram.value_at_quantile(0.99),
            max_body_ns: histogram.max(),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.body_calls.store(0, Ordering::Relaxed);
        self.tasks_completed.store(0, Ordering::Relaxed);
        self.tasks_canceled.store(0, Ordering::Relaxed);
        self.tasks_panicked.store(0, Ordering::Relaxed);
        self.slow_bodies.store(0, Ordering::Relaxed);
        self.forced_runs.store(0, Ordering::Relaxed);

        self.body_histogram.write().reset();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub uptime: Duration,
    pub body_calls: u64,
    pub tasks_completed: u64,
    pub tasks_canceled: u64,
    pub tasks_panicked: u64,
    pub slow_bodies: u64,
    pub forced_runs: u64,
    pub avg_body_ns: u64,
    pub p50_body_ns: u64,
    pub p99_body_ns: u64,
    pub max_body_ns: u64,
}

impl MetricsSnapshot {
    /// Body calls per second since the collector was created
    pub fn bodies_per_second(&self) -> f64 {
        let seconds = self.uptime.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.body_calls as f64 / seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_basic() {
        let metrics = Metrics::new();

        metrics.record_body(1000);
        metrics.record_body(2000);
        metrics.record_completed();
        metrics.record_forced_run();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.body_calls, 2);
        assert_eq!(snapshot.tasks_completed, 1);
        assert_eq!(snapshot.forced_runs, 1);
        assert!(snapshot.avg_body_ns > 0);
        assert!(snapshot.max_body_ns >= 2000);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = Metrics::new();

        metrics.record_body(1000);
        metrics.record_panic();
        assert_eq!(metrics.snapshot().body_calls, 1);

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.body_calls, 0);
        assert_eq!(snapshot.tasks_panicked, 0);
        assert_eq!(snapshot.avg_body_ns, 0);
    }

    #[test]
    fn test_bodies_per_second() {
        let snapshot = MetricsSnapshot {
            uptime: Duration::from_secs(2),
            body_calls: 10,
            ..Default::default()
        };
        assert_eq!(snapshot.bodies_per_second(), 5.0);
    }
}
