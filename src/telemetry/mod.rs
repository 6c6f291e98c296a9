//! Telemetry for the task pool.
//!
//! Counters and a body-latency histogram, fed by every executor. The slow-task
//! warning itself is logged by the executor; this module only counts it.

#[cfg(feature = "telemetry")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub use metrics::{Metrics, MetricsSnapshot};

// Stub implementations when telemetry is disabled
#[cfg(not(feature = "telemetry"))]
pub mod metrics {
    use std::time::Duration;

    #[derive(Debug, Clone, Default)]
    pub struct Metrics;

    impl Metrics {
        pub fn new() -> Self { Self }
        pub fn record_body(&self, _: u64) {}
        pub fn record_completed(&self) {}
        pub fn record_canceled(&self) {}
        pub fn record_panic(&self) {}
        pub fn record_slow_body(&self) {}
        pub fn record_forced_run(&self) {}
        pub fn snapshot(&self) -> MetricsSnapshot { MetricsSnapshot::default() }
        pub fn reset(&self) {}
    }

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
        pub fn bodies_per_second(&self) -> f64 { 0.0 }
    }
}

#[cfg(not(feature = "telemetry"))]
pub use metrics::{Metrics, MetricsSnapshot};
