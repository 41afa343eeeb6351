//! Upload metrics
//!
//! Lock-free counters and gauges shared by the worker pool. Gauges keep a
//! high-water mark so the concurrency and scratch-space bounds can be
//! checked after a run.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counter metric (monotonically increasing)
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by delta
    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down) with a high-water mark
#[derive(Default)]
pub struct Gauge {
    value: AtomicI64,
    peak: AtomicI64,
}

impl Gauge {
    /// Create a new gauge
    pub const fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
            peak: AtomicI64::new(0),
        }
    }

    /// Add delta, updating the peak
    pub fn add(&self, delta: i64) {
        let now = self.value.fetch_add(delta, Ordering::SeqCst) + delta;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    /// Subtract delta
    pub fn sub(&self, delta: i64) {
        self.value.fetch_sub(delta, Ordering::SeqCst);
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.add(1);
    }

    /// Decrement by 1
    pub fn dec(&self) {
        self.sub(1);
    }

    /// Get current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Highest value observed since creation
    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Metrics for one upload run
pub struct UploadMetrics {
    pub segments_uploaded: Counter,
    pub segments_failed: Counter,
    pub bytes_uploaded: Counter,
    /// Workers currently holding a pool slot
    pub active_workers: Gauge,
    /// Bytes of segment scratch files currently on disk
    pub scratch_bytes: Gauge,
}

impl UploadMetrics {
    pub const fn new() -> Self {
        Self {
            segments_uploaded: Counter::new(),
            segments_failed: Counter::new(),
            bytes_uploaded: Counter::new(),
            active_workers: Gauge::new(),
            scratch_bytes: Gauge::new(),
        }
    }

    /// Point-in-time copy of all values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            segments_uploaded: self.segments_uploaded.get(),
            segments_failed: self.segments_failed.get(),
            bytes_uploaded: self.bytes_uploaded.get(),
            peak_active_workers: self.active_workers.peak().max(0) as u64,
            peak_scratch_bytes: self.scratch_bytes.peak().max(0) as u64,
        }
    }
}

impl Default for UploadMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain values captured from [`UploadMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub segments_uploaded: u64,
    pub segments_failed: u64,
    pub bytes_uploaded: u64,
    pub peak_active_workers: u64,
    pub peak_scratch_bytes: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} segments uploaded ({} bytes), {} failed, peak {} workers, peak {} scratch bytes",
            self.segments_uploaded,
            self.bytes_uploaded,
            self.segments_failed,
            self.peak_active_workers,
            self.peak_scratch_bytes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge_peak() {
        let gauge = Gauge::new();
        gauge.inc();
        gauge.inc();
        gauge.inc();
        gauge.dec();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
        assert_eq!(gauge.peak(), 3);

        gauge.add(10);
        gauge.sub(10);
        assert_eq!(gauge.get(), 1);
        assert_eq!(gauge.peak(), 11);
    }

    #[test]
    fn test_snapshot() {
        let metrics = UploadMetrics::new();
        metrics.segments_uploaded.inc();
        metrics.bytes_uploaded.inc_by(42);
        metrics.active_workers.inc();
        metrics.active_workers.dec();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.segments_uploaded, 1);
        assert_eq!(snapshot.bytes_uploaded, 42);
        assert_eq!(snapshot.peak_active_workers, 1);
        assert_eq!(snapshot.segments_failed, 0);
    }
}
