//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics so recording never blocks the control loop. All atomics
//! use Relaxed ordering intentionally; these are statistical counters
//! only, never used for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tracing::info;

/// Counter set for the node. Periodic counters reset on `report()`,
/// totals are monotonic.
pub struct Metrics {
    detections_total: AtomicU64,
    detections_since_report: AtomicU64,
    denials_total: AtomicU64,
    debounced_total: AtomicU64,
    pulses_total: AtomicU64,
    publish_failures_total: AtomicU64,
    remote_commands_total: AtomicU64,
    zone_changes_total: AtomicU64,
    last_report_time: Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            detections_total: AtomicU64::new(0),
            detections_since_report: AtomicU64::new(0),
            denials_total: AtomicU64::new(0),
            debounced_total: AtomicU64::new(0),
            pulses_total: AtomicU64::new(0),
            publish_failures_total: AtomicU64::new(0),
            remote_commands_total: AtomicU64::new(0),
            zone_changes_total: AtomicU64::new(0),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    /// Record a non-suppressed card detection
    #[inline]
    pub fn record_detection(&self, allowed: bool) {
        self.detections_total.fetch_add(1, Ordering::Relaxed);
        self.detections_since_report.fetch_add(1, Ordering::Relaxed);
        if !allowed {
            self.denials_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a detection suppressed by the debounce window
    #[inline]
    pub fn record_debounced(&self) {
        self.debounced_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an actuator pulse
    #[inline]
    pub fn record_pulse(&self) {
        self.pulses_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a publish that failed even after the reconnect retry
    #[inline]
    pub fn record_publish_failure(&self) {
        self.publish_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a remote command received on the bus
    #[inline]
    pub fn record_remote_command(&self) {
        self.remote_commands_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a proximity zone transition
    #[inline]
    pub fn record_zone_change(&self) {
        self.zone_changes_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn detections_total(&self) -> u64 {
        self.detections_total.load(Ordering::Relaxed)
    }

    /// Snapshot the counters and reset the periodic ones.
    pub fn report(&self) -> MetricsSummary {
        let detections_count = self.detections_since_report.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock().unwrap_or_else(|e| e.into_inner());
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let detections_per_min = if elapsed.as_secs_f64() > 0.0 {
            detections_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            detections_total: self.detections_total.load(Ordering::Relaxed),
            detections_per_min,
            denials_total: self.denials_total.load(Ordering::Relaxed),
            debounced_total: self.debounced_total.load(Ordering::Relaxed),
            pulses_total: self.pulses_total.load(Ordering::Relaxed),
            publish_failures_total: self.publish_failures_total.load(Ordering::Relaxed),
            remote_commands_total: self.remote_commands_total.load(Ordering::Relaxed),
            zone_changes_total: self.zone_changes_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub detections_total: u64,
    pub detections_per_min: f64,
    pub denials_total: u64,
    pub debounced_total: u64,
    pub pulses_total: u64,
    pub publish_failures_total: u64,
    pub remote_commands_total: u64,
    pub zone_changes_total: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            detections_total = %self.detections_total,
            detections_per_min = format!("{:.1}", self.detections_per_min),
            denials = %self.denials_total,
            debounced = %self.debounced_total,
            pulses = %self.pulses_total,
            publish_failures = %self.publish_failures_total,
            remote_commands = %self.remote_commands_total,
            zone_changes = %self.zone_changes_total,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.detections_total(), 0);
    }

    #[test]
    fn test_record_detection_counts_denials() {
        let metrics = Metrics::new();
        metrics.record_detection(true);
        metrics.record_detection(false);
        metrics.record_detection(false);

        let summary = metrics.report();
        assert_eq!(summary.detections_total, 3);
        assert_eq!(summary.denials_total, 2);
    }

    #[test]
    fn test_report_resets_periodic_counters() {
        let metrics = Metrics::new();
        metrics.record_detection(true);
        metrics.record_pulse();

        let first = metrics.report();
        assert_eq!(first.detections_total, 1);
        assert_eq!(first.pulses_total, 1);

        let second = metrics.report();
        // Totals are monotonic; the per-interval rate starts over.
        assert_eq!(second.detections_total, 1);
        assert_eq!(metrics.detections_since_report.load(Ordering::Relaxed), 0);
    }
}
