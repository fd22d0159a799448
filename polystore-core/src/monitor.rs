//! Operation duration tracking.
//!
//! A bounded in-memory log of recent operations with on-demand windowed
//! statistics. Nothing is pushed anywhere; an external collector polls
//! [`PerformanceMonitor::stats`] or [`PerformanceMonitor::slow_operations`].

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 1000;
const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_secs(1);

/// One recorded operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub operation: String,
    pub duration: Duration,
    pub at: DateTime<Utc>,
    pub success: bool,
}

/// Aggregate over a time window.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PerformanceStats {
    pub total_operations: usize,
    pub average_duration: Duration,
    pub error_rate: f64,
    pub slow_operations: usize,
}

/// Records operation durations and flags slow ones.
pub struct PerformanceMonitor {
    records: Mutex<VecDeque<OperationRecord>>,
    capacity: usize,
    slow_threshold: Duration,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::with(DEFAULT_CAPACITY, DEFAULT_SLOW_THRESHOLD)
    }

    pub fn with(capacity: usize, slow_threshold: Duration) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
            slow_threshold,
        }
    }

    /// Record one operation. Keeps the most recent `capacity` records.
    pub fn record(&self, operation: &str, duration: Duration, success: bool) {
        if duration >= self.slow_threshold {
            warn!(
                operation,
                duration_ms = duration.as_millis() as u64,
                "slow database operation"
            );
        }

        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(OperationRecord {
            operation: operation.to_string(),
            duration,
            at: Utc::now(),
            success,
        });
    }

    /// Aggregate statistics over the trailing window.
    pub fn stats(&self, window: Duration) -> PerformanceStats {
        let cutoff = Utc::now() - window;
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        let recent: Vec<&OperationRecord> = records.iter().filter(|r| r.at >= cutoff).collect();
        if recent.is_empty() {
            return PerformanceStats::default();
        }

        let total = recent.len();
        let failures = recent.iter().filter(|r| !r.success).count();
        let slow = recent
            .iter()
            .filter(|r| r.duration >= self.slow_threshold)
            .count();
        let sum: Duration = recent.iter().map(|r| r.duration).sum();

        PerformanceStats {
            total_operations: total,
            average_duration: sum / total as u32,
            error_rate: failures as f64 / total as f64,
            slow_operations: slow,
        }
    }

    /// Recent operations slower than `threshold`, slowest first.
    pub fn slow_operations(&self, window: Duration, threshold: Duration) -> Vec<OperationRecord> {
        let cutoff = Utc::now() - window;
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        let mut slow: Vec<OperationRecord> = records
            .iter()
            .filter(|r| r.at >= cutoff && r.duration >= threshold)
            .cloned()
            .collect();
        slow.sort_by(|a, b| b.duration.cmp(&a.duration));
        slow
    }

    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_over_window() {
        let monitor = PerformanceMonitor::new();
        monitor.record("get_all", Duration::from_millis(10), true);
        monitor.record("get_all", Duration::from_millis(30), true);
        monitor.record("add", Duration::from_millis(20), false);

        let stats = monitor.stats(Duration::from_secs(60));
        assert_eq!(stats.total_operations, 3);
        assert_eq!(stats.average_duration, Duration::from_millis(20));
        assert!((stats.error_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.slow_operations, 0);
    }

    #[test]
    fn slow_operations_sorted_descending() {
        let monitor = PerformanceMonitor::with(100, Duration::from_millis(50));
        monitor.record("a", Duration::from_millis(60), true);
        monitor.record("b", Duration::from_millis(120), true);
        monitor.record("c", Duration::from_millis(10), true);

        let slow = monitor.slow_operations(Duration::from_secs(60), Duration::from_millis(50));
        assert_eq!(slow.len(), 2);
        assert_eq!(slow[0].operation, "b");
        assert_eq!(slow[1].operation, "a");
    }

    #[test]
    fn ring_is_bounded() {
        let monitor = PerformanceMonitor::with(3, Duration::from_secs(1));
        for i in 0..5 {
            monitor.record(&format!("op{i}"), Duration::from_millis(1), true);
        }
        let stats = monitor.stats(Duration::from_secs(60));
        assert_eq!(stats.total_operations, 3);
    }

    #[test]
    fn clear_resets() {
        let monitor = PerformanceMonitor::new();
        monitor.record("a", Duration::from_millis(1), true);
        monitor.clear();
        assert_eq!(monitor.stats(Duration::from_secs(60)).total_operations, 0);
    }
}
