//! Periodic connectivity probing.
//!
//! One background task per monitored manager, on a tokio interval. Each
//! probe is awaited before the next tick is taken, so a slow check skips
//! ticks instead of overlapping itself.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use polystore_core::ConnectionManager;

#[derive(Debug, Default)]
struct HealthState {
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    probes: AtomicU64,
    last_latency_us: AtomicU64,
}

/// Point-in-time view of the monitor's counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub probes: u64,
    pub last_latency_ms: f64,
}

/// Handle to a running health monitor. Dropping it stops the task.
pub struct HealthMonitor {
    state: Arc<HealthState>,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    /// Probe `manager` every `interval`, skipping ticks that land while a
    /// probe is still in flight.
    pub fn spawn(manager: Arc<dyn ConnectionManager>, interval: Duration) -> Self {
        let state = Arc::new(HealthState::default());
        let task_state = Arc::clone(&state);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let result = manager.test_connection().await;
                task_state.probes.fetch_add(1, Ordering::Relaxed);
                task_state
                    .last_latency_us
                    .store((result.latency_ms * 1000.0) as u64, Ordering::Relaxed);
                if result.success {
                    task_state.healthy.store(true, Ordering::Relaxed);
                    task_state.consecutive_failures.store(0, Ordering::Relaxed);
                    debug!(
                        engine = %manager.engine(),
                        latency_ms = result.latency_ms,
                        "health probe ok"
                    );
                } else {
                    task_state.healthy.store(false, Ordering::Relaxed);
                    let failures = task_state
                        .consecutive_failures
                        .fetch_add(1, Ordering::Relaxed)
                        + 1;
                    warn!(
                        engine = %manager.engine(),
                        consecutive_failures = failures,
                        error = result.error.as_deref().unwrap_or("unknown"),
                        "health probe failed"
                    );
                }
            }
        });

        Self { state, handle }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            healthy: self.state.healthy.load(Ordering::Relaxed),
            consecutive_failures: self.state.consecutive_failures.load(Ordering::Relaxed),
            probes: self.state.probes.load(Ordering::Relaxed),
            last_latency_ms: self.state.last_latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
