//! Process-wide request statistics.
//!
//! One aggregator is created at startup and shared through `AppState`. All
//! counters live behind a single mutex so each update is atomic as a whole.

use serde::Serialize;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ServerStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Seconds, summed over completed requests.
    pub total_processing_time: f64,
}

/// Point-in-time view with derived figures.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    #[serde(flatten)]
    pub counters: ServerStats,
    pub startup_time: f64,
    pub uptime_seconds: f64,
    /// Mean over requests that recorded an outcome.
    pub avg_processing_time: f64,
    /// Percentage of all requests that succeeded.
    pub success_rate: f64,
}

#[derive(Debug)]
pub struct StatsAggregator {
    started: Instant,
    startup_time: f64,
    inner: Mutex<ServerStats>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            startup_time: unix_now(),
            inner: Mutex::new(ServerStats::default()),
        }
    }

    /// Count a request as soon as it arrives, before any admission check.
    pub fn record_attempt(&self) {
        let mut stats = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        stats.total_requests += 1;
    }

    /// Record the terminal outcome of a request that reached the engine.
    pub fn record_outcome(&self, success: bool, elapsed_seconds: f64) {
        let mut stats = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if success {
            stats.successful_requests += 1;
        } else {
            stats.failed_requests += 1;
        }
        stats.total_processing_time += elapsed_seconds.max(0.0);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = *self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let completed = counters.successful_requests + counters.failed_requests;
        let avg_processing_time = if completed > 0 {
            counters.total_processing_time / completed as f64
        } else {
            0.0
        };
        let success_rate = if counters.total_requests > 0 {
            counters.successful_requests as f64 / counters.total_requests as f64 * 100.0
        } else {
            0.0
        };

        StatsSnapshot {
            counters,
            startup_time: self.startup_time,
            uptime_seconds: round_to(self.uptime_seconds(), 2),
            avg_processing_time,
            success_rate,
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
