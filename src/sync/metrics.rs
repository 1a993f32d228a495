//! # Sync Metrics
//!
//! Counters for reconciliation cycles run by the background service.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct SyncMetrics {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    /// Writes applied or replayed remotely
    pub writes_synced: u64,
    pub writes_deferred: u64,
    pub writes_dead_lettered: u64,
    pub average_sync_duration: Duration,
    pub last_sync_duration: Option<Duration>,
    last_sync_start: Option<Instant>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sync_start(&mut self) {
        self.last_sync_start = Some(Instant::now());
        self.total_syncs += 1;
    }

    pub fn record_sync_success(&mut self, synced: usize, deferred: usize, dead_lettered: usize) {
        self.writes_synced += synced as u64;
        self.writes_deferred += deferred as u64;
        self.writes_dead_lettered += dead_lettered as u64;
        if let Some(start) = self.last_sync_start.take() {
            let duration = start.elapsed();
            self.last_sync_duration = Some(duration);
            self.successful_syncs += 1;

            // Rolling average
            let count = u32::try_from(self.successful_syncs).unwrap_or(u32::MAX);
            let total = self.average_sync_duration * (count - 1) + duration;
            self.average_sync_duration = total / count;
        }
    }

    pub fn record_sync_failure(&mut self) {
        self.last_sync_start = None;
        self.failed_syncs += 1;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_syncs == 0 {
            0.0
        } else {
            self.successful_syncs as f64 / self.total_syncs as f64
        }
    }
}
