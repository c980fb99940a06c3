//! # Worker Metrics
//!
//! Counters for what the worker has done since it started. They are owned by the
//! queue loop (no locking needed) and only ever reported through the log.

use std::time::Instant;

#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Jobs accepted by `enqueue`
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    /// Cancelled jobs, whether pending or running
    pub cancelled: u64,
    /// Enqueue requests refused before a record was created
    pub rejected: u64,
    /// Inbound lines that were not valid control messages
    pub malformed_lines: u64,
    started_at: Instant,
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self {
            enqueued: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            rejected: 0,
            malformed_lines: 0,
            started_at: Instant::now(),
        }
    }
}

impl WorkerMetrics {
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Jobs that reached a terminal state.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }

    /// Share of finished jobs that failed (0.0 to 1.0).
    pub fn failure_rate(&self) -> f64 {
        match self.finished() {
            0 => 0.0,
            n => self.failed as f64 / n as f64,
        }
    }
}
