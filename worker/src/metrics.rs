//! Metrics for the execution worker
//!
//! Log-based: every measurement is a structured `tracing` event under the
//! `contra_exec::metrics` target, so any subscriber can aggregate them. Job and
//! error totals are also kept in process counters shared by all clones.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Metrics collector for the execution worker
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    jobs: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record how long a pipeline stage took
    pub fn record_stage(&self, stage: &str, elapsed: Duration) {
        info!(
            target: "contra_exec::metrics",
            stage = %stage,
            duration_ms = elapsed.as_millis() as u64,
            "Recorded stage duration"
        );
    }

    /// Record a finished job
    pub fn record_job(&self, status: &str, elapsed: Duration, artifact: bool) {
        self.jobs.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "contra_exec::metrics",
            status = %status,
            duration_ms = elapsed.as_millis() as u64,
            artifact,
            "Recorded job"
        );
    }

    /// Record a processing error
    pub fn record_error(&self, error_code: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "contra_exec::metrics",
            error_code = %error_code,
            "Recorded error"
        );
    }

    pub fn jobs_recorded(&self) -> u64 {
        self.jobs.load(Ordering::Relaxed)
    }

    pub fn errors_recorded(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();
        metrics.record_stage("unpacking", Duration::from_millis(12));
        metrics.record_job("done", Duration::from_secs(3), true);
        metrics.record_error("JOB_RETRIEVAL_ERROR");

        let shared = metrics.clone();
        shared.record_error("JOB_FILESYSTEM_ERROR");
        assert_eq!(metrics.jobs_recorded(), 1);
        assert_eq!(metrics.errors_recorded(), 2);
    }
}
