//! Metrics collectors for recording trainforge events.
//!
//! Recording methods are no-ops until [`init_metrics`](super::init_metrics)
//! has been called.

use super::prometheus::{
    BUSY_WORKERS, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, JOB_RETRIES, QUEUE_DEPTH,
    TRIALS_TOTAL,
};

/// Records orchestrator, optimizer and worker-pool metrics.
///
/// # Example
///
/// ```ignore
/// use trainforge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_job("completed", "forecast", 42.0);
/// collector.record_trial("pruned", "tpe");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a job reaching a terminal state.
    ///
    /// # Arguments
    ///
    /// * `status` - Terminal status (`completed`, `failed`, `cancelled`)
    /// * `model_type` - The job's model type
    /// * `duration_secs` - Run time, zero for jobs that never ran
    pub fn record_job(&self, status: &str, model_type: &str, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[status, model_type]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[model_type])
                .observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            model_type = model_type,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    pub fn record_job_retry(&self, model_type: &str) {
        if let Some(retries) = JOB_RETRIES.get() {
            retries.with_label_values(&[model_type]).inc();
        }
    }

    /// Record a finished HPO trial.
    pub fn record_trial(&self, state: &str, sampler: &str) {
        if let Some(trials_total) = TRIALS_TOTAL.get() {
            trials_total.with_label_values(&[state, sampler]).inc();
        }

        tracing::trace!(state = state, sampler = sampler, "Recorded trial metric");
    }

    pub fn update_queue_depth(&self, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.set(depth as f64);
        }
    }

    pub fn update_jobs_in_progress(&self, count: usize) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.set(count as f64);
        }
    }

    pub fn update_busy_workers(&self, count: usize) {
        if let Some(busy_workers) = BUSY_WORKERS.get() {
            busy_workers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated busy workers metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_job_and_trial() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_job("completed", "forecast", 12.5);
        collector.record_job("failed", "forecast", 3.0);
        collector.record_job_retry("forecast");
        collector.record_trial("complete", "tpe");
        collector.record_trial("pruned", "random");

        let text = export_metrics();
        assert!(text.contains("trainforge_jobs_total") || text.starts_with("# Metrics"));
    }

    #[test]
    fn test_gauges() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_queue_depth(7);
        collector.update_jobs_in_progress(2);
        collector.update_busy_workers(3);
    }
}
