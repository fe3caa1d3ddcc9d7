//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by trainforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all trainforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs that reached a terminal state, labeled by status and model type.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall-clock run time of finished jobs in seconds, labeled by model type.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Automatic retries of transient job failures, labeled by model type.
pub static JOB_RETRIES: OnceLock<CounterVec> = OnceLock::new();

/// Number of jobs waiting for dispatch.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of jobs currently RUNNING.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Finished HPO trials, labeled by state and sampler.
pub static TRIALS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of busy worker nodes.
pub static BUSY_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup; later calls replace the registry and are harmless.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("trainforge_jobs_total", "Jobs that reached a terminal state"),
        &["status", "model_type"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "trainforge_job_duration_seconds",
            "Job run time in seconds",
        )
        .buckets(vec![1.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
        &["model_type"],
    )?;

    let job_retries = CounterVec::new(
        Opts::new(
            "trainforge_job_retries_total",
            "Automatic retries of transient job failures",
        ),
        &["model_type"],
    )?;

    // Dispatch metrics
    let queue_depth = Gauge::new("trainforge_queue_depth", "Jobs waiting for dispatch")?;
    let jobs_in_progress = Gauge::new("trainforge_jobs_in_progress", "Jobs currently running")?;

    // HPO metrics
    let trials_total = CounterVec::new(
        Opts::new("trainforge_trials_total", "Finished HPO trials"),
        &["state", "sampler"],
    )?;

    // Worker metrics
    let busy_workers = Gauge::new("trainforge_busy_workers", "Busy worker nodes")?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(job_retries.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(trials_total.clone()))?;
    registry.register(Box::new(busy_workers.clone()))?;

    // Already-set statics keep their first instance.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = JOB_RETRIES.set(job_retries);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = TRIALS_TOTAL.set(trials_total);
    let _ = BUSY_WORKERS.set(busy_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of failing when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(jobs) = JOBS_TOTAL.get() {
            jobs.with_label_values(&["completed", "forecast"]).inc();
        }
        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        assert!(!metrics.starts_with("# Error"));
    }
}
