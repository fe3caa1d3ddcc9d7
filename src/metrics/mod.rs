//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for job dispatch,
//! job outcomes, HPO trials and worker utilisation.
//!
//! # Example
//!
//! ```ignore
//! use trainforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics()?;
//!
//! // Record a finished job
//! MetricsCollector::new().record_job("completed", "forecast", 120.5);
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    BUSY_WORKERS, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, JOB_RETRIES, QUEUE_DEPTH, REGISTRY,
    TRIALS_TOTAL,
};
