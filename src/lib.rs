//! trainforge: training job orchestration with hyperparameter search.
//!
//! This library schedules model training jobs by priority, runs them through
//! a staged training pipeline (locally or sharded over a worker pool) and
//! drives hyperparameter studies with pluggable samplers and pruners.

pub mod cli;
pub mod config;
pub mod distributed;
pub mod error;
pub mod hpo;
pub mod metrics;
pub mod pipeline;
pub mod runtime;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, OrchestratorConfig};
pub use error::{Result, StoreError, TrainingError};
pub use runtime::Runtime;
