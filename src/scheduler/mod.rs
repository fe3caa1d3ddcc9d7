//! Job scheduling: lifecycle, priority dispatch and retries.
//!
//! This module provides the job side of trainforge:
//!
//! - **TrainingJob**: a request to train one model, with its status machine
//! - **DispatchQueue**: in-process priority queue with global and per-tenant
//!   concurrency caps
//! - **TrainingOrchestrator**: validates and queues jobs, runs the dispatch
//!   loops and is the only writer of job status
//! - **RetryPolicy**: exponential backoff for transient failures
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │    Client    │
//!                      │  (API/CLI)   │
//!                      └──────┬───────┘
//!                             │ create_job
//!                      ┌──────▼───────┐      ┌──────────────┐
//!                      │ Orchestrator ├─────►│  Job store   │
//!                      └──────┬───────┘  CAS └──────────────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │DispatchQueue │  priority, then age
//!                      └──────┬───────┘
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │Dispatch 1│        │Dispatch 2│        │Dispatch N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └──────────► TrainingPipeline / HpOptimizer
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use trainforge::scheduler::{JobPriority, TrainingOrchestrator};
//! use std::time::Duration;
//!
//! let orchestrator = TrainingOrchestrator::new(store, pipeline, config);
//! orchestrator.recover().await?;
//! orchestrator.start().await?;
//!
//! let job_id = orchestrator
//!     .create_job("t1", "forecast", config_json, JobPriority::Normal)
//!     .await?;
//! let job = orchestrator.wait_for(job_id, Duration::from_secs(600)).await?;
//!
//! // Graceful shutdown
//! orchestrator.shutdown().await?;
//! ```

pub mod backoff;
pub mod job;
pub mod orchestrator;
pub mod queue;

pub use backoff::RetryPolicy;
pub use job::{
    parse_timestamp, HpoSettings, JobEvent, JobEventKind, JobId, JobPriority, JobStatus,
    SplitRatios, TrainingJob, TrainingSpec, RETRY_OF_TAG,
};
pub use orchestrator::{OrchestratorStats, RecoveryReport, TrainingOrchestrator};
pub use queue::{DispatchQueue, QueueEntry, QueueStats};
