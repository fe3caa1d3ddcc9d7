//! Distributed training over an in-process worker pool.
//!
//! This module provides the pieces the training stage uses when a fit is too
//! large, or explicitly requested, to run on a single worker:
//!
//! - **WorkerPool**: Node inventory and leasing; the only writer of node state
//! - **DistributedBackend**: Where partition subtasks run (`LocalBackend`,
//!   `PoolBackend`)
//! - **AggregationStrategy**: How partition models are merged
//!   (`ParameterAveraging`, `BestOfPartitions`)
//! - **DistributedTrainer**: Partitions the data, dispatches subtasks, retries
//!   failed partitions on other workers and aggregates the result
//!
//! # Architecture
//!
//! ```text
//!                 ┌─────────────────────┐
//!                 │ DistributedTrainer  │
//!                 └─────────┬───────────┘
//!                           │ one subtask per partition
//!          ┌────────────────┼────────────────┐
//!          ▼                ▼                ▼
//!     ┌─────────┐      ┌─────────┐      ┌─────────┐
//!     │worker-0 │      │worker-1 │      │worker-N │
//!     └────┬────┘      └────┬────┘      └────┬────┘
//!          └──── epoch reports / partial models ───┘
//!                           │
//!                  AggregationStrategy
//! ```
//!
//! # Failure handling
//!
//! A subtask whose worker becomes unreachable fails with
//! `TrainingError::WorkerUnavailable`. The trainer resubmits that partition
//! with the failed worker excluded, up to `partition_retries` times, and then
//! gives up with a retryable `WorkerUnavailable` so the orchestrator can
//! retry the whole job with backoff.

pub mod aggregation;
pub mod backend;
pub mod trainer;
pub mod worker_pool;

pub use aggregation::{strategy_for, AggregationStrategy, BestOfPartitions, ParameterAveraging};
pub use backend::{
    DistributedBackend, EpochReport, LocalBackend, PartialModel, PoolBackend, Subtask,
    SubtaskHandle,
};
pub use trainer::{partition_bounds, DistributedOutcome, DistributedRequest, DistributedTrainer};
pub use worker_pool::{
    PoolStatus, Resources, WorkerLease, WorkerNode, WorkerPool, WorkerStatus,
};
