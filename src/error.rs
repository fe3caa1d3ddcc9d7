//! Error types for trainforge operations.
//!
//! Defines the error taxonomy shared by every subsystem:
//! - Job and study validation
//! - Dataset retrieval and training failures
//! - Worker availability (the only transient class)
//! - Lifecycle violations and unknown identifiers
//! - Persistence

use thiserror::Error;

/// Convenience result alias used across the crate.
pub type Result<T, E = TrainingError> = std::result::Result<T, E>;

/// Errors surfaced by the orchestrator, the pipeline, the distributed
/// trainer and the hyperparameter optimizer.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// Bad job or study configuration. Rejected before anything is queued.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Empty or malformed dataset returned by the feature store.
    #[error("Data error: {0}")]
    Data(String),

    /// No worker could run the work, or a worker dropped it.
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Algorithm-level failure while fitting or evaluating a model.
    #[error("Training failed: {0}")]
    Training(String),

    /// A job or study exceeded its allotted time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Operation is illegal for the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unknown job, study or trial.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Cooperative cancellation was observed at a checkpoint.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The pruner stopped a trial early.
    #[error("Trial pruned at step {step}")]
    Pruned { step: usize },

    /// Feature store or model registry failure.
    #[error("External service error: {message}")]
    External { message: String, transient: bool },

    /// Persistence failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl TrainingError {
    /// Builds a `NotFound` error for the given record kind.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Returns whether the orchestrator should retry the job with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            TrainingError::WorkerUnavailable(_) => true,
            TrainingError::External { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Short machine-readable label, used for metrics and event logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TrainingError::Validation(_) => "validation",
            TrainingError::Data(_) => "data",
            TrainingError::WorkerUnavailable(_) => "worker_unavailable",
            TrainingError::Training(_) => "training",
            TrainingError::Timeout(_) => "timeout",
            TrainingError::InvalidState(_) => "invalid_state",
            TrainingError::NotFound { .. } => "not_found",
            TrainingError::Cancelled(_) => "cancelled",
            TrainingError::Pruned { .. } => "pruned",
            TrainingError::External { .. } => "external",
            TrainingError::Storage(_) => "storage",
        }
    }
}

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Query execution failed.
    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// Serialization/deserialization of a JSON column failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be mapped back to a domain type.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint was violated.
    #[error("Conflict: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(TrainingError::WorkerUnavailable("node-1 unreachable".into()).is_retryable());
        assert!(TrainingError::External {
            message: "registry 503".into(),
            transient: true
        }
        .is_retryable());

        assert!(!TrainingError::External {
            message: "registry rejected artifact".into(),
            transient: false
        }
        .is_retryable());
        assert!(!TrainingError::Validation("missing target".into()).is_retryable());
        assert!(!TrainingError::Data("zero rows".into()).is_retryable());
        assert!(!TrainingError::Training("diverged".into()).is_retryable());
        assert!(!TrainingError::Timeout("study".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = TrainingError::not_found("job", "abc");
        assert_eq!(err.to_string(), "job 'abc' not found");

        let err = TrainingError::Pruned { step: 3 };
        assert!(err.to_string().contains('3'));

        let err = TrainingError::from(StoreError::NotFound("job 1".into()));
        assert!(err.to_string().contains("Storage error"));
        assert_eq!(err.kind(), "storage");
    }
}
