//! Training pipeline: dataset retrieval through model registration.
//!
//! This module provides the staged pipeline every job and every HPO trial
//! runs through:
//!
//! 1. **Load**: fetch the dataset for the job's feature set and date range
//!    from the [`FeatureStore`]
//! 2. **Preprocess**: chronological split and feature standardization
//! 3. **Train**: in-process gradient descent, or a distributed fit through
//!    the [`DistributedTrainer`](crate::distributed::DistributedTrainer) when
//!    several workers are requested or the dataset is large
//! 4. **Evaluate**: MAE / RMSE / MAPE / R² on the test split
//! 5. **Register**: store the artifact in the [`ModelRegistry`] and return
//!    its `tenant:model_name:version` id
//!
//! # Example
//!
//! ```rust,ignore
//! use trainforge::pipeline::{NoopProgress, PipelineRun, RunTarget};
//!
//! let outcome = pipeline
//!     .run(PipelineRun { target: RunTarget::Job(job_id), ..run }, &NoopProgress, &token)
//!     .await?;
//! println!("registered {:?} with {:?}", outcome.model_id, outcome.metrics);
//! ```

pub mod dataset;
pub mod evaluation;
pub mod external;
pub mod model;
pub mod runner;

pub use dataset::{prepare, Dataset, FeatureRow, PreparedData, Split, StandardScaler};
pub use evaluation::{evaluate, Metrics};
pub use external::{
    checksum, model_id, FeatureStore, InMemoryFeatureStore, InMemoryModelRegistry, ModelRegistry,
    RegisterModel, RegisteredModel, SyntheticFeatureStore,
};
pub use model::{
    fit_partition, GradientDescentTrainer, LinearModel, ModelArtifact, ModelTrainer, TrainParams,
};
pub use runner::{
    EpochObserver, NoopProgress, PipelineOutcome, PipelineRun, PipelineStats, ProgressSink,
    RunTarget, Stage, TrainingPipeline, TrialContext,
};
