//! Hyperparameter optimization.
//!
//! A study owns a search space, a sampler, a pruner and an objective. The
//! [`HpOptimizer`] runs trials through the training pipeline:
//!
//! - **Samplers** ([`sampler`]): TPE (default), random, grid
//! - **Pruners** ([`pruner`]): median (default), Hyperband, none
//! - **Studies** ([`study`]): persisted study and trial records; trials move
//!   from RUNNING to exactly one of COMPLETE, PRUNED or FAIL
//!
//! # Example
//!
//! ```rust,ignore
//! use trainforge::hpo::{HpOptimizer, OptimizeOptions, StudySpec};
//!
//! let study_id = optimizer.create_study(spec).await?;
//! let outcome = optimizer
//!     .optimize(study_id, OptimizeOptions::new().with_parallelism(4))
//!     .await?;
//! println!("best {:?} with {:?}", outcome.best_trial.params, outcome.study.best_value);
//! ```

pub mod optimizer;
pub mod pruner;
pub mod sampler;
pub mod space;
pub mod study;

pub use optimizer::{HpOptimizer, OptimizeOptions, StudyOutcome};
pub use pruner::{HyperbandPruner, MedianPruner, NopPruner, Pruner, PrunerKind};
pub use sampler::{GridSampler, RandomSampler, Sampler, SamplerKind, TpeSampler};
pub use space::{ParamDomain, ParamValue, Params, SearchSpace};
pub use study::{Direction, HpoStudy, StudyId, StudySpec, StudyStatus, Trial, TrialState};
