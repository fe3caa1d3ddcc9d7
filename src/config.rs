//! Runtime configuration for the orchestrator and its subsystems.
//!
//! Every section has sensible defaults, a builder-style API and can be
//! overridden from `TRAINFORGE_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while building configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Relative weight of each pipeline stage in the reported progress.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageWeights {
    pub load: f64,
    pub preprocess: f64,
    pub train: f64,
    pub evaluate: f64,
    pub register: f64,
}

impl Default for StageWeights {
    fn default() -> Self {
        Self {
            load: 0.20,
            preprocess: 0.20,
            train: 0.30,
            evaluate: 0.15,
            register: 0.15,
        }
    }
}

impl StageWeights {
    /// Sum of all weights. Valid configurations sum to 1.0.
    pub fn total(&self) -> f64 {
        self.load + self.preprocess + self.train + self.evaluate + self.register
    }
}

/// Settings for the five-stage training pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Progress weight per stage.
    pub stage_weights: StageWeights,
    /// Datasets with more training rows than this are trained distributed.
    pub distributed_row_threshold: usize,
    /// Epochs used when the job does not specify any.
    pub default_epochs: usize,
    /// Learning rate used when the job does not specify one.
    pub default_learning_rate: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_weights: StageWeights::default(),
            distributed_row_threshold: 100_000,
            default_epochs: 20,
            default_learning_rate: 0.05,
        }
    }
}

/// How partial models from partitions are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    /// Row-weighted mean of the partition weights.
    Average,
    /// Keep the partition with the lowest validation loss.
    Best,
}

/// Settings for distributed training and the in-process worker pool.
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    /// Number of in-process worker nodes.
    pub num_workers: usize,
    /// CPU units per worker node.
    pub worker_cpu: u32,
    /// Memory (MB) per worker node.
    pub worker_memory_mb: u64,
    /// GPUs per worker node.
    pub worker_gpu: u32,
    /// Times a failed partition is retried on another worker.
    pub partition_retries: u32,
    /// Merge policy for partition results.
    pub aggregation: AggregationKind,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            worker_cpu: 4,
            worker_memory_mb: 8192,
            worker_gpu: 0,
            partition_retries: 2,
            aggregation: AggregationKind::Average,
        }
    }
}

/// Defaults for hyperparameter search.
#[derive(Debug, Clone)]
pub struct HpoConfig {
    /// Concurrent trials when a caller does not specify any.
    pub default_parallelism: usize,
    /// Completed trials required before the median pruner acts.
    pub median_startup_trials: usize,
    /// Steps ignored by the median pruner at the start of each trial.
    pub median_warmup_steps: usize,
    /// Random trials before TPE starts modelling.
    pub tpe_startup_trials: usize,
    /// Fraction of trials TPE treats as "good".
    pub tpe_gamma: f64,
    /// Grid resolution for continuous parameters.
    pub grid_points: usize,
    /// Smallest rung budget for Hyperband.
    pub hyperband_min_resource: usize,
    /// Successive-halving reduction factor.
    pub hyperband_reduction_factor: usize,
}

impl Default for HpoConfig {
    fn default() -> Self {
        Self {
            default_parallelism: 1,
            median_startup_trials: 1,
            median_warmup_steps: 0,
            tpe_startup_trials: 10,
            tpe_gamma: 0.25,
            grid_points: 5,
            hyperband_min_resource: 1,
            hyperband_reduction_factor: 3,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Dispatch settings
    /// Maximum number of simultaneously RUNNING jobs.
    pub max_concurrent_jobs: usize,
    /// Optional cap on RUNNING jobs per tenant.
    pub max_jobs_per_tenant: Option<usize>,
    /// Number of concurrent dispatch loops.
    pub dispatch_workers: usize,
    /// Idle wake-up interval of a dispatch loop.
    pub poll_interval: Duration,

    // Retry settings
    /// Automatic retries for transient failures.
    pub max_retries: u32,
    /// Delay before the first retry; doubles each attempt.
    pub retry_base_delay: Duration,
    /// Upper bound for the retry delay.
    pub retry_max_delay: Duration,

    // Storage
    /// sqlx SQLite URL.
    pub database_url: String,

    // Subsystems
    pub pipeline: PipelineConfig,
    pub distributed: DistributedConfig,
    pub hpo: HpoConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            max_jobs_per_tenant: None,
            dispatch_workers: 2,
            poll_interval: Duration::from_secs(1),

            max_retries: 3,
            retry_base_delay: Duration::from_secs(60),
            retry_max_delay: Duration::from_secs(240),

            database_url: "sqlite::memory:".to_string(),

            pipeline: PipelineConfig::default(),
            distributed: DistributedConfig::default(),
            hpo: HpoConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TRAINFORGE_MAX_CONCURRENT_JOBS` (default: 4)
    /// - `TRAINFORGE_MAX_JOBS_PER_TENANT` (default: unlimited)
    /// - `TRAINFORGE_DISPATCH_WORKERS` (default: 2)
    /// - `TRAINFORGE_POLL_INTERVAL_MS` (default: 1000)
    /// - `TRAINFORGE_MAX_RETRIES` (default: 3)
    /// - `TRAINFORGE_RETRY_BASE_DELAY_SECS` (default: 60)
    /// - `TRAINFORGE_RETRY_MAX_DELAY_SECS` (default: 240)
    /// - `TRAINFORGE_DATABASE_URL` (default: sqlite::memory:)
    /// - `TRAINFORGE_DISTRIBUTED_ROW_THRESHOLD` (default: 100000)
    /// - `TRAINFORGE_DEFAULT_EPOCHS` (default: 20)
    /// - `TRAINFORGE_NUM_WORKERS` (default: 4)
    /// - `TRAINFORGE_PARTITION_RETRIES` (default: 2)
    /// - `TRAINFORGE_AGGREGATION` (`average` | `best`, default: average)
    /// - `TRAINFORGE_HPO_PARALLELISM` (default: 1)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(val) = env("TRAINFORGE_MAX_CONCURRENT_JOBS") {
            config.max_concurrent_jobs = parse_env_value(&val, "TRAINFORGE_MAX_CONCURRENT_JOBS")?;
        }

        if let Some(val) = env("TRAINFORGE_MAX_JOBS_PER_TENANT") {
            config.max_jobs_per_tenant =
                Some(parse_env_value(&val, "TRAINFORGE_MAX_JOBS_PER_TENANT")?);
        }

        if let Some(val) = env("TRAINFORGE_DISPATCH_WORKERS") {
            config.dispatch_workers = parse_env_value(&val, "TRAINFORGE_DISPATCH_WORKERS")?;
        }

        if let Some(val) = env("TRAINFORGE_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "TRAINFORGE_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Some(val) = env("TRAINFORGE_MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "TRAINFORGE_MAX_RETRIES")?;
        }

        if let Some(val) = env("TRAINFORGE_RETRY_BASE_DELAY_SECS") {
            let secs: u64 = parse_env_value(&val, "TRAINFORGE_RETRY_BASE_DELAY_SECS")?;
            config.retry_base_delay = Duration::from_secs(secs);
        }

        if let Some(val) = env("TRAINFORGE_RETRY_MAX_DELAY_SECS") {
            let secs: u64 = parse_env_value(&val, "TRAINFORGE_RETRY_MAX_DELAY_SECS")?;
            config.retry_max_delay = Duration::from_secs(secs);
        }

        if let Some(val) = env("TRAINFORGE_DATABASE_URL") {
            config.database_url = val;
        }

        if let Some(val) = env("TRAINFORGE_DISTRIBUTED_ROW_THRESHOLD") {
            config.pipeline.distributed_row_threshold =
                parse_env_value(&val, "TRAINFORGE_DISTRIBUTED_ROW_THRESHOLD")?;
        }

        if let Some(val) = env("TRAINFORGE_DEFAULT_EPOCHS") {
            config.pipeline.default_epochs = parse_env_value(&val, "TRAINFORGE_DEFAULT_EPOCHS")?;
        }

        if let Some(val) = env("TRAINFORGE_NUM_WORKERS") {
            config.distributed.num_workers = parse_env_value(&val, "TRAINFORGE_NUM_WORKERS")?;
        }

        if let Some(val) = env("TRAINFORGE_PARTITION_RETRIES") {
            config.distributed.partition_retries =
                parse_env_value(&val, "TRAINFORGE_PARTITION_RETRIES")?;
        }

        if let Some(val) = env("TRAINFORGE_AGGREGATION") {
            config.distributed.aggregation = match val.to_lowercase().as_str() {
                "average" | "avg" => AggregationKind::Average,
                "best" => AggregationKind::Best,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "TRAINFORGE_AGGREGATION".to_string(),
                        message: format!("expected 'average' or 'best', got '{}'", other),
                    })
                }
            };
        }

        if let Some(val) = env("TRAINFORGE_HPO_PARALLELISM") {
            config.hpo.default_parallelism = parse_env_value(&val, "TRAINFORGE_HPO_PARALLELISM")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_jobs must be greater than 0".to_string(),
            ));
        }

        if self.max_jobs_per_tenant == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_jobs_per_tenant must be greater than 0 when set".to_string(),
            ));
        }

        if self.dispatch_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "dispatch_workers must be greater than 0".to_string(),
            ));
        }

        if self.retry_base_delay > self.retry_max_delay {
            return Err(ConfigError::ValidationFailed(
                "retry_base_delay cannot exceed retry_max_delay".to_string(),
            ));
        }

        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if (self.pipeline.stage_weights.total() - 1.0).abs() > 1e-6 {
            return Err(ConfigError::ValidationFailed(format!(
                "stage weights must sum to 1.0, got {:.3}",
                self.pipeline.stage_weights.total()
            )));
        }

        if self.pipeline.default_epochs == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_epochs must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.default_learning_rate <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "default_learning_rate must be positive".to_string(),
            ));
        }

        if self.distributed.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.hpo.default_parallelism == 0 {
            return Err(ConfigError::ValidationFailed(
                "hpo default_parallelism must be greater than 0".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.hpo.tpe_gamma) || self.hpo.tpe_gamma == 0.0 {
            return Err(ConfigError::ValidationFailed(
                "tpe_gamma must be in (0.0, 1.0)".to_string(),
            ));
        }

        if self.hpo.hyperband_reduction_factor < 2 {
            return Err(ConfigError::ValidationFailed(
                "hyperband_reduction_factor must be at least 2".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the global concurrency cap.
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    /// Builder method to set the per-tenant concurrency cap.
    pub fn with_max_jobs_per_tenant(mut self, max: usize) -> Self {
        self.max_jobs_per_tenant = Some(max);
        self
    }

    /// Builder method to set the number of dispatch loops.
    pub fn with_dispatch_workers(mut self, workers: usize) -> Self {
        self.dispatch_workers = workers;
        self
    }

    /// Builder method to set the dispatch poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the retry policy.
    pub fn with_retry_policy(mut self, max_retries: u32, base: Duration, max: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to replace the pipeline section.
    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Builder method to replace the distributed section.
    pub fn with_distributed(mut self, distributed: DistributedConfig) -> Self {
        self.distributed = distributed;
        self
    }

    /// Builder method to replace the HPO section.
    pub fn with_hpo(mut self, hpo: HpoConfig) -> Self {
        self.hpo = hpo;
        self
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.max_jobs_per_tenant, None);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_delay, Duration::from_secs(60));
        assert_eq!(config.retry_max_delay, Duration::from_secs(240));
        assert_eq!(config.database_url, "sqlite::memory:");
        assert!((config.pipeline.stage_weights.total() - 1.0).abs() < 1e-9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = OrchestratorConfig::new()
            .with_max_concurrent_jobs(8)
            .with_max_jobs_per_tenant(2)
            .with_dispatch_workers(3)
            .with_retry_policy(1, Duration::from_millis(10), Duration::from_millis(40))
            .with_database_url("sqlite://jobs.db");

        assert_eq!(config.max_concurrent_jobs, 8);
        assert_eq!(config.max_jobs_per_tenant, Some(2));
        assert_eq!(config.dispatch_workers, 3);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.database_url, "sqlite://jobs.db");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_concurrency() {
        let err = OrchestratorConfig::default()
            .with_max_concurrent_jobs(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("max_concurrent_jobs"));
    }

    #[test]
    fn test_validation_zero_tenant_cap() {
        let err = OrchestratorConfig::default()
            .with_max_jobs_per_tenant(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("max_jobs_per_tenant"));
    }

    #[test]
    fn test_validation_stage_weights() {
        let mut pipeline = PipelineConfig::default();
        pipeline.stage_weights.train = 0.9;
        let err = OrchestratorConfig::default()
            .with_pipeline(pipeline)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("stage weights"));
    }

    #[test]
    fn test_validation_retry_delays() {
        let err = OrchestratorConfig::default()
            .with_retry_policy(3, Duration::from_secs(10), Duration::from_secs(1))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("retry_base_delay"));
    }

    #[test]
    fn test_parse_env_value() {
        let v: usize = parse_env_value(" 12 ", "KEY").unwrap();
        assert_eq!(v, 12);

        let err = parse_env_value::<usize>("twelve", "KEY").unwrap_err();
        assert!(err.to_string().contains("KEY"));
        assert!(err.to_string().contains("twelve"));
    }
}
