//! Job definitions for the scheduler.
//!
//! This module defines the core job types used by the orchestrator:
//!
//! - `TrainingJob`: A request to train one model, with its lifecycle state
//! - `JobStatus`: The lifecycle state machine
//! - `JobPriority`: Ordered dispatch priority
//! - `TrainingSpec`: The validated, typed view of a job's opaque config blob
//! - `JobEvent`: Entries of a job's event log

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TrainingError;
use crate::hpo::{Direction, Params, PrunerKind, SamplerKind, SearchSpace};
use crate::pipeline::Metrics;

/// Identifier of a training job.
pub type JobId = Uuid;

/// Tag key linking a retry job to the job it was created from.
pub const RETRY_OF_TAG: &str = "retry_of";

/// Default number of trials for HPO-backed jobs.
const DEFAULT_HPO_TRIALS: usize = 20;

/// Lifecycle state of a training job.
///
/// `CREATED → QUEUED → RUNNING → {COMPLETED, FAILED, CANCELLED}`; a QUEUED
/// job may also be cancelled directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Created, JobStatus::Queued)
                | (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub const ALL: [JobStatus; 6] = [
        JobStatus::Created,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TrainingError::Validation(format!("unknown job status '{}'", s)))
    }
}

/// Dispatch priority. Higher variants are dispatched first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl JobPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(JobPriority::Low),
            "normal" => Ok(JobPriority::Normal),
            "high" => Ok(JobPriority::High),
            "urgent" => Ok(JobPriority::Urgent),
            other => Err(TrainingError::Validation(format!(
                "unknown priority '{}'",
                other
            ))),
        }
    }
}

/// A request to train a single model, plus its externally visible state.
///
/// Only the orchestrator mutates the status of a stored job. `version` is
/// bumped on every persisted write and used for compare-and-set updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJob {
    pub job_id: JobId,
    pub tenant_id: String,
    pub model_type: String,
    pub model_name: String,
    /// Opaque configuration blob as submitted.
    pub config: serde_json::Value,
    pub status: JobStatus,
    pub priority: JobPriority,
    /// Fraction complete in `[0.0, 1.0]`.
    pub progress: f64,
    pub metrics: Option<Metrics>,
    pub error_message: Option<String>,
    pub result_model_id: Option<String>,
    /// Automatic retries performed for transient failures.
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub version: u64,
}

impl TrainingJob {
    /// Creates a new job in the CREATED state.
    pub fn new(
        tenant_id: impl Into<String>,
        model_type: impl Into<String>,
        model_name: impl Into<String>,
        config: serde_json::Value,
        priority: JobPriority,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            model_type: model_type.into(),
            model_name: model_name.into(),
            config,
            status: JobStatus::Created,
            priority,
            progress: 0.0,
            metrics: None,
            error_message: None,
            result_model_id: None,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            tags: BTreeMap::new(),
            version: 0,
        }
    }

    /// Sets the job's tags.
    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    /// Returns the job this one retries, if any.
    pub fn retry_of(&self) -> Option<JobId> {
        self.tags
            .get(RETRY_OF_TAG)
            .and_then(|id| Uuid::parse_str(id).ok())
    }

    /// Returns how long the job has been running, or ran.
    pub fn run_duration(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.completed_at.unwrap_or_else(Utc::now) - started)
    }
}

/// Kind of an entry in a job's event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Status,
    Progress,
    Retry,
    Cancel,
    Error,
}

impl JobEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobEventKind::Status => "status",
            JobEventKind::Progress => "progress",
            JobEventKind::Retry => "retry",
            JobEventKind::Cancel => "cancel",
            JobEventKind::Error => "error",
        }
    }
}

impl FromStr for JobEventKind {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(JobEventKind::Status),
            "progress" => Ok(JobEventKind::Progress),
            "retry" => Ok(JobEventKind::Retry),
            "cancel" => Ok(JobEventKind::Cancel),
            "error" => Ok(JobEventKind::Error),
            other => Err(TrainingError::Validation(format!(
                "unknown event kind '{}'",
                other
            ))),
        }
    }
}

/// One entry of a job's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub at: DateTime<Utc>,
    pub kind: JobEventKind,
    pub message: String,
}

impl JobEvent {
    pub fn new(kind: JobEventKind, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            kind,
            message: message.into(),
        }
    }

    pub fn status(from: JobStatus, to: JobStatus) -> Self {
        Self::new(JobEventKind::Status, format!("{} -> {}", from, to))
    }
}

/// Train/validation/test fractions. Splits are chronological.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitRatios {
    pub train: f64,
    pub validation: f64,
    pub test: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.7,
            validation: 0.15,
            test: 0.15,
        }
    }
}

impl SplitRatios {
    fn validate(&self) -> Result<(), TrainingError> {
        let parts = [self.train, self.validation, self.test];
        if parts.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(TrainingError::Validation(
                "split ratios must all be positive".to_string(),
            ));
        }
        let total: f64 = parts.iter().sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(TrainingError::Validation(format!(
                "split ratios must sum to 1.0, got {:.3}",
                total
            )));
        }
        Ok(())
    }
}

/// Search settings for jobs that carry a `search_space`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpoSettings {
    #[serde(default)]
    pub sampler: SamplerKind,
    #[serde(default)]
    pub pruner: PrunerKind,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default = "default_hpo_trials")]
    pub n_trials: usize,
    #[serde(default = "default_parallel")]
    pub n_parallel: usize,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_objective_metric")]
    pub objective_metric: String,
}

impl Default for HpoSettings {
    fn default() -> Self {
        Self {
            sampler: SamplerKind::default(),
            pruner: PrunerKind::default(),
            direction: Direction::default(),
            n_trials: DEFAULT_HPO_TRIALS,
            n_parallel: 1,
            timeout_secs: None,
            objective_metric: default_objective_metric(),
        }
    }
}

fn default_hpo_trials() -> usize {
    DEFAULT_HPO_TRIALS
}

fn default_parallel() -> usize {
    1
}

fn default_objective_metric() -> String {
    crate::hpo::study::DEFAULT_OBJECTIVE.to_string()
}

#[derive(Debug, Default, Deserialize)]
struct RawDateRange {
    start: Option<String>,
    end: Option<String>,
}

/// Loose view of the config blob; every field is optional here so that
/// missing fields produce validation errors instead of serde errors.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    feature_set: Option<String>,
    #[serde(alias = "target_variable")]
    target: Option<String>,
    #[serde(alias = "start_date")]
    start: Option<String>,
    #[serde(alias = "end_date")]
    end: Option<String>,
    date_range: Option<RawDateRange>,
    asset_ids: Option<Vec<String>>,
    horizon: Option<u32>,
    split: Option<SplitRatios>,
    #[serde(default)]
    hyperparameters: Params,
    n_workers: Option<usize>,
    model_name: Option<String>,
    search_space: Option<SearchSpace>,
    hpo: Option<HpoSettings>,
    timeout_secs: Option<u64>,
}

/// Typed, validated view of a job's config blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSpec {
    pub feature_set: String,
    pub target: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub asset_ids: Option<Vec<String>>,
    pub horizon: Option<u32>,
    pub split: SplitRatios,
    pub hyperparameters: Params,
    pub n_workers: Option<usize>,
    pub model_name: Option<String>,
    pub search_space: Option<SearchSpace>,
    pub hpo: HpoSettings,
    pub timeout_secs: Option<u64>,
}

impl TrainingSpec {
    /// Parses and validates a config blob for the given model type.
    ///
    /// Required: `feature_set`, a non-empty `start`/`end` date range, and a
    /// target variable. Forecast models default their target to `target`.
    pub fn from_config(model_type: &str, config: &serde_json::Value) -> Result<Self, TrainingError> {
        if model_type.trim().is_empty() {
            return Err(TrainingError::Validation(
                "model_type cannot be empty".to_string(),
            ));
        }
        if !config.is_object() {
            return Err(TrainingError::Validation(
                "config must be a JSON object".to_string(),
            ));
        }

        let raw: RawConfig = serde_json::from_value(config.clone())
            .map_err(|e| TrainingError::Validation(format!("malformed config: {}", e)))?;

        let feature_set = non_empty(raw.feature_set, "feature_set")?;

        let target = match raw.target {
            Some(target) => non_empty(Some(target), "target")?,
            None => default_target(model_type)
                .map(str::to_string)
                .ok_or_else(|| missing("target"))?,
        };

        let range = raw.date_range.unwrap_or_default();
        let start = raw.start.or(range.start).ok_or_else(|| missing("start"))?;
        let end = raw.end.or(range.end).ok_or_else(|| missing("end"))?;
        let start = parse_timestamp(&start, "start")?;
        let end = parse_timestamp(&end, "end")?;
        if end <= start {
            return Err(TrainingError::Validation(format!(
                "date range is empty or inverted: {} .. {}",
                start, end
            )));
        }

        let split = raw.split.unwrap_or_default();
        split.validate()?;

        if raw.n_workers == Some(0) {
            return Err(TrainingError::Validation(
                "n_workers must be at least 1".to_string(),
            ));
        }

        if let Some(space) = &raw.search_space {
            space.validate()?;
        }

        let hpo = raw.hpo.unwrap_or_default();
        if hpo.n_trials == 0 || hpo.n_parallel == 0 {
            return Err(TrainingError::Validation(
                "hpo n_trials and n_parallel must be at least 1".to_string(),
            ));
        }

        if raw.timeout_secs == Some(0) {
            return Err(TrainingError::Validation(
                "timeout_secs must be positive".to_string(),
            ));
        }

        let spec = Self {
            feature_set,
            target,
            start,
            end,
            asset_ids: raw.asset_ids,
            horizon: raw.horizon,
            split,
            hyperparameters: raw.hyperparameters,
            n_workers: raw.n_workers,
            model_name: raw.model_name.filter(|n| !n.trim().is_empty()),
            search_space: raw.search_space,
            hpo,
            timeout_secs: raw.timeout_secs,
        };
        crate::pipeline::TrainParams::validate_overrides(&spec.hyperparameters)?;
        Ok(spec)
    }

    /// Whether the job is executed as a hyperparameter search.
    pub fn is_hpo(&self) -> bool {
        self.search_space.is_some()
    }
}

fn default_target(model_type: &str) -> Option<&'static str> {
    match model_type {
        "forecast" => Some("target"),
        _ => None,
    }
}

fn missing(field: &str) -> TrainingError {
    TrainingError::Validation(format!("missing required field '{}'", field))
}

fn non_empty(value: Option<String>, field: &str) -> Result<String, TrainingError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(missing(field)),
    }
}

/// Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>, TrainingError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| {
            TrainingError::Validation(format!("field '{}' is not a date: '{}'", field, value))
        })
}
