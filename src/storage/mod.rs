//! Persistent state for jobs, studies, trials and worker nodes.
//!
//! This module provides the storage ports the orchestrator, the optimizer and
//! the worker pool persist through, plus two implementations.
//!
//! # Overview
//!
//! - **JobStore**: Job records with compare-and-set updates, and the per-job
//!   event log
//! - **StudyStore**: HPO studies and their trials
//! - **WorkerNodeStore**: Snapshots of worker node state
//! - **MemoryStore**: `tokio::sync::RwLock`-backed maps, for tests and
//!   single-process runs
//! - **SqliteStore**: sqlx-backed SQLite storage with schema bootstrap
//!
//! # Usage
//!
//! ```rust,ignore
//! use trainforge::storage::{JobFilter, JobStore, SqliteStore};
//!
//! let store = SqliteStore::connect("sqlite://trainforge.db").await?;
//! store.insert_job(&job).await?;
//!
//! let filter = JobFilter::new().with_tenant("t1").with_page(1, 20);
//! let (jobs, total) = store.list_jobs(&filter).await?;
//! ```
//!
//! # Compare-and-set
//!
//! `update_job` succeeds only if the stored record's `version` is exactly one
//! less than the version being written. Callers bump `version` before
//! writing and treat `Ok(false)` as a lost race.

pub mod database;
pub mod memory;
pub mod schema;

use async_trait::async_trait;

use crate::distributed::WorkerNode;
use crate::error::StoreError;
use crate::hpo::{HpoStudy, StudyId, Trial};
use crate::scheduler::{JobEvent, JobId, JobStatus, TrainingJob};

pub use database::SqliteStore;
pub use memory::MemoryStore;

/// Default page size for job listings.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Filter and pagination for job listings. Set filters are combined with
/// logical AND; results are ordered by `created_at` descending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub tenant_id: Option<String>,
    pub status: Option<JobStatus>,
    pub model_type: Option<String>,
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            tenant_id: None,
            status: None,
            model_type: None,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl JobFilter {
    /// Creates a filter matching every job.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_model_type(mut self, model_type: impl Into<String>) -> Self {
        self.model_type = Some(model_type.into());
        self
    }

    /// Sets the page (1-based) and page size. Zero values are raised to 1.
    pub fn with_page(mut self, page: u32, page_size: u32) -> Self {
        self.page = page.max(1);
        self.page_size = page_size.max(1);
        self
    }

    /// Rows to skip for the current page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.page_size)
    }

    /// Returns whether `job` passes the filters (pagination aside).
    pub fn matches(&self, job: &TrainingJob) -> bool {
        self.tenant_id.as_ref().is_none_or(|t| &job.tenant_id == t)
            && self.status.is_none_or(|s| job.status == s)
            && self
                .model_type
                .as_ref()
                .is_none_or(|m| &job.model_type == m)
    }
}

/// Job records and event logs.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &TrainingJob) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<TrainingJob>, StoreError>;

    /// Returns one page of matching jobs and the total number of matches.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<TrainingJob>, u64), StoreError>;

    /// Writes `job` if the stored version is `job.version - 1`. Returns
    /// `Ok(false)` when another writer got there first.
    async fn update_job(&self, job: &TrainingJob) -> Result<bool, StoreError>;

    /// Jobs in `status`, oldest first.
    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<TrainingJob>, StoreError>;

    async fn append_event(&self, job_id: JobId, event: &JobEvent) -> Result<(), StoreError>;

    /// Events in the order they were appended.
    async fn job_events(&self, job_id: JobId) -> Result<Vec<JobEvent>, StoreError>;
}

/// Studies and trials.
#[async_trait]
pub trait StudyStore: Send + Sync {
    /// Fails with `StoreError::Conflict` if the tenant already has a study
    /// with the same name.
    async fn insert_study(&self, study: &HpoStudy) -> Result<(), StoreError>;

    async fn get_study(&self, study_id: StudyId) -> Result<Option<HpoStudy>, StoreError>;

    async fn find_study(&self, tenant_id: &str, name: &str)
        -> Result<Option<HpoStudy>, StoreError>;

    async fn update_study(&self, study: &HpoStudy) -> Result<(), StoreError>;

    /// Deletes a study and its trials. Returns whether it existed.
    async fn delete_study(&self, study_id: StudyId) -> Result<bool, StoreError>;

    async fn upsert_trial(&self, trial: &Trial) -> Result<(), StoreError>;

    /// Trials ordered by trial number.
    async fn list_trials(&self, study_id: StudyId) -> Result<Vec<Trial>, StoreError>;
}

/// Worker node snapshots.
#[async_trait]
pub trait WorkerNodeStore: Send + Sync {
    async fn save_workers(&self, nodes: &[WorkerNode]) -> Result<(), StoreError>;

    async fn list_workers(&self) -> Result<Vec<WorkerNode>, StoreError>;
}

/// Everything the runtime persists.
pub trait Store: JobStore + StudyStore + WorkerNodeStore {}

impl<T: JobStore + StudyStore + WorkerNodeStore> Store for T {}
