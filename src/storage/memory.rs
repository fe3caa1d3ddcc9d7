//! In-memory store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::distributed::WorkerNode;
use crate::error::StoreError;
use crate::hpo::{HpoStudy, StudyId, Trial};
use crate::scheduler::{JobEvent, JobId, JobStatus, TrainingJob};

use super::{JobFilter, JobStore, StudyStore, WorkerNodeStore};

/// Keeps every record in process memory.
#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<JobId, TrainingJob>>,
    events: RwLock<HashMap<JobId, Vec<JobEvent>>>,
    studies: RwLock<HashMap<StudyId, HpoStudy>>,
    trials: RwLock<HashMap<StudyId, Vec<Trial>>>,
    workers: RwLock<Vec<WorkerNode>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &TrainingJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.job_id) {
            return Err(StoreError::Conflict(format!("job {} exists", job.job_id)));
        }
        jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<TrainingJob>, StoreError> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<TrainingJob>, u64), StoreError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<&TrainingJob> = jobs.values().filter(|j| filter.matches(j)).collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.job_id.cmp(&a.job_id))
        });
        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.page_size as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn update_job(&self, job: &TrainingJob) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        let Some(stored) = jobs.get_mut(&job.job_id) else {
            return Err(StoreError::NotFound(format!("job {}", job.job_id)));
        };
        if stored.version + 1 != job.version {
            return Ok(false);
        }
        *stored = job.clone();
        Ok(true)
    }

    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<TrainingJob>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<TrainingJob> =
            jobs.values().filter(|j| j.status == status).cloned().collect();
        matching.sort_by_key(|j| j.created_at);
        Ok(matching)
    }

    async fn append_event(&self, job_id: JobId, event: &JobEvent) -> Result<(), StoreError> {
        self.events
            .write()
            .await
            .entry(job_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn job_events(&self, job_id: JobId) -> Result<Vec<JobEvent>, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl StudyStore for MemoryStore {
    async fn insert_study(&self, study: &HpoStudy) -> Result<(), StoreError> {
        let mut studies = self.studies.write().await;
        if studies
            .values()
            .any(|s| s.tenant_id == study.tenant_id && s.name == study.name)
        {
            return Err(StoreError::Conflict(format!(
                "study '{}' already exists for tenant '{}'",
                study.name, study.tenant_id
            )));
        }
        studies.insert(study.study_id, study.clone());
        Ok(())
    }

    async fn get_study(&self, study_id: StudyId) -> Result<Option<HpoStudy>, StoreError> {
        Ok(self.studies.read().await.get(&study_id).cloned())
    }

    async fn find_study(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<HpoStudy>, StoreError> {
        Ok(self
            .studies
            .read()
            .await
            .values()
            .find(|s| s.tenant_id == tenant_id && s.name == name)
            .cloned())
    }

    async fn update_study(&self, study: &HpoStudy) -> Result<(), StoreError> {
        let mut studies = self.studies.write().await;
        match studies.get_mut(&study.study_id) {
            Some(stored) => {
                *stored = study.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("study {}", study.study_id))),
        }
    }

    async fn delete_study(&self, study_id: StudyId) -> Result<bool, StoreError> {
        let existed = self.studies.write().await.remove(&study_id).is_some();
        self.trials.write().await.remove(&study_id);
        Ok(existed)
    }

    async fn upsert_trial(&self, trial: &Trial) -> Result<(), StoreError> {
        let mut trials = self.trials.write().await;
        let entries = trials.entry(trial.study_id).or_default();
        match entries.iter_mut().find(|t| t.trial_id == trial.trial_id) {
            Some(existing) => *existing = trial.clone(),
            None => {
                entries.push(trial.clone());
                entries.sort_by_key(|t| t.trial_number);
            }
        }
        Ok(())
    }

    async fn list_trials(&self, study_id: StudyId) -> Result<Vec<Trial>, StoreError> {
        Ok(self
            .trials
            .read()
            .await
            .get(&study_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl WorkerNodeStore for MemoryStore {
    async fn save_workers(&self, nodes: &[WorkerNode]) -> Result<(), StoreError> {
        *self.workers.write().await = nodes.to_vec();
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerNode>, StoreError> {
        Ok(self.workers.read().await.clone())
    }
}
