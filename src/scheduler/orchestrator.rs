//! The training orchestrator.
//!
//! [`TrainingOrchestrator`] owns the job lifecycle. It is the only component
//! that writes `TrainingJob.status`, and every write is a versioned
//! compare-and-set against the job store, so concurrent dispatch loops can
//! never move the same job to RUNNING twice.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::distributed::PoolStatus;
use crate::error::TrainingError;
use crate::hpo::{HpOptimizer, OptimizeOptions, Params, StudySpec};
use crate::metrics::MetricsCollector;
use crate::pipeline::{
    Metrics, PipelineOutcome, PipelineRun, PipelineStats, ProgressSink, RunTarget,
    TrainingPipeline,
};
use crate::storage::{JobFilter, JobStore, Store, StudyStore, WorkerNodeStore};

use super::backoff::RetryPolicy;
use super::job::{
    JobEvent, JobEventKind, JobId, JobPriority, JobStatus, TrainingJob, TrainingSpec,
    RETRY_OF_TAG,
};
use super::queue::{DispatchQueue, QueueEntry, QueueStats};

/// Attempts at a versioned job write before giving up.
const MAX_CAS_ATTEMPTS: usize = 8;

/// How long [`TrainingOrchestrator::shutdown`] waits for loops and jobs.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Polling fallback for waiters, in case a notification is missed.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Share of an HPO job's progress spent on the search; the rest is promotion.
const HPO_SEARCH_SHARE: f64 = 0.85;

/// Snapshot returned by [`TrainingOrchestrator::stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStats {
    /// Job counts keyed by status.
    pub jobs_by_status: BTreeMap<String, u64>,
    pub queue: QueueStats,
    pub running_jobs: usize,
    pub workers: PoolStatus,
    pub pipeline: PipelineStats,
}

/// What [`TrainingOrchestrator::recover`] did with persisted jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub failed: usize,
}

struct Inner {
    jobs: Arc<dyn JobStore>,
    workers: Arc<dyn WorkerNodeStore>,
    pipeline: Arc<TrainingPipeline>,
    optimizer: HpOptimizer,
    config: OrchestratorConfig,
    retry: RetryPolicy,
    queue: DispatchQueue,
    /// Cancellation tokens of jobs currently executing.
    running: Mutex<HashMap<JobId, CancellationToken>>,
    tasks: Mutex<JoinSet<()>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<CancellationToken>,
    is_running: AtomicBool,
    changed: Notify,
    metrics: MetricsCollector,
}

/// Accepts, schedules and tracks training jobs. Cheap to clone; every
/// clone drives the same queue and store.
#[derive(Clone)]
pub struct TrainingOrchestrator {
    inner: Arc<Inner>,
}

/// Forwards pipeline progress into the job record.
struct JobProgress {
    orchestrator: TrainingOrchestrator,
    job_id: JobId,
    offset: f64,
    scale: f64,
}

#[async_trait]
impl ProgressSink for JobProgress {
    async fn report(&self, progress: f64, metrics: Option<Metrics>) {
        let value = self.offset + self.scale * progress;
        if let Err(e) = self
            .orchestrator
            .update_progress(self.job_id, value, metrics)
            .await
        {
            debug!(job_id = %self.job_id, error = %e, "Progress update rejected");
        }
    }
}

impl TrainingOrchestrator {
    /// Creates an orchestrator over `store`, with an HPO optimizer sharing
    /// the same store and pipeline.
    pub fn new<S: Store + 'static>(
        store: Arc<S>,
        pipeline: Arc<TrainingPipeline>,
        config: OrchestratorConfig,
    ) -> Self {
        let optimizer = HpOptimizer::new(
            Arc::clone(&store) as Arc<dyn StudyStore>,
            Arc::clone(&pipeline),
            config.hpo.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                jobs: Arc::clone(&store) as Arc<dyn JobStore>,
                workers: store as Arc<dyn WorkerNodeStore>,
                pipeline,
                optimizer,
                retry: RetryPolicy::from_config(&config),
                config,
                queue: DispatchQueue::new(),
                running: Mutex::new(HashMap::new()),
                tasks: Mutex::new(JoinSet::new()),
                loops: Mutex::new(Vec::new()),
                shutdown: Mutex::new(CancellationToken::new()),
                is_running: AtomicBool::new(false),
                changed: Notify::new(),
                metrics: MetricsCollector::new(),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn optimizer(&self) -> &HpOptimizer {
        &self.inner.optimizer
    }

    pub fn pipeline(&self) -> &Arc<TrainingPipeline> {
        &self.inner.pipeline
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.inner.queue
    }

    // ---- submission and queries ----

    /// Validates `config` and queues a new job. Invalid configs are rejected
    /// with `Validation` and never reach the queue.
    pub async fn create_job(
        &self,
        tenant_id: &str,
        model_type: &str,
        config: serde_json::Value,
        priority: JobPriority,
    ) -> Result<JobId, TrainingError> {
        self.submit(tenant_id, model_type, config, priority, BTreeMap::new())
            .await
    }

    async fn submit(
        &self,
        tenant_id: &str,
        model_type: &str,
        config: serde_json::Value,
        priority: JobPriority,
        tags: BTreeMap<String, String>,
    ) -> Result<JobId, TrainingError> {
        if tenant_id.trim().is_empty() {
            return Err(TrainingError::Validation(
                "tenant_id cannot be empty".to_string(),
            ));
        }
        let spec = TrainingSpec::from_config(model_type, &config)?;
        let model_name = spec
            .model_name
            .clone()
            .unwrap_or_else(|| model_type.to_string());

        let job =
            TrainingJob::new(tenant_id, model_type, model_name, config, priority).with_tags(tags);
        let job_id = job.job_id;
        self.inner.jobs.insert_job(&job).await?;
        self.inner
            .jobs
            .append_event(job_id, &JobEvent::new(JobEventKind::Status, "created"))
            .await?;

        let (_, job) = self.transition(job_id, JobStatus::Queued, |_| {}).await?;
        self.inner.queue.push(QueueEntry::from_job(&job)).await;
        self.inner
            .metrics
            .update_queue_depth(self.inner.queue.len().await);

        info!(
            job_id = %job_id,
            tenant_id = %job.tenant_id,
            model_type = %job.model_type,
            priority = job.priority.as_str(),
            hpo = spec.is_hpo(),
            "Job queued"
        );
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<TrainingJob, TrainingError> {
        self.inner
            .jobs
            .get_job(job_id)
            .await?
            .ok_or_else(|| TrainingError::not_found("job", job_id))
    }

    /// One page of jobs matching every set filter, newest first, and the
    /// total number of matches.
    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
    ) -> Result<(Vec<TrainingJob>, u64), TrainingError> {
        Ok(self.inner.jobs.list_jobs(filter).await?)
    }

    /// The job's event log, oldest first.
    pub async fn job_logs(&self, job_id: JobId) -> Result<Vec<JobEvent>, TrainingError> {
        self.get_job(job_id).await?;
        Ok(self.inner.jobs.job_events(job_id).await?)
    }

    /// Counts by status, queue and worker snapshots. Also persists the
    /// worker snapshot.
    pub async fn stats(&self) -> Result<OrchestratorStats, TrainingError> {
        let mut jobs_by_status = BTreeMap::new();
        for status in JobStatus::ALL {
            let (_, total) = self
                .inner
                .jobs
                .list_jobs(&JobFilter::new().with_status(status).with_page(1, 1))
                .await?;
            jobs_by_status.insert(status.as_str().to_string(), total);
        }

        let workers = self.inner.pipeline.distributed().pool_status().await;
        self.inner.workers.save_workers(&workers.nodes).await?;
        self.inner.metrics.update_busy_workers(workers.busy);

        Ok(OrchestratorStats {
            jobs_by_status,
            queue: self.inner.queue.stats().await,
            running_jobs: self.inner.running.lock().await.len(),
            workers,
            pipeline: self.inner.pipeline.stats().await,
        })
    }

    // ---- lifecycle operations ----

    /// Cancels a QUEUED or RUNNING job. A queued job leaves the dispatch
    /// queue at once; a running job is told to stop at its next checkpoint.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<(), TrainingError> {
        let job = self.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(TrainingError::InvalidState(format!(
                "job {} is already {}",
                job_id, job.status
            )));
        }

        let dequeued = self.inner.queue.remove(job_id).await;
        let (from, job) = self
            .transition(job_id, JobStatus::Cancelled, |job| {
                job.completed_at = Some(Utc::now());
                job.error_message = Some("Cancelled by request".to_string());
                job.result_model_id = None;
                job.metrics = None;
            })
            .await?;
        self.inner
            .jobs
            .append_event(job_id, &JobEvent::new(JobEventKind::Cancel, "cancel requested"))
            .await?;

        if from == JobStatus::Running {
            if let Some(token) = self.inner.running.lock().await.get(&job_id) {
                token.cancel();
            }
            self.inner
                .pipeline
                .distributed()
                .cancel(&RunTarget::Job(job_id).task_id())
                .await;
        }

        let duration = job.run_duration().map(duration_secs).unwrap_or(0.0);
        self.inner
            .metrics
            .record_job(JobStatus::Cancelled.as_str(), &job.model_type, duration);
        self.inner
            .metrics
            .update_queue_depth(self.inner.queue.len().await);
        info!(job_id = %job_id, from = %from, dequeued = dequeued, "Job cancelled");
        Ok(())
    }

    /// Resubmits a FAILED job as a new job with the same config, tagged with
    /// the original's id. The original is left untouched.
    pub async fn retry_job(&self, job_id: JobId) -> Result<JobId, TrainingError> {
        let job = self.get_job(job_id).await?;
        if job.status != JobStatus::Failed {
            return Err(TrainingError::InvalidState(format!(
                "only failed jobs can be retried, job {} is {}",
                job_id, job.status
            )));
        }
        let mut tags = job.tags.clone();
        tags.insert(RETRY_OF_TAG.to_string(), job_id.to_string());

        let new_id = self
            .submit(
                &job.tenant_id,
                &job.model_type,
                job.config.clone(),
                job.priority,
                tags,
            )
            .await?;
        info!(job_id = %job_id, retry_job_id = %new_id, "Failed job resubmitted");
        Ok(new_id)
    }

    /// Records progress of a RUNNING job. A value below the current
    /// progress is ignored and `Ok(false)` is returned.
    pub async fn update_progress(
        &self,
        job_id: JobId,
        progress: f64,
        metrics: Option<Metrics>,
    ) -> Result<bool, TrainingError> {
        if !progress.is_finite() {
            return Err(TrainingError::Validation(format!(
                "progress must be finite, got {}",
                progress
            )));
        }
        let progress = progress.clamp(0.0, 1.0);
        let mut previous = 0.0;

        let updated = self
            .modify(job_id, |job| {
                if job.status != JobStatus::Running {
                    return Err(TrainingError::InvalidState(format!(
                        "job {} is {}, not running",
                        job.job_id, job.status
                    )));
                }
                if progress < job.progress {
                    warn!(
                        job_id = %job.job_id,
                        current = job.progress,
                        requested = progress,
                        "Ignoring progress regression"
                    );
                    return Ok(false);
                }
                previous = job.progress;
                job.progress = progress;
                if let Some(metrics) = &metrics {
                    job.metrics = Some(metrics.clone());
                }
                Ok(true)
            })
            .await?;

        if updated.is_none() {
            return Ok(false);
        }
        if (progress * 4.0).floor() > (previous * 4.0).floor() {
            self.inner
                .jobs
                .append_event(
                    job_id,
                    &JobEvent::new(
                        JobEventKind::Progress,
                        format!("{:.0}%", progress * 100.0),
                    ),
                )
                .await?;
        }
        debug!(job_id = %job_id, progress = progress, "Progress updated");
        Ok(true)
    }

    /// QUEUED → RUNNING. Exactly one of several concurrent callers wins; the
    /// rest get `InvalidState`.
    pub async fn mark_running(&self, job_id: JobId) -> Result<TrainingJob, TrainingError> {
        let (_, job) = self
            .transition(job_id, JobStatus::Running, |job| {
                job.started_at = Some(Utc::now());
            })
            .await?;
        Ok(job)
    }

    /// RUNNING → COMPLETED with the registered model id and final metrics.
    pub async fn mark_completed(
        &self,
        job_id: JobId,
        model_id: &str,
        metrics: Metrics,
    ) -> Result<TrainingJob, TrainingError> {
        if model_id.trim().is_empty() {
            return Err(TrainingError::Validation(
                "a completed job needs a result_model_id".to_string(),
            ));
        }
        let (_, job) = self
            .transition(job_id, JobStatus::Completed, |job| {
                job.progress = 1.0;
                job.metrics = Some(metrics.clone());
                job.result_model_id = Some(model_id.to_string());
                job.error_message = None;
                job.completed_at = Some(Utc::now());
            })
            .await?;
        Ok(job)
    }

    /// RUNNING → FAILED with a non-empty error message.
    pub async fn mark_failed(
        &self,
        job_id: JobId,
        message: &str,
    ) -> Result<TrainingJob, TrainingError> {
        if message.trim().is_empty() {
            return Err(TrainingError::Validation(
                "a failed job needs an error_message".to_string(),
            ));
        }
        let (_, job) = self
            .transition(job_id, JobStatus::Failed, |job| {
                job.error_message = Some(message.to_string());
                job.result_model_id = None;
                job.metrics = None;
                job.completed_at = Some(Utc::now());
            })
            .await?;
        self.inner
            .jobs
            .append_event(job_id, &JobEvent::new(JobEventKind::Error, message))
            .await?;
        Ok(job)
    }

    /// Reads, edits and writes a job with optimistic concurrency. `apply`
    /// returns `Ok(false)` to skip the write.
    async fn modify<F>(
        &self,
        job_id: JobId,
        mut apply: F,
    ) -> Result<Option<TrainingJob>, TrainingError>
    where
        F: FnMut(&mut TrainingJob) -> Result<bool, TrainingError> + Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut job = self.get_job(job_id).await?;
            if !apply(&mut job)? {
                return Ok(None);
            }
            job.version += 1;
            if self.inner.jobs.update_job(&job).await? {
                self.inner.changed.notify_waiters();
                return Ok(Some(job));
            }
            debug!(job_id = %job_id, "Concurrent job update, retrying");
        }
        Err(TrainingError::InvalidState(format!(
            "job {} is being updated concurrently",
            job_id
        )))
    }

    /// Moves a job to `to` if the state machine allows it from the job's
    /// current status. Returns the previous status and the stored job.
    async fn transition<F>(
        &self,
        job_id: JobId,
        to: JobStatus,
        edit: F,
    ) -> Result<(JobStatus, TrainingJob), TrainingError>
    where
        F: Fn(&mut TrainingJob) + Send + Sync,
    {
        let mut from = JobStatus::Created;
        let job = self
            .modify(job_id, |job| {
                if !job.status.can_transition_to(to) {
                    return Err(TrainingError::InvalidState(format!(
                        "job {} cannot move from {} to {}",
                        job.job_id, job.status, to
                    )));
                }
                from = job.status;
                job.status = to;
                edit(job);
                Ok(true)
            })
            .await?
            .ok_or_else(|| TrainingError::not_found("job", job_id))?;

        self.inner
            .jobs
            .append_event(job_id, &JobEvent::status(from, to))
            .await?;
        info!(job_id = %job_id, from = %from, to = %to, "Job status changed");
        Ok((from, job))
    }

    // ---- dispatch ----

    /// Claims the best eligible queued job and starts executing it.
    /// Returns `None` when nothing is eligible under the concurrency caps.
    pub async fn dispatch_next(&self) -> Result<Option<JobId>, TrainingError> {
        loop {
            let Some(entry) = self
                .inner
                .queue
                .claim(
                    self.inner.config.max_concurrent_jobs,
                    self.inner.config.max_jobs_per_tenant,
                )
                .await
            else {
                return Ok(None);
            };

            // The token is visible to cancel_job before the job can be
            // observed RUNNING.
            let token = self.inner.shutdown.lock().await.child_token();
            self.inner
                .running
                .lock()
                .await
                .insert(entry.job_id, token.clone());

            let job = match self.mark_running(entry.job_id).await {
                Ok(job) => job,
                Err(e) => {
                    self.inner.running.lock().await.remove(&entry.job_id);
                    self.inner.queue.release(&entry.tenant_id).await;
                    match e {
                        TrainingError::InvalidState(reason)
                        | TrainingError::NotFound { id: reason, .. } => {
                            debug!(job_id = %entry.job_id, reason = %reason, "Skipping claimed job");
                            continue;
                        }
                        e => return Err(e),
                    }
                }
            };

            let running = self.inner.running.lock().await.len();
            self.inner.metrics.update_jobs_in_progress(running);
            self.inner
                .metrics
                .update_queue_depth(self.inner.queue.len().await);
            info!(
                job_id = %job.job_id,
                tenant_id = %job.tenant_id,
                priority = job.priority.as_str(),
                "Job dispatched"
            );

            let job_id = job.job_id;
            let orchestrator = self.clone();
            let mut tasks = self.inner.tasks.lock().await;
            while tasks.try_join_next().is_some() {}
            tasks.spawn(async move { orchestrator.execute(job, token).await });
            return Ok(Some(job_id));
        }
    }

    async fn execute(self, job: TrainingJob, token: CancellationToken) {
        let job_id = job.job_id;
        let started = Instant::now();
        let result = self.run_with_retries(&job, &token).await;

        let finished = match result {
            Ok(outcome) => match outcome.model_id {
                Some(model_id) => self
                    .mark_completed(job_id, &model_id, outcome.metrics)
                    .await
                    .map(|_| JobStatus::Completed),
                None => self
                    .mark_failed(job_id, "pipeline finished without registering a model")
                    .await
                    .map(|_| JobStatus::Failed),
            },
            Err(TrainingError::Cancelled(reason)) => match self.get_job(job_id).await {
                Ok(current) if current.status == JobStatus::Cancelled => Ok(JobStatus::Cancelled),
                _ => self
                    .mark_failed(job_id, &format!("Interrupted: {}", reason))
                    .await
                    .map(|_| JobStatus::Failed),
            },
            Err(e) => {
                warn!(job_id = %job_id, kind = e.kind(), error = %e, "Job failed");
                self.mark_failed(job_id, &e.to_string())
                    .await
                    .map(|_| JobStatus::Failed)
            }
        };

        match finished {
            Ok(status) if status != JobStatus::Cancelled => {
                self.inner.metrics.record_job(
                    status.as_str(),
                    &job.model_type,
                    started.elapsed().as_secs_f64(),
                );
            }
            Ok(_) => {}
            Err(TrainingError::InvalidState(reason)) => {
                debug!(job_id = %job_id, reason = %reason, "Job changed state while running");
            }
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to record job result"),
        }

        self.inner.queue.release(&job.tenant_id).await;
        let running = {
            let mut running = self.inner.running.lock().await;
            running.remove(&job_id);
            running.len()
        };
        self.inner.metrics.update_jobs_in_progress(running);
        self.inner.changed.notify_waiters();
    }

    async fn run_with_retries(
        &self,
        job: &TrainingJob,
        token: &CancellationToken,
    ) -> Result<PipelineOutcome, TrainingError> {
        let spec = TrainingSpec::from_config(&job.model_type, &job.config)?;
        let mut attempt = 0u32;
        loop {
            let result = match spec.timeout_secs {
                Some(secs) => {
                    match tokio::time::timeout(
                        Duration::from_secs(secs),
                        self.run_once(job, &spec, token),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => {
                            self.inner
                                .pipeline
                                .distributed()
                                .cancel(&RunTarget::Job(job.job_id).task_id())
                                .await;
                            Err(TrainingError::Timeout(format!(
                                "job exceeded its {}s limit",
                                secs
                            )))
                        }
                    }
                }
                None => self.run_once(job, &spec, token).await,
            };

            let error = match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            attempt += 1;
            let Some(delay) = self.inner.retry.delay_for(attempt) else {
                warn!(job_id = %job.job_id, attempts = attempt - 1, error = %error, "Retries exhausted");
                return Err(error);
            };
            self.record_retry(job, attempt, &error, delay).await?;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => {
                    return Err(TrainingError::Cancelled(
                        "cancelled while waiting to retry".to_string(),
                    ));
                }
            }
        }
    }

    async fn record_retry(
        &self,
        job: &TrainingJob,
        attempt: u32,
        error: &TrainingError,
        delay: Duration,
    ) -> Result<(), TrainingError> {
        self.modify(job.job_id, |current| {
            current.retry_count = attempt;
            Ok(true)
        })
        .await?;
        self.inner
            .jobs
            .append_event(
                job.job_id,
                &JobEvent::new(
                    JobEventKind::Retry,
                    format!("attempt {} in {:?}: {}", attempt, delay, error),
                ),
            )
            .await?;
        self.inner.metrics.record_job_retry(&job.model_type);
        warn!(
            job_id = %job.job_id,
            attempt = attempt,
            delay_secs = delay.as_secs_f64(),
            error = %error,
            "Transient failure, retrying job"
        );
        Ok(())
    }

    async fn run_once(
        &self,
        job: &TrainingJob,
        spec: &TrainingSpec,
        token: &CancellationToken,
    ) -> Result<PipelineOutcome, TrainingError> {
        if spec.is_hpo() {
            return self.run_hpo(job, spec, token).await;
        }
        let progress = JobProgress {
            orchestrator: self.clone(),
            job_id: job.job_id,
            offset: 0.0,
            scale: 1.0,
        };
        self.inner
            .pipeline
            .run(
                PipelineRun {
                    target: RunTarget::Job(job.job_id),
                    tenant_id: job.tenant_id.clone(),
                    model_type: job.model_type.clone(),
                    model_name: job.model_name.clone(),
                    spec: spec.clone(),
                    params: Params::new(),
                    register: true,
                },
                &progress,
                token,
            )
            .await
    }

    /// Runs a search for the job's `search_space` and promotes the best
    /// trial. Each job owns the study named `job-<job_id>`, so a retried
    /// attempt resumes the same study.
    async fn run_hpo(
        &self,
        job: &TrainingJob,
        spec: &TrainingSpec,
        token: &CancellationToken,
    ) -> Result<PipelineOutcome, TrainingError> {
        let optimizer = &self.inner.optimizer;
        let name = format!("job-{}", job.job_id);
        let study_id = match optimizer.find_study(&job.tenant_id, &name).await {
            Ok(study) => study.study_id,
            Err(TrainingError::NotFound { .. }) => {
                let search_space = spec.search_space.clone().ok_or_else(|| {
                    TrainingError::Validation("job has no search_space".to_string())
                })?;
                let mut training_config = job.config.clone();
                if let Some(object) = training_config.as_object_mut() {
                    object.insert(
                        "model_name".to_string(),
                        serde_json::Value::String(job.model_name.clone()),
                    );
                }
                optimizer
                    .create_study(StudySpec {
                        tenant_id: job.tenant_id.clone(),
                        name,
                        model_type: job.model_type.clone(),
                        search_space,
                        sampler: spec.hpo.sampler,
                        pruner: spec.hpo.pruner,
                        direction: spec.hpo.direction,
                        n_trials: spec.hpo.n_trials,
                        objective_metric: spec.hpo.objective_metric.clone(),
                        training_config,
                        seed: None,
                    })
                    .await?
            }
            Err(e) => return Err(e),
        };

        let options = OptimizeOptions {
            n_trials: Some(spec.hpo.n_trials),
            timeout: spec.hpo.timeout_secs.map(Duration::from_secs),
            n_parallel: Some(spec.hpo.n_parallel),
        };
        let outcome = optimizer.optimize_with(study_id, options, token).await?;
        info!(
            job_id = %job.job_id,
            study_id = %study_id,
            trials_run = outcome.trials_run,
            best_value = ?outcome.study.best_value,
            "Search finished, promoting best trial"
        );
        self.update_progress(job.job_id, HPO_SEARCH_SHARE, None)
            .await?;

        let progress = JobProgress {
            orchestrator: self.clone(),
            job_id: job.job_id,
            offset: HPO_SEARCH_SHARE,
            scale: 1.0 - HPO_SEARCH_SHARE,
        };
        optimizer
            .promote_best(study_id, RunTarget::Job(job.job_id), &progress, token)
            .await
    }

    // ---- process lifecycle ----

    /// Restores persisted state after a restart: QUEUED jobs go back into
    /// the dispatch queue and RUNNING jobs, which lost their executor, are
    /// failed as interrupted.
    pub async fn recover(&self) -> Result<RecoveryReport, TrainingError> {
        let mut report = RecoveryReport::default();

        for job in self.inner.jobs.jobs_with_status(JobStatus::Running).await? {
            if self.inner.running.lock().await.contains_key(&job.job_id) {
                continue;
            }
            self.mark_failed(job.job_id, "Interrupted by orchestrator restart")
                .await?;
            report.failed += 1;
        }

        for job in self.inner.jobs.jobs_with_status(JobStatus::Created).await? {
            self.transition(job.job_id, JobStatus::Queued, |_| {}).await?;
        }

        for job in self.inner.jobs.jobs_with_status(JobStatus::Queued).await? {
            if !self.inner.queue.contains(job.job_id).await {
                self.inner.queue.push(QueueEntry::from_job(&job)).await;
                report.requeued += 1;
            }
        }

        self.inner
            .metrics
            .update_queue_depth(self.inner.queue.len().await);
        info!(
            requeued = report.requeued,
            failed = report.failed,
            "Recovered persisted jobs"
        );
        Ok(report)
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }

    /// Spawns `dispatch_workers` dispatch loops.
    pub async fn start(&self) -> Result<(), TrainingError> {
        if self.inner.is_running.swap(true, Ordering::SeqCst) {
            return Err(TrainingError::InvalidState(
                "orchestrator is already running".to_string(),
            ));
        }

        let shutdown = {
            let mut current = self.inner.shutdown.lock().await;
            if current.is_cancelled() {
                *current = CancellationToken::new();
            }
            current.clone()
        };

        let mut loops = self.inner.loops.lock().await;
        for worker in 0..self.inner.config.dispatch_workers.max(1) {
            let orchestrator = self.clone();
            let shutdown = shutdown.clone();
            loops.push(tokio::spawn(async move {
                orchestrator.dispatch_loop(worker, shutdown).await;
            }));
        }

        info!(
            dispatch_workers = loops.len(),
            max_concurrent_jobs = self.inner.config.max_concurrent_jobs,
            "Orchestrator started"
        );
        Ok(())
    }

    async fn dispatch_loop(self, worker: usize, shutdown: CancellationToken) {
        debug!(worker = worker, "Dispatch loop started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.dispatch_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(worker = worker, error = %e, "Dispatch failed"),
            }
            tokio::select! {
                _ = self.inner.queue.changed() => {}
                _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        debug!(worker = worker, "Dispatch loop stopped");
    }

    /// Stops the dispatch loops, cancels in-flight jobs and waits for them
    /// to wind down.
    pub async fn shutdown(&self) -> Result<(), TrainingError> {
        if !self.inner.is_running.swap(false, Ordering::SeqCst) {
            return Err(TrainingError::InvalidState(
                "orchestrator is not running".to_string(),
            ));
        }
        info!("Initiating orchestrator shutdown");
        self.inner.shutdown.lock().await.cancel();
        self.inner.queue.wake_all();

        let handles: Vec<JoinHandle<()>> = self.inner.loops.lock().await.drain(..).collect();
        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        let drain = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Dispatch loop panicked during shutdown");
                }
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Job task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await {
            Ok(()) => {
                info!("Orchestrator shutdown complete");
                Ok(())
            }
            Err(_) => Err(TrainingError::Timeout(format!(
                "shutdown did not finish within {:?}",
                SHUTDOWN_TIMEOUT
            ))),
        }
    }

    /// Waits until the job reaches a terminal status.
    pub async fn wait_for(
        &self,
        job_id: JobId,
        timeout: Duration,
    ) -> Result<TrainingJob, TrainingError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.get_job(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TrainingError::Timeout(format!(
                    "job {} still {} after {:?}",
                    job_id, job.status, timeout
                )));
            }
            tokio::select! {
                _ = self.inner.changed.notified() => {}
                _ = tokio::time::sleep(WAIT_POLL) => {}
            }
        }
    }

    /// Waits until the queue is empty and no job is executing.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<(), TrainingError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let running = self.inner.running.lock().await.len();
            if running == 0 && self.inner.queue.is_empty().await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TrainingError::Timeout(format!(
                    "{} job(s) still running after {:?}",
                    running, timeout
                )));
            }
            tokio::select! {
                _ = self.inner.changed.notified() => {}
                _ = tokio::time::sleep(WAIT_POLL) => {}
            }
        }
    }
}

fn duration_secs(duration: chrono::Duration) -> f64 {
    duration.num_milliseconds().max(0) as f64 / 1000.0
}
