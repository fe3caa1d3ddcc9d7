//! The hyperparameter optimization loop.
//!
//! [`HpOptimizer`] is the only writer of study and trial records. Each call
//! to [`HpOptimizer::optimize`] samples parameters, runs the training
//! pipeline for every trial (up to `n_parallel` at once), feeds per-epoch
//! validation losses to the pruner and keeps the study's best trial current.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{HpoConfig, PipelineConfig};
use crate::error::{StoreError, TrainingError};
use crate::metrics::MetricsCollector;
use crate::pipeline::{
    EpochObserver, NoopProgress, PipelineOutcome, PipelineRun, ProgressSink, RunTarget,
    TrainParams, TrainingPipeline, TrialContext,
};
use crate::scheduler::TrainingSpec;
use crate::storage::StudyStore;

use super::pruner::Pruner;
use super::space::{ParamDomain, SearchSpace};
use super::study::{Direction, HpoStudy, StudyId, StudySpec, StudyStatus, Trial, TrialState};

/// Per-call overrides for [`HpOptimizer::optimize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeOptions {
    /// Total finished trials to reach, counting trials from earlier calls.
    /// Defaults to the study's target.
    pub n_trials: Option<usize>,
    pub timeout: Option<Duration>,
    /// Concurrent trials. Defaults to `HpoConfig::default_parallelism`.
    pub n_parallel: Option<usize>,
}

impl OptimizeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_n_trials(mut self, n_trials: usize) -> Self {
        self.n_trials = Some(n_trials);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_parallelism(mut self, n_parallel: usize) -> Self {
        self.n_parallel = Some(n_parallel);
        self
    }
}

/// Result of an optimize call.
#[derive(Debug, Clone)]
pub struct StudyOutcome {
    pub study: HpoStudy,
    pub best_trial: Trial,
    /// Trials started by this call.
    pub trials_run: usize,
}

struct Inner {
    store: Arc<dyn StudyStore>,
    pipeline: Arc<TrainingPipeline>,
    config: HpoConfig,
    running: Mutex<HashMap<StudyId, CancellationToken>>,
    metrics: MetricsCollector,
}

/// Drives HPO studies over the training pipeline. Cheap to clone.
#[derive(Clone)]
pub struct HpOptimizer {
    inner: Arc<Inner>,
}

/// Everything a trial task needs, shared across the trials of one call.
struct TrialShared {
    store: Arc<dyn StudyStore>,
    pipeline: Arc<TrainingPipeline>,
    pruner: Arc<dyn Pruner>,
    history: Arc<RwLock<Vec<Trial>>>,
    direction: Direction,
    tenant_id: String,
    model_type: String,
    model_name: String,
    objective: String,
    spec: TrainingSpec,
}

/// Records intermediate values for one trial and consults the pruner.
struct TrialObserver {
    shared: Arc<TrialShared>,
    trial: Mutex<Trial>,
}

#[async_trait]
impl EpochObserver for TrialObserver {
    async fn on_epoch(&self, epoch: usize, validation_loss: f64) -> Result<(), TrainingError> {
        let snapshot = {
            let mut trial = self.trial.lock().await;
            trial.report(epoch, validation_loss)?;
            trial.clone()
        };
        {
            let mut history = self.shared.history.write().await;
            if let Some(entry) = history.iter_mut().find(|t| t.trial_id == snapshot.trial_id) {
                *entry = snapshot.clone();
            }
        }
        self.shared.store.upsert_trial(&snapshot).await?;

        let prune = {
            let history = self.shared.history.read().await;
            self.shared
                .pruner
                .should_prune(&snapshot, &history, self.shared.direction)
        };
        if prune {
            debug!(
                trial_number = snapshot.trial_number,
                step = epoch,
                value = validation_loss,
                "Pruner stopped trial"
            );
            return Err(TrainingError::Pruned { step: epoch });
        }
        Ok(())
    }
}

async fn run_trial(shared: Arc<TrialShared>, trial: Trial, cancel: CancellationToken) -> Trial {
    let observer = Arc::new(TrialObserver {
        shared: Arc::clone(&shared),
        trial: Mutex::new(trial.clone()),
    });
    let run = PipelineRun {
        target: RunTarget::Trial(TrialContext {
            study_id: trial.study_id,
            trial_id: trial.trial_id,
            trial_number: trial.trial_number,
            observer: Arc::clone(&observer) as Arc<dyn EpochObserver>,
        }),
        tenant_id: shared.tenant_id.clone(),
        model_type: shared.model_type.clone(),
        model_name: shared.model_name.clone(),
        spec: shared.spec.clone(),
        params: trial.params.clone(),
        register: false,
    };

    let result = shared.pipeline.run(run, &NoopProgress, &cancel).await;
    let mut trial = observer.trial.lock().await.clone();
    let transition = match result {
        Ok(outcome) => match outcome
            .metrics
            .get(&shared.objective)
            .copied()
            .filter(|v| v.is_finite())
        {
            Some(value) => {
                info!(
                    trial_number = trial.trial_number,
                    value = value,
                    "Trial complete"
                );
                trial.complete(value)
            }
            None => trial.fail(format!(
                "objective metric '{}' missing from evaluation",
                shared.objective
            )),
        },
        Err(TrainingError::Pruned { step }) => {
            info!(trial_number = trial.trial_number, step = step, "Trial pruned");
            trial.prune()
        }
        Err(e) => {
            warn!(trial_number = trial.trial_number, error = %e, "Trial failed");
            trial.fail(e.to_string())
        }
    };
    if let Err(e) = transition {
        warn!(trial_number = trial.trial_number, error = %e, "Could not finish trial");
    }
    if let Err(e) = shared.store.upsert_trial(&trial).await {
        error!(trial_id = %trial.trial_id, error = %e, "Failed to persist trial");
    }
    trial
}

/// Largest number of epochs a trial can run; the Hyperband budget.
fn max_epochs(spec: &TrainingSpec, space: &SearchSpace, config: &PipelineConfig) -> usize {
    let base = TrainParams::resolve(&spec.hyperparameters, config)
        .map(|p| p.epochs)
        .unwrap_or(config.default_epochs);
    match space.get("epochs") {
        Some(ParamDomain::Int { high, .. }) => base.max((*high).max(1) as usize),
        _ => base,
    }
}

fn validate_study(spec: &StudySpec) -> Result<(), TrainingError> {
    if spec.tenant_id.trim().is_empty() {
        return Err(TrainingError::Validation(
            "tenant_id cannot be empty".to_string(),
        ));
    }
    if spec.name.trim().is_empty() {
        return Err(TrainingError::Validation(
            "study name cannot be empty".to_string(),
        ));
    }
    if spec.n_trials == 0 {
        return Err(TrainingError::Validation(
            "n_trials must be at least 1".to_string(),
        ));
    }
    if spec.objective_metric.trim().is_empty() {
        return Err(TrainingError::Validation(
            "objective_metric cannot be empty".to_string(),
        ));
    }
    spec.search_space.validate()?;
    TrainingSpec::from_config(&spec.model_type, &spec.training_config)?;
    Ok(())
}

impl HpOptimizer {
    pub fn new(
        store: Arc<dyn StudyStore>,
        pipeline: Arc<TrainingPipeline>,
        config: HpoConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                pipeline,
                config,
                running: Mutex::new(HashMap::new()),
                metrics: MetricsCollector::new(),
            }),
        }
    }

    pub fn config(&self) -> &HpoConfig {
        &self.inner.config
    }

    /// Validates and persists a new study. Names are unique per tenant.
    pub async fn create_study(&self, spec: StudySpec) -> Result<StudyId, TrainingError> {
        validate_study(&spec)?;
        let study = HpoStudy::from_spec(spec);
        match self.inner.store.insert_study(&study).await {
            Ok(()) => {}
            Err(StoreError::Conflict(message)) => return Err(TrainingError::Validation(message)),
            Err(e) => return Err(e.into()),
        }
        info!(
            study_id = %study.study_id,
            tenant_id = %study.tenant_id,
            name = %study.name,
            sampler = study.sampler.as_str(),
            pruner = study.pruner.as_str(),
            "Study created"
        );
        Ok(study.study_id)
    }

    pub async fn get_study(&self, study_id: StudyId) -> Result<HpoStudy, TrainingError> {
        self.inner
            .store
            .get_study(study_id)
            .await?
            .ok_or_else(|| TrainingError::not_found("study", study_id))
    }

    /// Looks a study up by tenant and name.
    pub async fn find_study(&self, tenant_id: &str, name: &str) -> Result<HpoStudy, TrainingError> {
        self.inner
            .store
            .find_study(tenant_id, name)
            .await?
            .ok_or_else(|| TrainingError::not_found("study", format!("{}/{}", tenant_id, name)))
    }

    /// Trials of a study, ordered by trial number.
    pub async fn list_trials(&self, study_id: StudyId) -> Result<Vec<Trial>, TrainingError> {
        self.get_study(study_id).await?;
        Ok(self.inner.store.list_trials(study_id).await?)
    }

    /// The study's best trial, if any trial completed.
    pub async fn best_trial(&self, study_id: StudyId) -> Result<Option<Trial>, TrainingError> {
        let study = self.get_study(study_id).await?;
        let Some(best_id) = study.best_trial_id else {
            return Ok(None);
        };
        let trials = self.inner.store.list_trials(study_id).await?;
        Ok(trials.into_iter().find(|t| t.trial_id == best_id))
    }

    /// Whether an optimize call is in flight for the study.
    pub async fn is_running(&self, study_id: StudyId) -> bool {
        self.inner.running.lock().await.contains_key(&study_id)
    }

    /// Stops a study. An in-flight optimize call cancels its trials and
    /// finishes with status `Stopped`; an idle study is marked `Stopped`
    /// directly. Stopped studies cannot be optimized again.
    pub async fn stop_study(&self, study_id: StudyId) -> Result<(), TrainingError> {
        let mut study = self.get_study(study_id).await?;
        if let Some(token) = self.inner.running.lock().await.get(&study_id) {
            info!(study_id = %study_id, "Stopping running study");
            token.cancel();
            return Ok(());
        }
        if study.status != StudyStatus::Stopped {
            study.status = StudyStatus::Stopped;
            study.updated_at = Utc::now();
            self.inner.store.update_study(&study).await?;
            info!(study_id = %study_id, "Study stopped");
        }
        Ok(())
    }

    /// Deletes a study and its trials. Running studies must be stopped first.
    pub async fn delete_study(&self, study_id: StudyId) -> Result<(), TrainingError> {
        if self.is_running(study_id).await {
            return Err(TrainingError::InvalidState(format!(
                "study {} is running",
                study_id
            )));
        }
        if !self.inner.store.delete_study(study_id).await? {
            return Err(TrainingError::not_found("study", study_id));
        }
        info!(study_id = %study_id, "Study deleted");
        Ok(())
    }

    /// Runs trials until the target count is reached, the timeout elapses or
    /// the study is stopped. Returns the best trial.
    pub async fn optimize(
        &self,
        study_id: StudyId,
        options: OptimizeOptions,
    ) -> Result<StudyOutcome, TrainingError> {
        self.optimize_with(study_id, options, &CancellationToken::new())
            .await
    }

    /// Like [`optimize`](Self::optimize), also stopping when `cancel` fires.
    pub async fn optimize_with(
        &self,
        study_id: StudyId,
        options: OptimizeOptions,
        cancel: &CancellationToken,
    ) -> Result<StudyOutcome, TrainingError> {
        let mut study = self.get_study(study_id).await?;
        if study.status == StudyStatus::Stopped {
            return Err(TrainingError::InvalidState(format!(
                "study '{}' was stopped",
                study.name
            )));
        }

        let token = cancel.child_token();
        {
            let mut running = self.inner.running.lock().await;
            if running.contains_key(&study_id) {
                return Err(TrainingError::InvalidState(format!(
                    "study '{}' is already being optimized",
                    study.name
                )));
            }
            running.insert(study_id, token.clone());
        }

        let result = self.run_study(&mut study, options, &token).await;
        self.inner.running.lock().await.remove(&study_id);
        result
    }

    async fn run_study(
        &self,
        study: &mut HpoStudy,
        options: OptimizeOptions,
        token: &CancellationToken,
    ) -> Result<StudyOutcome, TrainingError> {
        let spec = TrainingSpec::from_config(&study.model_type, &study.training_config)?;

        // Trials left RUNNING by an interrupted call can never finish.
        let mut history = self.inner.store.list_trials(study.study_id).await?;
        for trial in history.iter_mut().filter(|t| t.state == TrialState::Running) {
            trial.fail("interrupted before completion")?;
            self.inner.store.upsert_trial(trial).await?;
            warn!(
                study_id = %study.study_id,
                trial_number = trial.trial_number,
                "Failed interrupted trial"
            );
        }
        let mut finished = history.len();
        let mut next_number = history
            .iter()
            .map(|t| t.trial_number + 1)
            .max()
            .unwrap_or(0);

        let n_target = options.n_trials.unwrap_or(study.n_trials_target);
        let n_parallel = options
            .n_parallel
            .unwrap_or(self.inner.config.default_parallelism)
            .max(1);
        study.n_trials_target = n_target;
        study.status = StudyStatus::Running;
        study.updated_at = Utc::now();
        self.inner.store.update_study(study).await?;
        info!(
            study_id = %study.study_id,
            name = %study.name,
            finished = finished,
            target = n_target,
            n_parallel = n_parallel,
            "Optimizing study"
        );

        let mut sampler = study.sampler.build(
            &self.inner.config,
            study.direction,
            study.seed.wrapping_add(next_number),
        );
        let max_resource = max_epochs(&spec, &study.search_space, self.inner.pipeline.config());
        let pruner: Arc<dyn Pruner> =
            Arc::from(study.pruner.build(&self.inner.config, max_resource));
        let model_name = spec.model_name.clone().unwrap_or_else(|| study.name.clone());
        let shared = Arc::new(TrialShared {
            store: Arc::clone(&self.inner.store),
            pipeline: Arc::clone(&self.inner.pipeline),
            pruner,
            history: Arc::new(RwLock::new(history)),
            direction: study.direction,
            tenant_id: study.tenant_id.clone(),
            model_type: study.model_type.clone(),
            model_name,
            objective: study.objective_metric.clone(),
            spec,
        });

        let deadline = options.timeout.map(|t| Instant::now() + t);
        let timer = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);

        let mut tasks = JoinSet::new();
        let mut launched = 0usize;
        let mut exhausted = false;
        let mut stopped_by = token.is_cancelled().then_some(StudyStatus::Stopped);

        loop {
            while stopped_by.is_none()
                && !exhausted
                && tasks.len() < n_parallel
                && finished + tasks.len() < n_target
            {
                let params = {
                    let history = shared.history.read().await;
                    sampler.sample(&study.search_space, &history)
                };
                let Some(params) = params else {
                    info!(study_id = %study.study_id, "Search space exhausted");
                    exhausted = true;
                    break;
                };
                let trial = Trial::new(study.study_id, next_number, params);
                next_number += 1;
                self.inner.store.upsert_trial(&trial).await?;
                shared.history.write().await.push(trial.clone());
                debug!(
                    study_id = %study.study_id,
                    trial_number = trial.trial_number,
                    "Trial started"
                );
                launched += 1;
                tasks.spawn(run_trial(Arc::clone(&shared), trial, token.child_token()));
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                joined = tasks.join_next() => {
                    finished += 1;
                    match joined {
                        Some(Ok(trial)) => self.record_finished(study, &shared, trial).await?,
                        Some(Err(e)) => error!(study_id = %study.study_id, error = %e, "Trial task aborted"),
                        None => {}
                    }
                }
                _ = &mut timer, if stopped_by.is_none() => {
                    warn!(study_id = %study.study_id, "Study timed out, cancelling in-flight trials");
                    stopped_by = Some(StudyStatus::TimedOut);
                    token.cancel();
                }
                _ = token.cancelled(), if stopped_by.is_none() => {
                    info!(study_id = %study.study_id, "Study stop requested");
                    stopped_by = Some(StudyStatus::Stopped);
                }
            }
        }

        study.status = stopped_by.unwrap_or(StudyStatus::Completed);
        study.updated_at = Utc::now();
        self.inner.store.update_study(study).await?;

        let best = match study.best_trial_id {
            Some(best_id) => shared
                .history
                .read()
                .await
                .iter()
                .find(|t| t.trial_id == best_id)
                .cloned(),
            None => None,
        };
        info!(
            study_id = %study.study_id,
            status = study.status.as_str(),
            trials_run = launched,
            best_value = ?study.best_value,
            "Optimization finished"
        );

        match best {
            Some(best_trial) => Ok(StudyOutcome {
                study: study.clone(),
                best_trial,
                trials_run: launched,
            }),
            None => Err(match study.status {
                StudyStatus::TimedOut => TrainingError::Timeout(format!(
                    "study '{}' timed out before any trial completed",
                    study.name
                )),
                StudyStatus::Stopped => TrainingError::Cancelled(format!(
                    "study '{}' stopped before any trial completed",
                    study.name
                )),
                _ => TrainingError::Training(format!(
                    "study '{}' finished without a completed trial",
                    study.name
                )),
            }),
        }
    }

    async fn record_finished(
        &self,
        study: &mut HpoStudy,
        shared: &TrialShared,
        trial: Trial,
    ) -> Result<(), TrainingError> {
        {
            let mut history = shared.history.write().await;
            if let Some(entry) = history.iter_mut().find(|t| t.trial_id == trial.trial_id) {
                *entry = trial.clone();
            }
        }
        self.inner
            .metrics
            .record_trial(trial.state.as_str(), study.sampler.as_str());
        if study.consider(&trial) {
            info!(
                study_id = %study.study_id,
                trial_number = trial.trial_number,
                value = ?trial.final_value,
                "New best trial"
            );
        }
        study.updated_at = Utc::now();
        self.inner.store.update_study(study).await?;
        Ok(())
    }

    /// Re-runs the pipeline with the best trial's parameters and registers
    /// the resulting model.
    pub async fn promote_best(
        &self,
        study_id: StudyId,
        target: RunTarget,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, TrainingError> {
        let study = self.get_study(study_id).await?;
        let best = self.best_trial(study_id).await?.ok_or_else(|| {
            TrainingError::InvalidState(format!("study '{}' has no completed trial", study.name))
        })?;
        let spec = TrainingSpec::from_config(&study.model_type, &study.training_config)?;
        let model_name = spec.model_name.clone().unwrap_or_else(|| study.name.clone());
        info!(
            study_id = %study_id,
            trial_number = best.trial_number,
            model_name = %model_name,
            "Promoting best trial"
        );

        self.inner
            .pipeline
            .run(
                PipelineRun {
                    target,
                    tenant_id: study.tenant_id.clone(),
                    model_type: study.model_type.clone(),
                    model_name,
                    spec,
                    params: best.params,
                    register: true,
                },
                progress,
                cancel,
            )
            .await
    }
}
