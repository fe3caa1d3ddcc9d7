//! The five-stage training pipeline.
//!
//! `load → preprocess → train → evaluate → register`. Progress is reported
//! through a [`ProgressSink`] as cumulative stage weights; cancellation is
//! checked before every stage and after every epoch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::distributed::{DistributedRequest, DistributedTrainer};
use crate::error::TrainingError;
use crate::hpo::Params;
use crate::scheduler::{JobId, TrainingSpec};

use super::dataset::{self, PreparedData};
use super::evaluation::{self, Metrics};
use super::external::{FeatureStore, ModelRegistry, RegisterModel};
use super::model::{LinearModel, ModelArtifact, ModelTrainer, TrainParams};

/// Receives progress updates from a running pipeline.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: f64, metrics: Option<Metrics>);
}

/// Discards progress updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

#[async_trait]
impl ProgressSink for NoopProgress {
    async fn report(&self, _progress: f64, _metrics: Option<Metrics>) {}
}

/// Called after every training epoch with the validation loss. Returning an
/// error (e.g. [`TrainingError::Pruned`]) stops training.
#[async_trait]
pub trait EpochObserver: Send + Sync {
    async fn on_epoch(&self, epoch: usize, validation_loss: f64) -> Result<(), TrainingError>;
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Preprocess,
    Train,
    Evaluate,
    Register,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::Preprocess => "preprocess",
            Stage::Train => "train",
            Stage::Evaluate => "evaluate",
            Stage::Register => "register",
        }
    }

    fn weight(self, config: &PipelineConfig) -> f64 {
        let w = &config.stage_weights;
        match self {
            Stage::Load => w.load,
            Stage::Preprocess => w.preprocess,
            Stage::Train => w.train,
            Stage::Evaluate => w.evaluate,
            Stage::Register => w.register,
        }
    }
}

/// Identifies an HPO trial run.
#[derive(Clone)]
pub struct TrialContext {
    pub study_id: Uuid,
    pub trial_id: Uuid,
    pub trial_number: u64,
    /// Receives intermediate values; may prune the trial.
    pub observer: Arc<dyn EpochObserver>,
}

/// What a pipeline run belongs to.
#[derive(Clone)]
pub enum RunTarget {
    Job(JobId),
    Trial(TrialContext),
}

impl RunTarget {
    /// Id used for distributed cancellation and logging.
    pub fn task_id(&self) -> String {
        match self {
            RunTarget::Job(id) => id.to_string(),
            RunTarget::Trial(ctx) => ctx.trial_id.to_string(),
        }
    }

    fn describe(&self) -> BTreeMap<String, String> {
        let mut meta = BTreeMap::new();
        match self {
            RunTarget::Job(id) => {
                meta.insert("job_id".to_string(), id.to_string());
            }
            RunTarget::Trial(ctx) => {
                meta.insert("study_id".to_string(), ctx.study_id.to_string());
                meta.insert("trial_id".to_string(), ctx.trial_id.to_string());
                meta.insert("trial_number".to_string(), ctx.trial_number.to_string());
            }
        }
        meta
    }
}

/// Input of one pipeline execution.
#[derive(Clone)]
pub struct PipelineRun {
    pub target: RunTarget,
    pub tenant_id: String,
    pub model_type: String,
    pub model_name: String,
    pub spec: TrainingSpec,
    /// Values layered over `spec.hyperparameters`, e.g. sampled by a trial.
    pub params: Params,
    /// Whether the trained model is registered. Trials skip it unless promoted.
    pub register: bool,
}

/// Output of a pipeline execution.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub model_id: Option<String>,
    pub metrics: Metrics,
    /// Validation RMSE after every epoch.
    pub validation_history: Vec<f64>,
    pub distributed: bool,
    pub duration: Duration,
}

/// Statistics about pipeline runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub models_registered: u64,
    pub average_duration: Duration,
}

impl PipelineStats {
    fn record_success(&mut self, duration: Duration, registered: bool) {
        self.runs_completed += 1;
        if registered {
            self.models_registered += 1;
        }
        let n = self.runs_completed as u32;
        self.average_duration = (self.average_duration * (n - 1) + duration) / n;
    }

    fn record_failure(&mut self) {
        self.runs_failed += 1;
    }
}

/// Progress and trial reporting for the training stage.
struct TrainStageObserver<'a> {
    progress: &'a dyn ProgressSink,
    base: f64,
    weight: f64,
    epochs: usize,
    trial: Option<Arc<dyn EpochObserver>>,
    history: Mutex<Vec<f64>>,
}

#[async_trait]
impl EpochObserver for TrainStageObserver<'_> {
    async fn on_epoch(&self, epoch: usize, validation_loss: f64) -> Result<(), TrainingError> {
        self.history.lock().await.push(validation_loss);
        let fraction = (epoch + 1) as f64 / self.epochs.max(1) as f64;
        self.progress
            .report(self.base + self.weight * fraction.min(1.0), None)
            .await;
        if let Some(trial) = &self.trial {
            trial.on_epoch(epoch, validation_loss).await?;
        }
        Ok(())
    }
}

fn checkpoint(cancel: &CancellationToken, task_id: &str, stage: Stage) -> Result<(), TrainingError> {
    if cancel.is_cancelled() {
        return Err(TrainingError::Cancelled(format!(
            "{} cancelled before {} stage",
            task_id,
            stage.as_str()
        )));
    }
    Ok(())
}

/// Executes training runs for jobs and trials.
pub struct TrainingPipeline {
    config: PipelineConfig,
    feature_store: Arc<dyn FeatureStore>,
    registry: Arc<dyn ModelRegistry>,
    trainer: Arc<dyn ModelTrainer>,
    distributed: Arc<DistributedTrainer>,
    stats: RwLock<PipelineStats>,
}

impl TrainingPipeline {
    pub fn new(
        config: PipelineConfig,
        feature_store: Arc<dyn FeatureStore>,
        registry: Arc<dyn ModelRegistry>,
        trainer: Arc<dyn ModelTrainer>,
        distributed: Arc<DistributedTrainer>,
    ) -> Self {
        Self {
            config,
            feature_store,
            registry,
            trainer,
            distributed,
            stats: RwLock::new(PipelineStats::default()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn distributed(&self) -> &Arc<DistributedTrainer> {
        &self.distributed
    }

    pub fn registry(&self) -> &Arc<dyn ModelRegistry> {
        &self.registry
    }

    pub fn feature_store(&self) -> &Arc<dyn FeatureStore> {
        &self.feature_store
    }

    pub async fn stats(&self) -> PipelineStats {
        self.stats.read().await.clone()
    }

    /// Runs all stages. Returns the registered model id (when `register` is
    /// set) and the test-split metrics.
    pub async fn run(
        &self,
        run: PipelineRun,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, TrainingError> {
        self.stats.write().await.runs_started += 1;
        let started = Instant::now();
        let result = self.execute(&run, progress, cancel).await;

        let mut stats = self.stats.write().await;
        match result {
            Ok(mut outcome) => {
                outcome.duration = started.elapsed();
                stats.record_success(outcome.duration, outcome.model_id.is_some());
                Ok(outcome)
            }
            Err(e) => {
                stats.record_failure();
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        run: &PipelineRun,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, TrainingError> {
        let task_id = run.target.task_id();
        let spec = &run.spec;
        let mut done = 0.0;

        // Stage 1: load
        checkpoint(cancel, &task_id, Stage::Load)?;
        let data = self
            .feature_store
            .get_dataset(
                &run.tenant_id,
                &spec.feature_set,
                spec.start,
                spec.end,
                spec.asset_ids.as_deref(),
            )
            .await?;
        if data.is_empty() {
            return Err(TrainingError::Data(format!(
                "feature set '{}' returned zero rows for {} .. {}",
                spec.feature_set, spec.start, spec.end
            )));
        }
        info!(task_id = %task_id, stage = "load", rows = data.len(), "Stage complete");
        done += Stage::Load.weight(&self.config);
        progress.report(done, None).await;

        // Stage 2: preprocess
        checkpoint(cancel, &task_id, Stage::Preprocess)?;
        let prepared = dataset::prepare(&data, &spec.target, &spec.split)?;
        drop(data);
        info!(
            task_id = %task_id,
            stage = "preprocess",
            train_rows = prepared.train.len(),
            test_rows = prepared.test.len(),
            "Stage complete"
        );
        done += Stage::Preprocess.weight(&self.config);
        progress.report(done, None).await;

        // Stage 3: train
        checkpoint(cancel, &task_id, Stage::Train)?;
        let mut overrides = spec.hyperparameters.clone();
        overrides.extend(run.params.clone());
        let params = TrainParams::resolve(&overrides, &self.config)?;
        let observer = TrainStageObserver {
            progress,
            base: done,
            weight: Stage::Train.weight(&self.config),
            epochs: params.epochs,
            trial: match &run.target {
                RunTarget::Trial(ctx) => Some(Arc::clone(&ctx.observer)),
                RunTarget::Job(_) => None,
            },
            history: Mutex::new(Vec::new()),
        };

        let distributed = self
            .distributed
            .should_distribute(spec.n_workers, prepared.train.len());
        let model = if distributed {
            let outcome = self
                .distributed
                .train(
                    DistributedRequest {
                        task_id: task_id.clone(),
                        init: self.trainer.initialize(&prepared.train),
                        train: prepared.train.clone(),
                        validation: Arc::new(prepared.validation.clone()),
                        params: params.clone(),
                        n_workers: spec.n_workers,
                    },
                    &observer,
                    cancel,
                )
                .await?;
            outcome.model
        } else {
            self.train_in_process(&prepared, &params, &observer, cancel, &task_id)
                .await?
        };
        let validation_history = observer.history.into_inner();
        info!(
            task_id = %task_id,
            stage = "train",
            distributed = distributed,
            epochs = params.epochs,
            "Stage complete"
        );
        done += Stage::Train.weight(&self.config);
        progress.report(done, None).await;

        // Stage 4: evaluate
        checkpoint(cancel, &task_id, Stage::Evaluate)?;
        let predictions = model.predict(&prepared.test.x);
        let mut metrics = evaluation::evaluate(prepared.test.y.view(), predictions.view())?;
        metrics.insert("val_rmse".to_string(), model.loss(&prepared.validation));
        info!(
            task_id = %task_id,
            stage = "evaluate",
            rmse = metrics.get("rmse").copied().unwrap_or(f64::NAN),
            "Stage complete"
        );
        done += Stage::Evaluate.weight(&self.config);
        progress.report(done, Some(metrics.clone())).await;

        // Stage 5: register
        let model_id = if run.register {
            checkpoint(cancel, &task_id, Stage::Register)?;
            let id = self
                .register(run, &prepared, &model, &overrides, &metrics, distributed)
                .await?;
            info!(task_id = %task_id, stage = "register", model_id = %id, "Stage complete");
            Some(id)
        } else {
            debug!(task_id = %task_id, "Skipping model registration");
            None
        };
        progress.report(1.0, Some(metrics.clone())).await;

        Ok(PipelineOutcome {
            model_id,
            metrics,
            validation_history,
            distributed,
            duration: Duration::ZERO,
        })
    }

    async fn train_in_process(
        &self,
        prepared: &PreparedData,
        params: &TrainParams,
        observer: &dyn EpochObserver,
        cancel: &CancellationToken,
        task_id: &str,
    ) -> Result<LinearModel, TrainingError> {
        let mut model = self.trainer.initialize(&prepared.train);
        for epoch in 0..params.epochs {
            if cancel.is_cancelled() {
                return Err(TrainingError::Cancelled(format!(
                    "{} cancelled at epoch {}",
                    task_id, epoch
                )));
            }
            self.trainer.fit_epoch(&mut model, &prepared.train, params)?;
            observer.on_epoch(epoch, model.loss(&prepared.validation)).await?;
            tokio::task::yield_now().await;
        }
        Ok(model)
    }

    async fn register(
        &self,
        run: &PipelineRun,
        prepared: &PreparedData,
        model: &LinearModel,
        params: &Params,
        metrics: &Metrics,
        distributed: bool,
    ) -> Result<String, TrainingError> {
        let artifact = ModelArtifact {
            model_type: run.model_type.clone(),
            feature_names: prepared.feature_names.clone(),
            weights: model.weights.to_vec(),
            bias: model.bias,
            scaler: prepared.scaler.clone(),
            params: params.clone(),
        };

        let mut metadata = run.target.describe();
        metadata.insert("feature_set".to_string(), run.spec.feature_set.clone());
        metadata.insert("target".to_string(), run.spec.target.clone());
        metadata.insert("start".to_string(), run.spec.start.to_rfc3339());
        metadata.insert("end".to_string(), run.spec.end.to_rfc3339());
        metadata.insert("trainer".to_string(), self.trainer.name().to_string());
        metadata.insert("distributed".to_string(), distributed.to_string());

        let registered = self
            .registry
            .register(RegisterModel {
                tenant_id: run.tenant_id.clone(),
                model_name: run.model_name.clone(),
                model_type: run.model_type.clone(),
                artifact: artifact.to_bytes()?,
                metrics: metrics.clone(),
                metadata,
            })
            .await?;
        Ok(registered.model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DistributedConfig;
    use crate::distributed::LocalBackend;
    use crate::pipeline::{
        Dataset, FeatureRow, GradientDescentTrainer, InMemoryFeatureStore, InMemoryModelRegistry,
        SyntheticFeatureStore,
    };
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        updates: StdMutex<Vec<(f64, bool)>>,
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn report(&self, progress: f64, metrics: Option<Metrics>) {
            self.updates.lock().unwrap().push((progress, metrics.is_some()));
        }
    }

    fn pipeline_with(
        store: Arc<dyn FeatureStore>,
        registry: Arc<InMemoryModelRegistry>,
    ) -> TrainingPipeline {
        let config = PipelineConfig::default();
        let distributed = Arc::new(DistributedTrainer::new(
            Arc::new(LocalBackend::new()),
            Arc::new(GradientDescentTrainer),
            DistributedConfig::default(),
            config.distributed_row_threshold,
        ));
        TrainingPipeline::new(
            config,
            store,
            registry,
            Arc::new(GradientDescentTrainer),
            distributed,
        )
    }

    fn spec(extra: serde_json::Value) -> TrainingSpec {
        let mut config = json!({
            "feature_set": "basic",
            "horizon": 24,
            "start": "2024-01-01",
            "end": "2024-02-01",
            "hyperparameters": {"epochs": 10, "learning_rate": 0.1}
        });
        if let (Some(base), Some(extra)) = (config.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        TrainingSpec::from_config("forecast", &config).unwrap()
    }

    fn job_run(spec: TrainingSpec, register: bool) -> PipelineRun {
        PipelineRun {
            target: RunTarget::Job(Uuid::new_v4()),
            tenant_id: "tenant-a".into(),
            model_type: "forecast".into(),
            model_name: "load-forecast".into(),
            spec,
            params: Params::new(),
            register,
        }
    }

    #[tokio::test]
    async fn test_pipeline_end_to_end() {
        let registry = Arc::new(InMemoryModelRegistry::new());
        let pipeline = pipeline_with(Arc::new(SyntheticFeatureStore::new()), Arc::clone(&registry));
        let sink = RecordingSink::default();

        let outcome = pipeline
            .run(job_run(spec(json!({})), true), &sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.model_id.as_deref(), Some("tenant-a:load-forecast:v1"));
        assert!(outcome.metrics.contains_key("mae"));
        assert!(outcome.metrics.contains_key("rmse"));
        assert_eq!(outcome.validation_history.len(), 10);
        assert!(!outcome.distributed);
        assert_eq!(registry.len().await, 1);

        let updates = sink.updates.lock().unwrap().clone();
        assert!(updates.windows(2).all(|w| w[0].0 <= w[1].0 + 1e-12));
        assert_eq!(updates.last().map(|u| u.0), Some(1.0));
        // Metrics only appear once evaluation has run.
        let first_with_metrics = updates.iter().position(|u| u.1).unwrap();
        assert!(updates[first_with_metrics].0 >= 0.85 - 1e-9);

        let stats = pipeline.stats().await;
        assert_eq!(stats.runs_completed, 1);
        assert_eq!(stats.models_registered, 1);
    }

    #[tokio::test]
    async fn test_pipeline_skips_registration_for_trials() {
        let registry = Arc::new(InMemoryModelRegistry::new());
        let pipeline = pipeline_with(Arc::new(SyntheticFeatureStore::new()), Arc::clone(&registry));
        let outcome = pipeline
            .run(job_run(spec(json!({})), false), &NoopProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.model_id.is_none());
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_pipeline_distributes_when_workers_requested() {
        let registry = Arc::new(InMemoryModelRegistry::new());
        let pipeline = pipeline_with(Arc::new(SyntheticFeatureStore::new()), registry);
        let outcome = pipeline
            .run(
                job_run(spec(json!({"n_workers": 3})), false),
                &NoopProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(outcome.distributed);
        assert!(outcome.metrics["rmse"].is_finite());
    }

    #[tokio::test]
    async fn test_pipeline_empty_dataset_is_data_error() {
        let store = Arc::new(InMemoryFeatureStore::new());
        let mut ds = Dataset::new(vec!["x".into(), "target".into()]);
        ds.push(FeatureRow {
            timestamp: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            asset_id: "a".into(),
            values: vec![1.0, 1.0],
        })
        .unwrap();
        store.insert("tenant-a", "basic", ds).await;

        let pipeline = pipeline_with(store, Arc::new(InMemoryModelRegistry::new()));
        let err = pipeline
            .run(job_run(spec(json!({})), true), &NoopProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TrainingError::Data(_)));
        assert!(!err.is_retryable());
        assert_eq!(pipeline.stats().await.runs_failed, 1);
    }

    #[tokio::test]
    async fn test_pipeline_honours_cancellation() {
        let pipeline = pipeline_with(
            Arc::new(SyntheticFeatureStore::new()),
            Arc::new(InMemoryModelRegistry::new()),
        );
        let token = CancellationToken::new();
        token.cancel();
        let err = pipeline
            .run(job_run(spec(json!({})), true), &NoopProgress, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, TrainingError::Cancelled(_)));
    }

    struct PruneAfter(usize);

    #[async_trait]
    impl EpochObserver for PruneAfter {
        async fn on_epoch(&self, epoch: usize, _loss: f64) -> Result<(), TrainingError> {
            if epoch >= self.0 {
                return Err(TrainingError::Pruned { step: epoch });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_trial_observer_can_prune() {
        let pipeline = pipeline_with(
            Arc::new(SyntheticFeatureStore::new()),
            Arc::new(InMemoryModelRegistry::new()),
        );
        let mut run = job_run(spec(json!({})), false);
        run.target = RunTarget::Trial(TrialContext {
            study_id: Uuid::new_v4(),
            trial_id: Uuid::new_v4(),
            trial_number: 0,
            observer: Arc::new(PruneAfter(3)),
        });
        let err = pipeline
            .run(run, &NoopProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TrainingError::Pruned { step: 3 }));
    }

    #[tokio::test]
    async fn test_sampled_params_override_job_params() {
        let pipeline = pipeline_with(
            Arc::new(SyntheticFeatureStore::new()),
            Arc::new(InMemoryModelRegistry::new()),
        );
        let mut run = job_run(spec(json!({})), false);
        run.params
            .insert("epochs".into(), crate::hpo::ParamValue::Int(4));
        let outcome = pipeline
            .run(run, &NoopProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.validation_history.len(), 4);
    }

    #[test]
    fn test_stage_weights_sum() {
        let config = PipelineConfig::default();
        let total: f64 = [
            Stage::Load,
            Stage::Preprocess,
            Stage::Train,
            Stage::Evaluate,
            Stage::Register,
        ]
        .iter()
        .map(|s| s.weight(&config))
        .sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
}
