//! Process wiring: one store, one worker pool, one pipeline and one
//! orchestrator, constructed once and shared by handle.

use std::sync::Arc;

use tracing::info;

use crate::config::OrchestratorConfig;
use crate::distributed::{DistributedTrainer, PoolBackend, WorkerPool};
use crate::error::TrainingError;
use crate::pipeline::{
    FeatureStore, GradientDescentTrainer, InMemoryModelRegistry, SyntheticFeatureStore,
    TrainingPipeline,
};
use crate::scheduler::{RecoveryReport, TrainingOrchestrator};
use crate::storage::{MemoryStore, SqliteStore, Store};

/// A fully wired trainforge instance.
pub struct Runtime {
    pub orchestrator: TrainingOrchestrator,
    pub worker_pool: Arc<WorkerPool>,
    pub registry: Arc<InMemoryModelRegistry>,
    /// What startup recovery did with persisted jobs.
    pub recovered: RecoveryReport,
}

impl Runtime {
    /// Opens the SQLite store at `config.database_url`, restores worker
    /// nodes and persisted jobs, and wires everything over the synthetic
    /// feature store.
    pub async fn connect(config: OrchestratorConfig) -> Result<Self, TrainingError> {
        config
            .validate()
            .map_err(|e| TrainingError::Validation(e.to_string()))?;
        let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
        Self::assemble(store, Arc::new(SyntheticFeatureStore::new()), config).await
    }

    /// Everything in memory; nothing survives the process.
    pub async fn in_memory(config: OrchestratorConfig) -> Result<Self, TrainingError> {
        config
            .validate()
            .map_err(|e| TrainingError::Validation(e.to_string()))?;
        Self::assemble(
            Arc::new(MemoryStore::new()),
            Arc::new(SyntheticFeatureStore::new()),
            config,
        )
        .await
    }

    /// Wires a runtime over explicit store and feature store.
    pub async fn assemble<S: Store + 'static>(
        store: Arc<S>,
        feature_store: Arc<dyn FeatureStore>,
        config: OrchestratorConfig,
    ) -> Result<Self, TrainingError> {
        let saved = store.list_workers().await?;
        let worker_pool = Arc::new(if saved.is_empty() {
            WorkerPool::new(&config.distributed)
        } else {
            info!(nodes = saved.len(), "Restored worker nodes");
            WorkerPool::with_nodes(saved)
        });

        let trainer = Arc::new(GradientDescentTrainer);
        let distributed = Arc::new(DistributedTrainer::new(
            Arc::new(PoolBackend::new(Arc::clone(&worker_pool))),
            trainer.clone(),
            config.distributed.clone(),
            config.pipeline.distributed_row_threshold,
        ));
        let registry = Arc::new(InMemoryModelRegistry::new());
        let pipeline = Arc::new(TrainingPipeline::new(
            config.pipeline.clone(),
            feature_store,
            registry.clone(),
            trainer,
            distributed,
        ));

        let orchestrator = TrainingOrchestrator::new(store, pipeline, config);
        let recovered = orchestrator.recover().await?;

        Ok(Self {
            orchestrator,
            worker_pool,
            registry,
            recovered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{JobPriority, JobStatus};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_in_memory_runtime_runs_job() {
        let runtime = Runtime::in_memory(
            OrchestratorConfig::default().with_poll_interval(Duration::from_millis(10)),
        )
        .await
        .unwrap();
        assert_eq!(runtime.worker_pool.len().await, 4);

        let orch = &runtime.orchestrator;
        orch.start().await.unwrap();
        let id = orch
            .create_job(
                "t1",
                "forecast",
                json!({"feature_set": "basic", "start": "2024-01-01", "end": "2024-01-10"}),
                JobPriority::Normal,
            )
            .await
            .unwrap();
        let job = orch.wait_for(id, Duration::from_secs(30)).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(runtime.registry.len().await, 1);
        orch.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result =
            Runtime::in_memory(OrchestratorConfig::default().with_max_concurrent_jobs(0)).await;
        assert!(matches!(result, Err(TrainingError::Validation(_))));
    }

    #[tokio::test]
    async fn test_sqlite_runtime_recovers_queued_jobs() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("trainforge.db").display());
        let config = OrchestratorConfig::default().with_database_url(url);

        let first = Runtime::connect(config.clone()).await.unwrap();
        let id = first
            .orchestrator
            .create_job(
                "t1",
                "forecast",
                json!({"feature_set": "basic", "start": "2024-01-01", "end": "2024-01-10"}),
                JobPriority::Low,
            )
            .await
            .unwrap();
        first.orchestrator.stats().await.unwrap();
        drop(first);

        let second = Runtime::connect(config).await.unwrap();
        assert_eq!(second.recovered.requeued, 1);
        assert!(second.orchestrator.queue().contains(id).await);
        assert_eq!(second.worker_pool.len().await, 4);
    }
}
