//! Execution backends for partition subtasks.
//!
//! A backend accepts a [`Subtask`], runs it somewhere and resolves the
//! returned [`SubtaskHandle`] with the partition's trained model. Two
//! backends ship with the crate:
//!
//! - [`LocalBackend`]: runs subtasks on the blocking thread pool, no pool
//!   accounting
//! - [`PoolBackend`]: leases a node from the [`WorkerPool`] per subtask

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TrainingError;
use crate::pipeline::{fit_partition, LinearModel, ModelTrainer, Split, TrainParams};

use super::worker_pool::{PoolStatus, Resources, WorkerNode, WorkerPool};

/// Per-epoch progress of one partition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochReport {
    pub partition: usize,
    pub epoch: usize,
    pub validation_loss: f64,
}

/// One unit of distributed work: train a model on one partition.
#[derive(Clone)]
pub struct Subtask {
    /// Id of the owning training task, used for cancellation.
    pub task_id: String,
    pub subtask_id: String,
    pub partition: usize,
    pub attempt: u32,
    pub train: Arc<Split>,
    pub validation: Arc<Split>,
    pub init: LinearModel,
    pub params: TrainParams,
    pub trainer: Arc<dyn ModelTrainer>,
    pub resources: Resources,
    /// Workers this attempt must not run on.
    pub exclude_workers: Vec<String>,
    pub progress: mpsc::UnboundedSender<EpochReport>,
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for Subtask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subtask")
            .field("task_id", &self.task_id)
            .field("subtask_id", &self.subtask_id)
            .field("partition", &self.partition)
            .field("attempt", &self.attempt)
            .field("rows", &self.train.len())
            .finish()
    }
}

/// Result of a finished subtask.
#[derive(Debug, Clone)]
pub struct PartialModel {
    pub partition: usize,
    pub worker_id: String,
    pub model: LinearModel,
    pub rows: usize,
    pub validation_loss: f64,
}

/// Future of a submitted subtask.
#[derive(Debug)]
pub struct SubtaskHandle {
    pub subtask_id: String,
    pub partition: usize,
    pub worker_id: String,
    rx: oneshot::Receiver<Result<PartialModel, TrainingError>>,
}

impl SubtaskHandle {
    pub fn new(
        subtask_id: String,
        partition: usize,
        worker_id: String,
        rx: oneshot::Receiver<Result<PartialModel, TrainingError>>,
    ) -> Self {
        Self {
            subtask_id,
            partition,
            worker_id,
            rx,
        }
    }
}

impl Future for SubtaskHandle {
    type Output = Result<PartialModel, TrainingError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let worker_id = self.worker_id.clone();
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(TrainingError::WorkerUnavailable(format!(
                    "worker {} dropped the subtask",
                    worker_id
                )))
            })
        })
    }
}

/// Where partition subtasks run.
#[async_trait]
pub trait DistributedBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts a subtask. The handle resolves when it finishes.
    async fn submit(&self, subtask: Subtask) -> Result<SubtaskHandle, TrainingError>;

    /// Cancels every in-flight subtask of `task_id`.
    async fn cancel(&self, task_id: &str);

    async fn pool_status(&self) -> PoolStatus;
}

/// Tracks subtask cancellation tokens per owning task.
#[derive(Default)]
struct ActiveSubtasks {
    tokens: Mutex<HashMap<String, HashMap<String, CancellationToken>>>,
}

impl ActiveSubtasks {
    async fn register(&self, task_id: &str, subtask_id: &str, token: CancellationToken) {
        self.tokens
            .lock()
            .await
            .entry(task_id.to_string())
            .or_default()
            .insert(subtask_id.to_string(), token);
    }

    async fn finish(&self, task_id: &str, subtask_id: &str) {
        let mut tokens = self.tokens.lock().await;
        if let Some(subtasks) = tokens.get_mut(task_id) {
            subtasks.remove(subtask_id);
            if subtasks.is_empty() {
                tokens.remove(task_id);
            }
        }
    }

    async fn cancel(&self, task_id: &str) -> usize {
        let tokens = self.tokens.lock().await;
        match tokens.get(task_id) {
            Some(subtasks) => {
                for token in subtasks.values() {
                    token.cancel();
                }
                subtasks.len()
            }
            None => 0,
        }
    }
}

/// Runs the partition fit on the blocking pool, checking cancellation and
/// worker reachability between epochs.
async fn run_partition(
    subtask: Subtask,
    worker_id: String,
    reachable: Option<Arc<AtomicBool>>,
) -> Result<PartialModel, TrainingError> {
    let Subtask {
        partition,
        train,
        validation,
        init,
        params,
        trainer,
        progress,
        cancel,
        subtask_id,
        ..
    } = subtask;
    let worker = worker_id.clone();

    let joined = tokio::task::spawn_blocking(move || {
        let mut lost_worker = false;
        let result = fit_partition(
            trainer.as_ref(),
            init,
            &train,
            &validation,
            &params,
            |epoch, validation_loss| {
                if reachable
                    .as_ref()
                    .is_some_and(|flag| !flag.load(Ordering::SeqCst))
                {
                    lost_worker = true;
                    return false;
                }
                if cancel.is_cancelled() {
                    return false;
                }
                let _ = progress.send(EpochReport {
                    partition,
                    epoch,
                    validation_loss,
                });
                true
            },
        );
        match result {
            Err(TrainingError::Cancelled(_)) if lost_worker => Err(
                TrainingError::WorkerUnavailable(format!("worker {} became unreachable", worker)),
            ),
            Ok(model) => {
                let validation_loss = model.loss(&validation);
                Ok(PartialModel {
                    partition,
                    worker_id: worker,
                    model,
                    rows: train.len(),
                    validation_loss,
                })
            }
            Err(e) => Err(e),
        }
    })
    .await;

    joined.unwrap_or_else(|e| {
        warn!(subtask_id = %subtask_id, worker_id = %worker_id, error = %e, "Subtask panicked");
        Err(TrainingError::WorkerUnavailable(format!(
            "worker {} crashed: {}",
            worker_id, e
        )))
    })
}

/// Single-process backend. Every subtask starts immediately on the blocking
/// thread pool under the pseudo worker `local`.
#[derive(Default)]
pub struct LocalBackend {
    active: Arc<ActiveSubtasks>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn submit(&self, subtask: Subtask) -> Result<SubtaskHandle, TrainingError> {
        let (tx, rx) = oneshot::channel();
        let task_id = subtask.task_id.clone();
        let subtask_id = subtask.subtask_id.clone();
        let partition = subtask.partition;
        self.active
            .register(&task_id, &subtask_id, subtask.cancel.clone())
            .await;

        let active = Arc::clone(&self.active);
        let sub_id = subtask_id.clone();
        tokio::spawn(async move {
            let result = run_partition(subtask, "local".to_string(), None).await;
            active.finish(&task_id, &sub_id).await;
            let _ = tx.send(result);
        });
        Ok(SubtaskHandle::new(subtask_id, partition, "local".to_string(), rx))
    }

    async fn cancel(&self, task_id: &str) {
        self.active.cancel(task_id).await;
    }

    async fn pool_status(&self) -> PoolStatus {
        PoolStatus::from_nodes(vec![WorkerNode::new("local", Resources::default())])
    }
}

/// Backend that leases a [`WorkerPool`] node for each subtask.
pub struct PoolBackend {
    pool: Arc<WorkerPool>,
    active: Arc<ActiveSubtasks>,
}

impl PoolBackend {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            active: Arc::new(ActiveSubtasks::default()),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}

#[async_trait]
impl DistributedBackend for PoolBackend {
    fn name(&self) -> &'static str {
        "pool"
    }

    async fn submit(&self, subtask: Subtask) -> Result<SubtaskHandle, TrainingError> {
        let lease = self
            .pool
            .acquire(
                &subtask.subtask_id,
                subtask.resources,
                &subtask.exclude_workers,
                &subtask.cancel,
            )
            .await?;

        let (tx, rx) = oneshot::channel();
        let worker_id = lease.worker_id.clone();
        let task_id = subtask.task_id.clone();
        let subtask_id = subtask.subtask_id.clone();
        let partition = subtask.partition;
        self.active
            .register(&task_id, &subtask_id, subtask.cancel.clone())
            .await;

        debug!(
            task_id = %task_id,
            subtask_id = %subtask_id,
            worker_id = %worker_id,
            attempt = subtask.attempt,
            "Subtask dispatched"
        );

        let pool = Arc::clone(&self.pool);
        let active = Arc::clone(&self.active);
        let reachable = lease.reachability();
        let worker = worker_id.clone();
        let sub_id = subtask_id.clone();
        tokio::spawn(async move {
            let result = run_partition(subtask, worker, Some(reachable)).await;
            pool.release(lease, result.is_ok()).await;
            active.finish(&task_id, &sub_id).await;
            let _ = tx.send(result);
        });

        Ok(SubtaskHandle::new(subtask_id, partition, worker_id, rx))
    }

    async fn cancel(&self, task_id: &str) {
        let cancelled = self.active.cancel(task_id).await;
        if cancelled > 0 {
            debug!(task_id = %task_id, subtasks = cancelled, "Cancelled subtasks");
        }
    }

    async fn pool_status(&self) -> PoolStatus {
        self.pool.status().await
    }
}
