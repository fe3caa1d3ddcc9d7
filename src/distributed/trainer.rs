//! Partitioned training across the worker pool.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DistributedConfig;
use crate::error::TrainingError;
use crate::pipeline::{EpochObserver, LinearModel, ModelTrainer, Split, TrainParams};

use super::aggregation::{strategy_for, AggregationStrategy};
use super::backend::{DistributedBackend, EpochReport, PartialModel, Subtask, SubtaskHandle};
use super::worker_pool::{PoolStatus, Resources};

/// Fewest training rows a partition may hold.
const MIN_PARTITION_ROWS: usize = 2;

/// Input of one distributed fit.
#[derive(Debug, Clone)]
pub struct DistributedRequest {
    /// Owning task id (job id or trial id); used for cancellation.
    pub task_id: String,
    pub train: Split,
    pub validation: Arc<Split>,
    pub init: LinearModel,
    pub params: TrainParams,
    /// Requested partition count; defaults to the reachable pool size.
    pub n_workers: Option<usize>,
}

/// Result of a distributed fit.
#[derive(Debug, Clone)]
pub struct DistributedOutcome {
    pub model: LinearModel,
    pub partitions: usize,
    pub validation_loss: f64,
    /// Partition subtasks that were re-run after a worker failure.
    pub retried_subtasks: u32,
}

/// Splits `rows` into `parts` contiguous, near-equal ranges.
pub fn partition_bounds(rows: usize, parts: usize) -> Vec<(usize, usize)> {
    let parts = parts.clamp(1, rows.max(1));
    let base = rows / parts;
    let extra = rows % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let range = (start, start + len);
            start += len;
            range
        })
        .collect()
}

fn track(
    handle: SubtaskHandle,
) -> impl Future<Output = (usize, String, Result<PartialModel, TrainingError>)> {
    let partition = handle.partition;
    let worker_id = handle.worker_id.clone();
    async move { (partition, worker_id, handle.await) }
}

/// Collects per-partition epoch losses and releases the row-weighted mean
/// of an epoch once every partition has reported it.
struct EpochBarrier {
    weights: Vec<f64>,
    pending: BTreeMap<usize, Vec<Option<f64>>>,
    next_epoch: usize,
}

impl EpochBarrier {
    fn new(rows: &[usize]) -> Self {
        let total: usize = rows.iter().sum::<usize>().max(1);
        Self {
            weights: rows.iter().map(|r| *r as f64 / total as f64).collect(),
            pending: BTreeMap::new(),
            next_epoch: 0,
        }
    }

    fn record(&mut self, report: EpochReport) -> Vec<(usize, f64)> {
        if report.epoch < self.next_epoch {
            // A retried partition replaying an epoch that was already released.
            return Vec::new();
        }
        let parts = self.weights.len();
        self.pending
            .entry(report.epoch)
            .or_insert_with(|| vec![None; parts])[report.partition] = Some(report.validation_loss);

        let mut ready = Vec::new();
        while let Some(losses) = self.pending.get(&self.next_epoch) {
            if losses.iter().any(Option::is_none) {
                break;
            }
            let mean = losses
                .iter()
                .zip(&self.weights)
                .map(|(loss, w)| loss.unwrap_or(0.0) * w)
                .sum();
            ready.push((self.next_epoch, mean));
            self.pending.remove(&self.next_epoch);
            self.next_epoch += 1;
        }
        ready
    }
}

/// Trains a model by partitioning the training split across workers and
/// aggregating the per-partition results.
pub struct DistributedTrainer {
    backend: Arc<dyn DistributedBackend>,
    trainer: Arc<dyn ModelTrainer>,
    aggregator: Box<dyn AggregationStrategy>,
    config: DistributedConfig,
    row_threshold: usize,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl DistributedTrainer {
    pub fn new(
        backend: Arc<dyn DistributedBackend>,
        trainer: Arc<dyn ModelTrainer>,
        config: DistributedConfig,
        row_threshold: usize,
    ) -> Self {
        let aggregator = strategy_for(config.aggregation);
        Self {
            backend,
            trainer,
            aggregator,
            config,
            row_threshold,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the aggregation strategy.
    pub fn with_aggregation(mut self, aggregator: Box<dyn AggregationStrategy>) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Whether a fit should be distributed rather than run in-process.
    pub fn should_distribute(&self, n_workers: Option<usize>, rows: usize) -> bool {
        n_workers.unwrap_or(1) > 1 || rows > self.row_threshold
    }

    pub async fn pool_status(&self) -> PoolStatus {
        self.backend.pool_status().await
    }

    /// Cancels the distributed fit of `task_id` and all of its subtasks.
    pub async fn cancel(&self, task_id: &str) {
        if let Some(token) = self.active.lock().await.get(task_id) {
            token.cancel();
        }
        self.backend.cancel(task_id).await;
    }

    /// Runs a distributed fit. Observer errors (e.g. a prune decision) abort
    /// the fit and are returned unchanged.
    pub async fn train(
        &self,
        request: DistributedRequest,
        observer: &dyn EpochObserver,
        cancel: &CancellationToken,
    ) -> Result<DistributedOutcome, TrainingError> {
        let task_id = request.task_id.clone();
        let token = cancel.child_token();
        self.active
            .lock()
            .await
            .insert(task_id.clone(), token.clone());

        let result = self.run(request, observer, &token).await;

        self.active.lock().await.remove(&task_id);
        if result.is_err() {
            token.cancel();
            self.backend.cancel(&task_id).await;
        }
        result
    }

    async fn run(
        &self,
        request: DistributedRequest,
        observer: &dyn EpochObserver,
        token: &CancellationToken,
    ) -> Result<DistributedOutcome, TrainingError> {
        let rows = request.train.len();
        let requested = match request.n_workers {
            Some(n) => n,
            None => self.backend.pool_status().await.available().max(1),
        };
        let max_parts = (rows / MIN_PARTITION_ROWS).max(1);
        let bounds = partition_bounds(rows, requested.min(max_parts));
        let parts = bounds.len();

        let partitions: Vec<Arc<Split>> = bounds
            .iter()
            .map(|(start, end)| Arc::new(request.train.slice_rows(*start, *end)))
            .collect();
        let partition_rows: Vec<usize> = partitions.iter().map(|p| p.len()).collect();

        info!(
            task_id = %request.task_id,
            backend = self.backend.name(),
            partitions = parts,
            rows = rows,
            "Starting distributed training"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut barrier = EpochBarrier::new(&partition_rows);
        let mut attempts = vec![0u32; parts];
        let mut failed_on: Vec<Vec<String>> = vec![Vec::new(); parts];
        let mut results: Vec<Option<PartialModel>> = vec![None; parts];
        let mut retried = 0u32;

        let subtask = |partition: usize, attempt: u32, exclude: Vec<String>| Subtask {
            task_id: request.task_id.clone(),
            subtask_id: format!("{}/p{}/a{}", request.task_id, partition, attempt),
            partition,
            attempt,
            train: Arc::clone(&partitions[partition]),
            validation: Arc::clone(&request.validation),
            init: request.init.clone(),
            params: request.params.clone(),
            trainer: Arc::clone(&self.trainer),
            resources: Resources {
                cpu: 1,
                ..Default::default()
            },
            exclude_workers: exclude,
            progress: tx.clone(),
            cancel: token.child_token(),
        };

        let mut pending = FuturesUnordered::new();
        for partition in 0..parts {
            let handle = self.backend.submit(subtask(partition, 0, Vec::new())).await?;
            pending.push(track(handle));
        }

        let mut done = 0;
        while done < parts {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return Err(TrainingError::Cancelled(format!(
                        "distributed training of {} cancelled",
                        request.task_id
                    )));
                }
                Some(report) = rx.recv() => {
                    for (epoch, loss) in barrier.record(report) {
                        observer.on_epoch(epoch, loss).await?;
                    }
                }
                Some((partition, worker_id, result)) = pending.next() => match result {
                    Ok(partial) => {
                        debug!(
                            task_id = %request.task_id,
                            partition = partition,
                            worker_id = %worker_id,
                            loss = partial.validation_loss,
                            "Partition finished"
                        );
                        results[partition] = Some(partial);
                        done += 1;
                    }
                    Err(TrainingError::WorkerUnavailable(message)) => {
                        attempts[partition] += 1;
                        failed_on[partition].push(worker_id.clone());
                        if attempts[partition] > self.config.partition_retries {
                            return Err(TrainingError::WorkerUnavailable(format!(
                                "partition {} failed after {} attempts: {}",
                                partition, attempts[partition], message
                            )));
                        }
                        warn!(
                            task_id = %request.task_id,
                            partition = partition,
                            worker_id = %worker_id,
                            attempt = attempts[partition],
                            error = %message,
                            "Partition failed, retrying on another worker"
                        );
                        retried += 1;
                        let handle = self
                            .backend
                            .submit(subtask(partition, attempts[partition], failed_on[partition].clone()))
                            .await?;
                        pending.push(track(handle));
                    }
                    Err(e) => return Err(e),
                },
            }
        }

        // Reports sent just before each partition finished.
        while let Ok(report) = rx.try_recv() {
            for (epoch, loss) in barrier.record(report) {
                observer.on_epoch(epoch, loss).await?;
            }
        }

        let partials: Vec<PartialModel> = results.into_iter().flatten().collect();
        let model = self.aggregator.aggregate(&partials)?;
        let validation_loss = model.loss(&request.validation);
        if !validation_loss.is_finite() {
            return Err(TrainingError::Training(
                "aggregated model produced a non-finite validation loss".to_string(),
            ));
        }

        info!(
            task_id = %request.task_id,
            aggregation = self.aggregator.name(),
            validation_loss = validation_loss,
            retried_subtasks = retried,
            "Distributed training finished"
        );

        Ok(DistributedOutcome {
            model,
            partitions: parts,
            validation_loss,
            retried_subtasks: retried,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{LocalBackend, PoolBackend, WorkerPool, WorkerStatus};
    use crate::pipeline::GradientDescentTrainer;
    use async_trait::async_trait;
    use ndarray::Array2;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn split(n: usize) -> Split {
        let x = Array2::from_shape_fn((n, 1), |(i, _)| i as f64 / n as f64 - 0.5);
        let y = x.column(0).mapv(|v| 4.0 * v + 2.0);
        Split { x, y }
    }

    fn request(task_id: &str, epochs: usize, n_workers: Option<usize>) -> DistributedRequest {
        let train = split(120);
        DistributedRequest {
            task_id: task_id.into(),
            init: GradientDescentTrainer.initialize(&train),
            validation: Arc::new(split(30)),
            train,
            params: TrainParams {
                learning_rate: 0.5,
                epochs,
                l2: 0.0,
            },
            n_workers,
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        epochs: std::sync::Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EpochObserver for RecordingObserver {
        async fn on_epoch(&self, epoch: usize, _loss: f64) -> Result<(), TrainingError> {
            self.epochs.lock().unwrap().push(epoch);
            Ok(())
        }
    }

    struct StopAt(usize);

    #[async_trait]
    impl EpochObserver for StopAt {
        async fn on_epoch(&self, epoch: usize, _loss: f64) -> Result<(), TrainingError> {
            if epoch >= self.0 {
                Err(TrainingError::Pruned { step: epoch })
            } else {
                Ok(())
            }
        }
    }

    /// Fails the first `failures` submissions that land on `bad_worker`.
    struct FlakyBackend {
        inner: LocalBackend,
        workers: Vec<String>,
        bad_worker: String,
        failures: AtomicUsize,
        submitted_on: std::sync::Mutex<Vec<String>>,
    }

    impl FlakyBackend {
        fn new(bad_worker: &str, failures: usize) -> Self {
            Self {
                inner: LocalBackend::new(),
                workers: vec!["w0".into(), "w1".into(), "w2".into()],
                bad_worker: bad_worker.into(),
                failures: AtomicUsize::new(failures),
                submitted_on: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DistributedBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn submit(&self, subtask: Subtask) -> Result<SubtaskHandle, TrainingError> {
            let worker = self
                .workers
                .iter()
                .find(|w| !subtask.exclude_workers.contains(w))
                .cloned()
                .ok_or_else(|| TrainingError::WorkerUnavailable("all workers excluded".into()))?;
            self.submitted_on.lock().unwrap().push(worker.clone());

            if worker == self.bad_worker && self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Err(TrainingError::WorkerUnavailable(format!(
                    "{} lost heartbeat",
                    worker
                ))));
                return Ok(SubtaskHandle::new(subtask.subtask_id, subtask.partition, worker, rx));
            }

            let partition = subtask.partition;
            let id = subtask.subtask_id.clone();
            let handle = self.inner.submit(subtask).await?;
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(handle.await);
            Ok(SubtaskHandle::new(id, partition, worker, rx))
        }

        async fn cancel(&self, task_id: &str) {
            self.inner.cancel(task_id).await;
        }

        async fn pool_status(&self) -> PoolStatus {
            self.inner.pool_status().await
        }
    }

    fn trainer(backend: Arc<dyn DistributedBackend>, retries: u32) -> DistributedTrainer {
        DistributedTrainer::new(
            backend,
            Arc::new(GradientDescentTrainer),
            DistributedConfig {
                partition_retries: retries,
                ..Default::default()
            },
            1_000,
        )
    }

    #[test]
    fn test_partition_bounds() {
        assert_eq!(partition_bounds(10, 3), vec![(0, 4), (4, 7), (7, 10)]);
        assert_eq!(partition_bounds(2, 5), vec![(0, 1), (1, 2)]);
        assert_eq!(partition_bounds(0, 3), vec![(0, 0)]);
    }

    #[test]
    fn test_should_distribute() {
        let trainer = trainer(Arc::new(LocalBackend::new()), 0);
        assert!(!trainer.should_distribute(None, 10));
        assert!(!trainer.should_distribute(Some(1), 1_000));
        assert!(trainer.should_distribute(Some(2), 10));
        assert!(trainer.should_distribute(None, 1_001));
    }

    #[test]
    fn test_epoch_barrier_waits_for_all_partitions() {
        let mut barrier = EpochBarrier::new(&[10, 30]);
        let report = |partition, epoch, loss| EpochReport {
            partition,
            epoch,
            validation_loss: loss,
        };
        assert!(barrier.record(report(0, 0, 1.0)).is_empty());
        assert!(barrier.record(report(0, 1, 1.0)).is_empty());
        let ready = barrier.record(report(1, 0, 2.0));
        assert_eq!(ready.len(), 1);
        assert!((ready[0].1 - 1.75).abs() < 1e-12);
        let ready = barrier.record(report(1, 1, 3.0));
        assert_eq!(ready[0].0, 1);
        // Replayed epoch from a retried partition is ignored.
        assert!(barrier.record(report(0, 0, 9.0)).is_empty());
    }

    #[tokio::test]
    async fn test_distributed_training_on_pool() {
        let pool = Arc::new(WorkerPool::new(&DistributedConfig {
            num_workers: 3,
            ..Default::default()
        }));
        let trainer = trainer(Arc::new(PoolBackend::new(Arc::clone(&pool))), 1);
        let observer = RecordingObserver::default();
        let outcome = trainer
            .train(request("job-1", 30, Some(3)), &observer, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.partitions, 3);
        assert_eq!(outcome.retried_subtasks, 0);
        assert!(outcome.validation_loss < 1.0);
        assert_eq!(*observer.epochs.lock().unwrap(), (0..30).collect::<Vec<_>>());

        let status = pool.status().await;
        assert_eq!(status.idle, 3);
        assert_eq!(status.tasks_completed, 3);
    }

    #[tokio::test]
    async fn test_failed_partition_retried_on_other_worker() {
        let backend = Arc::new(FlakyBackend::new("w0", 1));
        let trainer = trainer(backend.clone(), 2);
        let outcome = trainer
            .train(request("job-2", 5, Some(2)), &RecordingObserver::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.retried_subtasks, 1);

        let submitted = backend.submitted_on.lock().unwrap().clone();
        // Two initial submissions land on w0 (first fails), the retry avoids it.
        assert_eq!(submitted.len(), 3);
        assert_eq!(submitted[2], "w1");
    }

    #[tokio::test]
    async fn test_exhausted_partition_retries_is_retryable_error() {
        let backend = Arc::new(FlakyBackend::new("w0", usize::MAX));
        let trainer = trainer(backend, 0);
        let err = trainer
            .train(request("job-3", 5, Some(2)), &RecordingObserver::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TrainingError::WorkerUnavailable(_)));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("after 1 attempts"));
    }

    #[tokio::test]
    async fn test_observer_error_aborts_training() {
        let pool = Arc::new(WorkerPool::new(&DistributedConfig {
            num_workers: 2,
            ..Default::default()
        }));
        let trainer = trainer(Arc::new(PoolBackend::new(Arc::clone(&pool))), 0);
        let err = trainer
            .train(request("trial-1", 100_000, Some(2)), &StopAt(2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TrainingError::Pruned { step: 2 }));

        // Subtasks observe the cancellation and give their workers back.
        for _ in 0..100 {
            if pool.status().await.idle == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(pool
            .status()
            .await
            .nodes
            .iter()
            .all(|n| n.status == WorkerStatus::Idle));
    }

    #[tokio::test]
    async fn test_cancel_token_stops_training() {
        let pool = Arc::new(WorkerPool::new(&DistributedConfig::default()));
        let trainer = Arc::new(trainer(Arc::new(PoolBackend::new(pool)), 0));
        let token = CancellationToken::new();

        let running = {
            let trainer = Arc::clone(&trainer);
            let token = token.clone();
            tokio::spawn(async move {
                trainer
                    .train(request("job-4", 10_000_000, Some(2)), &RecordingObserver::default(), &token)
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        trainer.cancel("job-4").await;
        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, TrainingError::Cancelled(_)));
    }
}
