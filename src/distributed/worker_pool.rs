//! In-process pool of worker nodes.
//!
//! The pool is the single writer of [`WorkerNode`] state. Callers acquire a
//! [`WorkerLease`] for one subtask, run it, and hand the lease back with
//! [`WorkerPool::release`]. Nodes can be flagged unreachable, which revokes
//! the lease held there: its subtask fails at the next checkpoint and its
//! eventual release leaves the node alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DistributedConfig;
use crate::error::TrainingError;

/// Availability of a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Unreachable,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Unreachable => "unreachable",
        }
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(WorkerStatus::Idle),
            "busy" => Ok(WorkerStatus::Busy),
            "unreachable" => Ok(WorkerStatus::Unreachable),
            other => Err(TrainingError::Validation(format!(
                "unknown worker status '{}'",
                other
            ))),
        }
    }
}

/// Resources offered by a node, or requested by a subtask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: u32,
    pub memory_mb: u64,
    pub gpu: u32,
}

impl Resources {
    pub fn fits_within(&self, capacity: &Resources) -> bool {
        self.cpu <= capacity.cpu && self.memory_mb <= capacity.memory_mb && self.gpu <= capacity.gpu
    }
}

/// Externally visible state of one worker node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerNode {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub capacity: Resources,
    pub current_task_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerNode {
    pub fn new(worker_id: impl Into<String>, capacity: Resources) -> Self {
        Self {
            worker_id: worker_id.into(),
            status: WorkerStatus::Idle,
            capacity,
            current_task_id: None,
            updated_at: Utc::now(),
        }
    }
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub nodes: Vec<WorkerNode>,
    pub idle: usize,
    pub busy: usize,
    pub unreachable: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

impl PoolStatus {
    /// Builds a snapshot from a list of nodes.
    pub fn from_nodes(nodes: Vec<WorkerNode>) -> Self {
        let count = |s: WorkerStatus| nodes.iter().filter(|n| n.status == s).count();
        Self {
            idle: count(WorkerStatus::Idle),
            busy: count(WorkerStatus::Busy),
            unreachable: count(WorkerStatus::Unreachable),
            nodes,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }

    /// Nodes that are not unreachable.
    pub fn available(&self) -> usize {
        self.idle + self.busy
    }
}

/// Exclusive right to run one subtask on a node.
#[derive(Debug)]
pub struct WorkerLease {
    pub worker_id: String,
    pub task_id: String,
    generation: u64,
    reachable: Arc<AtomicBool>,
}

impl WorkerLease {
    /// Whether the lease is still valid. Checked by running subtasks between
    /// epochs; once revoked it never becomes valid again.
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// A cheap handle for checking reachability from blocking code.
    pub fn reachability(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reachable)
    }
}

struct ActiveLease {
    generation: u64,
    reachable: Arc<AtomicBool>,
}

struct NodeSlot {
    node: WorkerNode,
    /// Bumped on every acquire and revocation.
    generation: u64,
    lease: Option<ActiveLease>,
}

/// Pool of in-process worker nodes.
pub struct WorkerPool {
    nodes: Mutex<Vec<NodeSlot>>,
    released: Notify,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
}

impl WorkerPool {
    /// Creates `config.num_workers` identical nodes named `worker-N`.
    pub fn new(config: &DistributedConfig) -> Self {
        let capacity = Resources {
            cpu: config.worker_cpu,
            memory_mb: config.worker_memory_mb,
            gpu: config.worker_gpu,
        };
        Self::with_nodes(
            (0..config.num_workers)
                .map(|i| WorkerNode::new(format!("worker-{}", i), capacity))
                .collect(),
        )
    }

    /// Creates a pool from explicit nodes, e.g. restored from storage.
    pub fn with_nodes(nodes: Vec<WorkerNode>) -> Self {
        let slots = nodes
            .into_iter()
            .map(|mut node| {
                // A restored node cannot still be running anything.
                if node.status == WorkerStatus::Busy {
                    node.status = WorkerStatus::Idle;
                    node.current_task_id = None;
                }
                NodeSlot {
                    node,
                    generation: 0,
                    lease: None,
                }
            })
            .collect();
        Self {
            nodes: Mutex::new(slots),
            released: Notify::new(),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
        }
    }

    /// Acquires an idle node satisfying `request`, skipping `exclude`.
    ///
    /// Waits while every eligible node is busy. Fails with
    /// `WorkerUnavailable` when no reachable node could ever satisfy the
    /// request, and with `Cancelled` if `cancel` fires while waiting.
    pub async fn acquire(
        &self,
        task_id: &str,
        request: Resources,
        exclude: &[String],
        cancel: &CancellationToken,
    ) -> Result<WorkerLease, TrainingError> {
        loop {
            // Register interest before inspecting state so a release in
            // between is not missed.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut nodes = self.nodes.lock().await;
                let mut any_eligible = false;
                for slot in nodes.iter_mut() {
                    let node = &mut slot.node;
                    if node.status == WorkerStatus::Unreachable
                        || exclude.contains(&node.worker_id)
                        || !request.fits_within(&node.capacity)
                    {
                        continue;
                    }
                    any_eligible = true;
                    if node.status == WorkerStatus::Idle && slot.lease.is_none() {
                        node.status = WorkerStatus::Busy;
                        node.current_task_id = Some(task_id.to_string());
                        node.updated_at = Utc::now();
                        slot.generation += 1;
                        let reachable = Arc::new(AtomicBool::new(true));
                        slot.lease = Some(ActiveLease {
                            generation: slot.generation,
                            reachable: Arc::clone(&reachable),
                        });
                        debug!(worker_id = %node.worker_id, task_id = %task_id, "Worker acquired");
                        return Ok(WorkerLease {
                            worker_id: node.worker_id.clone(),
                            task_id: task_id.to_string(),
                            generation: slot.generation,
                            reachable,
                        });
                    }
                }
                if !any_eligible {
                    return Err(TrainingError::WorkerUnavailable(format!(
                        "no reachable worker can run task {} ({} excluded)",
                        task_id,
                        exclude.len()
                    )));
                }
            }

            tokio::select! {
                _ = &mut released => {}
                _ = cancel.cancelled() => {
                    return Err(TrainingError::Cancelled(format!(
                        "task {} cancelled while waiting for a worker",
                        task_id
                    )));
                }
            }
        }
    }

    /// Returns a node to the pool. `succeeded` feeds the pool counters.
    /// A revoked lease changes nothing on the node.
    pub async fn release(&self, lease: WorkerLease, succeeded: bool) {
        {
            let mut nodes = self.nodes.lock().await;
            if let Some(slot) = nodes.iter_mut().find(|s| s.node.worker_id == lease.worker_id) {
                let current = slot
                    .lease
                    .as_ref()
                    .is_some_and(|active| active.generation == lease.generation);
                if current {
                    slot.lease = None;
                    slot.node.current_task_id = None;
                    if slot.node.status == WorkerStatus::Busy {
                        slot.node.status = WorkerStatus::Idle;
                    }
                    slot.node.updated_at = Utc::now();
                } else {
                    debug!(
                        worker_id = %lease.worker_id,
                        task_id = %lease.task_id,
                        "Ignoring release of revoked lease"
                    );
                }
            }
        }
        if succeeded {
            self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.released.notify_waiters();
    }

    /// Flags a node unreachable. A subtask running there fails at its next
    /// checkpoint.
    pub async fn mark_unreachable(&self, worker_id: &str) -> Result<(), TrainingError> {
        let mut nodes = self.nodes.lock().await;
        let slot = nodes
            .iter_mut()
            .find(|s| s.node.worker_id == worker_id)
            .ok_or_else(|| TrainingError::not_found("worker", worker_id))?;
        if let Some(active) = slot.lease.take() {
            active.reachable.store(false, Ordering::SeqCst);
        }
        slot.generation += 1;
        warn!(worker_id = %worker_id, task_id = ?slot.node.current_task_id, "Worker marked unreachable");
        slot.node.status = WorkerStatus::Unreachable;
        slot.node.current_task_id = None;
        slot.node.updated_at = Utc::now();
        drop(nodes);
        // Waiters may now have no eligible node left.
        self.released.notify_waiters();
        Ok(())
    }

    /// Brings an unreachable node back as idle. Leases revoked while it was
    /// unreachable stay revoked; a node that was never unreachable is left
    /// as it is.
    pub async fn mark_reachable(&self, worker_id: &str) -> Result<(), TrainingError> {
        {
            let mut nodes = self.nodes.lock().await;
            let slot = nodes
                .iter_mut()
                .find(|s| s.node.worker_id == worker_id)
                .ok_or_else(|| TrainingError::not_found("worker", worker_id))?;
            if slot.node.status != WorkerStatus::Unreachable {
                return Ok(());
            }
            slot.node.status = WorkerStatus::Idle;
            slot.node.updated_at = Utc::now();
            info!(worker_id = %worker_id, "Worker reachable again");
        }
        self.released.notify_waiters();
        Ok(())
    }

    /// Snapshot of every node and the pool counters.
    pub async fn status(&self) -> PoolStatus {
        let nodes = self.nodes.lock().await;
        let mut status = PoolStatus::from_nodes(nodes.iter().map(|s| s.node.clone()).collect());
        status.tasks_completed = self.tasks_completed.load(Ordering::Relaxed);
        status.tasks_failed = self.tasks_failed.load(Ordering::Relaxed);
        status
    }

    /// Busy node per task id.
    pub async fn assignments(&self) -> HashMap<String, String> {
        self.nodes
            .lock()
            .await
            .iter()
            .filter_map(|s| {
                s.node
                    .current_task_id
                    .as_ref()
                    .map(|task| (task.clone(), s.node.worker_id.clone()))
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.nodes.lock().await.len()
    }
}
