//! In-process dispatch queue.
//!
//! Holds the QUEUED jobs in dispatch order (highest priority first, then
//! oldest `created_at`, then submission order) together with the running-job
//! accounting used to enforce the global and per-tenant concurrency caps.
//!
//! Selecting a job and reserving its concurrency slot happen under one lock,
//! so two dispatch workers can never claim the same entry.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use super::job::{JobId, JobPriority, TrainingJob};

/// A queued job as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub tenant_id: String,
    pub priority: JobPriority,
    pub created_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn from_job(job: &TrainingJob) -> Self {
        Self {
            job_id: job.job_id,
            tenant_id: job.tenant_id.clone(),
            priority: job.priority,
            created_at: job.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OrderKey {
    priority: JobPriority,
    created_at: DateTime<Utc>,
    seq: u64,
    job_id: JobId,
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| self.job_id.cmp(&other.job_id))
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Statistics about the dispatch queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting for dispatch.
    pub queued: usize,
    /// Jobs holding a concurrency slot.
    pub running: usize,
    /// Slots held per tenant.
    pub running_by_tenant: BTreeMap<String, usize>,
}

#[derive(Default)]
struct QueueState {
    order: BTreeSet<OrderKey>,
    entries: HashMap<JobId, (OrderKey, QueueEntry)>,
    running: HashMap<String, usize>,
    running_total: usize,
    next_seq: u64,
}

impl QueueState {
    fn tenant_running(&self, tenant_id: &str) -> usize {
        self.running.get(tenant_id).copied().unwrap_or(0)
    }
}

/// Priority queue of QUEUED jobs plus concurrency accounting.
#[derive(Default)]
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job. Pushing an id that is already queued is a no-op.
    pub async fn push(&self, entry: QueueEntry) {
        {
            let mut state = self.state.lock().await;
            if state.entries.contains_key(&entry.job_id) {
                return;
            }
            let key = OrderKey {
                priority: entry.priority,
                created_at: entry.created_at,
                seq: state.next_seq,
                job_id: entry.job_id,
            };
            state.next_seq += 1;
            state.order.insert(key.clone());
            debug!(job_id = %entry.job_id, priority = %entry.priority, "Job queued");
            state.entries.insert(entry.job_id, (key, entry));
        }
        self.notify.notify_waiters();
    }

    /// Removes the next eligible job and reserves a concurrency slot for its
    /// tenant. Returns `None` if the global cap is reached or no queued job
    /// belongs to a tenant below `tenant_cap`.
    pub async fn claim(&self, global_cap: usize, tenant_cap: Option<usize>) -> Option<QueueEntry> {
        let mut state = self.state.lock().await;
        if state.running_total >= global_cap {
            return None;
        }
        let key = state
            .order
            .iter()
            .find(|key| {
                let tenant = state
                    .entries
                    .get(&key.job_id)
                    .map(|(_, e)| e.tenant_id.as_str())
                    .unwrap_or_default();
                tenant_cap.is_none_or(|cap| state.tenant_running(tenant) < cap)
            })
            .cloned()?;

        state.order.remove(&key);
        let (_, entry) = state.entries.remove(&key.job_id)?;
        *state.running.entry(entry.tenant_id.clone()).or_default() += 1;
        state.running_total += 1;
        Some(entry)
    }

    /// Returns a slot reserved by [`claim`](Self::claim).
    pub async fn release(&self, tenant_id: &str) {
        {
            let mut state = self.state.lock().await;
            if let Some(count) = state.running.get_mut(tenant_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.running.remove(tenant_id);
                }
            }
            state.running_total = state.running_total.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    /// Removes a queued job. Returns whether it was still queued.
    pub async fn remove(&self, job_id: JobId) -> bool {
        let mut state = self.state.lock().await;
        match state.entries.remove(&job_id) {
            Some((key, _)) => {
                state.order.remove(&key);
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, job_id: JobId) -> bool {
        self.state.lock().await.entries.contains_key(&job_id)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            queued: state.entries.len(),
            running: state.running_total,
            running_by_tenant: state
                .running
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    /// Waits until a job is pushed or a slot is released.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }

    /// Wakes every waiter, e.g. on shutdown.
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }
}
