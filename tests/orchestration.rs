//! End-to-end tests for job scheduling over an in-memory runtime.
//!
//! Run with: cargo test --test orchestration

use std::time::Duration;

use serde_json::json;
use trainforge::config::OrchestratorConfig;
use trainforge::scheduler::{JobPriority, JobStatus, TrainingJob};
use trainforge::{Runtime, TrainingError};

const WAIT: Duration = Duration::from_secs(60);

fn job_config(feature_set: &str) -> serde_json::Value {
    json!({
        "feature_set": feature_set,
        "horizon": 24,
        "start": "2024-01-01",
        "end": "2024-01-15",
        "hyperparameters": {"epochs": 5}
    })
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig::default().with_poll_interval(Duration::from_millis(10))
}

async fn runtime(config: OrchestratorConfig) -> Runtime {
    Runtime::in_memory(config)
        .await
        .expect("Should build in-memory runtime")
}

fn started(job: &TrainingJob) -> chrono::DateTime<chrono::Utc> {
    job.started_at.expect("Completed job should have started")
}

#[tokio::test]
async fn test_job_runs_to_completion() {
    let runtime = runtime(test_config()).await;
    let orch = &runtime.orchestrator;
    orch.start().await.unwrap();

    let id = orch
        .create_job("t1", "forecast", job_config("basic"), JobPriority::Normal)
        .await
        .unwrap();
    let job = orch.wait_for(id, WAIT).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error_message);
    assert_eq!(job.result_model_id.as_deref(), Some("t1:forecast:v1"));
    assert_eq!(job.progress, 1.0);
    let metrics = job.metrics.expect("Completed job should carry metrics");
    for key in ["mae", "rmse", "r2"] {
        assert!(metrics.contains_key(key), "missing metric {}", key);
    }
    assert!(job.completed_at.is_some());
    assert_eq!(runtime.registry.len().await, 1);

    orch.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_priority_then_submission_order() {
    let runtime = runtime(
        test_config()
            .with_max_concurrent_jobs(1)
            .with_dispatch_workers(1),
    )
    .await;
    let orch = &runtime.orchestrator;

    let normal_first = orch
        .create_job("t1", "forecast", job_config("basic"), JobPriority::Normal)
        .await
        .unwrap();
    let low = orch
        .create_job("t1", "forecast", job_config("basic"), JobPriority::Low)
        .await
        .unwrap();
    let normal_second = orch
        .create_job("t1", "forecast", job_config("basic"), JobPriority::Normal)
        .await
        .unwrap();
    let urgent = orch
        .create_job("t1", "forecast", job_config("basic"), JobPriority::Urgent)
        .await
        .unwrap();

    orch.start().await.unwrap();
    let mut jobs = Vec::new();
    for id in [urgent, normal_first, normal_second, low] {
        jobs.push(orch.wait_for(id, WAIT).await.unwrap());
    }
    orch.shutdown().await.unwrap();

    for pair in jobs.windows(2) {
        assert!(
            started(&pair[0]) <= started(&pair[1]),
            "{} ({}) started after {} ({})",
            pair[0].job_id,
            pair[0].priority,
            pair[1].job_id,
            pair[1].priority
        );
        // With a single slot the next job starts only after the previous one ends.
        assert!(pair[0].completed_at.unwrap() <= started(&pair[1]));
    }
}

#[tokio::test]
async fn test_cancelled_queued_job_never_starts() {
    let runtime = runtime(test_config()).await;
    let orch = &runtime.orchestrator;

    let cancelled = orch
        .create_job("t1", "forecast", job_config("basic"), JobPriority::Normal)
        .await
        .unwrap();
    let kept = orch
        .create_job("t1", "forecast", job_config("basic"), JobPriority::Normal)
        .await
        .unwrap();
    orch.cancel_job(cancelled).await.unwrap();

    orch.start().await.unwrap();
    let kept = orch.wait_for(kept, WAIT).await.unwrap();
    assert_eq!(kept.status, JobStatus::Completed);
    orch.shutdown().await.unwrap();

    let cancelled = orch.get_job(cancelled).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.started_at.is_none());
    assert!(cancelled.result_model_id.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_running_distributed_job_stops_subtasks() {
    let runtime = runtime(test_config()).await;
    let orch = &runtime.orchestrator;
    let workers = runtime.worker_pool.len().await;
    orch.start().await.unwrap();

    let mut config = job_config("basic");
    config["n_workers"] = json!(2);
    config["hyperparameters"] = json!({"epochs": 50_000_000});
    let id = orch
        .create_job("t1", "forecast", config, JobPriority::Normal)
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let job = orch.get_job(id).await.unwrap();
        let busy = runtime.worker_pool.status().await.busy;
        if job.status == JobStatus::Running && busy > 0 {
            break;
        }
        assert!(!job.status.is_terminal(), "job ended early: {:?}", job.error_message);
        assert!(tokio::time::Instant::now() < deadline, "job never started training");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    orch.cancel_job(id).await.unwrap();
    orch.wait_idle(WAIT).await.unwrap();

    // Subtasks stop at their next epoch and hand their workers back.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status = runtime.worker_pool.status().await;
        if status.idle == workers {
            assert_eq!(status.busy, 0);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "workers still busy: {:?}", status);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let job = orch.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.result_model_id.is_none());
    assert!(job.metrics.is_none());
    assert_eq!(runtime.registry.len().await, 0);
    let logs = orch.job_logs(id).await.unwrap();
    assert!(logs.iter().all(|e| e.message != "running -> completed"));

    orch.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retry_of_failed_job_copies_config() {
    let runtime = runtime(test_config()).await;
    let orch = &runtime.orchestrator;

    let id = orch
        .create_job("t1", "forecast", job_config("extended"), JobPriority::High)
        .await
        .unwrap();
    orch.mark_running(id).await.unwrap();
    orch.mark_failed(id, "worker lost").await.unwrap();

    let retry = orch.retry_job(id).await.unwrap();
    let original = orch.get_job(id).await.unwrap();
    let copy = orch.get_job(retry).await.unwrap();
    assert_eq!(copy.status, JobStatus::Queued);
    assert_eq!(copy.config, original.config);
    assert_eq!(copy.tenant_id, original.tenant_id);
    assert_eq!(copy.priority, original.priority);
    assert_eq!(copy.retry_of(), Some(id));
    assert_eq!(original.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_invalid_job_is_rejected_before_queueing() {
    let runtime = runtime(test_config()).await;
    let orch = &runtime.orchestrator;

    let err = orch
        .create_job("", "forecast", job_config("basic"), JobPriority::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, TrainingError::Validation(_)));

    let err = orch
        .create_job(
            "t1",
            "forecast",
            json!({"feature_set": "basic", "start": "not-a-date", "end": "2024-01-15"}),
            JobPriority::Normal,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TrainingError::Validation(_)));
    assert!(orch.queue().is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispatchers_run_each_job_once() {
    let runtime = runtime(
        test_config()
            .with_max_concurrent_jobs(3)
            .with_dispatch_workers(4),
    )
    .await;
    let orch = &runtime.orchestrator;

    let mut ids = Vec::new();
    for i in 0..12 {
        let tenant = format!("t{}", i % 3);
        ids.push(
            orch.create_job(&tenant, "forecast", job_config("basic"), JobPriority::Normal)
                .await
                .unwrap(),
        );
    }
    orch.start().await.unwrap();
    orch.wait_idle(WAIT).await.unwrap();
    orch.shutdown().await.unwrap();

    for id in ids {
        let job = orch.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let starts = orch
            .job_logs(id)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.message == "queued -> running")
            .count();
        assert_eq!(starts, 1, "job {} dispatched {} times", id, starts);
    }
    assert_eq!(runtime.registry.len().await, 12);
}

#[tokio::test]
async fn test_stats_count_jobs_by_status() {
    let runtime = runtime(test_config()).await;
    let orch = &runtime.orchestrator;

    let a = orch
        .create_job("t1", "forecast", job_config("basic"), JobPriority::Normal)
        .await
        .unwrap();
    orch.create_job("t1", "forecast", job_config("basic"), JobPriority::Normal)
        .await
        .unwrap();
    orch.cancel_job(a).await.unwrap();

    let stats = orch.stats().await.unwrap();
    assert_eq!(stats.jobs_by_status.get("queued"), Some(&1));
    assert_eq!(stats.jobs_by_status.get("cancelled"), Some(&1));
    assert_eq!(stats.queue.queued, 1);
    assert_eq!(stats.running_jobs, 0);
}
