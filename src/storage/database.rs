//! SQLite storage backed by sqlx.
//!
//! The schema is bootstrapped on connect. Enum columns hold the same
//! snake_case names the types serialize to.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::debug;
use uuid::Uuid;

use crate::distributed::WorkerNode;
use crate::error::StoreError;
use crate::hpo::{HpoStudy, StudyId, Trial};
use crate::scheduler::{JobEvent, JobId, JobStatus, TrainingJob};

use super::schema;
use super::{JobFilter, JobStore, StudyStore, WorkerNodeStore};

/// SQLite database client.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connects to `database_url` (`sqlite::memory:` or `sqlite://path`) and
    /// creates missing tables.
    ///
    /// In-memory databases live as long as their connection, so they get a
    /// single connection that is never recycled.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let in_memory = database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .min_connections(1)
            .idle_timeout(if in_memory { None } else { Some(Duration::from_secs(600)) })
            .max_lifetime(if in_memory { None } else { Some(Duration::from_secs(1800)) })
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Creates a client from an existing pool. The schema is not touched.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates tables and indexes that do not exist yet.
    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        for sql in schema::ALL_TABLES.iter().chain(schema::CREATE_INDEXES) {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        debug!("sqlite schema ready");
        Ok(())
    }
}

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn opt_ts(value: &Option<DateTime<Utc>>) -> Option<String> {
    value.as_ref().map(ts)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", value, e)))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.as_deref().map(parse_ts).transpose()
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|e| StoreError::Corrupt(format!("bad id '{}': {}", value, e)))
}

/// Decodes a snake_case enum column through its serde representation.
fn parse_enum<T: DeserializeOwned>(value: &str) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| StoreError::Corrupt(format!("unknown enum value '{}'", value)))
}

fn conflict_or(err: sqlx::Error, message: String) -> StoreError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => StoreError::Conflict(message),
        _ => StoreError::Query(err),
    }
}

fn row_to_job(row: &SqliteRow) -> Result<TrainingJob, StoreError> {
    let metrics: Option<String> = row.try_get("metrics")?;
    Ok(TrainingJob {
        job_id: parse_uuid(&row.try_get::<String, _>("job_id")?)?,
        tenant_id: row.try_get("tenant_id")?,
        model_type: row.try_get("model_type")?,
        model_name: row.try_get("model_name")?,
        config: serde_json::from_str(&row.try_get::<String, _>("config")?)?,
        status: parse_enum(&row.try_get::<String, _>("status")?)?,
        priority: parse_enum(&row.try_get::<String, _>("priority")?)?,
        progress: row.try_get("progress")?,
        metrics: metrics.as_deref().map(serde_json::from_str).transpose()?,
        error_message: row.try_get("error_message")?,
        result_model_id: row.try_get("result_model_id")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        started_at: parse_opt_ts(row.try_get("started_at")?)?,
        completed_at: parse_opt_ts(row.try_get("completed_at")?)?,
        tags: serde_json::from_str(&row.try_get::<String, _>("tags")?)?,
        version: row.try_get::<i64, _>("version")? as u64,
    })
}

fn row_to_study(row: &SqliteRow) -> Result<HpoStudy, StoreError> {
    let best_trial_id: Option<String> = row.try_get("best_trial_id")?;
    Ok(HpoStudy {
        study_id: parse_uuid(&row.try_get::<String, _>("study_id")?)?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        model_type: row.try_get("model_type")?,
        search_space: serde_json::from_str(&row.try_get::<String, _>("search_space")?)?,
        sampler: parse_enum(&row.try_get::<String, _>("sampler")?)?,
        pruner: parse_enum(&row.try_get::<String, _>("pruner")?)?,
        direction: parse_enum(&row.try_get::<String, _>("direction")?)?,
        n_trials_target: row.try_get::<i64, _>("n_trials_target")? as usize,
        objective_metric: row.try_get("objective_metric")?,
        training_config: serde_json::from_str(&row.try_get::<String, _>("training_config")?)?,
        status: parse_enum(&row.try_get::<String, _>("status")?)?,
        best_trial_id: best_trial_id.as_deref().map(parse_uuid).transpose()?,
        best_value: row.try_get("best_value")?,
        seed: row.try_get::<i64, _>("seed")? as u64,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn row_to_trial(row: &SqliteRow) -> Result<Trial, StoreError> {
    Ok(Trial {
        trial_id: parse_uuid(&row.try_get::<String, _>("trial_id")?)?,
        study_id: parse_uuid(&row.try_get::<String, _>("study_id")?)?,
        trial_number: row.try_get::<i64, _>("trial_number")? as u64,
        state: parse_enum(&row.try_get::<String, _>("state")?)?,
        params: serde_json::from_str(&row.try_get::<String, _>("params")?)?,
        intermediate_values: serde_json::from_str(
            &row.try_get::<String, _>("intermediate_values")?,
        )?,
        final_value: row.try_get("final_value")?,
        error_message: row.try_get("error_message")?,
        started_at: parse_ts(&row.try_get::<String, _>("started_at")?)?,
        completed_at: parse_opt_ts(row.try_get("completed_at")?)?,
    })
}

fn push_job_filters(builder: &mut QueryBuilder<'_, Sqlite>, filter: &JobFilter) {
    let mut separator = " WHERE ";
    if let Some(tenant_id) = &filter.tenant_id {
        builder
            .push(separator)
            .push("tenant_id = ")
            .push_bind(tenant_id.clone());
        separator = " AND ";
    }
    if let Some(status) = filter.status {
        builder
            .push(separator)
            .push("status = ")
            .push_bind(status.as_str());
        separator = " AND ";
    }
    if let Some(model_type) = &filter.model_type {
        builder
            .push(separator)
            .push("model_type = ")
            .push_bind(model_type.clone());
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert_job(&self, job: &TrainingJob) -> Result<(), StoreError> {
        let metrics = job.metrics.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, tenant_id, model_type, model_name, config, status, priority,
                progress, metrics, error_message, result_model_id, retry_count,
                created_at, started_at, completed_at, tags, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.job_id.to_string())
        .bind(&job.tenant_id)
        .bind(&job.model_type)
        .bind(&job.model_name)
        .bind(serde_json::to_string(&job.config)?)
        .bind(job.status.as_str())
        .bind(job.priority.as_str())
        .bind(job.progress)
        .bind(metrics)
        .bind(&job.error_message)
        .bind(&job.result_model_id)
        .bind(i64::from(job.retry_count))
        .bind(ts(&job.created_at))
        .bind(opt_ts(&job.started_at))
        .bind(opt_ts(&job.completed_at))
        .bind(serde_json::to_string(&job.tags)?)
        .bind(job.version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or(e, format!("job {} exists", job.job_id)))?;
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<TrainingJob>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<TrainingJob>, u64), StoreError> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM jobs");
        push_job_filters(&mut count, filter);
        let total: i64 = count.build().fetch_one(&self.pool).await?.try_get("total")?;

        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM jobs");
        push_job_filters(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC, job_id DESC LIMIT ")
            .push_bind(i64::from(filter.page_size))
            .push(" OFFSET ")
            .push_bind(filter.offset() as i64);
        let rows = query.build().fetch_all(&self.pool).await?;

        let jobs = rows.iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?;
        Ok((jobs, total as u64))
    }

    async fn update_job(&self, job: &TrainingJob) -> Result<bool, StoreError> {
        let metrics = job.metrics.as_ref().map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?, priority = ?, progress = ?, metrics = ?, error_message = ?,
                result_model_id = ?, retry_count = ?, started_at = ?, completed_at = ?,
                tags = ?, version = ?
            WHERE job_id = ? AND version = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.priority.as_str())
        .bind(job.progress)
        .bind(metrics)
        .bind(&job.error_message)
        .bind(&job.result_model_id)
        .bind(i64::from(job.retry_count))
        .bind(opt_ts(&job.started_at))
        .bind(opt_ts(&job.completed_at))
        .bind(serde_json::to_string(&job.tags)?)
        .bind(job.version as i64)
        .bind(job.job_id.to_string())
        .bind(job.version as i64 - 1)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        let exists = sqlx::query("SELECT 1 FROM jobs WHERE job_id = ?")
            .bind(job.job_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if exists {
            Ok(false)
        } else {
            Err(StoreError::NotFound(format!("job {}", job.job_id)))
        }
    }

    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<TrainingJob>, StoreError> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE status = ? ORDER BY created_at ASC")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn append_event(&self, job_id: JobId, event: &JobEvent) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO job_events (job_id, at, kind, message) VALUES (?, ?, ?, ?)")
            .bind(job_id.to_string())
            .bind(ts(&event.at))
            .bind(event.kind.as_str())
            .bind(&event.message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn job_events(&self, job_id: JobId) -> Result<Vec<JobEvent>, StoreError> {
        let rows = sqlx::query("SELECT at, kind, message FROM job_events WHERE job_id = ? ORDER BY id")
            .bind(job_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<JobEvent, StoreError> {
                Ok(JobEvent {
                    at: parse_ts(&row.try_get::<String, _>("at")?)?,
                    kind: parse_enum(&row.try_get::<String, _>("kind")?)?,
                    message: row.try_get("message")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl StudyStore for SqliteStore {
    async fn insert_study(&self, study: &HpoStudy) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO studies (
                study_id, tenant_id, name, model_type, search_space, sampler, pruner,
                direction, n_trials_target, objective_metric, training_config, status,
                best_trial_id, best_value, seed, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(study.study_id.to_string())
        .bind(&study.tenant_id)
        .bind(&study.name)
        .bind(&study.model_type)
        .bind(serde_json::to_string(&study.search_space)?)
        .bind(study.sampler.as_str())
        .bind(study.pruner.as_str())
        .bind(study.direction.as_str())
        .bind(study.n_trials_target as i64)
        .bind(&study.objective_metric)
        .bind(serde_json::to_string(&study.training_config)?)
        .bind(study.status.as_str())
        .bind(study.best_trial_id.map(|id| id.to_string()))
        .bind(study.best_value)
        .bind(study.seed as i64)
        .bind(ts(&study.created_at))
        .bind(ts(&study.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_or(
                e,
                format!(
                    "study '{}' already exists for tenant '{}'",
                    study.name, study.tenant_id
                ),
            )
        })?;
        Ok(())
    }

    async fn get_study(&self, study_id: StudyId) -> Result<Option<HpoStudy>, StoreError> {
        let row = sqlx::query("SELECT * FROM studies WHERE study_id = ?")
            .bind(study_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_study).transpose()
    }

    async fn find_study(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<HpoStudy>, StoreError> {
        let row = sqlx::query("SELECT * FROM studies WHERE tenant_id = ? AND name = ?")
            .bind(tenant_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_study).transpose()
    }

    async fn update_study(&self, study: &HpoStudy) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE studies SET
                status = ?, best_trial_id = ?, best_value = ?, n_trials_target = ?,
                updated_at = ?
            WHERE study_id = ?
            "#,
        )
        .bind(study.status.as_str())
        .bind(study.best_trial_id.map(|id| id.to_string()))
        .bind(study.best_value)
        .bind(study.n_trials_target as i64)
        .bind(ts(&study.updated_at))
        .bind(study.study_id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("study {}", study.study_id)));
        }
        Ok(())
    }

    async fn delete_study(&self, study_id: StudyId) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM trials WHERE study_id = ?")
            .bind(study_id.to_string())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM studies WHERE study_id = ?")
            .bind(study_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_trial(&self, trial: &Trial) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trials (
                trial_id, study_id, trial_number, state, params, intermediate_values,
                final_value, error_message, started_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(trial_id) DO UPDATE SET
                state = excluded.state,
                intermediate_values = excluded.intermediate_values,
                final_value = excluded.final_value,
                error_message = excluded.error_message,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(trial.trial_id.to_string())
        .bind(trial.study_id.to_string())
        .bind(trial.trial_number as i64)
        .bind(trial.state.as_str())
        .bind(serde_json::to_string(&trial.params)?)
        .bind(serde_json::to_string(&trial.intermediate_values)?)
        .bind(trial.final_value)
        .bind(&trial.error_message)
        .bind(ts(&trial.started_at))
        .bind(opt_ts(&trial.completed_at))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_or(
                e,
                format!(
                    "trial number {} already used in study {}",
                    trial.trial_number, trial.study_id
                ),
            )
        })?;
        Ok(())
    }

    async fn list_trials(&self, study_id: StudyId) -> Result<Vec<Trial>, StoreError> {
        let rows = sqlx::query("SELECT * FROM trials WHERE study_id = ? ORDER BY trial_number")
            .bind(study_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_trial).collect()
    }
}

#[async_trait]
impl WorkerNodeStore for SqliteStore {
    async fn save_workers(&self, nodes: &[WorkerNode]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM worker_nodes")
            .execute(&mut *tx)
            .await?;
        for node in nodes {
            sqlx::query(
                r#"
                INSERT INTO worker_nodes (worker_id, status, capacity, current_task_id, updated_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&node.worker_id)
            .bind(node.status.as_str())
            .bind(serde_json::to_string(&node.capacity)?)
            .bind(&node.current_task_id)
            .bind(ts(&node.updated_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerNode>, StoreError> {
        let rows = sqlx::query("SELECT * FROM worker_nodes ORDER BY worker_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<WorkerNode, StoreError> {
                Ok(WorkerNode {
                    worker_id: row.try_get("worker_id")?,
                    status: parse_enum(&row.try_get::<String, _>("status")?)?,
                    capacity: serde_json::from_str(&row.try_get::<String, _>("capacity")?)?,
                    current_task_id: row.try_get("current_task_id")?,
                    updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
                })
            })
            .collect()
    }
}
