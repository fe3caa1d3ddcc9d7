//! Database schema constants.
//!
//! Every statement is idempotent so the schema can be bootstrapped on each
//! connect. Identifiers are stored as TEXT, timestamps as fixed-width
//! RFC 3339 TEXT (sortable), and structured fields as JSON TEXT.

/// SQL schema for creating the jobs table.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    model_type TEXT NOT NULL,
    model_name TEXT NOT NULL,
    config TEXT NOT NULL,
    status TEXT NOT NULL,
    priority TEXT NOT NULL,
    progress REAL NOT NULL DEFAULT 0,
    metrics TEXT,
    error_message TEXT,
    result_model_id TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    tags TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0
)
"#;

/// SQL schema for creating the job_events table.
pub const CREATE_JOB_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    at TEXT NOT NULL,
    kind TEXT NOT NULL,
    message TEXT NOT NULL
)
"#;

/// SQL schema for creating the studies table.
pub const CREATE_STUDIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS studies (
    study_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    model_type TEXT NOT NULL,
    search_space TEXT NOT NULL,
    sampler TEXT NOT NULL,
    pruner TEXT NOT NULL,
    direction TEXT NOT NULL,
    n_trials_target INTEGER NOT NULL,
    objective_metric TEXT NOT NULL,
    training_config TEXT NOT NULL,
    status TEXT NOT NULL,
    best_trial_id TEXT,
    best_value REAL,
    seed INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(tenant_id, name)
)
"#;

/// SQL schema for creating the trials table.
pub const CREATE_TRIALS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS trials (
    trial_id TEXT PRIMARY KEY,
    study_id TEXT NOT NULL,
    trial_number INTEGER NOT NULL,
    state TEXT NOT NULL,
    params TEXT NOT NULL,
    intermediate_values TEXT NOT NULL,
    final_value REAL,
    error_message TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    UNIQUE(study_id, trial_number)
)
"#;

/// SQL schema for creating the worker_nodes table.
pub const CREATE_WORKER_NODES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS worker_nodes (
    worker_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    capacity TEXT NOT NULL,
    current_task_id TEXT,
    updated_at TEXT NOT NULL
)
"#;

/// SQL for creating all required indexes.
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_tenant ON jobs(tenant_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_job_events_job ON job_events(job_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_trials_study ON trials(study_id, trial_number)",
];

/// All table statements in creation order.
pub const ALL_TABLES: &[&str] = &[
    CREATE_JOBS_TABLE,
    CREATE_JOB_EVENTS_TABLE,
    CREATE_STUDIES_TABLE,
    CREATE_TRIALS_TABLE,
    CREATE_WORKER_NODES_TABLE,
];
