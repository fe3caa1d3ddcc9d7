//! CLI command definitions for trainforge.
//!
//! Each command wires an in-process runtime (in-memory, or SQLite when
//! `--database-url` is given), runs to completion and prints a summary.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::hpo::{OptimizeOptions, Params, StudySpec};
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{NoopProgress, RunTarget};
use crate::runtime::Runtime;
use crate::scheduler::{JobId, JobPriority, JobStatus};

/// Default time `submit` waits for each job.
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 3600;

/// Training job orchestrator with priority scheduling and hyperparameter search.
#[derive(Parser)]
#[command(name = "trainforge")]
#[command(about = "Schedule training jobs and run hyperparameter searches")]
#[command(version)]
#[command(
    long_about = "trainforge queues training jobs, runs them through a staged training pipeline (optionally distributed over a worker pool) and drives hyperparameter searches.\n\nExample usage:\n  trainforge submit jobs.yaml\n  trainforge hpo study.yaml --n-trials 30 --parallel 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// SQLite database URL. Defaults to TRAINFORGE_DATABASE_URL or an
    /// in-memory store.
    #[arg(long, env = "TRAINFORGE_DATABASE_URL", global = true)]
    pub database_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Submit the jobs in a YAML file and run them to completion.
    Submit(SubmitArgs),

    /// Create (or resume) the study in a YAML file and optimize it.
    Hpo(HpoArgs),

    /// Print Prometheus metrics for the persisted state.
    Metrics,
}

/// Arguments for `trainforge submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// YAML file with a `jobs:` list.
    pub file: String,

    /// Seconds to wait for each job.
    #[arg(long, default_value_t = DEFAULT_JOB_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    /// Print the Prometheus exposition after the run.
    #[arg(long)]
    pub metrics: bool,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `trainforge hpo`.
#[derive(Parser, Debug)]
pub struct HpoArgs {
    /// YAML file describing the study.
    pub file: String,

    /// Total trials to reach, including earlier runs.
    #[arg(short = 'n', long)]
    pub n_trials: Option<usize>,

    /// Study timeout in seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Trials to run concurrently.
    #[arg(short = 'p', long)]
    pub parallel: Option<usize>,

    /// Retrain the best trial and register the model.
    #[arg(long)]
    pub promote: bool,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// One entry of a jobs file.
#[derive(Debug, Clone, Deserialize)]
struct JobRequest {
    tenant_id: String,
    model_type: String,
    #[serde(default)]
    priority: JobPriority,
    config: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct JobsFile {
    jobs: Vec<JobRequest>,
}

#[derive(Debug, Serialize)]
struct JobSummary {
    job_id: JobId,
    tenant_id: String,
    status: JobStatus,
    result_model_id: Option<String>,
    error_message: Option<String>,
    metrics: Option<BTreeMap<String, f64>>,
    retry_count: u32,
}

#[derive(Debug, Serialize)]
struct SubmitOutput {
    submitted: usize,
    rejected: usize,
    completed: usize,
    failed: usize,
    jobs: Vec<JobSummary>,
}

#[derive(Debug, Serialize)]
struct HpoOutput {
    study: String,
    status: String,
    trials_run: usize,
    best_trial_number: u64,
    best_value: Option<f64>,
    best_params: Params,
    model_id: Option<String>,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the trainforge CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = OrchestratorConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config = config.with_database_url(url);
    }
    init_metrics()?;

    match cli.command {
        Commands::Submit(args) => run_submit_command(args, config).await,
        Commands::Hpo(args) => run_hpo_command(args, config).await,
        Commands::Metrics => run_metrics_command(config).await,
    }
}

fn read_yaml<T: for<'de> Deserialize<'de>>(path: &str) -> anyhow::Result<T> {
    if !Path::new(path).exists() {
        return Err(anyhow::anyhow!("File does not exist: {}", path));
    }
    let content = fs::read_to_string(path)?;
    serde_yaml::from_str(&content).map_err(|e| anyhow::anyhow!("Invalid YAML in {}: {}", path, e))
}

// ============================================================================
// Submit Command Implementation
// ============================================================================

async fn run_submit_command(args: SubmitArgs, config: OrchestratorConfig) -> anyhow::Result<()> {
    let file: JobsFile = read_yaml(&args.file)?;
    let runtime = Runtime::connect(config).await?;
    let orchestrator = &runtime.orchestrator;
    orchestrator.start().await?;

    let mut submitted = Vec::new();
    let mut rejected = 0usize;
    for request in file.jobs {
        match orchestrator
            .create_job(
                &request.tenant_id,
                &request.model_type,
                request.config,
                request.priority,
            )
            .await
        {
            Ok(job_id) => submitted.push(job_id),
            Err(e) => {
                warn!(tenant_id = %request.tenant_id, error = %e, "Job rejected");
                rejected += 1;
            }
        }
    }
    info!(submitted = submitted.len(), rejected = rejected, "Jobs submitted");

    let mut jobs = Vec::new();
    for job_id in &submitted {
        let job = match orchestrator
            .wait_for(*job_id, Duration::from_secs(args.timeout_secs))
            .await
        {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Gave up waiting for job");
                orchestrator.get_job(*job_id).await?
            }
        };
        jobs.push(JobSummary {
            job_id: job.job_id,
            tenant_id: job.tenant_id,
            status: job.status,
            result_model_id: job.result_model_id,
            error_message: job.error_message,
            metrics: job.metrics,
            retry_count: job.retry_count,
        });
    }
    orchestrator.stats().await?;
    orchestrator.shutdown().await?;

    let output = SubmitOutput {
        submitted: submitted.len(),
        rejected,
        completed: jobs
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .count(),
        failed: jobs.iter().filter(|j| j.status == JobStatus::Failed).count(),
        jobs,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "Submitted {} job(s), {} rejected: {} completed, {} failed",
            output.submitted, output.rejected, output.completed, output.failed
        );
        for job in &output.jobs {
            let detail = match (&job.result_model_id, &job.error_message) {
                (Some(model_id), _) => {
                    let rmse = job
                        .metrics
                        .as_ref()
                        .and_then(|m| m.get("rmse"))
                        .map(|v| format!(" rmse={:.4}", v))
                        .unwrap_or_default();
                    format!("{}{}", model_id, rmse)
                }
                (None, Some(error)) => error.clone(),
                (None, None) => String::new(),
            };
            println!("  {} [{}] {} {}", job.job_id, job.tenant_id, job.status, detail);
        }
    }

    if args.metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

// ============================================================================
// HPO Command Implementation
// ============================================================================

async fn run_hpo_command(args: HpoArgs, config: OrchestratorConfig) -> anyhow::Result<()> {
    let spec: StudySpec = read_yaml(&args.file)?;
    let runtime = Runtime::connect(config).await?;
    let optimizer = runtime.orchestrator.optimizer();

    let study_id = match optimizer.find_study(&spec.tenant_id, &spec.name).await {
        Ok(existing) => {
            info!(study = %existing.name, "Resuming existing study");
            existing.study_id
        }
        Err(crate::error::TrainingError::NotFound { .. }) => optimizer.create_study(spec).await?,
        Err(e) => return Err(e.into()),
    };

    let options = OptimizeOptions {
        n_trials: args.n_trials,
        timeout: args.timeout_secs.map(Duration::from_secs),
        n_parallel: args.parallel,
    };
    let outcome = optimizer.optimize(study_id, options).await?;

    let model_id = if args.promote {
        let promoted = optimizer
            .promote_best(
                study_id,
                RunTarget::Job(uuid::Uuid::new_v4()),
                &NoopProgress,
                &tokio_util::sync::CancellationToken::new(),
            )
            .await?;
        promoted.model_id
    } else {
        None
    };

    let output = HpoOutput {
        study: outcome.study.name.clone(),
        status: outcome.study.status.as_str().to_string(),
        trials_run: outcome.trials_run,
        best_trial_number: outcome.best_trial.trial_number,
        best_value: outcome.study.best_value,
        best_params: outcome.best_trial.params.clone(),
        model_id,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "Study '{}' {} after {} new trial(s)",
            output.study, output.status, output.trials_run
        );
        println!(
            "  best trial #{} {} = {:?}",
            output.best_trial_number, outcome.study.objective_metric, output.best_value
        );
        for (name, value) in &output.best_params {
            println!("    {} = {}", name, value);
        }
        if let Some(model_id) = &output.model_id {
            println!("  registered {}", model_id);
        }
    }
    Ok(())
}

// ============================================================================
// Metrics Command Implementation
// ============================================================================

async fn run_metrics_command(config: OrchestratorConfig) -> anyhow::Result<()> {
    let runtime = Runtime::connect(config).await?;
    let stats = runtime.orchestrator.stats().await?;
    info!(
        queued = stats.queue.queued,
        running = stats.running_jobs,
        "Collected orchestrator stats"
    );
    print!("{}", export_metrics());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_submit() {
        let cli = Cli::try_parse_from(["trainforge", "submit", "jobs.yaml", "--json"]).unwrap();
        match cli.command {
            Commands::Submit(args) => {
                assert_eq!(args.file, "jobs.yaml");
                assert!(args.json);
                assert_eq!(args.timeout_secs, DEFAULT_JOB_TIMEOUT_SECS);
            }
            _ => panic!("expected submit"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_cli_parses_hpo_overrides() {
        let cli = Cli::try_parse_from([
            "trainforge",
            "--log-level",
            "debug",
            "hpo",
            "study.yaml",
            "-n",
            "30",
            "--parallel",
            "4",
            "--promote",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Hpo(args) => {
                assert_eq!(args.n_trials, Some(30));
                assert_eq!(args.parallel, Some(4));
                assert!(args.promote);
                assert!(args.timeout_secs.is_none());
            }
            _ => panic!("expected hpo"),
        }
    }

    #[test]
    fn test_jobs_file_parses() {
        let yaml = r#"
jobs:
  - tenant_id: t1
    model_type: forecast
    priority: high
    config:
      feature_set: basic
      start: "2024-01-01"
      end: "2024-06-01"
      horizon: 24
  - tenant_id: t2
    model_type: forecast
    config:
      feature_set: extended
      date_range: {start: "2024-01-01", end: "2024-02-01"}
"#;
        let file: JobsFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.jobs.len(), 2);
        assert_eq!(file.jobs[0].priority, JobPriority::High);
        assert_eq!(file.jobs[1].priority, JobPriority::Normal);
        assert_eq!(file.jobs[0].config["horizon"], 24);
    }

    #[test]
    fn test_study_file_parses() {
        let yaml = r#"
tenant_id: t1
name: demand-search
model_type: forecast
n_trials: 20
sampler: tpe
pruner: hyperband
direction: minimize
search_space:
  learning_rate: {type: float, low: 0.001, high: 0.3, log: true}
  epochs: {type: int, low: 5, high: 40}
training_config:
  feature_set: basic
  start: "2024-01-01"
  end: "2024-03-01"
"#;
        let spec: StudySpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.n_trials, 20);
        assert_eq!(spec.objective_metric, "val_rmse");
        assert_eq!(spec.search_space.len(), 2);
    }

    #[test]
    fn test_read_yaml_missing_file() {
        let result: anyhow::Result<JobsFile> = read_yaml("/nonexistent/jobs.yaml");
        assert!(result.is_err());
    }
}
