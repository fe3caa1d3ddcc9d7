//! Hyperparameter search tests: best-trial selection, pruning and full
//! studies driven through the runtime.
//!
//! Run with: cargo test --test hpo

use std::time::Duration;

use serde_json::json;
use trainforge::config::OrchestratorConfig;
use trainforge::hpo::{
    Direction, HpoStudy, MedianPruner, OptimizeOptions, ParamDomain, Params, Pruner, PrunerKind,
    SamplerKind, SearchSpace, StudySpec, StudyStatus, Trial, TrialState,
};
use trainforge::Runtime;

fn search_space() -> SearchSpace {
    SearchSpace::new()
        .with_param(
            "learning_rate",
            ParamDomain::Float {
                low: 0.01,
                high: 0.3,
                log: true,
            },
        )
        .with_param("epochs", ParamDomain::Int { low: 2, high: 6 })
}

fn study_spec(name: &str, n_trials: usize, direction: Direction) -> StudySpec {
    StudySpec {
        tenant_id: "t1".into(),
        name: name.into(),
        model_type: "forecast".into(),
        search_space: search_space(),
        sampler: SamplerKind::Random,
        pruner: PrunerKind::None,
        direction,
        n_trials,
        objective_metric: "val_rmse".into(),
        training_config: json!({
            "feature_set": "basic",
            "start": "2024-01-01",
            "end": "2024-01-15"
        }),
        seed: Some(42),
    }
}

fn completed_trial(study: &HpoStudy, number: u64, curve: &[f64], value: f64) -> Trial {
    let mut trial = Trial::new(study.study_id, number, Params::new());
    for (step, v) in curve.iter().enumerate() {
        trial.report(step, *v).unwrap();
    }
    trial.complete(value).unwrap();
    trial
}

#[test]
fn test_best_trial_is_lowest_value_when_minimizing() {
    let mut study = HpoStudy::from_spec(study_spec("best", 4, Direction::Minimize));
    let trials: Vec<Trial> = [5.0, 3.2, 4.1, 4.9]
        .iter()
        .enumerate()
        .map(|(i, v)| completed_trial(&study, i as u64, &[], *v))
        .collect();

    for trial in &trials {
        study.consider(trial);
    }
    assert_eq!(study.best_value, Some(3.2));
    assert_eq!(study.best_trial_id, Some(trials[1].trial_id));
}

#[test]
fn test_best_trial_is_highest_value_when_maximizing() {
    let mut study = HpoStudy::from_spec(study_spec("best-max", 4, Direction::Maximize));
    let trials: Vec<Trial> = [5.0, 3.2, 4.1, 4.9]
        .iter()
        .enumerate()
        .map(|(i, v)| completed_trial(&study, i as u64, &[], *v))
        .collect();

    for trial in &trials {
        study.consider(trial);
    }
    assert_eq!(study.best_value, Some(5.0));
    assert_eq!(study.best_trial_id, Some(trials[0].trial_id));
}

#[test]
fn test_median_pruner_stops_lagging_trial() {
    let study = HpoStudy::from_spec(study_spec("prune", 4, Direction::Minimize));
    let history = vec![
        completed_trial(&study, 0, &[12.0, 11.0, 10.0], 9.5),
        completed_trial(&study, 1, &[10.0, 9.0, 8.0], 7.5),
        completed_trial(&study, 2, &[8.0, 7.0, 6.0], 5.5),
    ];
    let pruner = MedianPruner::new(1, 0);

    let mut lagging = Trial::new(study.study_id, 3, Params::new());
    for (step, v) in [11.0, 10.0, 20.0].iter().enumerate() {
        lagging.report(step, *v).unwrap();
    }
    assert!(pruner.should_prune(&lagging, &history, Direction::Minimize));

    let mut ahead = Trial::new(study.study_id, 4, Params::new());
    for (step, v) in [9.0, 8.0, 7.0].iter().enumerate() {
        ahead.report(step, *v).unwrap();
    }
    assert!(!pruner.should_prune(&ahead, &history, Direction::Minimize));
}

#[test]
fn test_median_pruner_stops_trial_behind_single_completed_curve() {
    let study = HpoStudy::from_spec(study_spec("prune-one", 4, Direction::Minimize));
    let history = vec![completed_trial(&study, 0, &[10.0, 8.0, 6.0], 6.0)];
    let pruner = MedianPruner::default();

    let mut trial = Trial::new(study.study_id, 1, Params::new());
    let mut pruned_at = None;
    for (step, v) in [20.0, 19.0, 18.0].iter().enumerate() {
        trial.report(step, *v).unwrap();
        if pruner.should_prune(&trial, &history, Direction::Minimize) {
            pruned_at = Some(step);
            break;
        }
    }
    assert!(matches!(pruned_at, Some(0) | Some(1)));
}

#[tokio::test]
async fn test_study_runs_and_records_best_trial() {
    let runtime = Runtime::in_memory(OrchestratorConfig::default())
        .await
        .unwrap();
    let optimizer = runtime.orchestrator.optimizer();

    let study_id = optimizer
        .create_study(study_spec("search", 4, Direction::Minimize))
        .await
        .unwrap();
    let outcome = optimizer
        .optimize(study_id, OptimizeOptions::new().with_parallelism(2))
        .await
        .unwrap();

    assert_eq!(outcome.trials_run, 4);
    assert_eq!(outcome.study.status, StudyStatus::Completed);

    let trials = optimizer.list_trials(study_id).await.unwrap();
    assert_eq!(trials.len(), 4);
    let mut numbers: Vec<u64> = trials.iter().map(|t| t.trial_number).collect();
    numbers.sort_unstable();
    assert_eq!(numbers, vec![0, 1, 2, 3]);

    let best_completed = trials
        .iter()
        .filter(|t| t.state == TrialState::Complete)
        .filter_map(|t| t.final_value)
        .fold(f64::INFINITY, f64::min);
    assert_eq!(outcome.study.best_value, Some(best_completed));
    assert_eq!(outcome.best_trial.final_value, Some(best_completed));
    for trial in &trials {
        let lr = trial.params.get("learning_rate").expect("sampled learning_rate");
        let lr = lr.as_f64().expect("float parameter");
        assert!((0.01..=0.3).contains(&lr));
    }
}

#[tokio::test]
async fn test_duplicate_study_name_is_rejected() {
    let runtime = Runtime::in_memory(OrchestratorConfig::default())
        .await
        .unwrap();
    let optimizer = runtime.orchestrator.optimizer();

    optimizer
        .create_study(study_spec("dup", 2, Direction::Minimize))
        .await
        .unwrap();
    assert!(optimizer
        .create_study(study_spec("dup", 2, Direction::Minimize))
        .await
        .is_err());
}

#[tokio::test]
async fn test_hpo_job_registers_promoted_model() {
    let runtime = Runtime::in_memory(
        OrchestratorConfig::default().with_poll_interval(Duration::from_millis(10)),
    )
    .await
    .unwrap();
    let orch = &runtime.orchestrator;
    orch.start().await.unwrap();

    let id = orch
        .create_job(
            "t2",
            "forecast",
            json!({
                "feature_set": "basic",
                "start": "2024-01-01",
                "end": "2024-01-15",
                "model_name": "load",
                "hyperparameters": {"epochs": 3},
                "search_space": {
                    "learning_rate": {"type": "float", "low": 0.01, "high": 0.3, "log": true}
                },
                "hpo": {"n_trials": 2, "sampler": "random", "pruner": "none"}
            }),
            trainforge::scheduler::JobPriority::Normal,
        )
        .await
        .unwrap();

    let job = orch.wait_for(id, Duration::from_secs(60)).await.unwrap();
    assert_eq!(job.result_model_id.as_deref(), Some("t2:load:v1"));
    assert_eq!(runtime.registry.len().await, 1);
    orch.shutdown().await.unwrap();
}
