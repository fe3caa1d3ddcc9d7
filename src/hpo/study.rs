//! Study and trial records.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TrainingError;

use super::pruner::PrunerKind;
use super::sampler::SamplerKind;
use super::space::{Params, SearchSpace};

/// Identifier of a study.
pub type StudyId = Uuid;

/// Optimization direction of the objective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Minimize,
    Maximize,
}

impl Direction {
    /// Whether `candidate` is strictly better than `incumbent`.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Direction::Minimize => candidate < incumbent,
            Direction::Maximize => candidate > incumbent,
        }
    }

    /// Orders values best-first.
    pub fn cmp_best_first(self, a: f64, b: f64) -> std::cmp::Ordering {
        match self {
            Direction::Minimize => a.total_cmp(&b),
            Direction::Maximize => b.total_cmp(&a),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Minimize => "minimize",
            Direction::Maximize => "maximize",
        }
    }
}

impl FromStr for Direction {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minimize" => Ok(Direction::Minimize),
            "maximize" => Ok(Direction::Maximize),
            other => Err(TrainingError::Validation(format!(
                "unknown direction '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle of a study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyStatus {
    Created,
    Running,
    Completed,
    TimedOut,
    Stopped,
}

impl StudyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StudyStatus::Created => "created",
            StudyStatus::Running => "running",
            StudyStatus::Completed => "completed",
            StudyStatus::TimedOut => "timed_out",
            StudyStatus::Stopped => "stopped",
        }
    }
}

impl FromStr for StudyStatus {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(StudyStatus::Created),
            "running" => Ok(StudyStatus::Running),
            "completed" => Ok(StudyStatus::Completed),
            "timed_out" => Ok(StudyStatus::TimedOut),
            "stopped" => Ok(StudyStatus::Stopped),
            other => Err(TrainingError::Validation(format!(
                "unknown study status '{}'",
                other
            ))),
        }
    }
}

/// State of a single trial. Terminal states are written once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Running,
    Complete,
    Pruned,
    Fail,
}

impl TrialState {
    pub fn is_terminal(self) -> bool {
        self != TrialState::Running
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrialState::Running => "running",
            TrialState::Complete => "complete",
            TrialState::Pruned => "pruned",
            TrialState::Fail => "fail",
        }
    }
}

impl FromStr for TrialState {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(TrialState::Running),
            "complete" => Ok(TrialState::Complete),
            "pruned" => Ok(TrialState::Pruned),
            "fail" => Ok(TrialState::Fail),
            other => Err(TrainingError::Validation(format!(
                "unknown trial state '{}'",
                other
            ))),
        }
    }
}

/// One evaluation of the objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub trial_id: Uuid,
    pub study_id: StudyId,
    /// Position within the study, starting at 0.
    pub trial_number: u64,
    pub state: TrialState,
    pub params: Params,
    /// Intermediate objective values, indexed by step.
    pub intermediate_values: Vec<f64>,
    pub final_value: Option<f64>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(study_id: StudyId, trial_number: u64, params: Params) -> Self {
        Self {
            trial_id: Uuid::new_v4(),
            study_id,
            trial_number,
            state: TrialState::Running,
            params,
            intermediate_values: Vec::new(),
            final_value: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    fn ensure_running(&self) -> Result<(), TrainingError> {
        if self.state.is_terminal() {
            return Err(TrainingError::InvalidState(format!(
                "trial {} is already {}",
                self.trial_number,
                self.state.as_str()
            )));
        }
        Ok(())
    }

    /// Appends the intermediate value for `step`.
    pub fn report(&mut self, step: usize, value: f64) -> Result<(), TrainingError> {
        self.ensure_running()?;
        if step != self.intermediate_values.len() {
            return Err(TrainingError::InvalidState(format!(
                "trial {} expected step {}, got {}",
                self.trial_number,
                self.intermediate_values.len(),
                step
            )));
        }
        self.intermediate_values.push(value);
        Ok(())
    }

    /// Most recent intermediate value and its step.
    pub fn last_intermediate(&self) -> Option<(usize, f64)> {
        self.intermediate_values
            .last()
            .map(|v| (self.intermediate_values.len() - 1, *v))
    }

    pub fn complete(&mut self, value: f64) -> Result<(), TrainingError> {
        self.ensure_running()?;
        self.state = TrialState::Complete;
        self.final_value = Some(value);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn prune(&mut self) -> Result<(), TrainingError> {
        self.ensure_running()?;
        self.state = TrialState::Pruned;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TrainingError> {
        self.ensure_running()?;
        self.state = TrialState::Fail;
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}

/// Request to create a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySpec {
    pub tenant_id: String,
    pub name: String,
    pub model_type: String,
    pub search_space: SearchSpace,
    #[serde(default)]
    pub sampler: SamplerKind,
    #[serde(default)]
    pub pruner: PrunerKind,
    #[serde(default)]
    pub direction: Direction,
    pub n_trials: usize,
    #[serde(default = "default_objective")]
    pub objective_metric: String,
    /// Base job config every trial trains with; sampled values override its
    /// hyperparameters.
    pub training_config: serde_json::Value,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Objective used when a study does not name one: RMSE on the validation
/// split, so the test split stays held out from the search.
pub const DEFAULT_OBJECTIVE: &str = "val_rmse";

fn default_objective() -> String {
    DEFAULT_OBJECTIVE.to_string()
}

/// A hyperparameter search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpoStudy {
    pub study_id: StudyId,
    pub tenant_id: String,
    pub name: String,
    pub model_type: String,
    pub search_space: SearchSpace,
    pub sampler: SamplerKind,
    pub pruner: PrunerKind,
    pub direction: Direction,
    pub n_trials_target: usize,
    pub objective_metric: String,
    pub training_config: serde_json::Value,
    pub status: StudyStatus,
    pub best_trial_id: Option<Uuid>,
    pub best_value: Option<f64>,
    pub seed: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HpoStudy {
    pub fn from_spec(spec: StudySpec) -> Self {
        let now = Utc::now();
        Self {
            study_id: Uuid::new_v4(),
            tenant_id: spec.tenant_id,
            name: spec.name,
            model_type: spec.model_type,
            search_space: spec.search_space,
            sampler: spec.sampler,
            pruner: spec.pruner,
            direction: spec.direction,
            n_trials_target: spec.n_trials,
            objective_metric: spec.objective_metric,
            training_config: spec.training_config,
            status: StudyStatus::Created,
            best_trial_id: None,
            best_value: None,
            seed: spec.seed.unwrap_or_else(rand::random),
            created_at: now,
            updated_at: now,
        }
    }

    /// Records `trial` as the best one if it completed with a strictly
    /// better value. Returns whether the best trial changed.
    pub fn consider(&mut self, trial: &Trial) -> bool {
        if trial.state != TrialState::Complete {
            return false;
        }
        let Some(value) = trial.final_value.filter(|v| v.is_finite()) else {
            return false;
        };
        let improved = match self.best_value {
            Some(best) => self.direction.is_better(value, best),
            None => true,
        };
        if improved {
            self.best_trial_id = Some(trial.trial_id);
            self.best_value = Some(value);
            self.updated_at = Utc::now();
        }
        improved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn study(direction: Direction) -> HpoStudy {
        HpoStudy::from_spec(StudySpec {
            tenant_id: "t1".into(),
            name: "s".into(),
            model_type: "forecast".into(),
            search_space: SearchSpace::new(),
            sampler: SamplerKind::Random,
            pruner: PrunerKind::None,
            direction,
            n_trials: 5,
            objective_metric: "rmse".into(),
            training_config: serde_json::json!({}),
            seed: Some(1),
        })
    }

    fn completed(study: &HpoStudy, number: u64, value: f64) -> Trial {
        let mut trial = Trial::new(study.study_id, number, Params::new());
        trial.complete(value).unwrap();
        trial
    }

    #[test]
    fn test_best_trial_selection() {
        let mut study = study(Direction::Minimize);
        let trials: Vec<Trial> = [5.0, 3.2, 4.1]
            .iter()
            .enumerate()
            .map(|(i, v)| completed(&study, i as u64, *v))
            .collect();
        for trial in &trials {
            study.consider(trial);
        }
        assert_eq!(study.best_value, Some(3.2));
        assert_eq!(study.best_trial_id, Some(trials[1].trial_id));

        let worse = completed(&study, 3, 4.9);
        assert!(!study.consider(&worse));
        assert_eq!(study.best_value, Some(3.2));

        // Ties keep the incumbent.
        let tie = completed(&study, 4, 3.2);
        assert!(!study.consider(&tie));
        assert_eq!(study.best_trial_id, Some(trials[1].trial_id));
    }

    #[test]
    fn test_maximize_direction() {
        let mut study = study(Direction::Maximize);
        let low = completed(&study, 0, 0.5);
        let high = completed(&study, 1, 0.9);
        study.consider(&low);
        study.consider(&high);
        assert_eq!(study.best_value, Some(0.9));
    }

    #[test]
    fn test_pruned_and_failed_never_best() {
        let mut study = study(Direction::Minimize);
        let mut pruned = Trial::new(study.study_id, 0, Params::new());
        pruned.report(0, 0.1).unwrap();
        pruned.prune().unwrap();
        assert!(!study.consider(&pruned));

        let mut failed = Trial::new(study.study_id, 1, Params::new());
        failed.fail("boom").unwrap();
        assert!(!study.consider(&failed));
        assert!(study.best_trial_id.is_none());
    }

    #[test]
    fn test_objective_defaults_to_validation_rmse() {
        let spec: StudySpec = serde_json::from_value(serde_json::json!({
            "tenant_id": "t1",
            "name": "s",
            "model_type": "forecast",
            "search_space": {},
            "n_trials": 3,
            "training_config": {}
        }))
        .unwrap();
        assert_eq!(spec.objective_metric, "val_rmse");
    }

    #[test]
    fn test_terminal_state_is_write_once() {
        let mut trial = Trial::new(Uuid::new_v4(), 0, Params::new());
        trial.complete(1.0).unwrap();
        assert!(trial.prune().is_err());
        assert!(trial.fail("late").is_err());
        assert!(trial.complete(0.5).is_err());
        assert!(trial.report(0, 1.0).is_err());
        assert_eq!(trial.final_value, Some(1.0));
    }

    #[test]
    fn test_report_steps_in_order() {
        let mut trial = Trial::new(Uuid::new_v4(), 0, Params::new());
        trial.report(0, 3.0).unwrap();
        trial.report(1, 2.0).unwrap();
        assert!(trial.report(3, 1.0).is_err());
        assert_eq!(trial.last_intermediate(), Some((1, 2.0)));
    }

    #[test]
    fn test_direction_ordering() {
        let mut values = vec![2.0, 1.0, 3.0];
        values.sort_by(|a, b| Direction::Maximize.cmp_best_first(*a, *b));
        assert_eq!(values, vec![3.0, 2.0, 1.0]);
        assert!(Direction::Minimize.is_better(1.0, 2.0));
        assert!(!Direction::Minimize.is_better(2.0, 2.0));
    }
}
