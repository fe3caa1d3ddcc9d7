//! Early stopping of unpromising trials.

use serde::{Deserialize, Serialize};

use crate::config::HpoConfig;

use super::study::{Direction, Trial, TrialState};

/// Pruner selection for a study.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrunerKind {
    #[default]
    Median,
    Hyperband,
    None,
}

impl PrunerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PrunerKind::Median => "median",
            PrunerKind::Hyperband => "hyperband",
            PrunerKind::None => "none",
        }
    }

    /// Builds a pruner. `max_resource` is the number of steps a full trial
    /// reports (its epoch count).
    pub fn build(self, config: &HpoConfig, max_resource: usize) -> Box<dyn Pruner> {
        match self {
            PrunerKind::Median => Box::new(MedianPruner::new(
                config.median_startup_trials,
                config.median_warmup_steps,
            )),
            PrunerKind::Hyperband => Box::new(HyperbandPruner::new(
                config.hyperband_min_resource,
                max_resource,
                config.hyperband_reduction_factor,
            )),
            PrunerKind::None => Box::new(NopPruner),
        }
    }
}

/// Decides whether a running trial should stop after its latest report.
pub trait Pruner: Send + Sync {
    fn name(&self) -> &'static str;

    /// `trial` is the running trial with its intermediate values up to the
    /// current step. `history` holds the study's other trials.
    fn should_prune(&self, trial: &Trial, history: &[Trial], direction: Direction) -> bool;
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

/// Prunes a trial whose value at a step is worse than the median of the
/// completed trials' values at the same step.
#[derive(Debug, Clone)]
pub struct MedianPruner {
    n_startup_trials: usize,
    n_warmup_steps: usize,
}

impl MedianPruner {
    pub fn new(n_startup_trials: usize, n_warmup_steps: usize) -> Self {
        Self {
            n_startup_trials: n_startup_trials.max(1),
            n_warmup_steps,
        }
    }
}

impl Default for MedianPruner {
    fn default() -> Self {
        Self::new(1, 0)
    }
}

impl Pruner for MedianPruner {
    fn name(&self) -> &'static str {
        "median"
    }

    fn should_prune(&self, trial: &Trial, history: &[Trial], direction: Direction) -> bool {
        let Some((step, value)) = trial.last_intermediate() else {
            return false;
        };
        if step < self.n_warmup_steps || !value.is_finite() {
            return false;
        }

        let completed: Vec<&Trial> = history
            .iter()
            .filter(|t| t.trial_id != trial.trial_id && t.state == TrialState::Complete)
            .collect();
        if completed.len() < self.n_startup_trials {
            return false;
        }

        let mut at_step: Vec<f64> = completed
            .iter()
            .filter_map(|t| t.intermediate_values.get(step).copied())
            .filter(|v| v.is_finite())
            .collect();
        match median(&mut at_step) {
            Some(m) => direction.is_better(m, value),
            None => false,
        }
    }
}

/// Successive halving over Hyperband brackets.
///
/// Trials are assigned to brackets round-robin by trial number. Within a
/// bracket, rungs sit at `min_resource * eta^k` steps; at each rung only the
/// best `1/eta` of the bracket's trials that reached it continue.
#[derive(Debug, Clone)]
pub struct HyperbandPruner {
    min_resource: usize,
    max_resource: usize,
    eta: usize,
}

impl HyperbandPruner {
    pub fn new(min_resource: usize, max_resource: usize, eta: usize) -> Self {
        let min_resource = min_resource.max(1);
        Self {
            min_resource,
            max_resource: max_resource.max(min_resource),
            eta: eta.max(2),
        }
    }

    /// Number of brackets: `floor(log_eta(max / min)) + 1`.
    pub fn n_brackets(&self) -> usize {
        let mut count = 1;
        let mut resource = self.min_resource;
        while resource * self.eta <= self.max_resource {
            resource *= self.eta;
            count += 1;
        }
        count
    }

    pub fn bracket_of(&self, trial_number: u64) -> usize {
        (trial_number % self.n_brackets() as u64) as usize
    }

    /// Rung budgets (in steps) for a bracket, excluding the full budget.
    pub fn rungs(&self, bracket: usize) -> Vec<usize> {
        let mut rungs = Vec::new();
        let mut resource = self.min_resource * self.eta.pow(bracket as u32);
        while resource < self.max_resource {
            rungs.push(resource);
            resource *= self.eta;
        }
        rungs
    }
}

impl Pruner for HyperbandPruner {
    fn name(&self) -> &'static str {
        "hyperband"
    }

    fn should_prune(&self, trial: &Trial, history: &[Trial], direction: Direction) -> bool {
        let Some((step, value)) = trial.last_intermediate() else {
            return false;
        };
        let budget = step + 1;
        let bracket = self.bracket_of(trial.trial_number);
        if !self.rungs(bracket).contains(&budget) {
            return false;
        }

        let mut values: Vec<f64> = history
            .iter()
            .filter(|t| t.trial_id != trial.trial_id)
            .filter(|t| self.bracket_of(t.trial_number) == bracket)
            .filter_map(|t| t.intermediate_values.get(step).copied())
            .filter(|v| v.is_finite())
            .collect();
        if values.is_empty() {
            return false;
        }
        values.push(value);
        values.sort_by(|a, b| direction.cmp_best_first(*a, *b));

        let keep = values.len().div_ceil(self.eta);
        let cutoff = values[keep - 1];
        direction.is_better(cutoff, value)
    }
}

/// Never prunes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopPruner;

impl Pruner for NopPruner {
    fn name(&self) -> &'static str {
        "none"
    }

    fn should_prune(&self, _trial: &Trial, _history: &[Trial], _direction: Direction) -> bool {
        false
    }
}
