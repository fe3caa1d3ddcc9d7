//! Parameter samplers: TPE, random and grid.
//!
//! A sampler proposes the parameters of the next trial from the search space
//! and the study's trial history. Samplers are seeded so that a study with a
//! fixed seed proposes the same sequence.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

use crate::config::HpoConfig;

use super::space::{ParamDomain, ParamValue, Params, SearchSpace};
use super::study::{Direction, Trial, TrialState};

/// Candidates drawn from the "good" density per TPE proposal.
const TPE_CANDIDATES: usize = 24;

/// Sampler selection for a study.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    #[default]
    Tpe,
    Random,
    Grid,
}

impl SamplerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SamplerKind::Tpe => "tpe",
            SamplerKind::Random => "random",
            SamplerKind::Grid => "grid",
        }
    }

    /// Builds a sampler instance.
    pub fn build(self, config: &HpoConfig, direction: Direction, seed: u64) -> Box<dyn Sampler> {
        match self {
            SamplerKind::Tpe => Box::new(TpeSampler::new(
                direction,
                config.tpe_gamma,
                config.tpe_startup_trials,
                seed,
            )),
            SamplerKind::Random => Box::new(RandomSampler::new(seed)),
            SamplerKind::Grid => Box::new(GridSampler::new(config.grid_points)),
        }
    }
}

/// Proposes trial parameters.
pub trait Sampler: Send {
    fn name(&self) -> &'static str;

    /// Parameters for the next trial, or `None` when the sampler has no new
    /// configuration left to propose.
    fn sample(&mut self, space: &SearchSpace, history: &[Trial]) -> Option<Params>;
}

/// Independent uniform draws.
pub struct RandomSampler {
    rng: ChaCha8Rng,
}

impl RandomSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl Sampler for RandomSampler {
    fn name(&self) -> &'static str {
        "random"
    }

    fn sample(&mut self, space: &SearchSpace, _history: &[Trial]) -> Option<Params> {
        Some(space.sample_uniform(&mut self.rng))
    }
}

/// Exhaustive grid in a fixed order. Each configuration is proposed once;
/// configurations already present in the history (from any state) are
/// skipped, so resumed and parallel studies never repeat a point.
pub struct GridSampler {
    points: usize,
    grid: Option<Vec<Params>>,
}

impl GridSampler {
    pub fn new(points: usize) -> Self {
        Self { points, grid: None }
    }
}

fn same_value(a: &ParamValue, b: &ParamValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() <= 1e-9 * x.abs().max(y.abs()).max(1.0),
        _ => a == b,
    }
}

fn same_params(a: &Params, b: &Params) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .all(|(k, v)| b.get(k).is_some_and(|other| same_value(v, other)))
}

impl Sampler for GridSampler {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn sample(&mut self, space: &SearchSpace, history: &[Trial]) -> Option<Params> {
        let points = self.points;
        let grid = self.grid.get_or_insert_with(|| space.grid(points));
        grid.iter()
            .find(|candidate| !history.iter().any(|t| same_params(&t.params, candidate)))
            .cloned()
    }
}

/// Tree-structured Parzen Estimator.
///
/// After `n_startup` completed trials, splits the history into the best
/// `gamma` fraction ("good") and the rest, and proposes values maximizing
/// the ratio of the good density to the bad density.
pub struct TpeSampler {
    direction: Direction,
    gamma: f64,
    n_startup: usize,
    bandwidth: f64,
    rng: ChaCha8Rng,
}

impl TpeSampler {
    pub fn new(direction: Direction, gamma: f64, n_startup: usize, seed: u64) -> Self {
        Self {
            direction,
            gamma: gamma.clamp(0.01, 0.99),
            n_startup: n_startup.max(1),
            bandwidth: 1.0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    fn split<'a>(&self, history: &'a [Trial]) -> Option<(Vec<&'a Trial>, Vec<&'a Trial>)> {
        let mut completed: Vec<&Trial> = history
            .iter()
            .filter(|t| t.state == TrialState::Complete)
            .filter(|t| t.final_value.is_some_and(f64::is_finite))
            .collect();
        if completed.len() < self.n_startup || completed.len() < 2 {
            return None;
        }
        completed.sort_by(|a, b| {
            self.direction
                .cmp_best_first(a.final_value.unwrap_or(0.0), b.final_value.unwrap_or(0.0))
        });
        let n_good = ((completed.len() as f64) * self.gamma).ceil() as usize;
        let n_good = n_good.clamp(1, completed.len() - 1);
        let bad = completed.split_off(n_good);
        Some((completed, bad))
    }

    fn sample_continuous(&mut self, good: &[f64], bad: &[f64], low: f64, high: f64) -> f64 {
        if good.is_empty() {
            return self.rng.random_range(low..=high);
        }
        let bandwidth = (self.bandwidth * (high - low) / 10.0).max(f64::MIN_POSITIVE);
        let Ok(noise) = Normal::new(0.0, bandwidth) else {
            return self.rng.random_range(low..=high);
        };

        let mut best_value = low;
        let mut best_ratio = f64::NEG_INFINITY;
        for _ in 0..TPE_CANDIDATES {
            let base = good[self.rng.random_range(0..good.len())];
            let candidate = (base + self.rng.sample(noise)).clamp(low, high);
            let l = kde_score(candidate, good, bandwidth);
            let g = kde_score(candidate, bad, bandwidth);
            let ratio = l / (g + 1e-10);
            if ratio > best_ratio {
                best_ratio = ratio;
                best_value = candidate;
            }
        }
        best_value
    }

    /// Draws an index from `l/g` weights with Laplace smoothing.
    fn sample_weighted(&mut self, good_counts: &[f64], bad_counts: &[f64]) -> usize {
        let weights: Vec<f64> = good_counts
            .iter()
            .zip(bad_counts)
            .map(|(l, g)| (l + 1.0) / (g + 1.0))
            .collect();
        let total: f64 = weights.iter().sum();
        let r = self.rng.random::<f64>() * total;
        let mut cumsum = 0.0;
        for (i, w) in weights.iter().enumerate() {
            cumsum += w;
            if r < cumsum {
                return i;
            }
        }
        weights.len().saturating_sub(1)
    }

    fn sample_param(
        &mut self,
        name: &str,
        domain: &ParamDomain,
        good: &[&Trial],
        bad: &[&Trial],
    ) -> ParamValue {
        match domain {
            ParamDomain::Float { low, high, log } => {
                let project = |v: f64| if *log { v.max(f64::MIN_POSITIVE).ln() } else { v };
                let values = |trials: &[&Trial]| -> Vec<f64> {
                    trials
                        .iter()
                        .filter_map(|t| t.params.get(name)?.as_f64())
                        .map(project)
                        .collect()
                };
                let (good_values, bad_values) = (values(good), values(bad));
                let value =
                    self.sample_continuous(&good_values, &bad_values, project(*low), project(*high));
                let value = if *log { value.exp() } else { value };
                ParamValue::Float(value.clamp(*low, *high))
            }
            ParamDomain::Int { low, high } => {
                let span = (*high - *low + 1) as usize;
                let counts = |trials: &[&Trial]| -> Vec<f64> {
                    let mut counts = vec![0.0; span];
                    for v in trials.iter().filter_map(|t| t.params.get(name)?.as_i64()) {
                        if v >= *low && v <= *high {
                            counts[(v - low) as usize] += 1.0;
                        }
                    }
                    counts
                };
                let idx = self.sample_weighted(&counts(good), &counts(bad));
                ParamValue::Int(low + idx as i64)
            }
            ParamDomain::Categorical { choices } => {
                let counts = |trials: &[&Trial]| -> Vec<f64> {
                    let mut counts = vec![0.0; choices.len()];
                    for trial in trials {
                        if let Some(idx) = trial
                            .params
                            .get(name)
                            .and_then(|v| choices.iter().position(|c| c == v))
                        {
                            counts[idx] += 1.0;
                        }
                    }
                    counts
                };
                let idx = self.sample_weighted(&counts(good), &counts(bad));
                choices[idx].clone()
            }
        }
    }
}

fn kde_score(x: f64, values: &[f64], bandwidth: f64) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    values
        .iter()
        .map(|v| (-(x - v).powi(2) / (2.0 * bandwidth.powi(2))).exp())
        .sum::<f64>()
        / values.len() as f64
}

impl Sampler for TpeSampler {
    fn name(&self) -> &'static str {
        "tpe"
    }

    fn sample(&mut self, space: &SearchSpace, history: &[Trial]) -> Option<Params> {
        let Some((good, bad)) = self.split(history) else {
            return Some(space.sample_uniform(&mut self.rng));
        };
        let mut params = Params::new();
        for (name, domain) in space.iter() {
            let value = self.sample_param(name, domain, &good, &bad);
            params.insert(name.clone(), value);
        }
        Some(params)
    }
}
