//! Search space and parameter value types.

use std::collections::BTreeMap;

use rand::RngExt;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::TrainingError;

/// A concrete hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl ParamValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Str(v) => f.write_str(v),
            ParamValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

/// A named set of hyperparameter values. Ordered for stable serialization.
pub type Params = BTreeMap<String, ParamValue>;

/// Domain of one hyperparameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamDomain {
    /// Real interval `[low, high]`, optionally sampled in log space.
    Float {
        low: f64,
        high: f64,
        #[serde(default)]
        log: bool,
    },
    /// Integer interval `[low, high]`, inclusive.
    Int { low: i64, high: i64 },
    /// One of a fixed list of choices.
    Categorical { choices: Vec<ParamValue> },
}

impl ParamDomain {
    fn validate(&self, name: &str) -> Result<(), TrainingError> {
        match self {
            ParamDomain::Float { low, high, log } => {
                if !low.is_finite() || !high.is_finite() || low >= high {
                    return Err(TrainingError::Validation(format!(
                        "parameter '{}': invalid bounds [{}, {}]",
                        name, low, high
                    )));
                }
                if *log && *low <= 0.0 {
                    return Err(TrainingError::Validation(format!(
                        "parameter '{}': log scale requires low > 0",
                        name
                    )));
                }
            }
            ParamDomain::Int { low, high } => {
                if low > high {
                    return Err(TrainingError::Validation(format!(
                        "parameter '{}': invalid bounds [{}, {}]",
                        name, low, high
                    )));
                }
            }
            ParamDomain::Categorical { choices } => {
                if choices.is_empty() {
                    return Err(TrainingError::Validation(format!(
                        "parameter '{}': categorical choices cannot be empty",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Draws a value uniformly (log-uniformly for log-scale floats).
    pub fn sample_uniform(&self, rng: &mut ChaCha8Rng) -> ParamValue {
        match self {
            ParamDomain::Float { low, high, log } => {
                if *log {
                    let v = rng.random_range(low.ln()..=high.ln()).exp();
                    ParamValue::Float(v.clamp(*low, *high))
                } else {
                    ParamValue::Float(rng.random_range(*low..=*high))
                }
            }
            ParamDomain::Int { low, high } => ParamValue::Int(rng.random_range(*low..=*high)),
            ParamDomain::Categorical { choices } => {
                let idx = rng.random_range(0..choices.len());
                choices[idx].clone()
            }
        }
    }

    /// Returns whether `value` lies inside this domain.
    pub fn contains(&self, value: &ParamValue) -> bool {
        match self {
            ParamDomain::Float { low, high, .. } => value
                .as_f64()
                .map(|v| v >= *low && v <= *high)
                .unwrap_or(false),
            ParamDomain::Int { low, high } => value
                .as_i64()
                .map(|v| v >= *low && v <= *high)
                .unwrap_or(false),
            ParamDomain::Categorical { choices } => choices.contains(value),
        }
    }

    /// Evenly spaced grid values. Floats use `points` values (at least 2),
    /// integers enumerate every value when the range is no larger than
    /// `points`.
    pub fn grid_values(&self, points: usize) -> Vec<ParamValue> {
        let points = points.max(2);
        match self {
            ParamDomain::Float { low, high, log } => {
                let (lo, hi) = if *log {
                    (low.ln(), high.ln())
                } else {
                    (*low, *high)
                };
                (0..points)
                    .map(|i| {
                        let t = lo + (hi - lo) * i as f64 / (points - 1) as f64;
                        ParamValue::Float(if *log { t.exp() } else { t })
                    })
                    .collect()
            }
            ParamDomain::Int { low, high } => {
                let span = (high - low) as usize + 1;
                if span <= points {
                    (*low..=*high).map(ParamValue::Int).collect()
                } else {
                    let mut values: Vec<ParamValue> = (0..points)
                        .map(|i| {
                            let v = *low as f64
                                + (*high - *low) as f64 * i as f64 / (points - 1) as f64;
                            ParamValue::Int(v.round() as i64)
                        })
                        .collect();
                    values.dedup();
                    values
                }
            }
            ParamDomain::Categorical { choices } => choices.clone(),
        }
    }
}

/// Mapping from parameter name to its domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchSpace {
    params: BTreeMap<String, ParamDomain>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter (builder style).
    pub fn with_param(mut self, name: impl Into<String>, domain: ParamDomain) -> Self {
        self.params.insert(name.into(), domain);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamDomain> {
        self.params.get(name)
    }

    /// Parameters in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamDomain)> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.params.is_empty() {
            return Err(TrainingError::Validation(
                "search space cannot be empty".to_string(),
            ));
        }
        for (name, domain) in &self.params {
            domain.validate(name)?;
        }
        Ok(())
    }

    /// Draws one full configuration uniformly at random.
    pub fn sample_uniform(&self, rng: &mut ChaCha8Rng) -> Params {
        self.params
            .iter()
            .map(|(name, domain)| (name.clone(), domain.sample_uniform(rng)))
            .collect()
    }

    /// Returns whether every parameter of the space is present and in range.
    pub fn contains(&self, params: &Params) -> bool {
        self.params.iter().all(|(name, domain)| {
            params
                .get(name)
                .map(|value| domain.contains(value))
                .unwrap_or(false)
        })
    }

    /// Full cartesian product of per-parameter grids, in a fixed order.
    pub fn grid(&self, points: usize) -> Vec<Params> {
        let mut configs = vec![Params::new()];
        for (name, domain) in &self.params {
            let values = domain.grid_values(points);
            let mut next = Vec::with_capacity(configs.len() * values.len());
            for config in &configs {
                for value in &values {
                    let mut extended = config.clone();
                    extended.insert(name.clone(), value.clone());
                    next.push(extended);
                }
            }
            configs = next;
        }
        configs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use serde_json::json;

    fn space() -> SearchSpace {
        SearchSpace::new()
            .with_param(
                "learning_rate",
                ParamDomain::Float {
                    low: 1e-4,
                    high: 1e-1,
                    log: true,
                },
            )
            .with_param("epochs", ParamDomain::Int { low: 5, high: 8 })
            .with_param(
                "solver",
                ParamDomain::Categorical {
                    choices: vec![ParamValue::Str("gd".into()), ParamValue::Str("sgd".into())],
                },
            )
    }

    #[test]
    fn test_deserialize_space() {
        let space: SearchSpace = serde_json::from_value(json!({
            "learning_rate": {"type": "float", "low": 0.001, "high": 0.1, "log": true},
            "epochs": {"type": "int", "low": 5, "high": 30},
            "solver": {"type": "categorical", "choices": ["gd", "sgd"]}
        }))
        .unwrap();
        assert_eq!(space.len(), 3);
        assert!(space.validate().is_ok());
        assert!(matches!(space.get("epochs"), Some(ParamDomain::Int { low: 5, high: 30 })));
    }

    #[test]
    fn test_param_value_untagged() {
        let v: ParamValue = serde_json::from_value(json!(20)).unwrap();
        assert_eq!(v, ParamValue::Int(20));
        let v: ParamValue = serde_json::from_value(json!(0.05)).unwrap();
        assert_eq!(v, ParamValue::Float(0.05));
        let v: ParamValue = serde_json::from_value(json!("gd")).unwrap();
        assert_eq!(v, ParamValue::Str("gd".into()));
    }

    #[test]
    fn test_validation_errors() {
        let bad = SearchSpace::new().with_param(
            "lr",
            ParamDomain::Float {
                low: 0.0,
                high: 1.0,
                log: true,
            },
        );
        assert!(bad.validate().unwrap_err().to_string().contains("log scale"));

        let bad = SearchSpace::new().with_param("n", ParamDomain::Int { low: 5, high: 1 });
        assert!(bad.validate().is_err());

        let bad = SearchSpace::new().with_param("c", ParamDomain::Categorical { choices: vec![] });
        assert!(bad.validate().is_err());

        assert!(SearchSpace::new().validate().is_err());
    }

    #[test]
    fn test_uniform_samples_stay_in_domain() {
        let space = space();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..200 {
            let params = space.sample_uniform(&mut rng);
            assert!(space.contains(&params), "{:?}", params);
        }
    }

    #[test]
    fn test_grid_is_cartesian_product() {
        let space = space();
        let grid = space.grid(3);
        // 3 learning rates x 3 epoch values (5..=8 is wider than 3) x 2 solvers
        assert_eq!(grid.len(), 3 * 3 * 2);
        assert!(grid.iter().all(|p| space.contains(p)));

        let again = space.grid(3);
        assert_eq!(grid, again);
    }

    #[test]
    fn test_grid_small_int_range_is_exhaustive() {
        let domain = ParamDomain::Int { low: 1, high: 3 };
        assert_eq!(
            domain.grid_values(5),
            vec![ParamValue::Int(1), ParamValue::Int(2), ParamValue::Int(3)]
        );
    }

    #[test]
    fn test_log_grid_endpoints() {
        let domain = ParamDomain::Float {
            low: 0.001,
            high: 0.1,
            log: true,
        };
        let values = domain.grid_values(3);
        let mid = values[1].as_f64().unwrap();
        assert!((mid - 0.01).abs() < 1e-9);
    }
}
