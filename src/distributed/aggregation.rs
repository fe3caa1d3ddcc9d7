//! Strategies for merging partition results into one model.

use crate::config::AggregationKind;
use crate::error::TrainingError;
use crate::pipeline::LinearModel;

use super::backend::PartialModel;

/// Merges the partial models of every partition.
pub trait AggregationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn aggregate(&self, partials: &[PartialModel]) -> Result<LinearModel, TrainingError>;
}

/// Row-weighted mean of the partition parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterAveraging;

impl AggregationStrategy for ParameterAveraging {
    fn name(&self) -> &'static str {
        "average"
    }

    fn aggregate(&self, partials: &[PartialModel]) -> Result<LinearModel, TrainingError> {
        let first = partials
            .first()
            .ok_or_else(|| TrainingError::Training("no partition results to aggregate".into()))?;
        let total_rows: usize = partials.iter().map(|p| p.rows).sum();
        if total_rows == 0 {
            return Err(TrainingError::Training(
                "partition results cover zero rows".to_string(),
            ));
        }

        let mut merged = LinearModel::zeros(first.model.weights.len());
        for partial in partials {
            if partial.model.weights.len() != merged.weights.len() {
                return Err(TrainingError::Training(format!(
                    "partition {} has {} weights, expected {}",
                    partial.partition,
                    partial.model.weights.len(),
                    merged.weights.len()
                )));
            }
            let share = partial.rows as f64 / total_rows as f64;
            merged.weights.scaled_add(share, &partial.model.weights);
            merged.bias += share * partial.model.bias;
        }
        Ok(merged)
    }
}

/// Keeps the partition model with the lowest validation loss.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestOfPartitions;

impl AggregationStrategy for BestOfPartitions {
    fn name(&self) -> &'static str {
        "best"
    }

    fn aggregate(&self, partials: &[PartialModel]) -> Result<LinearModel, TrainingError> {
        partials
            .iter()
            .filter(|p| p.validation_loss.is_finite())
            .min_by(|a, b| a.validation_loss.total_cmp(&b.validation_loss))
            .map(|p| p.model.clone())
            .ok_or_else(|| TrainingError::Training("no usable partition results".to_string()))
    }
}

/// Strategy for a configured aggregation kind.
pub fn strategy_for(kind: AggregationKind) -> Box<dyn AggregationStrategy> {
    match kind {
        AggregationKind::Average => Box::new(ParameterAveraging),
        AggregationKind::Best => Box::new(BestOfPartitions),
    }
}
