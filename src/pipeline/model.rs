//! Model representation and the per-epoch training step.
//!
//! The numerical algorithm sits behind [`ModelTrainer`]; the pipeline and the
//! distributed trainer only rely on a model being a parameter vector that
//! can be trained one epoch at a time and averaged across partitions.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::TrainingError;
use crate::hpo::{ParamValue, Params};

use super::dataset::{Split, StandardScaler};
use super::evaluation;

/// A linear model `y = x·w + b`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    pub weights: Array1<f64>,
    pub bias: f64,
}

impl LinearModel {
    pub fn zeros(n_features: usize) -> Self {
        Self {
            weights: Array1::zeros(n_features),
            bias: 0.0,
        }
    }

    pub fn predict(&self, x: &Array2<f64>) -> Array1<f64> {
        x.dot(&self.weights) + self.bias
    }

    /// Validation RMSE of the model on `split`.
    pub fn loss(&self, split: &Split) -> f64 {
        let predictions = self.predict(&split.x);
        evaluation::rmse(split.y.view(), predictions.view())
    }

    pub fn is_finite(&self) -> bool {
        self.bias.is_finite() && self.weights.iter().all(|w| w.is_finite())
    }
}

/// Serialized form of a trained model, stored in the model registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model_type: String,
    pub feature_names: Vec<String>,
    pub weights: Vec<f64>,
    pub bias: f64,
    pub scaler: StandardScaler,
    pub params: Params,
}

impl ModelArtifact {
    pub fn to_bytes(&self) -> Result<Vec<u8>, TrainingError> {
        serde_json::to_vec(self)
            .map_err(|e| TrainingError::Training(format!("failed to serialize model: {}", e)))
    }
}

/// Resolved optimization settings for one training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainParams {
    pub learning_rate: f64,
    pub epochs: usize,
    pub l2: f64,
}

impl TrainParams {
    /// Merges job/trial overrides over the pipeline defaults. Unknown keys are
    /// ignored; they are carried as opaque metadata.
    pub fn resolve(overrides: &Params, defaults: &PipelineConfig) -> Result<Self, TrainingError> {
        Self::validate_overrides(overrides)?;
        let learning_rate = overrides
            .get("learning_rate")
            .and_then(ParamValue::as_f64)
            .unwrap_or(defaults.default_learning_rate);
        let epochs = overrides
            .get("epochs")
            .and_then(ParamValue::as_i64)
            .map(|e| e as usize)
            .unwrap_or(defaults.default_epochs);
        let l2 = overrides
            .get("l2")
            .and_then(ParamValue::as_f64)
            .unwrap_or(0.0);
        Ok(Self {
            learning_rate,
            epochs,
            l2,
        })
    }

    /// Checks the types and ranges of the known hyperparameters.
    pub fn validate_overrides(overrides: &Params) -> Result<(), TrainingError> {
        if let Some(value) = overrides.get("learning_rate") {
            match value.as_f64() {
                Some(lr) if lr > 0.0 && lr.is_finite() => {}
                _ => {
                    return Err(TrainingError::Validation(format!(
                        "learning_rate must be a positive number, got {}",
                        value
                    )))
                }
            }
        }
        if let Some(value) = overrides.get("epochs") {
            match value.as_i64() {
                Some(e) if e > 0 => {}
                _ => {
                    return Err(TrainingError::Validation(format!(
                        "epochs must be a positive integer, got {}",
                        value
                    )))
                }
            }
        }
        if let Some(value) = overrides.get("l2") {
            match value.as_f64() {
                Some(l2) if l2 >= 0.0 && l2.is_finite() => {}
                _ => {
                    return Err(TrainingError::Validation(format!(
                        "l2 must be a non-negative number, got {}",
                        value
                    )))
                }
            }
        }
        Ok(())
    }
}

/// One epoch of model fitting.
pub trait ModelTrainer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starting point for a fit on `train`.
    fn initialize(&self, train: &Split) -> LinearModel;

    /// Runs one epoch over `train`, returning the training MSE.
    fn fit_epoch(
        &self,
        model: &mut LinearModel,
        train: &Split,
        params: &TrainParams,
    ) -> Result<f64, TrainingError>;
}

/// Full-batch gradient descent on squared error with optional L2 penalty.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientDescentTrainer;

impl ModelTrainer for GradientDescentTrainer {
    fn name(&self) -> &'static str {
        "gradient_descent"
    }

    fn initialize(&self, train: &Split) -> LinearModel {
        let mut model = LinearModel::zeros(train.x.ncols());
        model.bias = train.y.mean().unwrap_or(0.0);
        model
    }

    fn fit_epoch(
        &self,
        model: &mut LinearModel,
        train: &Split,
        params: &TrainParams,
    ) -> Result<f64, TrainingError> {
        if train.is_empty() {
            return Err(TrainingError::Training(
                "cannot fit on an empty partition".to_string(),
            ));
        }
        let n = train.len() as f64;
        let residual = model.predict(&train.x) - &train.y;
        let grad_w = train.x.t().dot(&residual) / n + &model.weights * params.l2;
        let grad_b = residual.sum() / n;

        model.weights.scaled_add(-params.learning_rate, &grad_w);
        model.bias -= params.learning_rate * grad_b;

        if !model.is_finite() {
            return Err(TrainingError::Training(format!(
                "model diverged (learning_rate={})",
                params.learning_rate
            )));
        }
        Ok(residual.mapv(|r| r * r).sum() / n)
    }
}

/// Fits a model on one partition, calling `on_epoch(epoch, validation_rmse)`
/// after every epoch. Returning `false` from the callback aborts the fit
/// with [`TrainingError::Cancelled`].
pub fn fit_partition(
    trainer: &dyn ModelTrainer,
    mut model: LinearModel,
    train: &Split,
    validation: &Split,
    params: &TrainParams,
    mut on_epoch: impl FnMut(usize, f64) -> bool,
) -> Result<LinearModel, TrainingError> {
    for epoch in 0..params.epochs {
        trainer.fit_epoch(&mut model, train, params)?;
        if !on_epoch(epoch, model.loss(validation)) {
            return Err(TrainingError::Cancelled(format!(
                "partition fit stopped after epoch {}",
                epoch
            )));
        }
    }
    Ok(model)
}
