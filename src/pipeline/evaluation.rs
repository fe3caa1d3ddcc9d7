//! Regression metrics computed on the held-out test split.

use std::collections::BTreeMap;

use ndarray::ArrayView1;

use crate::error::TrainingError;

/// Named evaluation metrics, e.g. `{"mae": 1.2, "rmse": 1.8}`.
pub type Metrics = BTreeMap<String, f64>;

/// Mean absolute error.
pub fn mae(y_true: ArrayView1<'_, f64>, y_pred: ArrayView1<'_, f64>) -> f64 {
    let n = y_true.len().max(1) as f64;
    (&y_true - &y_pred).mapv(f64::abs).sum() / n
}

/// Root mean squared error.
pub fn rmse(y_true: ArrayView1<'_, f64>, y_pred: ArrayView1<'_, f64>) -> f64 {
    let n = y_true.len().max(1) as f64;
    ((&y_true - &y_pred).mapv(|e| e * e).sum() / n).sqrt()
}

/// Mean absolute percentage error, in percent. Rows with a zero target are
/// skipped; returns `None` when every target is zero.
pub fn mape(y_true: ArrayView1<'_, f64>, y_pred: ArrayView1<'_, f64>) -> Option<f64> {
    let mut total = 0.0;
    let mut count = 0usize;
    for (t, p) in y_true.iter().zip(y_pred.iter()) {
        if t.abs() > f64::EPSILON {
            total += ((t - p) / t).abs();
            count += 1;
        }
    }
    (count > 0).then(|| 100.0 * total / count as f64)
}

/// Coefficient of determination. A constant target yields 0.0.
pub fn r2(y_true: ArrayView1<'_, f64>, y_pred: ArrayView1<'_, f64>) -> f64 {
    let mean = y_true.mean().unwrap_or(0.0);
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean).powi(2)).sum();
    let ss_res: f64 = y_true
        .iter()
        .zip(y_pred.iter())
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    if ss_tot <= f64::EPSILON {
        0.0
    } else {
        1.0 - ss_res / ss_tot
    }
}

/// Computes the standard metric set. Fails when the inputs are empty,
/// mismatched, or the predictions are not finite.
pub fn evaluate(
    y_true: ArrayView1<'_, f64>,
    y_pred: ArrayView1<'_, f64>,
) -> Result<Metrics, TrainingError> {
    if y_true.is_empty() {
        return Err(TrainingError::Training(
            "cannot evaluate on an empty test split".to_string(),
        ));
    }
    if y_true.len() != y_pred.len() {
        return Err(TrainingError::Training(format!(
            "prediction length {} does not match target length {}",
            y_pred.len(),
            y_true.len()
        )));
    }
    if y_pred.iter().any(|p| !p.is_finite()) {
        return Err(TrainingError::Training(
            "model produced non-finite predictions".to_string(),
        ));
    }

    let mut metrics = Metrics::new();
    metrics.insert("mae".to_string(), mae(y_true, y_pred));
    metrics.insert("rmse".to_string(), rmse(y_true, y_pred));
    metrics.insert("r2".to_string(), r2(y_true, y_pred));
    if let Some(m) = mape(y_true, y_pred) {
        metrics.insert("mape".to_string(), m);
    }
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_perfect_predictions() {
        let y = array![1.0, 2.0, 3.0];
        let metrics = evaluate(y.view(), y.view()).unwrap();
        assert_eq!(metrics["mae"], 0.0);
        assert_eq!(metrics["rmse"], 0.0);
        assert!((metrics["r2"] - 1.0).abs() < 1e-12);
        assert_eq!(metrics["mape"], 0.0);
    }

    #[test]
    fn test_known_errors() {
        let y = array![2.0, 4.0];
        let p = array![1.0, 6.0];
        assert!((mae(y.view(), p.view()) - 1.5).abs() < 1e-12);
        assert!((rmse(y.view(), p.view()) - (2.5f64).sqrt()).abs() < 1e-12);
        assert!((mape(y.view(), p.view()).unwrap() - 50.0).abs() < 1e-12);
    }

    #[test]
    fn test_mape_skips_zero_targets() {
        let y = array![0.0, 0.0];
        let p = array![1.0, 1.0];
        assert!(mape(y.view(), p.view()).is_none());
        let metrics = evaluate(y.view(), p.view()).unwrap();
        assert!(!metrics.contains_key("mape"));
        assert_eq!(metrics["r2"], 0.0);
    }

    #[test]
    fn test_evaluate_rejects_bad_inputs() {
        let empty = ndarray::Array1::<f64>::zeros(0);
        assert!(evaluate(empty.view(), empty.view()).is_err());

        let y = array![1.0, 2.0];
        let p = array![1.0];
        assert!(evaluate(y.view(), p.view()).is_err());

        let p = array![1.0, f64::NAN];
        let err = evaluate(y.view(), p.view()).unwrap_err();
        assert!(err.to_string().contains("non-finite"));
    }
}
