//! Tabular datasets and the preprocessing stage.
//!
//! Rows are ordered chronologically before splitting; the train, validation
//! and test splits are contiguous time ranges so that no future row leaks
//! into training. Features are standardized with statistics fitted on the
//! training split only.

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TrainingError;
use crate::scheduler::SplitRatios;

/// One observation returned by a feature store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub timestamp: DateTime<Utc>,
    pub asset_id: String,
    /// Values aligned with [`Dataset::columns`].
    pub values: Vec<f64>,
}

/// A tabular dataset: named columns plus timestamped rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

impl Dataset {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Appends a row, checking its width against the columns.
    pub fn push(&mut self, row: FeatureRow) -> Result<(), TrainingError> {
        if row.values.len() != self.columns.len() {
            return Err(TrainingError::Data(format!(
                "row has {} values but dataset has {} columns",
                row.values.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Feature matrix and target vector of one split.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
}

impl Split {
    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    /// Contiguous row range `[start, end)`.
    pub fn slice_rows(&self, start: usize, end: usize) -> Split {
        Split {
            x: self.x.slice(ndarray::s![start..end, ..]).to_owned(),
            y: self.y.slice(ndarray::s![start..end]).to_owned(),
        }
    }
}

/// Per-feature standardization fitted on the training split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(x: &Array2<f64>) -> Self {
        let mean = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(x.ncols()));
        let std = x.std_axis(Axis(0), 0.0);
        Self {
            mean: mean.to_vec(),
            // Constant columns are left centred but unscaled.
            std: std
                .iter()
                .map(|s| if *s > f64::EPSILON { *s } else { 1.0 })
                .collect(),
        }
    }

    pub fn transform(&self, x: &mut Array2<f64>) {
        for (j, mut column) in x.axis_iter_mut(Axis(1)).enumerate() {
            let (m, s) = (self.mean[j], self.std[j]);
            column.mapv_inplace(|v| (v - m) / s);
        }
    }
}

/// Output of the preprocessing stage.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub feature_names: Vec<String>,
    pub train: Split,
    pub validation: Split,
    pub test: Split,
    pub scaler: StandardScaler,
    /// Rows dropped because a value was missing or non-finite.
    pub dropped_rows: usize,
}

/// Orders, splits and standardizes a dataset for training.
pub fn prepare(
    dataset: &Dataset,
    target: &str,
    ratios: &SplitRatios,
) -> Result<PreparedData, TrainingError> {
    if dataset.is_empty() {
        return Err(TrainingError::Data("dataset has zero rows".to_string()));
    }
    let target_idx = dataset.column_index(target).ok_or_else(|| {
        TrainingError::Data(format!("target column '{}' not present in dataset", target))
    })?;
    let feature_idx: Vec<usize> = (0..dataset.columns.len())
        .filter(|i| *i != target_idx)
        .collect();
    if feature_idx.is_empty() {
        return Err(TrainingError::Data(
            "dataset has no feature columns besides the target".to_string(),
        ));
    }

    let mut rows: Vec<&FeatureRow> = dataset
        .rows
        .iter()
        .filter(|row| row.values.iter().all(|v| v.is_finite()))
        .collect();
    let dropped_rows = dataset.len() - rows.len();
    rows.sort_by_key(|row| row.timestamp);

    let n = rows.len();
    let n_train = (n as f64 * ratios.train).floor() as usize;
    let n_val = (n as f64 * ratios.validation).floor() as usize;
    let n_test = n.saturating_sub(n_train + n_val);
    if n_train < 2 || n_val == 0 || n_test == 0 {
        return Err(TrainingError::Data(format!(
            "dataset too small to split: {} usable rows",
            n
        )));
    }

    let mut x = Array2::<f64>::zeros((n, feature_idx.len()));
    let mut y = Array1::<f64>::zeros(n);
    for (i, row) in rows.iter().enumerate() {
        for (j, idx) in feature_idx.iter().enumerate() {
            x[[i, j]] = row.values[*idx];
        }
        y[i] = row.values[target_idx];
    }

    let all = Split { x, y };
    let mut train = all.slice_rows(0, n_train);
    let mut validation = all.slice_rows(n_train, n_train + n_val);
    let mut test = all.slice_rows(n_train + n_val, n);

    let scaler = StandardScaler::fit(&train.x);
    scaler.transform(&mut train.x);
    scaler.transform(&mut validation.x);
    scaler.transform(&mut test.x);

    debug!(
        rows = n,
        dropped = dropped_rows,
        train = train.len(),
        validation = validation.len(),
        test = test.len(),
        "Prepared dataset"
    );

    Ok(PreparedData {
        feature_names: feature_idx
            .iter()
            .map(|i| dataset.columns[*i].clone())
            .collect(),
        train,
        validation,
        test,
        scaler,
        dropped_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn dataset(n: usize) -> Dataset {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut ds = Dataset::new(vec!["x".into(), "target".into()]);
        // Insert in reverse order to exercise chronological sorting.
        for i in (0..n).rev() {
            ds.push(FeatureRow {
                timestamp: start + Duration::hours(i as i64),
                asset_id: "a1".into(),
                values: vec![i as f64, 2.0 * i as f64],
            })
            .unwrap();
        }
        ds
    }

    #[test]
    fn test_push_checks_width() {
        let mut ds = Dataset::new(vec!["a".into()]);
        let err = ds
            .push(FeatureRow {
                timestamp: Utc::now(),
                asset_id: "a".into(),
                values: vec![1.0, 2.0],
            })
            .unwrap_err();
        assert!(matches!(err, TrainingError::Data(_)));
    }

    #[test]
    fn test_prepare_splits_chronologically() {
        let prepared = prepare(&dataset(100), "target", &SplitRatios::default()).unwrap();
        assert_eq!(prepared.train.len(), 70);
        assert_eq!(prepared.validation.len(), 15);
        assert_eq!(prepared.test.len(), 15);
        assert_eq!(prepared.feature_names, vec!["x".to_string()]);

        // Targets are monotone in time, so every train target precedes the test ones.
        let max_train = prepared.train.y.iter().cloned().fold(f64::MIN, f64::max);
        let min_test = prepared.test.y.iter().cloned().fold(f64::MAX, f64::min);
        assert!(max_train < min_test);
    }

    #[test]
    fn test_scaler_fitted_on_train() {
        let prepared = prepare(&dataset(100), "target", &SplitRatios::default()).unwrap();
        let mean = prepared.train.x.column(0).mean().unwrap();
        assert!(mean.abs() < 1e-9);
        // Test rows lie after the training window, so they scale above zero.
        assert!(prepared.test.x.column(0).iter().all(|v| *v > 0.0));
    }

    #[test]
    fn test_prepare_errors() {
        let err = prepare(&Dataset::default(), "target", &SplitRatios::default()).unwrap_err();
        assert!(err.to_string().contains("zero rows"));

        let err = prepare(&dataset(10), "load", &SplitRatios::default()).unwrap_err();
        assert!(err.to_string().contains("'load'"));

        let err = prepare(&dataset(3), "target", &SplitRatios::default()).unwrap_err();
        assert!(err.to_string().contains("too small"));
    }

    #[test]
    fn test_prepare_drops_non_finite_rows() {
        let mut ds = dataset(40);
        ds.rows[0].values[0] = f64::NAN;
        let prepared = prepare(&ds, "target", &SplitRatios::default()).unwrap();
        assert_eq!(prepared.dropped_rows, 1);
    }
}
