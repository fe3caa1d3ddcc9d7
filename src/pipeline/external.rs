//! Ports to the external feature store and model registry.
//!
//! The pipeline only talks to these services through the [`FeatureStore`]
//! and [`ModelRegistry`] traits. In-process implementations are provided for
//! local runs and tests:
//!
//! - [`SyntheticFeatureStore`] generates deterministic hourly series
//! - [`InMemoryFeatureStore`] serves datasets inserted ahead of time
//! - [`InMemoryModelRegistry`] versions and checksums registered artifacts

use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::TrainingError;

use super::dataset::{Dataset, FeatureRow};
use super::evaluation::Metrics;

/// Asset used when a job does not restrict its dataset to specific assets.
pub const DEFAULT_ASSET: &str = "asset-1";

/// Read access to historical and online features.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Returns the rows of `feature_set` with `start <= timestamp < end`.
    async fn get_dataset(
        &self,
        tenant_id: &str,
        feature_set: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        asset_ids: Option<&[String]>,
    ) -> Result<Dataset, TrainingError>;

    /// Latest feature values for one asset.
    async fn get_online_features(
        &self,
        tenant_id: &str,
        asset_id: &str,
        feature_set: &str,
    ) -> Result<BTreeMap<String, f64>, TrainingError>;
}

/// Builds the canonical model identifier `tenant:model_name:vN`.
pub fn model_id(tenant_id: &str, model_name: &str, version: u32) -> String {
    format!("{}:{}:v{}", tenant_id, model_name, version)
}

/// A model registration request.
#[derive(Debug, Clone)]
pub struct RegisterModel {
    pub tenant_id: String,
    pub model_name: String,
    pub model_type: String,
    pub artifact: Vec<u8>,
    pub metrics: Metrics,
    pub metadata: BTreeMap<String, String>,
}

/// A stored model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub model_id: String,
    pub tenant_id: String,
    pub model_name: String,
    pub model_type: String,
    pub version: u32,
    /// Hex-encoded SHA-256 of the artifact.
    pub checksum: String,
    pub size_bytes: usize,
    pub metrics: Metrics,
    pub metadata: BTreeMap<String, String>,
    pub registered_at: DateTime<Utc>,
}

/// Versioned storage of trained model artifacts.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Stores the artifact as the next version of `tenant:model_name`.
    async fn register(&self, request: RegisterModel) -> Result<RegisteredModel, TrainingError>;

    async fn get(&self, model_id: &str) -> Result<RegisteredModel, TrainingError>;

    /// Highest registered version, if any.
    async fn latest_version(
        &self,
        tenant_id: &str,
        model_name: &str,
    ) -> Result<Option<u32>, TrainingError>;
}

/// Hex-encoded SHA-256 digest.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn seed_for(parts: &[&str]) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Generates deterministic hourly series for the `basic` and `extended`
/// feature sets. The target is a noisy linear function of the features, so a
/// linear model can learn it.
#[derive(Debug, Clone)]
pub struct SyntheticFeatureStore {
    interval: Duration,
    noise_std: f64,
    max_rows: usize,
}

impl Default for SyntheticFeatureStore {
    fn default() -> Self {
        Self {
            interval: Duration::hours(1),
            noise_std: 1.0,
            max_rows: 500_000,
        }
    }
}

impl SyntheticFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the spacing between generated rows.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the standard deviation of the target noise.
    pub fn with_noise(mut self, noise_std: f64) -> Self {
        self.noise_std = noise_std;
        self
    }

    /// Caps the number of rows generated per request.
    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    fn columns(feature_set: &str) -> Option<Vec<String>> {
        let names: &[&str] = match feature_set {
            "basic" => &["hour_sin", "hour_cos", "temperature", "target"],
            "extended" => &[
                "hour_sin",
                "hour_cos",
                "temperature",
                "is_weekend",
                "day_of_year_sin",
                "target",
            ],
            _ => return None,
        };
        Some(names.iter().map(|s| s.to_string()).collect())
    }

    fn row_values(
        feature_set: &str,
        ts: DateTime<Utc>,
        rng: &mut ChaCha8Rng,
        noise: &rand_distr::Normal<f64>,
    ) -> Vec<f64> {
        let hour = ts.hour() as f64;
        let day = ts.ordinal() as f64;
        let hour_sin = (2.0 * PI * hour / 24.0).sin();
        let hour_cos = (2.0 * PI * hour / 24.0).cos();
        let season = (2.0 * PI * day / 365.0).sin();
        let temperature = 15.0 + 8.0 * season + rng.sample(noise) * 0.5;
        let is_weekend = if ts.weekday().number_from_monday() >= 6 {
            1.0
        } else {
            0.0
        };

        let mut target = 50.0 + 10.0 * hour_sin + 5.0 * hour_cos + 0.8 * temperature;
        let mut values = vec![hour_sin, hour_cos, temperature];
        if feature_set == "extended" {
            target -= 6.0 * is_weekend;
            target += 3.0 * season;
            values.push(is_weekend);
            values.push(season);
        }
        values.push(target + rng.sample(noise));
        values
    }
}

#[async_trait]
impl FeatureStore for SyntheticFeatureStore {
    async fn get_dataset(
        &self,
        tenant_id: &str,
        feature_set: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        asset_ids: Option<&[String]>,
    ) -> Result<Dataset, TrainingError> {
        let columns = Self::columns(feature_set).ok_or_else(|| {
            TrainingError::Data(format!("unknown feature set '{}'", feature_set))
        })?;
        let noise = rand_distr::Normal::new(0.0, self.noise_std.max(f64::MIN_POSITIVE))
            .map_err(|e| TrainingError::Data(format!("invalid noise level: {}", e)))?;

        let default_assets = [DEFAULT_ASSET.to_string()];
        let assets = asset_ids.unwrap_or(&default_assets);
        let first = start
            .duration_trunc(self.interval)
            .map_err(|e| TrainingError::Data(format!("invalid start timestamp: {}", e)))?;

        let mut dataset = Dataset::new(columns);
        'assets: for asset in assets {
            let mut rng = ChaCha8Rng::seed_from_u64(seed_for(&[tenant_id, feature_set, asset]));
            let mut ts = if first < start { first + self.interval } else { first };
            while ts < end {
                if dataset.len() >= self.max_rows {
                    break 'assets;
                }
                dataset.push(FeatureRow {
                    timestamp: ts,
                    asset_id: asset.clone(),
                    values: Self::row_values(feature_set, ts, &mut rng, &noise),
                })?;
                ts += self.interval;
            }
        }

        debug!(
            tenant_id = %tenant_id,
            feature_set = %feature_set,
            rows = dataset.len(),
            "Generated synthetic dataset"
        );
        Ok(dataset)
    }

    async fn get_online_features(
        &self,
        tenant_id: &str,
        asset_id: &str,
        feature_set: &str,
    ) -> Result<BTreeMap<String, f64>, TrainingError> {
        let columns = Self::columns(feature_set).ok_or_else(|| {
            TrainingError::Data(format!("unknown feature set '{}'", feature_set))
        })?;
        let noise = rand_distr::Normal::new(0.0, self.noise_std.max(f64::MIN_POSITIVE))
            .map_err(|e| TrainingError::Data(format!("invalid noise level: {}", e)))?;
        let now = Utc::now()
            .duration_trunc(self.interval)
            .map_err(|e| TrainingError::Data(format!("invalid timestamp: {}", e)))?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed_for(&[
            tenant_id,
            feature_set,
            asset_id,
            &now.to_rfc3339(),
        ]));
        let values = Self::row_values(feature_set, now, &mut rng, &noise);
        Ok(columns
            .into_iter()
            .zip(values)
            .filter(|(name, _)| name != "target")
            .collect())
    }
}

/// Feature store backed by datasets inserted up front.
#[derive(Debug, Default)]
pub struct InMemoryFeatureStore {
    datasets: RwLock<HashMap<(String, String), Dataset>>,
}

impl InMemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, tenant_id: &str, feature_set: &str, dataset: Dataset) {
        self.datasets
            .write()
            .await
            .insert((tenant_id.to_string(), feature_set.to_string()), dataset);
    }
}

#[async_trait]
impl FeatureStore for InMemoryFeatureStore {
    async fn get_dataset(
        &self,
        tenant_id: &str,
        feature_set: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        asset_ids: Option<&[String]>,
    ) -> Result<Dataset, TrainingError> {
        let datasets = self.datasets.read().await;
        let source = datasets
            .get(&(tenant_id.to_string(), feature_set.to_string()))
            .ok_or_else(|| {
                TrainingError::Data(format!(
                    "feature set '{}' not found for tenant '{}'",
                    feature_set, tenant_id
                ))
            })?;

        let mut dataset = Dataset::new(source.columns.clone());
        dataset.rows = source
            .rows
            .iter()
            .filter(|row| row.timestamp >= start && row.timestamp < end)
            .filter(|row| asset_ids.map_or(true, |ids| ids.contains(&row.asset_id)))
            .cloned()
            .collect();
        Ok(dataset)
    }

    async fn get_online_features(
        &self,
        tenant_id: &str,
        asset_id: &str,
        feature_set: &str,
    ) -> Result<BTreeMap<String, f64>, TrainingError> {
        let datasets = self.datasets.read().await;
        let source = datasets
            .get(&(tenant_id.to_string(), feature_set.to_string()))
            .ok_or_else(|| {
                TrainingError::Data(format!("feature set '{}' not found", feature_set))
            })?;
        let latest = source
            .rows
            .iter()
            .filter(|row| row.asset_id == asset_id)
            .max_by_key(|row| row.timestamp)
            .ok_or_else(|| {
                TrainingError::Data(format!("no features for asset '{}'", asset_id))
            })?;
        Ok(source
            .columns
            .iter()
            .cloned()
            .zip(latest.values.iter().copied())
            .collect())
    }
}

/// Model registry that keeps every version in memory.
#[derive(Debug, Default)]
pub struct InMemoryModelRegistry {
    models: RwLock<BTreeMap<String, (RegisteredModel, Vec<u8>)>>,
}

impl InMemoryModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw artifact bytes of a registered model.
    pub async fn artifact(&self, model_id: &str) -> Option<Vec<u8>> {
        self.models
            .read()
            .await
            .get(model_id)
            .map(|(_, bytes)| bytes.clone())
    }

    pub async fn len(&self) -> usize {
        self.models.read().await.len()
    }
}

#[async_trait]
impl ModelRegistry for InMemoryModelRegistry {
    async fn register(&self, request: RegisterModel) -> Result<RegisteredModel, TrainingError> {
        if request.artifact.is_empty() {
            return Err(TrainingError::External {
                message: "refusing to register an empty artifact".to_string(),
                transient: false,
            });
        }

        let mut models = self.models.write().await;
        let version = models
            .values()
            .filter(|(m, _)| m.tenant_id == request.tenant_id && m.model_name == request.model_name)
            .map(|(m, _)| m.version)
            .max()
            .unwrap_or(0)
            + 1;

        let registered = RegisteredModel {
            model_id: model_id(&request.tenant_id, &request.model_name, version),
            tenant_id: request.tenant_id,
            model_name: request.model_name,
            model_type: request.model_type,
            version,
            checksum: checksum(&request.artifact),
            size_bytes: request.artifact.len(),
            metrics: request.metrics,
            metadata: request.metadata,
            registered_at: Utc::now(),
        };

        info!(
            model_id = %registered.model_id,
            checksum = %registered.checksum,
            "Registered model"
        );
        models.insert(
            registered.model_id.clone(),
            (registered.clone(), request.artifact),
        );
        Ok(registered)
    }

    async fn get(&self, model_id: &str) -> Result<RegisteredModel, TrainingError> {
        self.models
            .read()
            .await
            .get(model_id)
            .map(|(m, _)| m.clone())
            .ok_or_else(|| TrainingError::not_found("model", model_id))
    }

    async fn latest_version(
        &self,
        tenant_id: &str,
        model_name: &str,
    ) -> Result<Option<u32>, TrainingError> {
        Ok(self
            .models
            .read()
            .await
            .values()
            .filter(|(m, _)| m.tenant_id == tenant_id && m.model_name == model_name)
            .map(|(m, _)| m.version)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn range() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_synthetic_dataset_is_deterministic() {
        let store = SyntheticFeatureStore::new();
        let (start, end) = range();
        let a = store.get_dataset("t1", "basic", start, end, None).await.unwrap();
        let b = store.get_dataset("t1", "basic", start, end, None).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 48);
        assert_eq!(a.columns.last().map(String::as_str), Some("target"));

        let other = store.get_dataset("t2", "basic", start, end, None).await.unwrap();
        assert_ne!(a.rows[0].values, other.rows[0].values);
    }

    #[tokio::test]
    async fn test_synthetic_assets_and_cap() {
        let store = SyntheticFeatureStore::new().with_max_rows(60);
        let (start, end) = range();
        let assets = vec!["a".to_string(), "b".to_string()];
        let ds = store
            .get_dataset("t1", "extended", start, end, Some(&assets))
            .await
            .unwrap();
        assert_eq!(ds.len(), 60);
        assert_eq!(ds.columns.len(), 6);
    }

    #[tokio::test]
    async fn test_synthetic_unknown_feature_set() {
        let store = SyntheticFeatureStore::new();
        let (start, end) = range();
        let err = store
            .get_dataset("t1", "missing", start, end, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TrainingError::Data(_)));
    }

    #[tokio::test]
    async fn test_synthetic_online_features_exclude_target() {
        let store = SyntheticFeatureStore::new();
        let features = store
            .get_online_features("t1", "asset-1", "basic")
            .await
            .unwrap();
        assert_eq!(features.len(), 3);
        assert!(!features.contains_key("target"));
    }

    #[tokio::test]
    async fn test_in_memory_feature_store_filters() {
        let store = InMemoryFeatureStore::new();
        let (start, end) = range();
        let mut ds = Dataset::new(vec!["x".into(), "target".into()]);
        for (i, asset) in ["a", "b", "a"].iter().enumerate() {
            ds.push(FeatureRow {
                timestamp: start + Duration::hours(i as i64 * 30),
                asset_id: asset.to_string(),
                values: vec![i as f64, 1.0],
            })
            .unwrap();
        }
        store.insert("t1", "basic", ds).await;

        let all = store.get_dataset("t1", "basic", start, end, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_b = vec!["b".to_string()];
        let b = store
            .get_dataset("t1", "basic", start, end, Some(&only_b))
            .await
            .unwrap();
        assert_eq!(b.len(), 1);

        let latest = store.get_online_features("t1", "a", "basic").await.unwrap();
        assert_eq!(latest["x"], 2.0);

        assert!(store.get_dataset("t2", "basic", start, end, None).await.is_err());
    }

    #[tokio::test]
    async fn test_registry_versions_and_checksums() {
        let registry = InMemoryModelRegistry::new();
        let request = RegisterModel {
            tenant_id: "t1".into(),
            model_name: "load".into(),
            model_type: "forecast".into(),
            artifact: b"weights".to_vec(),
            metrics: Metrics::new(),
            metadata: BTreeMap::new(),
        };

        let first = registry.register(request.clone()).await.unwrap();
        let second = registry.register(request).await.unwrap();
        assert_eq!(first.model_id, "t1:load:v1");
        assert_eq!(second.model_id, "t1:load:v2");
        assert_eq!(first.checksum, checksum(b"weights"));
        assert_eq!(registry.latest_version("t1", "load").await.unwrap(), Some(2));
        assert_eq!(registry.latest_version("t1", "other").await.unwrap(), None);
        assert_eq!(registry.get("t1:load:v1").await.unwrap(), first);
        assert!(registry.get("t1:load:v9").await.is_err());
    }

    #[tokio::test]
    async fn test_registry_rejects_empty_artifact() {
        let registry = InMemoryModelRegistry::new();
        let err = registry
            .register(RegisterModel {
                tenant_id: "t1".into(),
                model_name: "m".into(),
                model_type: "forecast".into(),
                artifact: Vec::new(),
                metrics: Metrics::new(),
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
