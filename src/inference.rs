use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use ndarray::{Array1, ArrayView1};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("failed to read model artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed model artifact: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid model artifact: {0}")]
    InvalidArtifact(String),

    #[error("unsupported model type: {0}")]
    UnsupportedModelType(String),

    #[error("expected {expected} features, got {actual}")]
    FeatureCountMismatch { expected: usize, actual: usize },
}

/// Serialized pre-trained model, exported from the training pipeline
/// as JSON. The service only knows how to apply it, never to fit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model_type: String,
    pub version: String,
    pub feature_names: Vec<String>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl ModelArtifact {
    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.model_type != "linear_regression" {
            return Err(InferenceError::UnsupportedModelType(self.model_type.clone()));
        }
        if self.coefficients.is_empty() {
            return Err(InferenceError::InvalidArtifact(
                "coefficient vector is empty".to_string(),
            ));
        }
        if self.feature_names.len() != self.coefficients.len() {
            return Err(InferenceError::InvalidArtifact(format!(
                "{} feature names for {} coefficients",
                self.feature_names.len(),
                self.coefficients.len()
            )));
        }
        for (i, c) in self.coefficients.iter().enumerate() {
            if !c.is_finite() {
                return Err(InferenceError::InvalidArtifact(format!(
                    "coefficient {} is not finite ({})",
                    i, c
                )));
            }
        }
        if !self.intercept.is_finite() {
            return Err(InferenceError::InvalidArtifact(format!(
                "intercept is not finite ({})",
                self.intercept
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub model_type: String,
    pub version: String,
    pub n_features: usize,
    pub feature_names: Vec<String>,
}

// Process-wide counters, exposed through /stats.
static PREDICTIONS_TOTAL: AtomicU64 = AtomicU64::new(0);
static PREDICTIONS_FAILED: AtomicU64 = AtomicU64::new(0);
static CACHE_HITS: AtomicU64 = AtomicU64::new(0);
static STARTED: Lazy<Instant> = Lazy::new(Instant::now);

/// Anchors the uptime clock; called once from main before serving.
pub fn mark_started() {
    Lazy::force(&STARTED);
}

pub fn uptime_secs() -> u64 {
    STARTED.elapsed().as_secs()
}

#[derive(Debug, Serialize)]
pub struct ServiceStats {
    pub predictions_total: u64,
    pub predictions_failed: u64,
    pub cache_hits: u64,
    pub uptime_secs: u64,
}

pub fn get_stats() -> ServiceStats {
    ServiceStats {
        predictions_total: PREDICTIONS_TOTAL.load(Ordering::Relaxed),
        predictions_failed: PREDICTIONS_FAILED.load(Ordering::Relaxed),
        cache_hits: CACHE_HITS.load(Ordering::Relaxed),
        uptime_secs: uptime_secs(),
    }
}

const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Loaded model plus a cache of past predictions. Inference is a dot
/// product, so the cache exists to absorb clients that hammer the
/// endpoint with identical payloads, not to save compute per se.
/// Growth stops at `cache_capacity`; entries are only reclaimed by
/// `clear_cache`.
#[derive(Debug)]
pub struct ModelInference {
    artifact: ModelArtifact,
    weights: Array1<f64>,
    cache: DashMap<Vec<u64>, f64>,
    cache_capacity: usize,
}

impl ModelInference {
    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, InferenceError> {
        artifact.validate()?;
        let weights = Array1::from_vec(artifact.coefficients.clone());
        Ok(Self {
            artifact,
            weights,
            cache: DashMap::new(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        })
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, InferenceError> {
        let file = File::open(path)?;
        let artifact: ModelArtifact = serde_json::from_reader(BufReader::new(file))?;
        Self::from_artifact(artifact)
    }

    pub fn predict(&self, features: &[f64]) -> Result<f64, InferenceError> {
        PREDICTIONS_TOTAL.fetch_add(1, Ordering::Relaxed);

        if features.len() != self.weights.len() {
            PREDICTIONS_FAILED.fetch_add(1, Ordering::Relaxed);
            return Err(InferenceError::FeatureCountMismatch {
                expected: self.weights.len(),
                actual: features.len(),
            });
        }

        // NaN never round-trips through a key, so key on raw bits.
        let key: Vec<u64> = features.iter().map(|f| f.to_bits()).collect();
        if let Some(hit) = self.cache.get(&key) {
            CACHE_HITS.fetch_add(1, Ordering::Relaxed);
            return Ok(*hit);
        }

        let prediction = ArrayView1::from(features).dot(&self.weights) + self.artifact.intercept;
        if self.cache.len() < self.cache_capacity {
            self.cache.insert(key, prediction);
        }
        Ok(prediction)
    }

    pub fn batch_predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, InferenceError> {
        rows.iter().map(|row| self.predict(row)).collect()
    }

    pub fn clear_cache(&self) -> usize {
        let cleared = self.cache.len();
        self.cache.clear();
        cleared
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            model_type: self.artifact.model_type.clone(),
            version: self.artifact.version.clone(),
            n_features: self.weights.len(),
            feature_names: self.artifact.feature_names.clone(),
        }
    }

    pub fn version(&self) -> &str {
        &self.artifact.version
    }

    pub fn n_features(&self) -> usize {
        self.weights.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn artifact() -> ModelArtifact {
        ModelArtifact {
            model_type: "linear_regression".to_string(),
            version: "1.0.0".to_string(),
            feature_names: vec!["feature1".to_string(), "feature2".to_string()],
            coefficients: vec![2.0, 3.0],
            intercept: 1.0,
        }
    }

    #[test]
    fn predict_is_dot_product_plus_intercept() {
        let model = ModelInference::from_artifact(artifact()).unwrap();
        let y = model.predict(&[1.2, 3.4]).unwrap();
        assert!((y - 13.6).abs() < 1e-9);
    }

    #[test]
    fn predict_rejects_wrong_feature_count() {
        let model = ModelInference::from_artifact(artifact()).unwrap();
        let err = model.predict(&[1.0]).unwrap_err();
        match err {
            InferenceError::FeatureCountMismatch { expected, actual } => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn repeated_inputs_hit_the_cache() {
        let model = ModelInference::from_artifact(artifact()).unwrap();
        let first = model.predict(&[0.5, 0.5]).unwrap();
        let second = model.predict(&[0.5, 0.5]).unwrap();
        assert_eq!(first, second);
        assert_eq!(model.clear_cache(), 1);
        assert_eq!(model.clear_cache(), 0);
    }

    #[test]
    fn cache_stops_growing_at_capacity() {
        let model = ModelInference::from_artifact(artifact())
            .unwrap()
            .with_cache_capacity(1);
        model.predict(&[1.0, 1.0]).unwrap();
        model.predict(&[2.0, 2.0]).unwrap();
        assert_eq!(model.clear_cache(), 1);
    }

    #[test]
    fn batch_predict_preserves_order() {
        let model = ModelInference::from_artifact(artifact()).unwrap();
        let out = model
            .batch_predict(&[vec![0.0, 0.0], vec![1.0, 1.0]])
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!((out[0] - 1.0).abs() < 1e-9);
        assert!((out[1] - 6.0).abs() < 1e-9);
    }

    #[test]
    fn load_reads_a_json_artifact() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        serde_json::to_writer(&mut file, &artifact()).unwrap();
        file.flush().unwrap();

        let model = ModelInference::load(file.path()).unwrap();
        assert_eq!(model.version(), "1.0.0");
        assert_eq!(model.n_features(), 2);
    }

    #[test]
    fn load_fails_for_missing_file() {
        let err = ModelInference::load("/nonexistent/model.json").unwrap_err();
        assert!(matches!(err, InferenceError::Io(_)));
    }

    #[test]
    fn load_fails_for_malformed_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not json").unwrap();
        file.flush().unwrap();

        let err = ModelInference::load(file.path()).unwrap_err();
        assert!(matches!(err, InferenceError::Malformed(_)));
    }

    #[test]
    fn artifact_with_nan_coefficient_is_rejected() {
        let mut bad = artifact();
        bad.coefficients[1] = f64::NAN;
        assert!(matches!(
            ModelInference::from_artifact(bad),
            Err(InferenceError::InvalidArtifact(_))
        ));
    }

    #[test]
    fn artifact_with_mismatched_names_is_rejected() {
        let mut bad = artifact();
        bad.feature_names.pop();
        assert!(matches!(
            ModelInference::from_artifact(bad),
            Err(InferenceError::InvalidArtifact(_))
        ));
    }

    #[test]
    fn unsupported_model_type_is_rejected() {
        let mut bad = artifact();
        bad.model_type = "gradient_boosting".to_string();
        assert!(matches!(
            ModelInference::from_artifact(bad),
            Err(InferenceError::UnsupportedModelType(_))
        ));
    }

    #[test]
    fn empty_coefficients_are_rejected() {
        let mut bad = artifact();
        bad.coefficients.clear();
        bad.feature_names.clear();
        assert!(matches!(
            ModelInference::from_artifact(bad),
            Err(InferenceError::InvalidArtifact(_))
        ));
    }
}
