use serde::{Deserialize, Serialize};

/// Input payload for `/predict`.
///
/// The field set is fixed: the serving schema must match the artifact
/// the model was trained with. Deserialization rejects missing or
/// non-numeric fields; `validate` handles what the type system cannot.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PredictionRequest {
    pub feature1: f64,
    pub feature2: f64,
}

impl PredictionRequest {
    pub const NUM_FEATURES: usize = 2;

    /// JSON deserialization accepts any f64 representation; the model
    /// output is garbage for NaN or infinite inputs, so reject them
    /// with a named-field message.
    pub fn validate(&self) -> Result<(), String> {
        let features = [("feature1", self.feature1), ("feature2", self.feature2)];

        for (name, value) in features.iter() {
            if !value.is_finite() {
                return Err(format!("{} must be a finite number (got {})", name, value));
            }
        }

        Ok(())
    }

    pub fn to_array(&self) -> [f64; Self::NUM_FEATURES] {
        [self.feature1, self.feature2]
    }
}

/// Output payload for `/predict`: a single scalar.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct PredictionResponse {
    pub prediction: f64,
}

impl PredictionResponse {
    pub fn new(prediction: f64) -> Self {
        PredictionResponse { prediction }
    }
}

/// Error envelope for every non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub timestamp: String,
}

impl ErrorBody {
    pub fn new(message: &str) -> Self {
        ErrorBody {
            error: message.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub model_version: String,
    pub uptime_secs: u64,
}

/// Response for `/clear-cache`.
#[derive(Debug, Serialize)]
pub struct CacheCleared {
    pub cleared: usize,
}
