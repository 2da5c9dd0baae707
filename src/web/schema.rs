use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ml::registry::{LoadFailure, ModelSlot};
use crate::ml::{Framework, RawWindow, Tag};

pub const SCALED_NOTE: &str =
    "No output scaler loaded; y_pred is in the model's scaled space";

/// Body of both prediction routes.
///
/// `tag` and `framework` stay as strings so that unknown values are
/// reported as bad requests rather than body rejections.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PredictRequest {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(rename = "X")]
    pub x: RawWindow,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegressionResponse {
    pub tag: Tag,
    pub framework: Framework,
    pub y_pred: f64,
    /// True while `y_pred` has not been inverse-transformed.
    pub scaled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassificationResponse {
    pub tag: Tag,
    pub framework: Framework,
    pub p_up: f64,
    pub label: u8,
    pub threshold: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub models: usize,
    pub neural_runtime: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelSlot>,
    pub scaler_loaded: bool,
    pub failures: Vec<LoadFailure>,
    pub enabled_frameworks: Vec<Framework>,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

/// `1` iff `p_up >= threshold`.
pub fn decide_label(p_up: f64, threshold: f64) -> u8 {
    u8::from(p_up >= threshold)
}
