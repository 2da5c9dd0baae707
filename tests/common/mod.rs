//! Shared fixtures for integration tests: artifact directories and an
//! in-process router.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

use nvda_forecast::config::Config;
use nvda_forecast::ml::{Framework, ModelRegistry, RegistryLoader, Tag, Task};
use nvda_forecast::web::ApiServer;

/// A temporary model directory laid out with the `nvda` prefix.
pub struct ModelDir {
    pub temp_dir: TempDir,
}

impl ModelDir {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn artifact_path(&self, framework: Framework, tag: Tag, task: Task) -> PathBuf {
        self.path().join(format!(
            "nvda_{}_{}_{}.{}",
            framework.file_token(),
            tag,
            task.file_token(),
            framework.extension()
        ))
    }

    pub fn write(&self, framework: Framework, tag: Tag, task: Task, contents: &str) -> PathBuf {
        let path = self.artifact_path(framework, tag, task);
        fs::write(&path, contents).expect("Failed to write artifact");
        path
    }

    pub fn write_archive(&self, framework: Framework, tag: Tag, task: Task, archive: &Value) -> PathBuf {
        self.write(framework, tag, task, &archive.to_string())
    }

    /// Standard scaler: `y = y_scaled * scale + mean`.
    pub fn write_scaler(&self, mean: f64, scale: f64) {
        let body = json!({ "kind": "standard", "mean": [mean], "scale": [scale] });
        fs::write(self.path().join("y_scaler.json"), body.to_string()).expect("Failed to write scaler");
    }

    pub fn registry(&self) -> Arc<ModelRegistry> {
        Arc::new(RegistryLoader::new(self.path()).load().expect("Failed to load registry"))
    }

    pub fn router(&self) -> Router {
        self.router_with(Config::default())
    }

    pub fn router_with(&self, mut config: Config) -> Router {
        config.models.dir = self.path().to_path_buf();
        ApiServer::new(self.registry(), &config).router()
    }
}

/// LightGBM text model with one split on feature 0: `x0 <= threshold`
/// goes left.
pub fn gbdt_stump(objective: &str, num_features: usize, threshold: f64, left: f64, right: f64) -> String {
    format!(
        "tree\nversion=v3\nnum_class=1\nnum_tree_per_iteration=1\nlabel_index=0\n\
         max_feature_idx={}\nobjective={}\n\n\
         Tree=0\nnum_leaves=2\nnum_cat=0\nsplit_feature=0\nsplit_gain=1\nthreshold={}\n\
         decision_type=2\nleft_child=-1\nright_child=-2\nleaf_value={} {}\nshrinkage=1\n\n\n\
         end of trees\n",
        num_features - 1,
        objective,
        threshold,
        left,
        right
    )
}

fn zero_lstm_weights(inputs: usize) -> Value {
    json!({
        "kernel": vec![vec![0.0; 4]; inputs],
        "recurrent_kernel": [[0.0, 0.0, 0.0, 0.0]],
        "bias": [0.0, 0.0, 0.0, 0.0]
    })
}

fn dense_head(inputs: usize, bias: f64, activation: &str) -> Value {
    json!({
        "class_name": "Dense",
        "config": { "units": 1, "activation": activation },
        "weights": { "kernel": vec![vec![1.0]; inputs], "bias": [bias] }
    })
}

fn archive(features: usize, layers: Vec<Value>) -> Value {
    json!({
        "format": "sequence-archive",
        "version": 1,
        "input_features": features,
        "layers": layers
    })
}

/// LSTM whose hidden state stays at zero, so the head emits `bias` (or
/// `sigmoid(bias)`) for any input.
pub fn lstm_archive(features: usize, bias: f64, activation: &str) -> Value {
    archive(
        features,
        vec![
            json!({ "class_name": "Masking", "config": { "mask_value": 0.0 } }),
            json!({
                "class_name": "LSTM",
                "config": { "units": 1 },
                "weights": zero_lstm_weights(features)
            }),
            json!({ "class_name": "Dropout", "config": { "rate": 0.2 } }),
            dense_head(1, bias, activation),
        ],
    )
}

/// Bidirectional LSTM followed by `SoftAttention`; constant output like
/// [`lstm_archive`].
pub fn bilstm_archive(features: usize, bias: f64, activation: &str) -> Value {
    archive(
        features,
        vec![
            json!({
                "class_name": "Bidirectional",
                "config": { "layer": { "units": 1, "return_sequences": true }, "merge_mode": "concat" },
                "weights": {
                    "forward": zero_lstm_weights(features),
                    "backward": zero_lstm_weights(features)
                }
            }),
            json!({
                "class_name": "SoftAttention",
                "config": { "version": 1 },
                "weights": { "W": [[0.0], [0.0]], "b": [0.0] }
            }),
            dense_head(2, bias, activation),
        ],
    )
}

pub async fn get(router: Router, uri: &str) -> (StatusCode, Value) {
    send(router, Request::builder().method(Method::GET).uri(uri).body(Body::empty()).unwrap()).await
}

pub async fn post_json(router: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    post_raw(router, uri, &body.to_string()).await
}

pub async fn post_raw(router: Router, uri: &str, body: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(router, request).await
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}
