//! Sequence-family serving through the recurrent runtime.

#![cfg(feature = "neural")]

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{bilstm_archive, get, lstm_archive, post_json, ModelDir};
use nvda_forecast::ml::{Framework, RegistryLoader, Tag, Task};

fn sequence_models() -> ModelDir {
    let dir = ModelDir::new();
    dir.write_archive(Framework::Lstm, Tag::B, Task::Regression, &lstm_archive(3, 0.25, "linear"));
    dir.write_archive(Framework::Lstm, Tag::B, Task::Classification, &lstm_archive(3, 0.0, "sigmoid"));
    dir.write_archive(Framework::Bilstm, Tag::A, Task::Regression, &bilstm_archive(3, 0.75, "linear"));
    dir.write_archive(
        Framework::Bilstm,
        Tag::A,
        Task::Classification,
        &bilstm_archive(3, 0.0, "sigmoid"),
    );
    dir
}

#[tokio::test]
async fn health_reports_the_runtime() {
    let dir = sequence_models();
    let (status, body) = get(dir.router(), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["models"], 4);
    assert_eq!(body["neural_runtime"], true);
}

#[tokio::test]
async fn lstm_regression_over_a_window() {
    let dir = sequence_models();
    let (status, body) = post_json(
        dir.router(),
        "/predict/regression",
        json!({ "framework": "lstm", "X": [[1, 2, 3], [4, 5, 6], [0, 0, 0]] }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["framework"], "lstm");
    assert_eq!(body["y_pred"], 0.25);
    assert_eq!(body["scaled"], true);
}

#[tokio::test]
async fn sequence_path_accepts_a_single_step() {
    let dir = sequence_models();
    let (status, body) = post_json(
        dir.router(),
        "/predict/regression",
        json!({ "framework": "lstm", "X": [1, 2, 3] }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["y_pred"], 0.25);
}

#[tokio::test]
async fn bilstm_with_attention_serves_both_tasks() {
    let dir = sequence_models();
    dir.write_scaler(100.0, 4.0);

    let (status, body) = post_json(
        dir.router(),
        "/predict/regression",
        json!({ "tag": "A", "framework": "bilstm", "X": [[1, 2, 3], [4, 5, 6]] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["y_pred"], 103.0);
    assert_eq!(body["scaled"], false);

    let (status, body) = post_json(
        dir.router(),
        "/predict/classification",
        json!({ "tag": "A", "framework": "bilstm", "X": [[1, 2, 3], [4, 5, 6]] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["p_up"], 0.5);
    assert_eq!(body["label"], 1);
}

#[tokio::test]
async fn feature_count_mismatch_is_a_bad_request() {
    let dir = sequence_models();
    let (status, body) = post_json(
        dir.router(),
        "/predict/regression",
        json!({ "framework": "lstm", "X": [[1, 2], [3, 4]] }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("Expected 3 input features"));
}

#[test]
fn attention_is_only_known_to_the_bilstm_family() {
    let dir = ModelDir::new();
    // an attention archive saved under the plain LSTM name cannot be rebuilt
    let misplaced = dir.write_archive(
        Framework::Lstm,
        Tag::Aff,
        Task::Regression,
        &bilstm_archive(2, 0.0, "linear"),
    );

    let registry = RegistryLoader::new(dir.path()).load().unwrap();

    assert!(registry.is_empty());
    assert_eq!(registry.failures()[0].path, misplaced);
    assert!(registry.failures()[0].reason.contains("SoftAttention"));
}
