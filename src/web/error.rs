use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, warn};

use super::schema::ErrorBody;
use crate::error::InferenceError;

/// Errors surfaced to HTTP clients as `{"detail": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            ApiError::BadRequest(detail) | ApiError::NotFound(detail) | ApiError::Internal(detail) => {
                detail
            }
        }
    }
}

impl From<InferenceError> for ApiError {
    fn from(err: InferenceError) -> Self {
        let detail = err.to_string();
        match err {
            InferenceError::NotFound { .. } => ApiError::NotFound(detail),
            InferenceError::InputShape(_)
            | InferenceError::UnsupportedFramework(_)
            | InferenceError::InvalidTag(_) => ApiError::BadRequest(detail),
            InferenceError::Model(_) => ApiError::Internal(detail),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.detail());
        } else {
            warn!("Request rejected ({}): {}", status.as_u16(), self.detail());
        }
        metrics::counter!("prediction_errors_total", "kind" => self.kind()).increment(1);

        let body = ErrorBody {
            detail: self.detail().to_string(),
        };
        (status, Json(body)).into_response()
    }
}
