use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use super::error::ApiError;
use super::schema::{
    decide_label, ClassificationResponse, ErrorBody, HealthResponse, ModelsResponse,
    PredictRequest, RegressionResponse, SCALED_NOTE,
};
use crate::config::{Config, ServingConfig};
use crate::error::InferenceError;
use crate::ml::{infer, window, Framework, ModelRegistry, RawWindow, Tag, Task};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub serving: Arc<ServingConfig>,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Clone)]
pub struct ApiServer {
    state: AppState,
    host: String,
    port: u16,
    allowed_origins: Vec<String>,
}

impl ApiServer {
    pub fn new(registry: Arc<ModelRegistry>, config: &Config) -> Self {
        Self {
            state: AppState {
                registry,
                serving: Arc::new(config.serving.clone()),
                metrics: None,
            },
            host: config.server.host.clone(),
            port: config.server.port,
            allowed_origins: config.server.allowed_origins(),
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/models", get(list_models))
            .route("/metrics", get(render_metrics))
            .route("/predict/regression", post(predict_regression))
            .route("/predict/classification", post(predict_classification))
            .layer(TraceLayer::new_for_http())
            .layer(self.cors_layer())
            .with_state(self.state.clone())
    }

    fn cors_layer(&self) -> CorsLayer {
        let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
        if self.allowed_origins.iter().any(|o| o == "*") {
            return cors.allow_origin(Any);
        }

        let origins: Vec<HeaderValue> = self
            .allowed_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin {:?}", origin);
                    None
                }
            })
            .collect();
        cors.allow_origin(AllowOrigin::list(origins))
    }

    pub async fn start<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind((self.host.as_str(), self.port)).await?;
        info!("NVDA forecast API listening on http://{}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("API server stopped");
        Ok(())
    }
}

/// Applies configured defaults and rejects tags or frameworks this
/// deployment does not serve.
fn resolve(serving: &ServingConfig, req: &PredictRequest) -> Result<(Tag, Framework), InferenceError> {
    let tag = match req.tag.as_deref() {
        Some(raw) => raw.parse::<Tag>().map_err(InferenceError::InvalidTag)?,
        None => serving.default_tag,
    };

    let framework = match req.framework.as_deref() {
        Some(raw) => raw
            .parse::<Framework>()
            .map_err(|_| InferenceError::UnsupportedFramework(raw.to_string()))?,
        None => serving.default_framework,
    };

    if !serving.enabled_frameworks.contains(&framework) {
        return Err(InferenceError::UnsupportedFramework(framework.to_string()));
    }

    Ok((tag, framework))
}

async fn run_inference(
    registry: Arc<ModelRegistry>,
    framework: Framework,
    tag: Tag,
    task: Task,
    raw: &RawWindow,
) -> Result<f64, ApiError> {
    let x = window::to_array(raw)?;
    let span = Span::current();
    let started = Instant::now();

    let value = tokio::task::spawn_blocking(move || {
        span.in_scope(|| infer(&registry, framework, tag, task, &x))
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Inference worker failed: {}", e)))??;

    metrics::histogram!(
        "inference_duration_seconds",
        "framework" => framework.as_str(),
        "task" => task.as_str()
    )
    .record(started.elapsed().as_secs_f64());
    metrics::counter!(
        "predictions_total",
        "framework" => framework.as_str(),
        "task" => task.as_str()
    )
    .increment(1);

    Ok(value)
}

fn request_span(tag: Tag, framework: Framework, task: Task) -> Span {
    info_span!(
        "predict",
        request_id = %Uuid::new_v4(),
        tag = %tag,
        framework = %framework,
        task = %task
    )
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let models = state.registry.len();
    let (status, label) = if models > 0 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };

    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            models,
            neural_runtime: state.registry.neural_available(),
        }),
    )
}

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.registry.available(),
        scaler_loaded: state.registry.scaler().is_some(),
        failures: state.registry.failures().to_vec(),
        enabled_frameworks: state.serving.enabled_frameworks.clone(),
        loaded_at: state.registry.loaded_at(),
    })
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                detail: "Metrics recorder is not installed".to_string(),
            }),
        )
            .into_response(),
    }
}

async fn predict_regression(
    State(state): State<AppState>,
    body: Result<Json<PredictRequest>, JsonRejection>,
) -> Result<Json<RegressionResponse>, ApiError> {
    let Json(req) = body?;
    let (tag, framework) = resolve(&state.serving, &req)?;
    serve_regression(state, req, tag, framework)
        .instrument(request_span(tag, framework, Task::Regression))
        .await
}

async fn serve_regression(
    state: AppState,
    req: PredictRequest,
    tag: Tag,
    framework: Framework,
) -> Result<Json<RegressionResponse>, ApiError> {
    let y_scaled = run_inference(state.registry.clone(), framework, tag, Task::Regression, &req.x).await?;
    let (y_pred, scaled) = state.registry.rescale(y_scaled);
    info!(y_pred, scaled, "Regression served");

    Ok(Json(RegressionResponse {
        tag,
        framework,
        y_pred,
        scaled,
        note: scaled.then(|| SCALED_NOTE.to_string()),
    }))
}

async fn predict_classification(
    State(state): State<AppState>,
    body: Result<Json<PredictRequest>, JsonRejection>,
) -> Result<Json<ClassificationResponse>, ApiError> {
    let Json(req) = body?;
    let (tag, framework) = resolve(&state.serving, &req)?;
    serve_classification(state, req, tag, framework)
        .instrument(request_span(tag, framework, Task::Classification))
        .await
}

async fn serve_classification(
    state: AppState,
    req: PredictRequest,
    tag: Tag,
    framework: Framework,
) -> Result<Json<ClassificationResponse>, ApiError> {
    let p_up = run_inference(state.registry.clone(), framework, tag, Task::Classification, &req.x).await?;
    let threshold = state.serving.threshold;
    let label = decide_label(p_up, threshold);
    info!(p_up, label, "Classification served");

    Ok(Json(ClassificationResponse {
        tag,
        framework,
        p_up,
        label,
        threshold,
    }))
}
