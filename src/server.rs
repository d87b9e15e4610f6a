//! HTTP routes: model introspection and prediction, sensor fetch, artifact download.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::artifact::{format_timestamp, ArtifactError};
use crate::features::FeatureError;
use crate::model::{ModelService, PredictError};
use crate::pipeline::{BboxTier, FetchReport, FetchRequest, FetchService, PipelineError};

pub const API_VERSION: &str = "1.0.0";

#[derive(Clone, Default)]
pub struct AppState {
    pub model: Option<Arc<ModelService>>,
    pub fetch: Option<Arc<FetchService>>,
}

impl AppState {
    pub fn new(model: Option<Arc<ModelService>>, fetch: Option<Arc<FetchService>>) -> Self {
        Self { model, fetch }
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/model-info", get(get_model_info))
        .route("/predict", post(post_predict))
        .route("/predict-batch", post(post_predict_batch))
        .route("/fetch-airnow", post(post_fetch_airnow))
        .route("/fetch-and-predict", post(post_fetch_and_predict))
        .route("/download-airnow/{filename}", get(get_download))
        .with_state(state)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn model_not_loaded() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "Model not loaded")
    }

    fn fetch_not_configured() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Sensor fetch is not configured (missing API key)",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(
                component = "server",
                event = "http.request.failed",
                status = self.status.as_u16(),
                detail = %self.detail
            );
        } else {
            warn!(
                component = "server",
                event = "http.request.rejected",
                status = self.status.as_u16(),
                detail = %self.detail
            );
        }
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text())
    }
}

impl From<PredictError> for ApiError {
    fn from(err: PredictError) -> Self {
        let status = match err {
            PredictError::NonFiniteOutput => StatusCode::INTERNAL_SERVER_ERROR,
            PredictError::FeatureCount { .. }
            | PredictError::NonFiniteInput { .. }
            | PredictError::MissingInput { .. }
            | PredictError::EmptyBatch
            | PredictError::BatchTooLarge { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, err.to_string())
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidRequest(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            PipelineError::NoData { .. } => {
                Self::new(StatusCode::NOT_FOUND, "no data for this location")
            }
            PipelineError::Feature(inner) => inner.into(),
            PipelineError::Artifact(inner) => inner.into(),
        }
    }
}

impl From<FeatureError> for ApiError {
    fn from(err: FeatureError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<ArtifactError> for ApiError {
    fn from(err: ArtifactError) -> Self {
        let status = match err {
            ArtifactError::InvalidName(_) | ArtifactError::InvalidExtension(_) => {
                StatusCode::BAD_REQUEST
            }
            ArtifactError::NotFound(_) => StatusCode::NOT_FOUND,
            ArtifactError::Io(_) | ArtifactError::Csv(_) | ArtifactError::CsvFlush(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictBody {
    pub features: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchBody {
    pub batch: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub prediction: f64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPredictionResponse {
    pub predictions: Vec<f64>,
    pub count: usize,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSummary {
    pub status: String,
    pub rows: usize,
    pub file: String,
    pub path: String,
    pub features_file: String,
    pub features_path: String,
    pub region: String,
    pub bbox_tier: BboxTier,
    pub bbox: String,
    pub radius_miles: f64,
    pub window_start: String,
    pub window_end: String,
    pub latest_utc: String,
    pub feature_schema_fingerprint: String,
}

impl From<&FetchReport> for FetchSummary {
    fn from(report: &FetchReport) -> Self {
        let file_name = |path: &std::path::Path| {
            path.file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default()
        };
        Self {
            status: "success".to_string(),
            rows: report.hourly_rows,
            file: file_name(&report.hourly_path),
            path: report.hourly_path.display().to_string(),
            features_file: file_name(&report.features_path),
            features_path: report.features_path.display().to_string(),
            region: report.region.clone(),
            bbox_tier: report.candidate.tier,
            bbox: report.candidate.bbox.to_query_string(),
            radius_miles: report.radius_miles,
            window_start: format_timestamp(report.window.start),
            window_end: format_timestamp(report.window.end),
            latest_utc: format_timestamp(report.latest.utc),
            feature_schema_fingerprint: report.schema.fingerprint.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchPredictionResponse {
    pub prediction: f64,
    pub features: BTreeMap<String, Option<f64>>,
    pub fetch: FetchSummary,
    pub status: String,
}

async fn get_root() -> impl IntoResponse {
    Json(json!({
        "message": "AQI Prediction API",
        "version": API_VERSION,
        "endpoints": {
            "/health": "Health check",
            "/predict": "Single prediction",
            "/predict-batch": "Batch prediction",
            "/model-info": "Model information",
            "/fetch-airnow": "Fetch sensor data around a point and save spreadsheets",
            "/fetch-and-predict": "Fetch sensor data and predict from the latest feature row",
            "/download-airnow/{filename}": "Download a saved spreadsheet",
        }
    }))
}

async fn get_health(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let model = state.model.as_ref().ok_or_else(ApiError::model_not_loaded)?;
    Ok(Json(json!({
        "status": "healthy",
        "model_loaded": true,
        "expected_features": model.expected_features(),
        "fetch_enabled": state.fetch.is_some(),
    })))
}

async fn get_model_info(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let model = state.model.as_ref().ok_or_else(ApiError::model_not_loaded)?;
    Ok(Json(model.info()))
}

async fn post_predict(
    State(state): State<AppState>,
    body: Result<Json<PredictBody>, JsonRejection>,
) -> Result<Json<PredictionResponse>, ApiError> {
    let model = state.model.as_ref().ok_or_else(ApiError::model_not_loaded)?;
    let Json(body) = body?;
    let prediction = model.predict(&body.features)?;

    info!(
        component = "server",
        event = "http.predict.request",
        features = body.features.len(),
        prediction
    );
    Ok(Json(PredictionResponse {
        prediction,
        status: "success".to_string(),
    }))
}

async fn post_predict_batch(
    State(state): State<AppState>,
    body: Result<Json<BatchBody>, JsonRejection>,
) -> Result<Json<BatchPredictionResponse>, ApiError> {
    let model = state.model.as_ref().ok_or_else(ApiError::model_not_loaded)?;
    let Json(body) = body?;
    let predictions = model.predict_batch(&body.batch)?;

    info!(
        component = "server",
        event = "http.predict_batch.request",
        rows = predictions.len()
    );
    Ok(Json(BatchPredictionResponse {
        count: predictions.len(),
        predictions,
        status: "success".to_string(),
    }))
}

async fn post_fetch_airnow(
    State(state): State<AppState>,
    body: Result<Json<FetchRequest>, JsonRejection>,
) -> Result<Json<FetchSummary>, ApiError> {
    let fetch = state.fetch.clone().ok_or_else(ApiError::fetch_not_configured)?;
    let Json(req) = body?;
    let report = run_fetch(fetch, req).await?;

    info!(
        component = "server",
        event = "http.fetch_airnow.request",
        rows = report.hourly_rows,
        region = %report.region
    );
    Ok(Json(FetchSummary::from(&report)))
}

async fn post_fetch_and_predict(
    State(state): State<AppState>,
    body: Result<Json<FetchRequest>, JsonRejection>,
) -> Result<Json<FetchPredictionResponse>, ApiError> {
    let model = state.model.clone().ok_or_else(ApiError::model_not_loaded)?;
    let fetch = state.fetch.clone().ok_or_else(ApiError::fetch_not_configured)?;
    let Json(req) = body?;
    let report = run_fetch(fetch, req).await?;

    let names = model.feature_names();
    let vector = report.schema.select(&report.latest, names)?;
    let prediction = model.predict_with_missing(&vector)?;

    info!(
        component = "server",
        event = "http.fetch_and_predict.request",
        rows = report.hourly_rows,
        region = %report.region,
        missing_features = vector.iter().filter(|v| v.is_none()).count(),
        prediction
    );
    Ok(Json(FetchPredictionResponse {
        prediction,
        features: names.iter().cloned().zip(vector).collect(),
        fetch: FetchSummary::from(&report),
        status: "success".to_string(),
    }))
}

async fn get_download(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let fetch = state.fetch.clone().ok_or_else(ApiError::fetch_not_configured)?;
    let path = fetch.artifacts().resolve_download(&filename)?;

    let bytes = tokio::task::spawn_blocking(move || std::fs::read(path))
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .map_err(|err| ApiError::from(ArtifactError::Io(err)))?;

    info!(
        component = "server",
        event = "http.download.request",
        file = %filename,
        bytes = bytes.len()
    );
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn run_fetch(fetch: Arc<FetchService>, req: FetchRequest) -> Result<FetchReport, ApiError> {
    tokio::task::spawn_blocking(move || fetch.run(&req))
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .map_err(ApiError::from)
}
