use std::path::Path;
use std::sync::Arc;

use aqi_service::{
    app_router, build_feature_schema, AppState, ArtifactStore, BoundingBox, Estimator, FetchError,
    FetchService, FeatureConfig, ModelDocument, ModelService, ObservationQuery, ObservationSource,
    PipelineConfig, Pollutant, StaticRegionLookup,
};
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use chrono::Duration;
use regex::Regex;
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use tower::util::ServiceExt;

const SCHEMA_FEATURES: [&str; 11] = [
    "year",
    "month",
    "day",
    "hour",
    "value_pm10",
    "value_no2",
    "value_co",
    "value_so2",
    "value_ozone",
    "value_pm25",
    "aqi_lag6",
];

fn linear_model(names: &[&str]) -> Arc<ModelService> {
    let mut coefficients = vec![0.0; names.len()];
    coefficients[names.len() - 1] = 1.0;
    Arc::new(
        ModelService::from_document(ModelDocument {
            model_type: "Linear Regressor".to_string(),
            feature_names: names.iter().map(|n| n.to_string()).collect(),
            estimator: Estimator::Linear {
                intercept: 2.0,
                coefficients,
            },
        })
        .unwrap(),
    )
}

struct WindowSource {
    hours: i64,
    silent: Option<Pollutant>,
}

impl ObservationSource for WindowSource {
    fn fetch(&self, query: &ObservationQuery) -> Result<Vec<u8>, FetchError> {
        if self.silent == Some(query.pollutant) {
            return Ok(b"[]".to_vec());
        }
        let rows: Vec<Value> = (0..self.hours)
            .map(|i| {
                let ts = query.window.end - Duration::hours(self.hours - 1 - i);
                json!({
                    "UTC": ts.format("%Y-%m-%dT%H:%M").to_string(),
                    "Value": 10 + i,
                    "AQI": 30 + i,
                })
            })
            .collect();
        Ok(serde_json::to_vec(&rows).unwrap())
    }
}

fn fetch_service(source: WindowSource, out: &Path) -> Arc<FetchService> {
    Arc::new(FetchService::new(
        Arc::new(source),
        Arc::new(StaticRegionLookup::new().with(
            "California",
            BoundingBox {
                lon_min: -124.5,
                lat_min: 32.5,
                lon_max: -114.1,
                lat_max: 42.0,
            },
        )),
        ArtifactStore::new(out),
        PipelineConfig::default(),
    ))
}

fn app(model: Option<Arc<ModelService>>, fetch_hours: Option<i64>) -> (Router, TempDir) {
    let dir = tempdir().unwrap();
    let fetch = fetch_hours.map(|hours| {
        fetch_service(
            WindowSource {
                hours,
                silent: None,
            },
            dir.path(),
        )
    });
    (app_router(AppState::new(model, fetch)), dir)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send_json(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, method, uri, body).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn root_lists_endpoints() {
    let (app, _dir) = app(None, None);
    let (status, body) = send_json(&app, "GET", "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "AQI Prediction API");
    assert!(body["endpoints"]["/predict"].is_string());
}

#[tokio::test]
async fn model_routes_are_unavailable_without_a_model() {
    let (app, _dir) = app(None, None);
    for (method, uri, body) in [
        ("GET", "/health", None),
        ("GET", "/model-info", None),
        ("POST", "/predict", Some(json!({"features": [1.0]}))),
    ] {
        let (status, body) = send_json(&app, method, uri, body).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{uri}");
        assert_eq!(body["detail"], "Model not loaded");
    }
}

#[tokio::test]
async fn health_and_model_info() {
    let (app, _dir) = app(Some(linear_model(&SCHEMA_FEATURES)), None);
    let (status, body) = send_json(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["model_loaded"], true);
    assert_eq!(body["fetch_enabled"], false);

    let (status, body) = send_json(&app, "GET", "/model-info", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["expected_features"], 11);
    assert_eq!(body["feature_names"][10], "aqi_lag6");
}

#[tokio::test]
async fn predict_validates_length_and_returns_prediction() {
    let (app, _dir) = app(Some(linear_model(&SCHEMA_FEATURES)), None);

    let (status, body) =
        send_json(&app, "POST", "/predict", Some(json!({"features": [1.0, 2.0, 3.0]}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["detail"], "Expected 11 features, got 3");

    let mut features = vec![0.0; 11];
    features[10] = 40.0;
    let (status, body) = send_json(&app, "POST", "/predict", Some(json!({ "features": features }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["prediction"], 42.0);
    assert_eq!(body["status"], "success");
}

#[tokio::test]
async fn predict_rejects_malformed_body() {
    let (app, _dir) = app(Some(linear_model(&SCHEMA_FEATURES)), None);
    let (status, body) =
        send_json(&app, "POST", "/predict", Some(json!({"features": "many"}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn predict_batch_counts_and_bounds() {
    let (app, _dir) = app(Some(linear_model(&SCHEMA_FEATURES)), None);

    let (status, body) = send_json(
        &app,
        "POST",
        "/predict-batch",
        Some(json!({"batch": [vec![1.0; 11], vec![-50.0; 11]]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["predictions"], json!([3.0, 0.0]));

    let (status, body) =
        send_json(&app, "POST", "/predict-batch", Some(json!({"batch": []}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["detail"], "Batch cannot be empty");

    let (status, body) = send_json(
        &app,
        "POST",
        "/predict-batch",
        Some(json!({"batch": [vec![1.0; 11], vec![1.0; 2]]})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["detail"], "Row 1: Expected 11 features, got 2");
}

#[tokio::test]
async fn fetch_routes_are_unavailable_without_api_key() {
    let (app, _dir) = app(Some(linear_model(&SCHEMA_FEATURES)), None);
    let (status, _) = send_json(
        &app,
        "POST",
        "/fetch-airnow",
        Some(json!({"latitude": 36.7783, "longitude": -119.4179})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn fetch_with_no_data_anywhere_is_not_found() {
    let (app, _dir) = app(None, Some(0));
    let (status, body) = send_json(
        &app,
        "POST",
        "/fetch-airnow",
        Some(json!({"latitude": 36.7783, "longitude": -119.4179, "radius_miles": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"], "no data for this location");
}

#[tokio::test]
async fn fetch_rejects_bad_coordinates() {
    let (app, _dir) = app(None, Some(3));
    let (status, body) = send_json(
        &app,
        "POST",
        "/fetch-airnow",
        Some(json!({"latitude": 36.7783, "longitude": -190.0})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["detail"].as_str().unwrap().contains("longitude"));
}

#[tokio::test]
async fn fetch_saves_spreadsheet_that_can_be_downloaded() {
    let (app, _dir) = app(None, Some(10));
    let (status, body) = send_json(
        &app,
        "POST",
        "/fetch-airnow",
        Some(json!({"latitude": 36.7783, "longitude": -119.4179})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rows"], 10);
    assert_eq!(body["region"], "California");
    assert_eq!(body["bbox_tier"], "requested");
    assert_eq!(body["radius_miles"], 10.0);
    assert_eq!(body["feature_schema_fingerprint"].as_str().unwrap().len(), 64);

    let file = body["file"].as_str().unwrap();
    let pattern =
        Regex::new(r"^airnow_hourly_\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2}_[0-9a-f]{12}\.csv$").unwrap();
    assert!(pattern.is_match(file), "{file}");
    assert!(body["features_file"]
        .as_str()
        .unwrap()
        .starts_with("airnow_features_"));

    let (status, bytes) = send(&app, "GET", &format!("/download-airnow/{file}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.starts_with("utc,region,value_no2"));
    assert_eq!(text.lines().count(), 11);
}

#[tokio::test]
async fn download_rejects_other_extensions_and_missing_files() {
    let (app, _dir) = app(None, Some(1));
    let (status, _) = send_json(&app, "GET", "/download-airnow/report.xlsx", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, body) = send_json(&app, "GET", "/download-airnow/missing.csv", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["detail"].as_str().unwrap().contains("missing.csv"));
}

#[tokio::test]
async fn fetch_and_predict_selects_model_features_by_name() {
    let (app, _dir) = app(Some(linear_model(&SCHEMA_FEATURES)), Some(12));
    let (status, body) = send_json(
        &app,
        "POST",
        "/fetch-and-predict",
        Some(json!({"latitude": 36.7783, "longitude": -119.4179, "radius_miles": 15})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    // Hour 11 of 12 has lag-6 index 30 + 5; the model is 2 + aqi_lag6.
    assert_eq!(body["features"]["aqi_lag6"], 35.0);
    assert_eq!(body["prediction"], 37.0);
    assert_eq!(body["fetch"]["rows"], 12);
    assert!(body["fetch"]["path"].as_str().unwrap().ends_with(".csv"));
}

#[tokio::test]
async fn fetch_and_predict_with_foreign_feature_names_is_a_server_error() {
    let (app, _dir) = app(Some(linear_model(&["City_encoded", "Year"])), Some(12));
    let (status, body) = send_json(
        &app,
        "POST",
        "/fetch-and-predict",
        Some(json!({"latitude": 36.7783, "longitude": -119.4179})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["detail"].as_str().unwrap().contains("City_encoded"));
}

#[tokio::test]
async fn fetch_and_predict_scores_through_a_missing_pollutant() {
    let dir = tempdir().unwrap();
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("models/aqi_model.json");
    let model = Arc::new(ModelService::load(&path).unwrap());
    let fetch = fetch_service(
        WindowSource {
            hours: 12,
            silent: Some(Pollutant::Pm10),
        },
        dir.path(),
    );
    let app = app_router(AppState::new(Some(model), Some(fetch)));

    let (status, body) = send_json(
        &app,
        "POST",
        "/fetch-and-predict",
        Some(json!({"latitude": 36.7783, "longitude": -119.4179})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(body["features"]["value_pm10"].is_null());
    assert_eq!(body["features"]["value_pm25"], 21.0);
    // 42 base; pm2.5 above 12 (+3.2); pm10 gap takes the left branch (-0.8);
    // the hour split adds 4.4 before noon UTC and 9.8 after.
    let prediction = body["prediction"].as_f64().unwrap();
    assert!(
        (prediction - 48.8).abs() < 1e-9 || (prediction - 54.2).abs() < 1e-9,
        "{prediction}"
    );
}

#[tokio::test]
async fn predict_still_requires_every_feature() {
    let (app, _dir) = app(Some(linear_model(&SCHEMA_FEATURES)), None);
    let mut features = vec![json!(1.0); 11];
    features[4] = Value::Null;
    let (status, _) = send_json(&app, "POST", "/predict", Some(json!({ "features": features }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[test]
fn shipped_model_matches_the_feature_schema() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("models/aqi_model.json");
    let model = ModelService::load(&path).unwrap();
    assert_eq!(model.expected_features(), 11);

    let schema = build_feature_schema(&FeatureConfig::default());
    for name in model.feature_names() {
        assert!(schema.column_index(name).is_some(), "{name}");
    }
    let prediction = model.predict(&[2025.0, 10.0, 4.0, 14.0, 20.0, 8.0, 0.3, 1.0, 0.03, 9.0, 35.0]).unwrap();
    assert!(prediction >= 0.0);
}
