//! Environment-driven service configuration and capability wiring.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::airnow::{AirNowConfig, AirNowSource, AIRNOW_DATA_URL, MAX_WINDOW_HOURS};
use crate::artifact::ArtifactStore;
use crate::http::{HttpError, HttpFetcher, ReqwestBlockingFetcher};
use crate::pipeline::{FetchService, PipelineConfig};
use crate::region::{CachedRegionLookup, ShapefileRegionConfig, ShapefileRegionLookup};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";
pub const DEFAULT_MODEL_PATH: &str = "models/aqi_model.json";
pub const DEFAULT_OUTPUT_DIR: &str = "user_output";
pub const DEFAULT_REGION_BUCKET_DEG: f64 = 0.01;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {var} value {value:?}: {message}")]
    Invalid {
        var: &'static str,
        value: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub model_path: PathBuf,
    pub airnow: Option<AirNowConfig>,
    pub output_dir: PathBuf,
    pub pipeline: PipelineConfig,
    pub region: ShapefileRegionConfig,
    pub region_bucket_deg: f64,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Empty values count as unset. Unparsable numbers fall back to their
    /// defaults; an unparsable bind address is an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        let bind_raw = get("AQI_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_raw
            .parse::<SocketAddr>()
            .map_err(|err| ConfigError::Invalid {
                var: "AQI_BIND_ADDR",
                value: bind_raw.clone(),
                message: err.to_string(),
            })?;

        let airnow = get("AIRNOW_API_KEY").map(|api_key| {
            let defaults = AirNowConfig::default();
            AirNowConfig {
                base_url: get("AIRNOW_BASE_URL").unwrap_or_else(|| AIRNOW_DATA_URL.to_string()),
                api_key,
                timeout_ms: parse_or(get("AIRNOW_TIMEOUT_MS"), defaults.timeout_ms, |v| *v > 0),
                data_type: defaults.data_type,
            }
        });

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            window_hours: parse_or(get("AQI_WINDOW_HOURS"), defaults.window_hours, |v| {
                (1..=MAX_WINDOW_HOURS).contains(v)
            }),
            fallback_radius_miles: parse_or(
                get("AQI_FALLBACK_RADIUS_MILES"),
                defaults.fallback_radius_miles,
                |v: &f64| v.is_finite() && *v > 0.0,
            ),
            fetch_workers: parse_or(get("AQI_FETCH_WORKERS"), defaults.fetch_workers, |v| *v > 0),
            ..defaults
        };

        let mut region = ShapefileRegionConfig::default();
        if let Some(url) = get("AQI_REGION_SHAPEFILE_URL") {
            region.url = url;
        }

        Ok(Self {
            bind_addr,
            model_path: get("AQI_MODEL_PATH")
                .unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string())
                .into(),
            airnow,
            output_dir: get("AQI_OUTPUT_DIR")
                .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string())
                .into(),
            pipeline,
            region,
            region_bucket_deg: parse_or(
                get("AQI_REGION_BUCKET_DEG"),
                DEFAULT_REGION_BUCKET_DEG,
                |v: &f64| v.is_finite() && *v > 0.0,
            ),
        })
    }

    pub fn fetch_service(&self) -> Result<Option<FetchService>, HttpError> {
        let Some(airnow) = self.airnow.clone() else {
            return Ok(None);
        };

        let http: Arc<dyn HttpFetcher> = Arc::new(ReqwestBlockingFetcher::new(airnow.timeout_ms)?);
        let source = Arc::new(AirNowSource::new(airnow, Arc::clone(&http)));
        let shapes = Arc::new(ShapefileRegionLookup::new(self.region.clone(), http));
        let regions = Arc::new(CachedRegionLookup::new(shapes, self.region_bucket_deg));

        Ok(Some(FetchService::new(
            source,
            regions,
            ArtifactStore::new(&self.output_dir),
            self.pipeline.clone(),
        )))
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T, valid: impl Fn(&T) -> bool) -> T {
    raw.and_then(|raw| raw.parse::<T>().ok())
        .filter(|value| valid(value))
        .unwrap_or(default)
}
