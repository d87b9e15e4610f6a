//! AQI service core crate.
//!
//! Fetches hourly pollutant observations around a point, merges them into an
//! hourly table, labels the table with a region, derives lag/rolling features
//! and serves a pretrained AQI regressor over HTTP.

mod airnow;
mod artifact;
mod config;
mod features;
mod frame;
mod geo;
mod http;
mod model;
mod observability;
mod pipeline;
mod pollutant;
mod region;
mod server;
mod shapefile;

pub use airnow::{
    aggregate_hourly, build_query_url, fetch_all_pollutants, fetch_pollutant, format_query_hour,
    parse_observations, parse_utc_field, truncate_to_hour, AirNowConfig, AirNowSource, FetchError,
    HourWindow, HourlyPoint, Observation, ObservationQuery, ObservationSource, PollutantSeries,
    AIRNOW_DATA_URL, MAX_WINDOW_HOURS,
};
pub use artifact::{
    artifact_file_name, format_timestamp, ArtifactError, ArtifactStore, FEATURES_PREFIX,
    HOURLY_PREFIX,
};
pub use config::{ConfigError, ServiceConfig, DEFAULT_BIND_ADDR, DEFAULT_MODEL_PATH};
pub use features::{
    build_feature_schema, column_name, engineer_features, lag, mean, median, rolling, sample_std,
    CalendarField, FeatureColumn, FeatureConfig, FeatureError, FeatureKind, FeatureReport,
    FeatureRow, FeatureSchema, FeatureTable, LabeledRow, FEATURE_SCHEMA_VERSION,
};
pub use frame::{
    merge_pollutant_series, HourlyRow, HourlyTable, MergedFrame, MergedRow,
    AGGREGATE_INDEX_COLUMN, REGION_COLUMN, UTC_COLUMN,
};
pub use geo::{
    bbox_from_center_miles, clamp_radius_miles, miles_to_degrees_lat, miles_to_degrees_lon,
    BoundingBox, GeoError, GeoPoint, CONTINENTAL_US_BBOX, DEFAULT_RADIUS_MILES, MAX_RADIUS_MILES,
    MIN_RADIUS_MILES,
};
pub use http::{redact_url, HttpError, HttpFetcher, ReqwestBlockingFetcher};
pub use model::{
    Estimator, ModelDocument, ModelError, ModelInfo, ModelService, PredictError, Tree, TreeNode,
    MAX_BATCH_ROWS,
};
pub use observability::{Lifecycle, LogFormat, LoggingConfig, LoggingInitError};
pub use pipeline::{
    candidate_plan, collect_merged_frame, BboxCandidate, BboxTier, FetchReport, FetchRequest,
    FetchService, PipelineConfig, PipelineError,
};
pub use pollutant::{parse_pollutant, Pollutant, UnknownPollutant, ALL_POLLUTANTS, POLLUTANT_COUNT};
pub use region::{
    resolve_region, CachedRegionLookup, RegionError, RegionLookup, ShapefileRegionConfig,
    ShapefileRegionLookup, StaticRegionLookup, CENSUS_STATES_URL, EXCLUDED_TERRITORIES,
    UNKNOWN_REGION,
};
pub use server::{
    app_router, ApiError, AppState, BatchPredictionResponse, FetchPredictionResponse,
    FetchSummary, PredictionResponse, API_VERSION,
};
pub use shapefile::{locate, read_zipped_shapefile, RegionPolygon, ShapefileError};
