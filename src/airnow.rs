//! Per-pollutant sensor observations: query, normalize, window-filter, aggregate per hour.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Timelike, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::geo::BoundingBox;
use crate::http::{HttpError, HttpFetcher};
use crate::pollutant::{parse_pollutant, Pollutant, ALL_POLLUTANTS};

pub const AIRNOW_DATA_URL: &str = "https://www.airnowapi.org/aq/data/";
pub const MAX_WINDOW_HOURS: u32 = 24 * 366;

// AirNow reports missing readings as -999.
const MISSING_SENTINEL: f64 = -999.0;

const UTC_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AirNowConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
    pub data_type: String,
}

impl Default for AirNowConfig {
    fn default() -> Self {
        Self {
            base_url: AIRNOW_DATA_URL.to_string(),
            api_key: String::new(),
            timeout_ms: 30_000,
            data_type: "B".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl HourWindow {
    pub fn trailing(now: DateTime<Utc>, hours: u32) -> Self {
        let end = truncate_to_hour(now) - ChronoDuration::hours(1);
        let start = end - ChronoDuration::hours(i64::from(hours.min(MAX_WINDOW_HOURS)));
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationQuery {
    pub pollutant: Pollutant,
    pub bbox: BoundingBox,
    pub window: HourWindow,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("invalid sensor endpoint URL {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("malformed sensor response body: {0}")]
    MalformedBody(String),
}

pub trait ObservationSource: Send + Sync {
    fn fetch(&self, query: &ObservationQuery) -> Result<Vec<u8>, FetchError>;
}

pub struct AirNowSource {
    cfg: AirNowConfig,
    http: Arc<dyn HttpFetcher>,
}

impl AirNowSource {
    pub fn new(cfg: AirNowConfig, http: Arc<dyn HttpFetcher>) -> Self {
        Self { cfg, http }
    }
}

impl ObservationSource for AirNowSource {
    fn fetch(&self, query: &ObservationQuery) -> Result<Vec<u8>, FetchError> {
        let url = build_query_url(&self.cfg, query)?;
        Ok(self.http.get_bytes(&url)?)
    }
}

pub fn build_query_url(cfg: &AirNowConfig, query: &ObservationQuery) -> Result<Url, FetchError> {
    let params = [
        ("BBOX", query.bbox.to_query_string()),
        ("dataType", cfg.data_type.clone()),
        ("format", "application/json".to_string()),
        ("API_KEY", cfg.api_key.clone()),
        ("parameters", query.pollutant.code().to_string()),
        ("startDate", format_query_hour(query.window.start)),
        ("endDate", format_query_hour(query.window.end)),
    ];
    Url::parse_with_params(&cfg.base_url, &params).map_err(|err| FetchError::InvalidUrl {
        url: cfg.base_url.clone(),
        message: err.to_string(),
    })
}

pub fn format_query_hour(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H").to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub utc: Option<DateTime<Utc>>,
    pub pollutant: Pollutant,
    pub value: Option<f64>,
    pub index: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HourlyPoint {
    pub utc: DateTime<Utc>,
    pub value: Option<f64>,
    pub index: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollutantSeries {
    pub pollutant: Pollutant,
    pub points: Vec<HourlyPoint>,
}

impl PollutantSeries {
    pub fn empty(pollutant: Pollutant) -> Self {
        Self {
            pollutant,
            points: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RawObservation {
    #[serde(rename = "UTC")]
    utc: Option<String>,
    #[serde(rename = "DateObserved")]
    date_observed: Option<String>,
    #[serde(rename = "HourObserved")]
    hour_observed: Option<Value>,
    #[serde(rename = "Value")]
    value: Option<Value>,
    #[serde(rename = "AQI")]
    aqi: Option<Value>,
    #[serde(rename = "Parameter")]
    parameter: Option<String>,
}

pub fn parse_observations(pollutant: Pollutant, body: &[u8]) -> Result<Vec<Observation>, FetchError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let parsed: Value =
        serde_json::from_slice(body).map_err(|err| FetchError::MalformedBody(err.to_string()))?;
    let items = match parsed {
        Value::Array(items) => items,
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(FetchError::MalformedBody(format!(
                "expected a JSON array, got {}",
                json_kind(&other)
            )))
        }
    };

    let mut out = Vec::with_capacity(items.len());
    let mut skipped = 0usize;
    let mut foreign = 0usize;
    for item in items {
        match serde_json::from_value::<RawObservation>(item) {
            Ok(raw) if !labelled_as(&raw, pollutant) => foreign += 1,
            Ok(raw) => out.push(normalize_observation(pollutant, raw)),
            Err(_) => skipped += 1,
        }
    }

    if foreign > 0 {
        debug!(
            component = "airnow",
            event = "airnow.parse.rows_foreign",
            pollutant = pollutant.code(),
            foreign
        );
    }

    if skipped > 0 {
        debug!(
            component = "airnow",
            event = "airnow.parse.rows_skipped",
            pollutant = pollutant.code(),
            skipped
        );
    }

    Ok(out)
}

fn normalize_observation(pollutant: Pollutant, raw: RawObservation) -> Observation {
    let utc = match raw.utc.as_deref() {
        Some(text) => parse_utc_field(text),
        None => match (raw.date_observed.as_deref(), raw.hour_observed.as_ref()) {
            (Some(date), Some(hour)) => parse_date_and_hour(date, hour),
            _ => None,
        },
    };

    Observation {
        utc: utc.map(truncate_to_hour),
        pollutant,
        value: raw.value.as_ref().and_then(reading),
        index: raw.aqi.as_ref().and_then(reading),
    }
}

// Rows without a Parameter label are taken as the queried pollutant. A label
// that names another pollutant, or none we monitor, drops the row.
fn labelled_as(raw: &RawObservation, pollutant: Pollutant) -> bool {
    match raw.parameter.as_deref() {
        None => true,
        Some(label) => parse_pollutant(label) == Ok(pollutant),
    }
}

pub fn parse_utc_field(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    UTC_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn parse_date_and_hour(date: &str, hour: &Value) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok()?;
    let hour = match hour {
        Value::Number(n) => n.as_u64().and_then(|h| u32::try_from(h).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }?;
    date.and_hms_opt(hour, 0, 0).map(|naive| naive.and_utc())
}

pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

fn reading(value: &Value) -> Option<f64> {
    json_number(value).filter(|v| *v > MISSING_SENTINEL)
}

fn json_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn aggregate_hourly(
    pollutant: Pollutant,
    observations: &[Observation],
    window: &HourWindow,
) -> PollutantSeries {
    #[derive(Default)]
    struct Bucket {
        value_sum: f64,
        value_count: u32,
        max_index: Option<f64>,
    }

    let mut buckets: BTreeMap<DateTime<Utc>, Bucket> = BTreeMap::new();
    for obs in observations {
        let Some(utc) = obs.utc else {
            continue;
        };
        if !window.contains(utc) {
            continue;
        }

        let bucket = buckets.entry(utc).or_default();
        if let Some(value) = obs.value {
            bucket.value_sum += value;
            bucket.value_count += 1;
        }
        if let Some(index) = obs.index {
            bucket.max_index = Some(bucket.max_index.map_or(index, |m| m.max(index)));
        }
    }

    let points = buckets
        .into_iter()
        .map(|(utc, bucket)| HourlyPoint {
            utc,
            value: (bucket.value_count > 0).then(|| bucket.value_sum / f64::from(bucket.value_count)),
            index: bucket.max_index,
        })
        .collect();

    PollutantSeries { pollutant, points }
}

/// Never fails: any transport, status or body problem yields an empty series
/// for this pollutant only.
pub fn fetch_pollutant(source: &dyn ObservationSource, query: &ObservationQuery) -> PollutantSeries {
    let pollutant = query.pollutant;
    let body = match source.fetch(query) {
        Ok(body) => body,
        Err(err) => {
            warn!(
                component = "airnow",
                event = "airnow.fetch.degraded",
                pollutant = pollutant.code(),
                bbox = %query.bbox.to_query_string(),
                reason = %err
            );
            return PollutantSeries::empty(pollutant);
        }
    };

    let observations = match parse_observations(pollutant, &body) {
        Ok(observations) => observations,
        Err(err) => {
            warn!(
                component = "airnow",
                event = "airnow.fetch.degraded",
                pollutant = pollutant.code(),
                bbox = %query.bbox.to_query_string(),
                reason = %err
            );
            return PollutantSeries::empty(pollutant);
        }
    };

    let series = aggregate_hourly(pollutant, &observations, &query.window);
    info!(
        component = "airnow",
        event = "airnow.fetch.finish",
        pollutant = pollutant.code(),
        raw_rows = observations.len(),
        hourly_rows = series.points.len()
    );
    series
}

/// Queries every pollutant for one bbox using at most `workers` threads.
/// Output order follows the pollutant enumeration regardless of completion order.
pub fn fetch_all_pollutants(
    source: &dyn ObservationSource,
    bbox: &BoundingBox,
    window: &HourWindow,
    workers: usize,
) -> Vec<PollutantSeries> {
    let queries: Vec<ObservationQuery> = ALL_POLLUTANTS
        .iter()
        .map(|pollutant| ObservationQuery {
            pollutant: *pollutant,
            bbox: *bbox,
            window: *window,
        })
        .collect();

    let workers = workers.clamp(1, queries.len());
    if workers == 1 {
        return queries
            .iter()
            .map(|query| fetch_pollutant(source, query))
            .collect();
    }

    let mut slots: Vec<Option<PollutantSeries>> = vec![None; queries.len()];
    thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let queries = &queries;
                scope.spawn(move || {
                    queries
                        .iter()
                        .enumerate()
                        .skip(worker)
                        .step_by(workers)
                        .map(|(idx, query)| (idx, fetch_pollutant(source, query)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for handle in handles {
            match handle.join() {
                Ok(results) => {
                    for (idx, series) in results {
                        slots[idx] = Some(series);
                    }
                }
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
    });

    slots
        .into_iter()
        .zip(queries.iter())
        .map(|(slot, query)| slot.unwrap_or_else(|| PollutantSeries::empty(query.pollutant)))
        .collect()
}
