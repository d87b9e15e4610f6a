//! Per-region calendar, lag and rolling-window features with median imputation.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::frame::{HourlyTable, AGGREGATE_INDEX_COLUMN};
use crate::pollutant::{Pollutant, ALL_POLLUTANTS, POLLUTANT_COUNT};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalendarField {
    Year,
    Month,
    Day,
    Hour,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    Calendar(CalendarField),
    Value(Pollutant),
    AggregateIndex,
    AggregateIndexLag(usize),
    ValueLag(Pollutant, usize),
    RollingMean(Pollutant, usize),
    RollingStd(Pollutant, usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub kind: FeatureKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    // Gaps stay `None`; only a name outside the schema is an error.
    pub fn select(
        &self,
        row: &FeatureRow,
        names: &[String],
    ) -> Result<Vec<Option<f64>>, FeatureError> {
        names
            .iter()
            .map(|name| {
                let idx = self
                    .column_index(name)
                    .ok_or_else(|| FeatureError::UnknownColumn(name.clone()))?;
                Ok(row.values.get(idx).copied().flatten())
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub index_lags: Vec<usize>,
    pub value_lags: Vec<usize>,
    pub rolling_windows: Vec<usize>,
    pub monitored: Vec<Pollutant>,
    pub schema_version: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            index_lags: vec![6],
            value_lags: vec![6, 24],
            rolling_windows: vec![3, 6, 12, 24],
            monitored: vec![
                Pollutant::No2,
                Pollutant::Co,
                Pollutant::Ozone,
                Pollutant::So2,
            ],
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledRow {
    pub region: String,
    pub utc: Option<DateTime<Utc>>,
    pub values: [Option<f64>; POLLUTANT_COUNT],
    pub aqi: Option<f64>,
}

impl HourlyTable {
    pub fn labeled(&self, region: &str) -> Vec<LabeledRow> {
        self.rows
            .iter()
            .map(|row| LabeledRow {
                region: region.to_string(),
                utc: Some(row.utc),
                values: row.values,
                aqi: row.aqi,
            })
            .collect()
    }
}

/// `values[i]` belongs to `schema.columns[i]`. A `None` survives imputation
/// only when the whole column was missing within the region group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureRow {
    pub region: String,
    pub utc: DateTime<Utc>,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureReport {
    pub input_rows: u64,
    pub output_rows: u64,
    pub dropped_untimed_rows: u64,
    pub region_groups: u64,
    pub unfilled_cells: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
    pub report: FeatureReport,
}

impl FeatureTable {
    pub fn latest(&self) -> Option<&FeatureRow> {
        self.rows.iter().fold(None, |best: Option<&FeatureRow>, row| match best {
            Some(current) if current.utc > row.utc => Some(current),
            _ => Some(row),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeatureError {
    #[error("invalid feature config: {0}")]
    InvalidConfig(String),
    #[error("unknown feature column: {0}")]
    UnknownColumn(String),
}

pub fn build_feature_schema(cfg: &FeatureConfig) -> FeatureSchema {
    let mut columns = Vec::new();
    let mut push = |kind: FeatureKind| {
        columns.push(FeatureColumn {
            name: column_name(kind),
            kind,
        })
    };

    for field in [
        CalendarField::Year,
        CalendarField::Month,
        CalendarField::Day,
        CalendarField::Hour,
    ] {
        push(FeatureKind::Calendar(field));
    }
    for pollutant in ALL_POLLUTANTS {
        push(FeatureKind::Value(pollutant));
    }
    push(FeatureKind::AggregateIndex);
    for lag in &cfg.index_lags {
        push(FeatureKind::AggregateIndexLag(*lag));
    }
    for pollutant in &cfg.monitored {
        for lag in &cfg.value_lags {
            push(FeatureKind::ValueLag(*pollutant, *lag));
        }
        for window in &cfg.rolling_windows {
            push(FeatureKind::RollingMean(*pollutant, *window));
            push(FeatureKind::RollingStd(*pollutant, *window));
        }
    }

    let fingerprint = schema_fingerprint(cfg, &columns);

    info!(
        component = "features",
        event = "features.schema.built",
        version = cfg.schema_version,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    }
}

pub fn column_name(kind: FeatureKind) -> String {
    match kind {
        FeatureKind::Calendar(CalendarField::Year) => "year".to_string(),
        FeatureKind::Calendar(CalendarField::Month) => "month".to_string(),
        FeatureKind::Calendar(CalendarField::Day) => "day".to_string(),
        FeatureKind::Calendar(CalendarField::Hour) => "hour".to_string(),
        FeatureKind::Value(p) => p.value_column(),
        FeatureKind::AggregateIndex => AGGREGATE_INDEX_COLUMN.to_string(),
        FeatureKind::AggregateIndexLag(n) => format!("{AGGREGATE_INDEX_COLUMN}_lag{n}"),
        FeatureKind::ValueLag(p, n) => format!("{}_lag{n}", p.value_column()),
        FeatureKind::RollingMean(p, w) => format!("{}_rollmean{w}", p.value_column()),
        FeatureKind::RollingStd(p, w) => format!("{}_rollstd{w}", p.value_column()),
    }
}

/// Groups rows by region, derives every schema column per group in time
/// order, drops untimed rows, then fills gaps with the group's column median.
pub fn engineer_features(rows: &[LabeledRow], cfg: &FeatureConfig) -> Result<FeatureTable, FeatureError> {
    validate_config(cfg)?;
    let schema = build_feature_schema(cfg);

    let mut groups: BTreeMap<&str, Vec<&LabeledRow>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.region.as_str()).or_default().push(row);
    }

    let mut report = FeatureReport {
        input_rows: rows.len() as u64,
        output_rows: 0,
        dropped_untimed_rows: 0,
        region_groups: groups.len() as u64,
        unfilled_cells: 0,
    };

    let mut out = Vec::with_capacity(rows.len());
    for (region, mut group) in groups {
        // Untimed rows sort last.
        group.sort_by_key(|row| (row.utc.is_none(), row.utc));
        let mut derived = derive_group(region, &group, &schema);
        report.dropped_untimed_rows += (group.len() - derived.len()) as u64;
        report.unfilled_cells += impute_with_group_median(&mut derived, schema.columns.len());
        out.extend(derived);
    }
    report.output_rows = out.len() as u64;

    info!(
        component = "features",
        event = "features.transform.finish",
        input_rows = report.input_rows,
        output_rows = report.output_rows,
        dropped_untimed_rows = report.dropped_untimed_rows,
        region_groups = report.region_groups,
        unfilled_cells = report.unfilled_cells
    );

    Ok(FeatureTable {
        schema,
        rows: out,
        report,
    })
}

fn derive_group(region: &str, group: &[&LabeledRow], schema: &FeatureSchema) -> Vec<FeatureRow> {
    let aqi: Vec<Option<f64>> = group.iter().map(|row| row.aqi).collect();
    let values: Vec<Vec<Option<f64>>> = ALL_POLLUTANTS
        .iter()
        .map(|p| group.iter().map(|row| row.values[p.index()]).collect())
        .collect();

    let columns: Vec<Vec<Option<f64>>> = schema
        .columns
        .iter()
        .map(|column| match column.kind {
            FeatureKind::Calendar(field) => group
                .iter()
                .map(|row| row.utc.map(|ts| calendar_value(ts, field)))
                .collect(),
            FeatureKind::Value(p) => values[p.index()].clone(),
            FeatureKind::AggregateIndex => aqi.clone(),
            FeatureKind::AggregateIndexLag(n) => lag(&aqi, n),
            FeatureKind::ValueLag(p, n) => lag(&values[p.index()], n),
            FeatureKind::RollingMean(p, w) => rolling(&values[p.index()], w, mean),
            FeatureKind::RollingStd(p, w) => rolling(&values[p.index()], w, sample_std),
        })
        .collect();

    group
        .iter()
        .enumerate()
        .filter_map(|(i, row)| {
            let utc = row.utc?;
            Some(FeatureRow {
                region: region.to_string(),
                utc,
                values: columns.iter().map(|column| column[i]).collect(),
            })
        })
        .collect()
}

fn calendar_value(ts: DateTime<Utc>, field: CalendarField) -> f64 {
    match field {
        CalendarField::Year => f64::from(ts.year()),
        CalendarField::Month => f64::from(ts.month()),
        CalendarField::Day => f64::from(ts.day()),
        CalendarField::Hour => f64::from(ts.hour()),
    }
}

pub fn lag(series: &[Option<f64>], n: usize) -> Vec<Option<f64>> {
    (0..series.len())
        .map(|i| i.checked_sub(n).and_then(|j| series[j]))
        .collect()
}

pub fn rolling(
    series: &[Option<f64>],
    window: usize,
    stat: fn(&[f64]) -> Option<f64>,
) -> Vec<Option<f64>> {
    (0..series.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            let observed: Vec<f64> = series[start..=i].iter().flatten().copied().collect();
            stat(&observed)
        })
        .collect()
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

// Sample standard deviation (n - 1); undefined below two points.
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let sum_sq = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>();
    Some((sum_sq / (values.len() - 1) as f64).sqrt())
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

fn impute_with_group_median(rows: &mut [FeatureRow], column_count: usize) -> u64 {
    let mut unfilled = 0u64;
    for col in 0..column_count {
        let observed: Vec<f64> = rows.iter().filter_map(|row| row.values[col]).collect();
        let fill = median(&observed);
        for row in rows.iter_mut() {
            if row.values[col].is_none() {
                row.values[col] = fill;
                if fill.is_none() {
                    unfilled += 1;
                }
            }
        }
    }
    unfilled
}

fn validate_config(cfg: &FeatureConfig) -> Result<(), FeatureError> {
    if cfg.schema_version != FEATURE_SCHEMA_VERSION {
        return Err(FeatureError::InvalidConfig(format!(
            "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
        )));
    }

    for (label, entries) in [
        ("index_lags", &cfg.index_lags),
        ("value_lags", &cfg.value_lags),
        ("rolling_windows", &cfg.rolling_windows),
    ] {
        let mut seen = HashSet::new();
        for entry in entries {
            if *entry == 0 {
                return Err(FeatureError::InvalidConfig(format!(
                    "{label} entries must be > 0"
                )));
            }
            if !seen.insert(*entry) {
                return Err(FeatureError::InvalidConfig(format!(
                    "{label} entries must be unique"
                )));
            }
        }
    }

    let mut seen = HashSet::new();
    for pollutant in &cfg.monitored {
        if !seen.insert(*pollutant) {
            return Err(FeatureError::InvalidConfig(
                "monitored pollutants must be unique".to_string(),
            ));
        }
    }

    Ok(())
}

fn schema_fingerprint(cfg: &FeatureConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update(format!(
        "index_lags:{:?};value_lags:{:?};rolling_windows:{:?};",
        cfg.index_lags, cfg.value_lags, cfg.rolling_windows
    ));
    hasher.update("monitored:");
    for pollutant in &cfg.monitored {
        hasher.update(pollutant.code());
        hasher.update(",");
    }
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}
