//! Outer join of per-pollutant series on timestamp, and the aggregate-index table built from it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::airnow::PollutantSeries;
use crate::pollutant::{ALL_POLLUTANTS, POLLUTANT_COUNT};

pub const UTC_COLUMN: &str = "utc";
pub const REGION_COLUMN: &str = "region";
pub const AGGREGATE_INDEX_COLUMN: &str = "aqi";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedRow {
    pub utc: DateTime<Utc>,
    pub values: [Option<f64>; POLLUTANT_COUNT],
    pub indices: [Option<f64>; POLLUTANT_COUNT],
}

impl MergedRow {
    fn blank(utc: DateTime<Utc>) -> Self {
        Self {
            utc,
            values: [None; POLLUTANT_COUNT],
            indices: [None; POLLUTANT_COUNT],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergedFrame {
    pub rows: Vec<MergedRow>,
}

impl MergedFrame {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn column_names() -> Vec<String> {
        let mut columns = vec![UTC_COLUMN.to_string()];
        columns.extend(ALL_POLLUTANTS.iter().map(|p| p.value_column()));
        columns.extend(ALL_POLLUTANTS.iter().map(|p| p.index_column()));
        columns
    }

    /// Row-wise max of the per-pollutant indices becomes `aqi`; the
    /// per-pollutant indices are dropped. Deduplicated by timestamp
    /// (first wins) and sorted ascending.
    pub fn into_hourly_table(self) -> HourlyTable {
        let mut seen: BTreeMap<DateTime<Utc>, HourlyRow> = BTreeMap::new();
        for row in self.rows {
            let aqi = row
                .indices
                .iter()
                .flatten()
                .copied()
                .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |m| m.max(v))));
            seen.entry(row.utc).or_insert(HourlyRow {
                utc: row.utc,
                values: row.values,
                aqi,
            });
        }

        HourlyTable {
            rows: seen.into_values().collect(),
        }
    }
}

pub fn merge_pollutant_series(series: &[PollutantSeries]) -> MergedFrame {
    let mut by_ts: BTreeMap<DateTime<Utc>, MergedRow> = BTreeMap::new();

    for s in series {
        let slot = s.pollutant.index();
        for point in &s.points {
            let row = by_ts
                .entry(point.utc)
                .or_insert_with(|| MergedRow::blank(point.utc));
            row.values[slot] = point.value;
            row.indices[slot] = point.index;
        }
    }

    MergedFrame {
        rows: by_ts.into_values().collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyRow {
    pub utc: DateTime<Utc>,
    pub values: [Option<f64>; POLLUTANT_COUNT],
    pub aqi: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HourlyTable {
    pub rows: Vec<HourlyRow>,
}

impl HourlyTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn column_names() -> Vec<String> {
        let mut columns = vec![UTC_COLUMN.to_string()];
        columns.extend(ALL_POLLUTANTS.iter().map(|p| p.value_column()));
        columns.push(AGGREGATE_INDEX_COLUMN.to_string());
        columns
    }
}
