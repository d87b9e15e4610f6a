//! CSV spreadsheet artifacts: collision-free names, atomic writes, safe download lookup.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::features::{FeatureRow, FeatureSchema};
use crate::frame::{HourlyTable, REGION_COLUMN, UTC_COLUMN};

pub const HOURLY_PREFIX: &str = "airnow_hourly";
pub const FEATURES_PREFIX: &str = "airnow_features";
pub const ARTIFACT_EXTENSION: &str = "csv";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M";
const NAME_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const UNIQUE_SUFFIX_HEX_LEN: usize = 12;

static NAME_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("csv writer error: {0}")]
    CsvFlush(String),
    #[error("invalid artifact name: {0}")]
    InvalidName(String),
    #[error("only .csv artifacts can be downloaded, got {0}")]
    InvalidExtension(String),
    #[error("artifact not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn write_hourly_table(
        &self,
        table: &HourlyTable,
        region: &str,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, ArtifactError> {
        let mut header = vec![UTC_COLUMN.to_string(), REGION_COLUMN.to_string()];
        header.extend(HourlyTable::column_names().into_iter().skip(1));

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&header)?;
        for row in &table.rows {
            let mut record = vec![format_timestamp(row.utc), region.to_string()];
            record.extend(row.values.iter().map(|v| format_cell(*v)));
            record.push(format_cell(row.aqi));
            writer.write_record(&record)?;
        }

        self.persist(HOURLY_PREFIX, writer, now, table.len())
    }

    pub fn write_feature_row(
        &self,
        schema: &FeatureSchema,
        row: &FeatureRow,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, ArtifactError> {
        let mut header = vec![REGION_COLUMN.to_string(), UTC_COLUMN.to_string()];
        header.extend(schema.columns.iter().map(|c| c.name.clone()));

        let mut record = vec![row.region.clone(), format_timestamp(row.utc)];
        record.extend(row.values.iter().map(|v| format_cell(*v)));

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&header)?;
        writer.write_record(&record)?;

        self.persist(FEATURES_PREFIX, writer, now, 1)
    }

    pub fn resolve_download(&self, filename: &str) -> Result<PathBuf, ArtifactError> {
        let name = filename.trim();
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
            || name.starts_with('.')
        {
            return Err(ArtifactError::InvalidName(filename.to_string()));
        }

        let is_csv = Path::new(name)
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case(ARTIFACT_EXTENSION))
            .unwrap_or(false);
        if !is_csv {
            return Err(ArtifactError::InvalidExtension(filename.to_string()));
        }

        let path = self.root.join(name);
        if !path.is_file() {
            return Err(ArtifactError::NotFound(filename.to_string()));
        }
        Ok(path)
    }

    fn persist(
        &self,
        prefix: &str,
        writer: csv::Writer<Vec<u8>>,
        now: DateTime<Utc>,
        rows: usize,
    ) -> Result<PathBuf, ArtifactError> {
        let bytes = writer
            .into_inner()
            .map_err(|err| ArtifactError::CsvFlush(err.to_string()))?;

        fs::create_dir_all(&self.root)?;
        let path = self.root.join(artifact_file_name(prefix, now));
        write_atomic(&path, &bytes)?;

        info!(
            component = "artifact",
            event = "artifact.write.finish",
            path = %path.display(),
            rows,
            bytes = bytes.len()
        );
        Ok(path)
    }
}

/// `<prefix>_<YYYY-MM-DD_HH-MM-SS>_<unique hex>.csv`; two calls within the
/// same second still differ.
pub fn artifact_file_name(prefix: &str, now: DateTime<Utc>) -> String {
    format!(
        "{prefix}_{}_{}.{ARTIFACT_EXTENSION}",
        now.format(NAME_TIME_FORMAT),
        unique_suffix()
    )
}

fn unique_suffix() -> String {
    let seq = NAME_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut hasher = Sha256::new();
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(seq.to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..UNIQUE_SUFFIX_HEX_LEN].to_string()
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn format_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| ArtifactError::InvalidName(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
