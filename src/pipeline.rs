//! Bounding-box fallback tiers and the end-to-end fetch service.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::airnow::{fetch_all_pollutants, HourWindow, ObservationSource};
use crate::artifact::{ArtifactError, ArtifactStore};
use crate::features::{engineer_features, FeatureConfig, FeatureError, FeatureRow, FeatureSchema};
use crate::frame::{merge_pollutant_series, MergedFrame};
use crate::geo::{
    bbox_from_center_miles, clamp_radius_miles, BoundingBox, GeoError, GeoPoint, CONTINENTAL_US_BBOX,
};
use crate::region::{resolve_region, RegionLookup};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub window_hours: u32,
    pub fallback_radius_miles: f64,
    pub fetch_workers: usize,
    pub continental_bbox: BoundingBox,
    pub features: FeatureConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            fallback_radius_miles: 25.0,
            fetch_workers: 6,
            continental_bbox: CONTINENTAL_US_BBOX,
            features: FeatureConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BboxTier {
    Requested,
    Expanded,
    Continental,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BboxCandidate {
    pub tier: BboxTier,
    pub radius_miles: Option<f64>,
    pub bbox: BoundingBox,
}

/// Requested radius, then the fallback radius, then the continental box.
/// The fallback tier is skipped when it would repeat the requested box.
pub fn candidate_plan(
    center: GeoPoint,
    requested_miles: f64,
    cfg: &PipelineConfig,
) -> Result<Vec<BboxCandidate>, GeoError> {
    let mut plan = vec![BboxCandidate {
        tier: BboxTier::Requested,
        radius_miles: Some(requested_miles),
        bbox: bbox_from_center_miles(center, requested_miles)?,
    }];

    if cfg.fallback_radius_miles != requested_miles {
        plan.push(BboxCandidate {
            tier: BboxTier::Expanded,
            radius_miles: Some(cfg.fallback_radius_miles),
            bbox: bbox_from_center_miles(center, cfg.fallback_radius_miles)?,
        });
    }

    plan.push(BboxCandidate {
        tier: BboxTier::Continental,
        radius_miles: None,
        bbox: cfg.continental_bbox,
    });
    Ok(plan)
}

pub fn collect_merged_frame(
    source: &dyn ObservationSource,
    plan: &[BboxCandidate],
    window: &HourWindow,
    workers: usize,
) -> Option<(BboxCandidate, MergedFrame)> {
    for candidate in plan {
        let series = fetch_all_pollutants(source, &candidate.bbox, window, workers);
        let frame = merge_pollutant_series(&series);
        if !frame.is_empty() {
            info!(
                component = "pipeline",
                event = "pipeline.candidate.selected",
                tier = ?candidate.tier,
                bbox = %candidate.bbox.to_query_string(),
                rows = frame.len()
            );
            return Some((*candidate, frame));
        }
        info!(
            component = "pipeline",
            event = "pipeline.candidate.empty",
            tier = ?candidate.tier,
            bbox = %candidate.bbox.to_query_string()
        );
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub radius_miles: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchReport {
    pub center: GeoPoint,
    pub radius_miles: f64,
    pub window: HourWindow,
    pub candidate: BboxCandidate,
    pub region: String,
    pub hourly_rows: usize,
    pub hourly_path: PathBuf,
    pub features_path: PathBuf,
    pub schema: FeatureSchema,
    pub latest: FeatureRow,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] GeoError),
    #[error("no data for this location ({latitude}, {longitude}) after all fallbacks")]
    NoData { latitude: f64, longitude: f64 },
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

pub struct FetchService {
    source: Arc<dyn ObservationSource>,
    regions: Arc<dyn RegionLookup>,
    artifacts: ArtifactStore,
    cfg: PipelineConfig,
}

impl FetchService {
    pub fn new(
        source: Arc<dyn ObservationSource>,
        regions: Arc<dyn RegionLookup>,
        artifacts: ArtifactStore,
        cfg: PipelineConfig,
    ) -> Self {
        Self {
            source,
            regions,
            artifacts,
            cfg,
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    pub fn run(&self, req: &FetchRequest) -> Result<FetchReport, PipelineError> {
        self.run_at(req, Utc::now())
    }

    // Blocking; callers on an async runtime must move this off the reactor.
    pub fn run_at(&self, req: &FetchRequest, now: DateTime<Utc>) -> Result<FetchReport, PipelineError> {
        let center = GeoPoint::new(req.latitude, req.longitude)?;
        let radius_miles = clamp_radius_miles(req.radius_miles)?;
        let window = HourWindow::trailing(now, self.cfg.window_hours);
        let plan = candidate_plan(center, radius_miles, &self.cfg)?;

        info!(
            component = "pipeline",
            event = "pipeline.fetch.start",
            latitude = center.latitude,
            longitude = center.longitude,
            radius_miles,
            window_start = %window.start,
            window_end = %window.end,
            tiers = plan.len()
        );

        let no_data = || PipelineError::NoData {
            latitude: center.latitude,
            longitude: center.longitude,
        };

        let Some((candidate, frame)) =
            collect_merged_frame(self.source.as_ref(), &plan, &window, self.cfg.fetch_workers)
        else {
            warn!(
                component = "pipeline",
                event = "pipeline.fetch.no_data",
                latitude = center.latitude,
                longitude = center.longitude
            );
            return Err(no_data());
        };

        let table = frame.into_hourly_table();
        let region = resolve_region(self.regions.as_ref(), center);
        let features = engineer_features(&table.labeled(&region), &self.cfg.features)?;
        let latest = features.latest().cloned().ok_or_else(no_data)?;

        let hourly_path = self.artifacts.write_hourly_table(&table, &region, now)?;
        let features_path = self
            .artifacts
            .write_feature_row(&features.schema, &latest, now)?;

        info!(
            component = "pipeline",
            event = "pipeline.fetch.finish",
            tier = ?candidate.tier,
            region = %region,
            hourly_rows = table.len(),
            latest_utc = %latest.utc,
            hourly_path = %hourly_path.display(),
            features_path = %features_path.display()
        );

        Ok(FetchReport {
            center,
            radius_miles,
            window,
            candidate,
            region,
            hourly_rows: table.len(),
            hourly_path,
            features_path,
            schema: features.schema,
            latest,
        })
    }
}
