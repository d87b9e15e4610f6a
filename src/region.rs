//! Point to region label, as an injectable capability that never fails the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use reqwest::Url;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::geo::{BoundingBox, GeoPoint};
use crate::http::{HttpError, HttpFetcher};
use crate::shapefile::{locate, read_zipped_shapefile, RegionPolygon, ShapefileError};

pub const UNKNOWN_REGION: &str = "Unknown";

pub const CENSUS_STATES_URL: &str =
    "https://www2.census.gov/geo/tiger/GENZ2018/shp/cb_2018_us_state_20m.zip";

pub const EXCLUDED_TERRITORIES: [&str; 5] = ["PR", "GU", "VI", "AS", "MP"];

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("invalid reference data URL {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Shapefile(#[from] ShapefileError),
}

pub trait RegionLookup: Send + Sync {
    fn lookup(&self, point: GeoPoint) -> Result<Option<String>, RegionError>;
}

pub fn resolve_region(lookup: &dyn RegionLookup, point: GeoPoint) -> String {
    match lookup.lookup(point) {
        Ok(Some(name)) => name,
        Ok(None) => {
            debug!(
                component = "region",
                event = "region.lookup.miss",
                latitude = point.latitude,
                longitude = point.longitude
            );
            UNKNOWN_REGION.to_string()
        }
        Err(err) => {
            warn!(
                component = "region",
                event = "region.lookup.degraded",
                latitude = point.latitude,
                longitude = point.longitude,
                reason = %err
            );
            UNKNOWN_REGION.to_string()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticRegionLookup {
    regions: Vec<(String, BoundingBox)>,
}

impl StaticRegionLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, bbox: BoundingBox) -> Self {
        self.regions.push((name.to_string(), bbox));
        self
    }
}

impl RegionLookup for StaticRegionLookup {
    fn lookup(&self, point: GeoPoint) -> Result<Option<String>, RegionError> {
        Ok(self
            .regions
            .iter()
            .find(|(_, bbox)| bbox.contains(point))
            .map(|(name, _)| name.clone()))
    }
}

// Memoizes successful lookups per coordinate bucket. Errors are not cached.
pub struct CachedRegionLookup {
    inner: Arc<dyn RegionLookup>,
    bucket_deg: f64,
    cache: Mutex<HashMap<(i64, i64), Option<String>>>,
}

impl CachedRegionLookup {
    pub fn new(inner: Arc<dyn RegionLookup>, bucket_deg: f64) -> Self {
        let bucket_deg = if bucket_deg.is_finite() && bucket_deg > 0.0 {
            bucket_deg
        } else {
            0.01
        };
        Self {
            inner,
            bucket_deg,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn bucket(&self, point: GeoPoint) -> (i64, i64) {
        (
            (point.latitude / self.bucket_deg).floor() as i64,
            (point.longitude / self.bucket_deg).floor() as i64,
        )
    }

    pub fn cached_buckets(&self) -> usize {
        self.cache.lock().expect("region cache lock should not be poisoned").len()
    }
}

impl RegionLookup for CachedRegionLookup {
    fn lookup(&self, point: GeoPoint) -> Result<Option<String>, RegionError> {
        let key = self.bucket(point);
        if let Some(hit) = self
            .cache
            .lock()
            .expect("region cache lock should not be poisoned")
            .get(&key)
        {
            return Ok(hit.clone());
        }

        let resolved = self.inner.lookup(point)?;
        self.cache
            .lock()
            .expect("region cache lock should not be poisoned")
            .insert(key, resolved.clone());
        Ok(resolved)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapefileRegionConfig {
    pub url: String,
    pub name_field: String,
    pub code_field: String,
    pub excluded_codes: Vec<String>,
}

impl Default for ShapefileRegionConfig {
    fn default() -> Self {
        Self {
            url: CENSUS_STATES_URL.to_string(),
            name_field: "NAME".to_string(),
            code_field: "STUSPS".to_string(),
            excluded_codes: EXCLUDED_TERRITORIES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Downloads the reference archive on first use. A failed download leaves
/// nothing loaded, so the next lookup tries again.
pub struct ShapefileRegionLookup {
    cfg: ShapefileRegionConfig,
    http: Arc<dyn HttpFetcher>,
    polygons: Mutex<Option<Arc<Vec<RegionPolygon>>>>,
}

impl ShapefileRegionLookup {
    pub fn new(cfg: ShapefileRegionConfig, http: Arc<dyn HttpFetcher>) -> Self {
        Self {
            cfg,
            http,
            polygons: Mutex::new(None),
        }
    }

    fn loaded(&self) -> Option<Arc<Vec<RegionPolygon>>> {
        self.polygons
            .lock()
            .expect("region polygons lock should not be poisoned")
            .clone()
    }

    // The download runs without the lock held; concurrent first lookups may
    // each fetch, and the first stored result wins.
    fn load(&self) -> Result<Arc<Vec<RegionPolygon>>, RegionError> {
        if let Some(polygons) = self.loaded() {
            return Ok(polygons);
        }

        let url = Url::parse(&self.cfg.url).map_err(|err| RegionError::InvalidUrl {
            url: self.cfg.url.clone(),
            message: err.to_string(),
        })?;
        let bytes = self.http.get_bytes(&url)?;
        let all = read_zipped_shapefile(&bytes, &self.cfg.name_field, Some(&self.cfg.code_field))?;
        let total = all.len();
        let kept: Vec<RegionPolygon> = all
            .into_iter()
            .filter(|polygon| {
                polygon
                    .code
                    .as_ref()
                    .map_or(true, |code| !self.cfg.excluded_codes.contains(code))
            })
            .collect();

        info!(
            component = "region",
            event = "region.reference.loaded",
            url = %self.cfg.url,
            polygons = kept.len(),
            excluded = total - kept.len()
        );

        let mut slot = self.polygons.lock().expect("region polygons lock should not be poisoned");
        Ok(Arc::clone(slot.get_or_insert_with(|| Arc::new(kept))))
    }
}

impl RegionLookup for ShapefileRegionLookup {
    fn lookup(&self, point: GeoPoint) -> Result<Option<String>, RegionError> {
        let polygons = self.load()?;
        Ok(locate(&polygons, point).map(|polygon| polygon.name.clone()))
    }
}
