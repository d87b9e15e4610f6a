//! Center-plus-radius bounding boxes in WGS84 degrees.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MILES_PER_DEGREE_LAT: f64 = 69.0;
pub const MILES_PER_DEGREE_LON_EQUATOR: f64 = 69.172;
pub const DEFAULT_RADIUS_MILES: f64 = 10.0;
pub const MIN_RADIUS_MILES: f64 = 1.0;
pub const MAX_RADIUS_MILES: f64 = 50.0;

// Below this many miles per longitude degree the box collapses to zero width.
const DEGENERATE_LON_MILES: f64 = 1e-6;

pub const CONTINENTAL_US_BBOX: BoundingBox = BoundingBox {
    lon_min: -130.964794,
    lat_min: 13.151361,
    lon_max: -62.410107,
    lat_max: 50.455533,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lon_min: f64,
    pub lat_min: f64,
    pub lon_max: f64,
    pub lat_max: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum GeoError {
    #[error("latitude must be a finite value in [-90, 90], got {0}")]
    InvalidLatitude(f64),
    #[error("longitude must be a finite value in [-180, 180], got {0}")]
    InvalidLongitude(f64),
    #[error("radius must be a finite positive number of miles, got {0}")]
    InvalidRadius(f64),
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, GeoError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(GeoError::InvalidLatitude(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(GeoError::InvalidLongitude(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

impl BoundingBox {
    pub fn to_query_string(&self) -> String {
        format!(
            "{:.6},{:.6},{:.6},{:.6}",
            self.lon_min, self.lat_min, self.lon_max, self.lat_max
        )
    }

    pub fn contains(&self, point: GeoPoint) -> bool {
        point.longitude >= self.lon_min
            && point.longitude <= self.lon_max
            && point.latitude >= self.lat_min
            && point.latitude <= self.lat_max
    }
}

pub fn miles_to_degrees_lat(miles: f64) -> f64 {
    miles / MILES_PER_DEGREE_LAT
}

/// Longitude span of `miles` at `latitude_deg`.
pub fn miles_to_degrees_lon(miles: f64, latitude_deg: f64) -> f64 {
    let miles_per_degree = MILES_PER_DEGREE_LON_EQUATOR * latitude_deg.to_radians().cos();
    if miles_per_degree.abs() < DEGENERATE_LON_MILES {
        return 0.0;
    }
    miles / miles_per_degree
}

pub fn bbox_from_center_miles(center: GeoPoint, miles_to_edge: f64) -> Result<BoundingBox, GeoError> {
    if !miles_to_edge.is_finite() || miles_to_edge <= 0.0 {
        return Err(GeoError::InvalidRadius(miles_to_edge));
    }

    let dlat = miles_to_degrees_lat(miles_to_edge);
    let dlon = miles_to_degrees_lon(miles_to_edge, center.latitude);

    Ok(BoundingBox {
        lon_min: center.longitude - dlon,
        lat_min: center.latitude - dlat,
        lon_max: center.longitude + dlon,
        lat_max: center.latitude + dlat,
    })
}

/// Missing radius defaults to 10 miles; anything else is clamped to [1, 50].
pub fn clamp_radius_miles(radius: Option<f64>) -> Result<f64, GeoError> {
    match radius {
        None => Ok(DEFAULT_RADIUS_MILES),
        Some(value) if !value.is_finite() => Err(GeoError::InvalidRadius(value)),
        Some(value) => Ok(value.clamp(MIN_RADIUS_MILES, MAX_RADIUS_MILES)),
    }
}
