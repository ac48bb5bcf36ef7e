//! Geodesy primitives: coordinate validation and haversine distance
//!
//! All coordinates are WGS84 decimal degrees. Distances come from the `geo`
//! crate's haversine on a sphere of [`EARTH_RADIUS_M`]; no ellipsoid
//! iteration, so results are reproducible across platforms.

use geo::{Distance, Haversine, Point};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// IUGG mean Earth radius in meters, the radius `geo`'s haversine uses
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Errors raised when geometric input is out of range
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoError {
    #[error("invalid coordinate: latitude={latitude}, longitude={longitude}")]
    InvalidCoordinate { latitude: f64, longitude: f64 },
    #[error("invalid radius: {0} (must be finite and > 0)")]
    InvalidRadius(f64),
}

/// A latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    #[inline]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Check lat ∈ [-90, 90] and lon ∈ [-180, 180]; NaN and infinities are rejected
    pub fn validate(&self) -> Result<(), GeoError> {
        let lat_ok = self.latitude.is_finite() && (-90.0..=90.0).contains(&self.latitude);
        let lon_ok = self.longitude.is_finite() && (-180.0..=180.0).contains(&self.longitude);
        if lat_ok && lon_ok {
            Ok(())
        } else {
            Err(GeoError::InvalidCoordinate { latitude: self.latitude, longitude: self.longitude })
        }
    }
}

impl From<GeoPoint> for Point<f64> {
    fn from(p: GeoPoint) -> Self {
        Point::new(p.longitude, p.latitude)
    }
}

impl std::fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// Check radius is finite and strictly positive
pub fn validate_radius(radius_m: f64) -> Result<(), GeoError> {
    if radius_m.is_finite() && radius_m > 0.0 {
        Ok(())
    } else {
        Err(GeoError::InvalidRadius(radius_m))
    }
}

/// Great-circle distance in meters (haversine on the mean-radius sphere)
///
/// Rounding next to antipodal points can push the haversine term past 1;
/// that case is pinned to half the circumference instead of NaN. Inputs are
/// not validated here.
pub fn haversine_distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let d = Haversine::distance(Point::from(a), Point::from(b));
    if d.is_nan() {
        std::f64::consts::PI * EARTH_RADIUS_M
    } else {
        d
    }
}
