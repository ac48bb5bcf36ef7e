//! Containment evaluation - is a point inside a circular zone
//!
//! Distance is the haversine great-circle distance (see `domain::geo`).
//! A point exactly on the boundary (distance == radius) counts as inside.

use crate::domain::geo::{haversine_distance_m, validate_radius, GeoError, GeoPoint};
use crate::domain::{Position, Zone, ZoneId};

/// Outcome of checking one position against one zone
#[derive(Debug, Clone, PartialEq)]
pub struct ContainmentResult {
    pub zone_id: ZoneId,
    pub position: Position,
    pub distance_m: f64,
    pub is_inside: bool,
}

/// Decide whether `point` lies within `radius_m` meters of `center`
///
/// Fails with `InvalidCoordinate` for out-of-range or non-finite
/// coordinates and `InvalidRadius` for a radius that is not > 0.
pub fn is_within(point: GeoPoint, center: GeoPoint, radius_m: f64) -> Result<bool, GeoError> {
    Ok(distance_if_valid(point, center, radius_m)? <= radius_m)
}

/// Check a stored position against a zone
pub fn contains(zone: &Zone, position: &Position) -> Result<ContainmentResult, GeoError> {
    let distance_m = distance_if_valid(position.point(), zone.center(), zone.radius_meters)?;
    Ok(ContainmentResult {
        zone_id: zone.zone_id,
        position: position.clone(),
        distance_m,
        is_inside: distance_m <= zone.radius_meters,
    })
}

fn distance_if_valid(point: GeoPoint, center: GeoPoint, radius_m: f64) -> Result<f64, GeoError> {
    point.validate()?;
    center.validate()?;
    validate_radius(radius_m)?;
    Ok(haversine_distance_m(point, center))
}
