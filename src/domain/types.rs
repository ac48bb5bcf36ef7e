//! Shared types for the geofence engine

use crate::domain::geo::{validate_radius, GeoError, GeoPoint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Newtype wrapper for device IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct DeviceId(pub i64);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for zone IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ZoneId(pub i64);

impl std::fmt::Display for ZoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored device location report. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub device_id: DeviceId,
    pub latitude: f64,
    pub longitude: f64,
    pub captured_at: DateTime<Utc>,
}

impl Position {
    pub fn new(device_id: DeviceId, latitude: f64, longitude: f64, captured_at: DateTime<Utc>) -> Self {
        Self { device_id, latitude, longitude, captured_at }
    }

    #[inline]
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Registry entry for a reporting device
///
/// Created on the device's first stored position. Inactive devices keep
/// their history but drop out of the fleet-wide latest-position view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
}

/// Circular geofence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub zone_id: ZoneId,
    pub name: String,
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub radius_meters: f64,
    pub alert_on_entry: bool,
    pub alert_on_exit: bool,
}

impl Zone {
    #[inline]
    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(self.center_latitude, self.center_longitude)
    }
}

fn default_true() -> bool {
    true
}

/// Zone creation request; alert flags default to enabled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewZone {
    pub name: String,
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub radius_meters: f64,
    #[serde(default = "default_true")]
    pub alert_on_entry: bool,
    #[serde(default = "default_true")]
    pub alert_on_exit: bool,
}

impl NewZone {
    pub fn validate(&self) -> Result<(), ZoneValidationError> {
        if self.name.trim().is_empty() {
            return Err(ZoneValidationError::EmptyName);
        }
        GeoPoint::new(self.center_latitude, self.center_longitude).validate()?;
        validate_radius(self.radius_meters)?;
        Ok(())
    }

    pub fn into_zone(self, zone_id: ZoneId) -> Zone {
        Zone {
            zone_id,
            name: self.name,
            center_latitude: self.center_latitude,
            center_longitude: self.center_longitude,
            radius_meters: self.radius_meters,
            alert_on_entry: self.alert_on_entry,
            alert_on_exit: self.alert_on_exit,
        }
    }
}

/// Partial zone update. The center moves only when both coordinates are given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZonePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub center_latitude: Option<f64>,
    #[serde(default)]
    pub center_longitude: Option<f64>,
    #[serde(default)]
    pub radius_meters: Option<f64>,
    #[serde(default)]
    pub alert_on_entry: Option<bool>,
    #[serde(default)]
    pub alert_on_exit: Option<bool>,
}

impl ZonePatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.center_latitude.is_none()
            && self.center_longitude.is_none()
            && self.radius_meters.is_none()
            && self.alert_on_entry.is_none()
            && self.alert_on_exit.is_none()
    }

    pub fn validate(&self) -> Result<(), ZoneValidationError> {
        if self.is_empty() {
            return Err(ZoneValidationError::EmptyPatch);
        }
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(ZoneValidationError::EmptyName);
            }
        }
        match (self.center_latitude, self.center_longitude) {
            (Some(lat), Some(lon)) => GeoPoint::new(lat, lon).validate()?,
            (None, None) => {}
            _ => return Err(ZoneValidationError::PartialCenter),
        }
        if let Some(radius) = self.radius_meters {
            validate_radius(radius)?;
        }
        Ok(())
    }

    /// Apply the patch in place. Callers validate first.
    pub fn apply(&self, zone: &mut Zone) {
        if let Some(name) = &self.name {
            zone.name = name.clone();
        }
        if let (Some(lat), Some(lon)) = (self.center_latitude, self.center_longitude) {
            zone.center_latitude = lat;
            zone.center_longitude = lon;
        }
        if let Some(radius) = self.radius_meters {
            zone.radius_meters = radius;
        }
        if let Some(entry) = self.alert_on_entry {
            zone.alert_on_entry = entry;
        }
        if let Some(exit) = self.alert_on_exit {
            zone.alert_on_exit = exit;
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ZoneValidationError {
    #[error("zone name must not be empty")]
    EmptyName,
    #[error("no fields to update")]
    EmptyPatch,
    #[error("center_latitude and center_longitude must be given together")]
    PartialCenter,
    #[error(transparent)]
    Geo(#[from] GeoError),
}

/// Direction of a containment change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransitionKind {
    #[serde(rename = "ZONE_ENTRY")]
    Entered,
    #[serde(rename = "ZONE_EXIT")]
    Exited,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Entered => "ZONE_ENTRY",
            TransitionKind::Exited => "ZONE_EXIT",
        }
    }
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransitionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ZONE_ENTRY" => Ok(TransitionKind::Entered),
            "ZONE_EXIT" => Ok(TransitionKind::Exited),
            other => Err(format!("unknown transition kind: {other}")),
        }
    }
}

/// A detected containment change for one (device, zone) pair
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub device_id: DeviceId,
    pub zone_id: ZoneId,
    pub zone_name: String,
    pub kind: TransitionKind,
    /// `captured_at` of the position that triggered the transition
    pub at: DateTime<Utc>,
}

impl Transition {
    pub fn key(&self) -> AlertKey {
        AlertKey { device_id: self.device_id, zone_id: self.zone_id, kind: self.kind, position_at: self.at }
    }
}

/// Natural key of an alert: at most one record per key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub device_id: DeviceId,
    pub zone_id: ZoneId,
    pub kind: TransitionKind,
    pub position_at: DateTime<Utc>,
}

/// Persisted record of a transition. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert_id: String,
    pub device_id: DeviceId,
    pub zone_id: ZoneId,
    pub kind: TransitionKind,
    pub description: String,
    pub position_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn key(&self) -> AlertKey {
        AlertKey {
            device_id: self.device_id,
            zone_id: self.zone_id,
            kind: self.kind,
            position_at: self.position_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> Zone {
        NewZone {
            name: "Office".to_string(),
            center_latitude: 4.6548,
            center_longitude: -74.0543,
            radius_meters: 50.0,
            alert_on_entry: true,
            alert_on_exit: true,
        }
        .into_zone(ZoneId(1))
    }

    #[test]
    fn test_transition_kind_from_str() {
        assert_eq!("ZONE_ENTRY".parse::<TransitionKind>().unwrap(), TransitionKind::Entered);
        assert_eq!("ZONE_EXIT".parse::<TransitionKind>().unwrap(), TransitionKind::Exited);
        assert!("SOMETHING".parse::<TransitionKind>().is_err());
    }

    #[test]
    fn test_transition_kind_serde_matches_as_str() {
        let json = serde_json::to_string(&TransitionKind::Exited).unwrap();
        assert_eq!(json, "\"ZONE_EXIT\"");
    }

    #[test]
    fn test_new_zone_flags_default_true() {
        let new_zone: NewZone = serde_json::from_str(
            r#"{"name":"A","center_latitude":1.0,"center_longitude":2.0,"radius_meters":10.0}"#,
        )
        .unwrap();
        assert!(new_zone.alert_on_entry);
        assert!(new_zone.alert_on_exit);
    }

    #[test]
    fn test_new_zone_validation() {
        let mut new_zone = NewZone {
            name: "A".to_string(),
            center_latitude: 1.0,
            center_longitude: 2.0,
            radius_meters: 0.0,
            alert_on_entry: true,
            alert_on_exit: true,
        };
        assert!(matches!(
            new_zone.validate(),
            Err(ZoneValidationError::Geo(GeoError::InvalidRadius(_)))
        ));

        new_zone.radius_meters = 10.0;
        new_zone.center_latitude = 91.0;
        assert!(matches!(
            new_zone.validate(),
            Err(ZoneValidationError::Geo(GeoError::InvalidCoordinate { .. }))
        ));

        new_zone.center_latitude = 1.0;
        new_zone.name = "  ".to_string();
        assert_eq!(new_zone.validate(), Err(ZoneValidationError::EmptyName));
    }

    #[test]
    fn test_patch_requires_both_center_coordinates() {
        let patch = ZonePatch { center_latitude: Some(1.0), ..Default::default() };
        assert_eq!(patch.validate(), Err(ZoneValidationError::PartialCenter));
        assert_eq!(ZonePatch::default().validate(), Err(ZoneValidationError::EmptyPatch));
    }

    #[test]
    fn test_patch_apply() {
        let mut z = zone();
        let patch = ZonePatch {
            radius_meters: Some(120.0),
            alert_on_exit: Some(false),
            ..Default::default()
        };
        assert!(patch.validate().is_ok());
        patch.apply(&mut z);
        assert_eq!(z.radius_meters, 120.0);
        assert!(!z.alert_on_exit);
        assert!(z.alert_on_entry);
        assert_eq!(z.name, "Office");
    }
}
