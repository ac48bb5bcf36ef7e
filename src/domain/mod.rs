//! Domain models - core types of the geofencing engine
//!
//! This module contains the canonical data types used throughout the system:
//! - `Position` - a stored device location report
//! - `Device` - registry entry with the active flag
//! - `Zone` - a circular geofence with entry/exit alert flags
//! - `Transition` - a detected containment change for one device and zone
//! - `AlertEvent` - the persisted record of a transition
//! - `geo` - coordinate validation and haversine distance

pub mod geo;
pub mod types;

pub use geo::{haversine_distance_m, GeoError, GeoPoint};
pub use types::{
    AlertEvent, AlertKey, Device, DeviceId, NewZone, Position, Transition, TransitionKind, Zone,
    ZoneId, ZonePatch, ZoneValidationError,
};
