//! Spatial store - persistence boundary for positions, zones and alerts
//!
//! The engine never touches storage directly; it goes through the
//! [`SpatialStore`] trait so the backend can be swapped:
//! - `memory` - in-process maps, used for tests and ephemeral deployments
//! - `sqlite` - rusqlite file database with a unique alert natural key

pub mod memory;
pub mod sqlite;

use crate::domain::{AlertEvent, Device, DeviceId, NewZone, Position, Zone, ZoneId, ZonePatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Result of appending an alert under the natural-key constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// An alert with the same (device, zone, kind, position_at) already exists
    Duplicate,
}

#[async_trait]
pub trait SpatialStore: Send + Sync {
    /// Store a position, registering the device as active on first sight
    async fn append_position(&self, position: Position) -> Result<(), StoreError>;

    /// Most recent positions for a device, newest first
    async fn recent_positions(
        &self,
        device_id: DeviceId,
        limit: usize,
    ) -> Result<Vec<Position>, StoreError>;

    /// Most recent positions captured at or before `until`, newest first
    async fn positions_until(
        &self,
        device_id: DeviceId,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Position>, StoreError>;

    /// Positions for a device within an inclusive time range, oldest first
    async fn position_history(
        &self,
        device_id: DeviceId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Position>, StoreError>;

    /// Newest position of every active device, ordered by device id
    async fn latest_positions(&self) -> Result<Vec<Position>, StoreError>;

    /// Registered devices, ordered by id
    async fn list_devices(&self) -> Result<Vec<Device>, StoreError>;

    /// Flip a device's active flag; `None` when the device is unknown
    async fn set_device_active(
        &self,
        device_id: DeviceId,
        active: bool,
    ) -> Result<Option<Device>, StoreError>;

    /// All zones, ordered by name
    async fn list_zones(&self) -> Result<Vec<Zone>, StoreError>;

    async fn get_zone(&self, zone_id: ZoneId) -> Result<Option<Zone>, StoreError>;

    async fn create_zone(&self, zone: NewZone) -> Result<Zone, StoreError>;

    async fn update_zone(&self, zone_id: ZoneId, patch: ZonePatch)
        -> Result<Option<Zone>, StoreError>;

    async fn delete_zone(&self, zone_id: ZoneId) -> Result<bool, StoreError>;

    async fn append_alert(&self, alert: AlertEvent) -> Result<AppendOutcome, StoreError>;

    /// Alert log, newest first, optionally filtered by device
    async fn list_alerts(
        &self,
        device_id: Option<DeviceId>,
        limit: usize,
    ) -> Result<Vec<AlertEvent>, StoreError>;
}

/// Bound a store call by `timeout`; an elapsed timer becomes `StoreError::Timeout`
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}
