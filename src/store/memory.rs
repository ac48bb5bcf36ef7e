//! In-memory spatial store
//!
//! Positions are kept per device in capture-time order, next to the device
//! registry. Zones live in a BTreeMap keyed by id; alerts in an append-only
//! Vec plus a key set enforcing the natural-key uniqueness.

use super::{AppendOutcome, SpatialStore, StoreError};
use crate::domain::{
    AlertEvent, AlertKey, Device, DeviceId, NewZone, Position, Zone, ZoneId, ZonePatch,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

#[derive(Default)]
struct AlertLog {
    records: Vec<AlertEvent>,
    keys: FxHashSet<AlertKey>,
}

pub struct MemoryStore {
    /// Per-device positions, ascending by captured_at (ties keep insert order)
    positions: RwLock<FxHashMap<DeviceId, Vec<Position>>>,
    devices: RwLock<BTreeMap<DeviceId, Device>>,
    zones: RwLock<BTreeMap<ZoneId, Zone>>,
    next_zone_id: AtomicI64,
    alerts: RwLock<AlertLog>,
    /// Fault injection: every call fails with `Unavailable`
    unavailable: AtomicBool,
    /// Fault injection: only `append_alert` fails
    alert_writes_failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(FxHashMap::default()),
            devices: RwLock::new(BTreeMap::new()),
            zones: RwLock::new(BTreeMap::new()),
            next_zone_id: AtomicI64::new(1),
            alerts: RwLock::new(AlertLog::default()),
            unavailable: AtomicBool::new(false),
            alert_writes_failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Make `append_alert` fail until reset
    pub fn set_alert_writes_failing(&self, failing: bool) {
        self.alert_writes_failing.store(failing, Ordering::Relaxed);
    }

    /// Number of stored alerts
    pub fn alert_count(&self) -> usize {
        self.alerts.read().records.len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Relaxed) {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpatialStore for MemoryStore {
    async fn append_position(&self, position: Position) -> Result<(), StoreError> {
        self.check_available()?;
        self.devices.write().entry(position.device_id).or_insert_with(|| Device {
            device_id: position.device_id,
            active: true,
            registered_at: Utc::now(),
        });
        let mut positions = self.positions.write();
        let history = positions.entry(position.device_id).or_default();
        let idx = history.partition_point(|p| p.captured_at <= position.captured_at);
        history.insert(idx, position);
        Ok(())
    }

    async fn recent_positions(
        &self,
        device_id: DeviceId,
        limit: usize,
    ) -> Result<Vec<Position>, StoreError> {
        self.check_available()?;
        let positions = self.positions.read();
        Ok(positions
            .get(&device_id)
            .map(|history| history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn positions_until(
        &self,
        device_id: DeviceId,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Position>, StoreError> {
        self.check_available()?;
        let positions = self.positions.read();
        Ok(positions
            .get(&device_id)
            .map(|history| {
                let end = history.partition_point(|p| p.captured_at <= until);
                history[..end].iter().rev().take(limit).cloned().collect()
            })
            .unwrap_or_default())
    }

    async fn position_history(
        &self,
        device_id: DeviceId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Position>, StoreError> {
        self.check_available()?;
        let positions = self.positions.read();
        Ok(positions
            .get(&device_id)
            .map(|history| {
                history
                    .iter()
                    .filter(|p| from.map_or(true, |f| p.captured_at >= f))
                    .filter(|p| to.map_or(true, |t| p.captured_at <= t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn latest_positions(&self) -> Result<Vec<Position>, StoreError> {
        self.check_available()?;
        let devices = self.devices.read();
        let positions = self.positions.read();
        Ok(devices
            .values()
            .filter(|device| device.active)
            .filter_map(|device| positions.get(&device.device_id)?.last().cloned())
            .collect())
    }

    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        self.check_available()?;
        Ok(self.devices.read().values().cloned().collect())
    }

    async fn set_device_active(
        &self,
        device_id: DeviceId,
        active: bool,
    ) -> Result<Option<Device>, StoreError> {
        self.check_available()?;
        Ok(self.devices.write().get_mut(&device_id).map(|device| {
            device.active = active;
            device.clone()
        }))
    }

    async fn list_zones(&self) -> Result<Vec<Zone>, StoreError> {
        self.check_available()?;
        let mut zones: Vec<Zone> = self.zones.read().values().cloned().collect();
        zones.sort_by(|a, b| a.name.cmp(&b.name).then(a.zone_id.cmp(&b.zone_id)));
        Ok(zones)
    }

    async fn get_zone(&self, zone_id: ZoneId) -> Result<Option<Zone>, StoreError> {
        self.check_available()?;
        Ok(self.zones.read().get(&zone_id).cloned())
    }

    async fn create_zone(&self, zone: NewZone) -> Result<Zone, StoreError> {
        self.check_available()?;
        let zone_id = ZoneId(self.next_zone_id.fetch_add(1, Ordering::Relaxed));
        let zone = zone.into_zone(zone_id);
        self.zones.write().insert(zone_id, zone.clone());
        Ok(zone)
    }

    async fn update_zone(
        &self,
        zone_id: ZoneId,
        patch: ZonePatch,
    ) -> Result<Option<Zone>, StoreError> {
        self.check_available()?;
        let mut zones = self.zones.write();
        Ok(zones.get_mut(&zone_id).map(|zone| {
            patch.apply(zone);
            zone.clone()
        }))
    }

    async fn delete_zone(&self, zone_id: ZoneId) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.zones.write().remove(&zone_id).is_some())
    }

    async fn append_alert(&self, alert: AlertEvent) -> Result<AppendOutcome, StoreError> {
        self.check_available()?;
        if self.alert_writes_failing.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("alert log write rejected".to_string()));
        }
        let mut log = self.alerts.write();
        if !log.keys.insert(alert.key()) {
            return Ok(AppendOutcome::Duplicate);
        }
        log.records.push(alert);
        Ok(AppendOutcome::Inserted)
    }

    async fn list_alerts(
        &self,
        device_id: Option<DeviceId>,
        limit: usize,
    ) -> Result<Vec<AlertEvent>, StoreError> {
        self.check_available()?;
        let log = self.alerts.read();
        Ok(log
            .records
            .iter()
            .rev()
            .filter(|a| device_id.map_or(true, |d| a.device_id == d))
            .take(limit)
            .cloned()
            .collect())
    }
}
