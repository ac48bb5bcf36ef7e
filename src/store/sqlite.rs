//! SQLite spatial store (rusqlite)
//!
//! Timestamps are stored as INTEGER microseconds since the Unix epoch so
//! ordering and the alert natural key compare exactly. The alert table has a
//! UNIQUE constraint on (device_id, zone_id, kind, position_at); duplicates
//! are absorbed with `INSERT OR IGNORE`.
//!
//! rusqlite is blocking, so every call runs on the blocking pool behind a
//! single connection mutex.

use super::{AppendOutcome, SpatialStore, StoreError};
use crate::domain::{
    AlertEvent, Device, DeviceId, NewZone, Position, TransitionKind, Zone, ZoneId, ZonePatch,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS positions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id   INTEGER NOT NULL,
    latitude    REAL NOT NULL,
    longitude   REAL NOT NULL,
    captured_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_positions_device_time ON positions (device_id, captured_at);

CREATE TABLE IF NOT EXISTS devices (
    device_id     INTEGER PRIMARY KEY,
    active        INTEGER NOT NULL DEFAULT 1,
    registered_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS zones (
    zone_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name             TEXT NOT NULL,
    center_latitude  REAL NOT NULL,
    center_longitude REAL NOT NULL,
    radius_meters    REAL NOT NULL CHECK (radius_meters > 0),
    alert_on_entry   INTEGER NOT NULL,
    alert_on_exit    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS alerts (
    alert_id    TEXT PRIMARY KEY,
    device_id   INTEGER NOT NULL,
    zone_id     INTEGER NOT NULL,
    kind        TEXT NOT NULL,
    description TEXT NOT NULL,
    position_at INTEGER NOT NULL,
    recorded_at INTEGER NOT NULL,
    UNIQUE (device_id, zone_id, kind, position_at)
);
CREATE INDEX IF NOT EXISTS idx_alerts_device ON alerts (device_id, recorded_at);
";

const ZONE_COLUMNS: &str =
    "zone_id, name, center_latitude, center_longitude, radius_meters, alert_on_entry, alert_on_exit";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
            | rusqlite::Error::InvalidColumnType(..) => StoreError::Corrupt(err.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

fn micros_to_utc(idx: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, micros))
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        device_id: DeviceId(row.get(0)?),
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        captured_at: micros_to_utc(3, row.get(3)?)?,
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        device_id: DeviceId(row.get(0)?),
        active: row.get(1)?,
        registered_at: micros_to_utc(2, row.get(2)?)?,
    })
}

fn zone_from_row(row: &Row<'_>) -> rusqlite::Result<Zone> {
    Ok(Zone {
        zone_id: ZoneId(row.get(0)?),
        name: row.get(1)?,
        center_latitude: row.get(2)?,
        center_longitude: row.get(3)?,
        radius_meters: row.get(4)?,
        alert_on_entry: row.get(5)?,
        alert_on_exit: row.get(6)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<AlertEvent> {
    let kind: String = row.get(3)?;
    let kind = kind
        .parse::<TransitionKind>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into()))?;
    Ok(AlertEvent {
        alert_id: row.get(0)?,
        device_id: DeviceId(row.get(1)?),
        zone_id: ZoneId(row.get(2)?),
        kind,
        description: row.get(4)?,
        position_at: micros_to_utc(5, row.get(5)?)?,
        recorded_at: micros_to_utc(6, row.get(6)?)?,
    })
}

fn select_zone(conn: &Connection, zone_id: ZoneId) -> rusqlite::Result<Option<Zone>> {
    conn.query_row(
        &format!("SELECT {ZONE_COLUMNS} FROM zones WHERE zone_id = ?1"),
        params![zone_id.0],
        zone_from_row,
    )
    .optional()
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "sqlite_store_opened");
        Self::bootstrap(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Run a closure against the connection on the blocking pool
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?;
        result.map_err(StoreError::from)
    }
}

#[async_trait]
impl SpatialStore for SqliteStore {
    async fn append_position(&self, position: Position) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_micros();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO devices (device_id, active, registered_at) VALUES (?1, 1, ?2)",
                params![position.device_id.0, now],
            )?;
            tx.execute(
                "INSERT INTO positions (device_id, latitude, longitude, captured_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    position.device_id.0,
                    position.latitude,
                    position.longitude,
                    position.captured_at.timestamp_micros()
                ],
            )?;
            tx.commit()
        })
        .await
    }

    async fn recent_positions(
        &self,
        device_id: DeviceId,
        limit: usize,
    ) -> Result<Vec<Position>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT device_id, latitude, longitude, captured_at FROM positions
                 WHERE device_id = ?1
                 ORDER BY captured_at DESC, id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![device_id.0, limit], position_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn positions_until(
        &self,
        device_id: DeviceId,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Position>, StoreError> {
        let until = until.timestamp_micros();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT device_id, latitude, longitude, captured_at FROM positions
                 WHERE device_id = ?1 AND captured_at <= ?2
                 ORDER BY captured_at DESC, id DESC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![device_id.0, until, limit], position_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn position_history(
        &self,
        device_id: DeviceId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Position>, StoreError> {
        let from = from.map(|t| t.timestamp_micros());
        let to = to.map(|t| t.timestamp_micros());
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT device_id, latitude, longitude, captured_at FROM positions
                 WHERE device_id = ?1
                   AND (?2 IS NULL OR captured_at >= ?2)
                   AND (?3 IS NULL OR captured_at <= ?3)
                 ORDER BY captured_at ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![device_id.0, from, to], position_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn latest_positions(&self) -> Result<Vec<Position>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT p.device_id, p.latitude, p.longitude, p.captured_at
                 FROM positions p JOIN devices d ON d.device_id = p.device_id
                 WHERE d.active = 1 AND p.id = (
                     SELECT q.id FROM positions q
                     WHERE q.device_id = p.device_id
                     ORDER BY q.captured_at DESC, q.id DESC
                     LIMIT 1
                 )
                 ORDER BY p.device_id",
            )?;
            let rows = stmt.query_map([], position_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT device_id, active, registered_at FROM devices ORDER BY device_id",
            )?;
            let rows = stmt.query_map([], device_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn set_device_active(
        &self,
        device_id: DeviceId,
        active: bool,
    ) -> Result<Option<Device>, StoreError> {
        self.run(move |conn| {
            conn.execute(
                "UPDATE devices SET active = ?1 WHERE device_id = ?2",
                params![active, device_id.0],
            )?;
            conn.query_row(
                "SELECT device_id, active, registered_at FROM devices WHERE device_id = ?1",
                params![device_id.0],
                device_from_row,
            )
            .optional()
        })
        .await
    }

    async fn list_zones(&self) -> Result<Vec<Zone>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn
                .prepare_cached(&format!("SELECT {ZONE_COLUMNS} FROM zones ORDER BY name, zone_id"))?;
            let rows = stmt.query_map([], zone_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn get_zone(&self, zone_id: ZoneId) -> Result<Option<Zone>, StoreError> {
        self.run(move |conn| select_zone(conn, zone_id)).await
    }

    async fn create_zone(&self, zone: NewZone) -> Result<Zone, StoreError> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO zones (name, center_latitude, center_longitude, radius_meters,
                                    alert_on_entry, alert_on_exit)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    zone.name,
                    zone.center_latitude,
                    zone.center_longitude,
                    zone.radius_meters,
                    zone.alert_on_entry,
                    zone.alert_on_exit
                ],
            )?;
            let zone_id = ZoneId(conn.last_insert_rowid());
            Ok(zone.into_zone(zone_id))
        })
        .await
    }

    async fn update_zone(
        &self,
        zone_id: ZoneId,
        patch: ZonePatch,
    ) -> Result<Option<Zone>, StoreError> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let Some(mut zone) = select_zone(&tx, zone_id)? else {
                return Ok(None);
            };
            patch.apply(&mut zone);
            tx.execute(
                "UPDATE zones SET name = ?1, center_latitude = ?2, center_longitude = ?3,
                                  radius_meters = ?4, alert_on_entry = ?5, alert_on_exit = ?6
                 WHERE zone_id = ?7",
                params![
                    zone.name,
                    zone.center_latitude,
                    zone.center_longitude,
                    zone.radius_meters,
                    zone.alert_on_entry,
                    zone.alert_on_exit,
                    zone_id.0
                ],
            )?;
            tx.commit()?;
            Ok(Some(zone))
        })
        .await
    }

    async fn delete_zone(&self, zone_id: ZoneId) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let deleted = conn.execute("DELETE FROM zones WHERE zone_id = ?1", params![zone_id.0])?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn append_alert(&self, alert: AlertEvent) -> Result<AppendOutcome, StoreError> {
        self.run(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO alerts
                    (alert_id, device_id, zone_id, kind, description, position_at, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    alert.alert_id,
                    alert.device_id.0,
                    alert.zone_id.0,
                    alert.kind.as_str(),
                    alert.description,
                    alert.position_at.timestamp_micros(),
                    alert.recorded_at.timestamp_micros()
                ],
            )?;
            Ok(if inserted == 0 { AppendOutcome::Duplicate } else { AppendOutcome::Inserted })
        })
        .await
    }

    async fn list_alerts(
        &self,
        device_id: Option<DeviceId>,
        limit: usize,
    ) -> Result<Vec<AlertEvent>, StoreError> {
        let device = device_id.map(|d| d.0);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT alert_id, device_id, zone_id, kind, description, position_at, recorded_at
                 FROM alerts
                 WHERE (?1 IS NULL OR device_id = ?1)
                 ORDER BY recorded_at DESC, rowid DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![device, limit], alert_from_row)?;
            rows.collect()
        })
        .await
    }
}
