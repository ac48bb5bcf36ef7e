//! Alert recording - turn transitions into persisted alert events
//!
//! Each transition becomes at most one `AlertEvent`. The store rejects a
//! second record with the same (device, zone, kind, position timestamp), so
//! re-running a pass for the same position never duplicates alerts.
//! Write failures are logged and counted; they never propagate further.

use crate::domain::{AlertEvent, DeviceId, Transition, TransitionKind, ZoneId};
use crate::infra::metrics::Metrics;
use crate::io::egress::AlertEgress;
use crate::store::{with_timeout, AppendOutcome, SpatialStore, StoreError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("alert write failed: device={device_id} zone={zone_id} kind={kind}: {source}")]
pub struct AlertWriteFailed {
    pub device_id: DeviceId,
    pub zone_id: ZoneId,
    pub kind: TransitionKind,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Recorded(AlertEvent),
    /// Already recorded for this natural key
    Duplicate,
}

/// Human-readable alert text
pub fn describe(kind: TransitionKind, zone_name: &str) -> String {
    match kind {
        TransitionKind::Entered => format!("Device entered zone: {zone_name}."),
        TransitionKind::Exited => format!("Device exited zone: {zone_name}."),
    }
}

/// Build the alert record for a transition
pub fn build_alert(transition: &Transition) -> AlertEvent {
    AlertEvent {
        alert_id: Uuid::now_v7().to_string(),
        device_id: transition.device_id,
        zone_id: transition.zone_id,
        kind: transition.kind,
        description: describe(transition.kind, &transition.zone_name),
        position_at: transition.at,
        recorded_at: Utc::now(),
    }
}

pub struct AlertRecorder {
    store: Arc<dyn SpatialStore>,
    store_timeout: Duration,
    metrics: Arc<Metrics>,
    egress: Option<AlertEgress>,
}

impl AlertRecorder {
    pub fn new(store: Arc<dyn SpatialStore>, store_timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self { store, store_timeout, metrics, egress: None }
    }

    /// Mirror recorded alerts through the egress writer
    pub fn with_egress(mut self, egress: AlertEgress) -> Self {
        self.egress = Some(egress);
        self
    }

    pub async fn record(&self, transition: &Transition) -> Result<RecordOutcome, AlertWriteFailed> {
        let alert = build_alert(transition);

        match with_timeout(self.store_timeout, self.store.append_alert(alert.clone())).await {
            Ok(AppendOutcome::Inserted) => {
                info!(
                    alert_id = %alert.alert_id,
                    device_id = %alert.device_id,
                    zone_id = %alert.zone_id,
                    zone = %transition.zone_name,
                    kind = %alert.kind,
                    position_at = %alert.position_at.to_rfc3339(),
                    "geofence_alert_recorded"
                );
                self.metrics.record_alert_recorded();
                if let Some(egress) = &self.egress {
                    egress.send(&alert);
                }
                Ok(RecordOutcome::Recorded(alert))
            }
            Ok(AppendOutcome::Duplicate) => {
                debug!(
                    device_id = %alert.device_id,
                    zone_id = %alert.zone_id,
                    kind = %alert.kind,
                    position_at = %alert.position_at.to_rfc3339(),
                    "geofence_alert_duplicate"
                );
                self.metrics.record_alert_duplicate();
                Ok(RecordOutcome::Duplicate)
            }
            Err(source) => {
                error!(
                    device_id = %alert.device_id,
                    zone_id = %alert.zone_id,
                    kind = %alert.kind,
                    error = %source,
                    "geofence_alert_write_failed"
                );
                self.metrics.record_alert_failed();
                Err(AlertWriteFailed {
                    device_id: alert.device_id,
                    zone_id: alert.zone_id,
                    kind: alert.kind,
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::egress::create_alert_egress;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn transition(kind: TransitionKind) -> Transition {
        Transition {
            device_id: DeviceId(7),
            zone_id: ZoneId(1),
            zone_name: "Office".to_string(),
            kind,
            at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn recorder(store: Arc<MemoryStore>) -> (AlertRecorder, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        (AlertRecorder::new(store, Duration::from_millis(500), metrics.clone()), metrics)
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(TransitionKind::Entered, "Office"), "Device entered zone: Office.");
        assert_eq!(describe(TransitionKind::Exited, "Office"), "Device exited zone: Office.");
    }

    #[test]
    fn test_build_alert_copies_key_fields() {
        let tr = transition(TransitionKind::Exited);
        let alert = build_alert(&tr);
        assert_eq!(alert.key(), tr.key());
        assert!(Uuid::parse_str(&alert.alert_id).is_ok());
    }

    #[tokio::test]
    async fn test_record_then_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let (recorder, metrics) = recorder(store.clone());
        let tr = transition(TransitionKind::Entered);

        let first = recorder.record(&tr).await.unwrap();
        assert!(matches!(first, RecordOutcome::Recorded(ref a) if a.description == "Device entered zone: Office."));
        assert_eq!(recorder.record(&tr).await.unwrap(), RecordOutcome::Duplicate);

        assert_eq!(store.alert_count(), 1);
        assert_eq!(metrics.alerts_recorded(), 1);
        assert_eq!(metrics.alerts_duplicate(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store.set_alert_writes_failing(true);
        let (recorder, metrics) = recorder(store.clone());

        let err = recorder.record(&transition(TransitionKind::Exited)).await.unwrap_err();
        assert_eq!(err.kind, TransitionKind::Exited);
        assert!(matches!(err.source, StoreError::Unavailable(_)));
        assert_eq!(metrics.alerts_failed(), 1);
        assert_eq!(store.alert_count(), 0);
    }

    #[tokio::test]
    async fn test_recorded_alert_is_mirrored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alerts.jsonl");
        let store = Arc::new(MemoryStore::new());
        let (recorder, _) = recorder(store);
        let (egress, writer) = create_alert_egress(&path, 8);
        let handle = tokio::spawn(writer.run());
        let recorder = recorder.with_egress(egress);

        recorder.record(&transition(TransitionKind::Entered)).await.unwrap();
        recorder.record(&transition(TransitionKind::Entered)).await.unwrap();
        drop(recorder);
        handle.await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
