//! Location ingest - accept a report, store it, schedule evaluation
//!
//! The caller gets an answer as soon as the position is stored. The
//! geofence pass runs later on the device's worker and its outcome is never
//! reported back to the device.

use crate::domain::geo::GeoError;
use crate::domain::{DeviceId, Position};
use crate::infra::metrics::Metrics;
use crate::services::geofence_worker::{EvalJob, GeofenceDispatcher};
use crate::store::{with_timeout, SpatialStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Location report as posted by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReport {
    pub device_id: DeviceId,
    pub latitude: f64,
    pub longitude: f64,
    /// Device-side capture time; server receive time when absent
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    #[error(transparent)]
    Invalid(#[from] GeoError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Ingestor {
    store: Arc<dyn SpatialStore>,
    dispatcher: Arc<GeofenceDispatcher>,
    metrics: Arc<Metrics>,
    store_timeout: Duration,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn SpatialStore>,
        dispatcher: Arc<GeofenceDispatcher>,
        metrics: Arc<Metrics>,
        store_timeout: Duration,
    ) -> Self {
        Self { store, dispatcher, metrics, store_timeout }
    }

    /// Store a report and enqueue the device for evaluation
    ///
    /// Returns the stored position. Evaluation is scheduled but not awaited;
    /// a full queue defers the job and is not an error for the caller.
    pub async fn ingest(&self, report: LocationReport) -> Result<Position, IngestError> {
        let captured_at = report.captured_at.unwrap_or_else(Utc::now);
        let position = Position::new(report.device_id, report.latitude, report.longitude, captured_at);

        if let Err(e) = position.point().validate() {
            warn!(device_id = %report.device_id, error = %e, "position_rejected");
            self.metrics.record_position_rejected();
            return Err(e.into());
        }

        let sender = self.dispatcher.shard_sender(position.device_id).await;
        with_timeout(self.store_timeout, self.store.append_position(position.clone())).await?;
        let dispatch =
            self.dispatcher.submit(&sender, EvalJob::new(position.device_id, position.captured_at));
        drop(sender);

        self.metrics.record_position_ingested();
        info!(
            device_id = %position.device_id,
            point = %position.point(),
            captured_at = %position.captured_at.to_rfc3339(),
            dispatch = %dispatch.as_str(),
            "position_ingested"
        );

        Ok(position)
    }
}
