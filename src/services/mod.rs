//! Services - geofence evaluation and ingest
//!
//! This module contains the core business logic services:
//! - `containment` - Point-in-circle test on haversine distance
//! - `transition_detector` - Entry/exit classification over consecutive positions
//! - `alert_recorder` - Idempotent alert persistence
//! - `geofence_worker` - Sharded per-device evaluation workers
//! - `ingest` - Location report intake

pub mod alert_recorder;
pub mod containment;
pub mod geofence_worker;
pub mod ingest;
pub mod transition_detector;

// Re-export commonly used types
pub use alert_recorder::{AlertRecorder, AlertWriteFailed, RecordOutcome};
pub use containment::ContainmentResult;
pub use geofence_worker::{
    create_geofence_workers, Dispatch, EvalJob, GeofenceDispatcher, GeofenceEngine, GeofenceWorker,
    PassReport,
};
pub use ingest::{IngestError, Ingestor, LocationReport};
pub use transition_detector::{EvaluationError, RangeStart, TransitionDetector};
