//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `http` - JSON API, /metrics and /health over hyper
//! - `prometheus` - Prometheus text formatting of engine metrics
//! - `egress` - Alert mirror to file (JSONL format) on its own writer task

pub mod egress;
pub mod http;
pub mod prometheus;

// Re-export commonly used types
pub use egress::{create_alert_egress, AlertEgress, AlertEgressWriter};
pub use http::{start_api_server, ApiState};
