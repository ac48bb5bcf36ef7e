//! HTTP API - location intake, zone management, history and alerts
//!
//! Plain hyper http1 server with a hand-written router. Request and response
//! bodies are JSON; errors are `{"message": "..."}` with 400 for bad input,
//! 404 for missing resources and 500 for store failures.
//!
//! Query strings decode into typed structs via serde_urlencoded.
//!
//! /metrics (Prometheus text) and /health are served from the same listener.

use crate::domain::{DeviceId, NewZone, ZoneId, ZonePatch};
use crate::infra::metrics::Metrics;
use crate::io::prometheus::format_prometheus_metrics;
use crate::services::ingest::{IngestError, Ingestor, LocationReport};
use crate::store::{with_timeout, SpatialStore, StoreError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Request bodies above this size are rejected
const MAX_BODY_BYTES: usize = 64 * 1024;
const DEFAULT_ALERT_LIMIT: usize = 100;
const MAX_ALERT_LIMIT: usize = 1000;

/// Shared state for request handlers
pub struct ApiState {
    pub store: Arc<dyn SpatialStore>,
    pub ingestor: Arc<Ingestor>,
    pub metrics: Arc<Metrics>,
    pub site_id: String,
    pub store_timeout: Duration,
}

type ApiResponse = Response<Full<Bytes>>;

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> ApiResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> ApiResponse {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => {
            error!(error = %e, "api_serialize_failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error.")
        }
    }
}

fn message(status: StatusCode, text: &str) -> ApiResponse {
    json_response(status, &json!({ "message": text }))
}

fn store_failure(e: StoreError) -> ApiResponse {
    error!(error = %e, "api_store_error");
    message(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error.")
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiResponse> {
    serde_json::from_slice(body).map_err(|e| {
        debug!(error = %e, "api_bad_json");
        message(StatusCode::BAD_REQUEST, &format!("Invalid request body: {e}"))
    })
}

fn parse_id(raw: &str, what: &str) -> Result<i64, ApiResponse> {
    raw.parse::<i64>()
        .map_err(|_| message(StatusCode::BAD_REQUEST, &format!("Invalid {what}: {raw}")))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct AlertsQuery {
    device_id: Option<i64>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct DeviceStatusUpdate {
    active: bool,
}

fn parse_query<T: DeserializeOwned + Default>(query: Option<&str>) -> Result<T, ApiResponse> {
    let Some(raw) = query.filter(|q| !q.is_empty()) else {
        return Ok(T::default());
    };
    // Form decoding turns `+` into a space; keep it so RFC 3339 offsets survive
    serde_urlencoded::from_str(&raw.replace('+', "%2B")).map_err(|e| {
        debug!(query = %raw, error = %e, "api_bad_query");
        message(StatusCode::BAD_REQUEST, &format!("Invalid query: {e}"))
    })
}

/// Route one request. Body is already collected.
pub async fn route(
    state: &ApiState,
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: Bytes,
) -> ApiResponse {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let result = match (method, segments.as_slice()) {
        (&Method::GET, ["health"]) => Ok(respond(StatusCode::OK, "text/plain", "ok")),
        (&Method::GET, ["metrics"]) => Ok(respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&state.metrics, &state.site_id),
        )),
        (&Method::POST, ["api", "location"]) => post_location(state, &body).await,
        (&Method::GET, ["api", "zones"]) => list_zones(state).await,
        (&Method::POST, ["api", "zones"]) => create_zone(state, &body).await,
        (&Method::PUT, ["api", "zones", id]) => update_zone(state, id, &body).await,
        (&Method::DELETE, ["api", "zones", id]) => delete_zone(state, id).await,
        (&Method::GET, ["api", "history", "last"]) => latest_positions(state).await,
        (&Method::GET, ["api", "history", device, "last"]) => last_position(state, device).await,
        (&Method::GET, ["api", "history", device]) => history(state, device, query).await,
        (&Method::GET, ["api", "alerts"]) => list_alerts(state, query).await,
        (&Method::GET, ["api", "admin", "devices"]) => list_devices(state).await,
        (&Method::PUT, ["api", "admin", "devices", id, "status"]) => {
            update_device_status(state, id, &body).await
        }
        _ => Err(message(StatusCode::NOT_FOUND, "Not found.")),
    };

    result.unwrap_or_else(|response| response)
}

async fn post_location(state: &ApiState, body: &[u8]) -> Result<ApiResponse, ApiResponse> {
    let report: LocationReport = parse_json(body)?;
    match state.ingestor.ingest(report).await {
        Ok(position) => Ok(json_response(
            StatusCode::OK,
            &json!({
                "message": "Location stored. Geofence evaluation scheduled.",
                "position": position,
            }),
        )),
        Err(IngestError::Invalid(e)) => Err(message(StatusCode::BAD_REQUEST, &e.to_string())),
        Err(IngestError::Store(e)) => Err(store_failure(e)),
    }
}

async fn list_zones(state: &ApiState) -> Result<ApiResponse, ApiResponse> {
    let zones = with_timeout(state.store_timeout, state.store.list_zones())
        .await
        .map_err(store_failure)?;
    Ok(json_response(StatusCode::OK, &zones))
}

async fn create_zone(state: &ApiState, body: &[u8]) -> Result<ApiResponse, ApiResponse> {
    let new_zone: NewZone = parse_json(body)?;
    new_zone.validate().map_err(|e| message(StatusCode::BAD_REQUEST, &e.to_string()))?;

    let zone = with_timeout(state.store_timeout, state.store.create_zone(new_zone))
        .await
        .map_err(store_failure)?;
    info!(zone_id = %zone.zone_id, name = %zone.name, radius_m = %zone.radius_meters, "zone_created");
    Ok(json_response(StatusCode::CREATED, &zone))
}

async fn update_zone(state: &ApiState, id: &str, body: &[u8]) -> Result<ApiResponse, ApiResponse> {
    let zone_id = ZoneId(parse_id(id, "zone id")?);
    let patch: ZonePatch = parse_json(body)?;
    patch.validate().map_err(|e| message(StatusCode::BAD_REQUEST, &e.to_string()))?;

    match with_timeout(state.store_timeout, state.store.update_zone(zone_id, patch))
        .await
        .map_err(store_failure)?
    {
        Some(zone) => {
            info!(zone_id = %zone.zone_id, name = %zone.name, "zone_updated");
            Ok(json_response(StatusCode::OK, &zone))
        }
        None => Err(message(StatusCode::NOT_FOUND, "Zone not found.")),
    }
}

async fn delete_zone(state: &ApiState, id: &str) -> Result<ApiResponse, ApiResponse> {
    let zone_id = ZoneId(parse_id(id, "zone id")?);
    let deleted = with_timeout(state.store_timeout, state.store.delete_zone(zone_id))
        .await
        .map_err(store_failure)?;
    if deleted {
        info!(zone_id = %zone_id, "zone_deleted");
        Ok(message(StatusCode::OK, "Zone deleted."))
    } else {
        Err(message(StatusCode::NOT_FOUND, "Zone not found."))
    }
}

async fn latest_positions(state: &ApiState) -> Result<ApiResponse, ApiResponse> {
    let positions = with_timeout(state.store_timeout, state.store.latest_positions())
        .await
        .map_err(store_failure)?;
    Ok(json_response(StatusCode::OK, &positions))
}

async fn last_position(state: &ApiState, device: &str) -> Result<ApiResponse, ApiResponse> {
    let device_id = DeviceId(parse_id(device, "device id")?);
    let positions = with_timeout(state.store_timeout, state.store.recent_positions(device_id, 1))
        .await
        .map_err(store_failure)?;
    match positions.first() {
        Some(position) => Ok(json_response(StatusCode::OK, position)),
        None => Err(message(StatusCode::NOT_FOUND, "No position found for device.")),
    }
}

async fn history(
    state: &ApiState,
    device: &str,
    query: Option<&str>,
) -> Result<ApiResponse, ApiResponse> {
    let device_id = DeviceId(parse_id(device, "device id")?);
    let HistoryQuery { start, end } = parse_query(query)?;

    let positions =
        with_timeout(state.store_timeout, state.store.position_history(device_id, start, end))
            .await
            .map_err(store_failure)?;
    if positions.is_empty() {
        return Err(message(StatusCode::NOT_FOUND, "No positions found for device in range."));
    }

    Ok(json_response(
        StatusCode::OK,
        &json!({
            "device_id": device_id,
            "count": positions.len(),
            "positions": positions,
        }),
    ))
}

async fn list_alerts(state: &ApiState, query: Option<&str>) -> Result<ApiResponse, ApiResponse> {
    let params: AlertsQuery = parse_query(query)?;
    let device_id = params.device_id.map(DeviceId);
    let limit = params.limit.unwrap_or(DEFAULT_ALERT_LIMIT).min(MAX_ALERT_LIMIT);

    let alerts = with_timeout(state.store_timeout, state.store.list_alerts(device_id, limit))
        .await
        .map_err(store_failure)?;
    Ok(json_response(StatusCode::OK, &alerts))
}

async fn list_devices(state: &ApiState) -> Result<ApiResponse, ApiResponse> {
    let devices = with_timeout(state.store_timeout, state.store.list_devices())
        .await
        .map_err(store_failure)?;
    Ok(json_response(StatusCode::OK, &json!({ "devices": devices })))
}

async fn update_device_status(
    state: &ApiState,
    id: &str,
    body: &[u8],
) -> Result<ApiResponse, ApiResponse> {
    let device_id = DeviceId(parse_id(id, "device id")?);
    let update: DeviceStatusUpdate = parse_json(body)?;

    match with_timeout(state.store_timeout, state.store.set_device_active(device_id, update.active))
        .await
        .map_err(store_failure)?
    {
        Some(device) => {
            info!(device_id = %device.device_id, active = %device.active, "device_status_updated");
            Ok(json_response(
                StatusCode::OK,
                &json!({ "message": "Device status updated.", "device": device }),
            ))
        }
        None => Err(message(StatusCode::NOT_FOUND, "Device not found.")),
    }
}

/// Handle one HTTP request
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ApiState>,
) -> Result<ApiResponse, Infallible> {
    let (parts, body) = req.into_parts();

    let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(path = %parts.uri.path(), error = %e, "api_body_rejected");
            return Ok(message(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large."));
        }
    };

    let response = route(&state, &parts.method, parts.uri.path(), parts.uri.query(), body).await;
    debug!(
        method = %parts.method,
        path = %parts.uri.path(),
        status = %response.status().as_u16(),
        "api_request"
    );
    Ok(response)
}

/// Start the API server; returns when shutdown is signalled
pub async fn start_api_server(
    bind_address: &str,
    port: u16,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{bind_address}:{port}");
    let listener = TcpListener::bind(&addr).await?;

    info!(addr = %addr, site = %state.site_id, "api_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, state.clone()));

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "api_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "api_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("api_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::alert_recorder::AlertRecorder;
    use crate::services::geofence_worker::{create_geofence_workers, GeofenceEngine};
    use crate::services::transition_detector::TransitionDetector;
    use crate::store::MemoryStore;

    fn state(store: Arc<MemoryStore>) -> ApiState {
        let metrics = Arc::new(Metrics::new());
        let timeout = Duration::from_millis(500);
        let engine = Arc::new(GeofenceEngine::new(
            TransitionDetector::new(store.clone(), timeout, metrics.clone()),
            AlertRecorder::new(store.clone(), timeout, metrics.clone()),
            metrics.clone(),
        ));
        let (dispatcher, _workers) = create_geofence_workers(engine, metrics.clone(), 1, 64);
        let ingestor =
            Arc::new(Ingestor::new(store.clone(), Arc::new(dispatcher), metrics.clone(), timeout));
        ApiState { store, ingestor, metrics, site_id: "test".to_string(), store_timeout: timeout }
    }

    async fn call(state: &ApiState, method: Method, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let (path, query) = match uri.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (uri, None),
        };
        let response = route(state, &method, path, query, Bytes::from(body.to_string())).await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    const ZONE_A: &str = r#"{"name":"Zone A","center_latitude":4.6548,"center_longitude":-74.0543,"radius_meters":50}"#;

    #[test]
    fn test_history_query_keeps_offsets() {
        let expected = "2024-01-01T05:00:00Z".parse::<DateTime<Utc>>().unwrap();

        // Unescaped `+` as sent by most clients
        let q: HistoryQuery = parse_query(Some("start=2024-01-01T00:00:00-05:00")).unwrap();
        assert_eq!(q.start, Some(expected));
        let q: HistoryQuery = parse_query(Some("start=2024-01-01T10:00:00+05:00&other=1")).unwrap();
        assert_eq!(q.start, Some(expected));
        let q: HistoryQuery = parse_query(Some("end=2024-01-01T10:00:00%2B05:00")).unwrap();
        assert_eq!(q.end, Some(expected));
        assert!(q.start.is_none());

        let q: HistoryQuery = parse_query(None).unwrap();
        assert!(q.start.is_none() && q.end.is_none());
        assert!(parse_query::<HistoryQuery>(Some("start=yesterday")).is_err());
    }

    #[test]
    fn test_alerts_query() {
        let q: AlertsQuery = parse_query(Some("device_id=7&limit=5")).unwrap();
        assert_eq!(q.device_id, Some(7));
        assert_eq!(q.limit, Some(5));
        assert!(parse_query::<AlertsQuery>(Some("limit=-1")).is_err());
        assert!(parse_query::<AlertsQuery>(Some("device_id=seven")).is_err());
    }

    #[tokio::test]
    async fn test_zone_crud() {
        let store = Arc::new(MemoryStore::new());
        let state = state(store);

        let (status, zone) = call(&state, Method::POST, "/api/zones", ZONE_A).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(zone["alert_on_entry"], true);
        assert_eq!(zone["alert_on_exit"], true);
        let id = zone["zone_id"].as_i64().unwrap();

        let (status, updated) =
            call(&state, Method::PUT, &format!("/api/zones/{id}"), r#"{"radius_meters":75}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["radius_meters"], 75.0);

        let (status, _) = call(&state, Method::PUT, &format!("/api/zones/{id}"), "{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, zones) = call(&state, Method::GET, "/api/zones", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(zones.as_array().unwrap().len(), 1);

        let (status, _) = call(&state, Method::DELETE, &format!("/api/zones/{id}"), "").await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&state, Method::DELETE, &format!("/api/zones/{id}"), "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Zone not found.");
    }

    #[tokio::test]
    async fn test_zone_validation() {
        let state = state(Arc::new(MemoryStore::new()));
        let bad_radius = r#"{"name":"Z","center_latitude":4.6,"center_longitude":-74.0,"radius_meters":0}"#;
        let (status, body) = call(&state, Method::POST, "/api/zones", bad_radius).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("radius"));

        let (status, _) = call(&state, Method::POST, "/api/zones", "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&state, Method::PUT, "/api/zones/abc", r#"{"name":"x"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_location_and_history() {
        let state = state(Arc::new(MemoryStore::new()));

        let (status, _) = call(&state, Method::GET, "/api/history/7/last", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let first = r#"{"device_id":7,"latitude":4.6548,"longitude":-74.0543,"captured_at":"2024-05-01T10:00:00Z"}"#;
        let second = r#"{"device_id":7,"latitude":4.6570,"longitude":-74.0500,"captured_at":"2024-05-01T10:01:00Z"}"#;
        assert_eq!(call(&state, Method::POST, "/api/location", first).await.0, StatusCode::OK);
        assert_eq!(call(&state, Method::POST, "/api/location", second).await.0, StatusCode::OK);

        let (status, last) = call(&state, Method::GET, "/api/history/7/last", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(last["latitude"], 4.6570);

        let (status, history) = call(&state, Method::GET, "/api/history/7", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["count"], 2);
        assert_eq!(history["positions"][0]["latitude"], 4.6548);

        let (status, _) =
            call(&state, Method::GET, "/api/history/7?start=2024-05-01T10:00:30Z", "").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) =
            call(&state, Method::GET, "/api/history/7?end=2024-05-01T09:00:00Z", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&state, Method::GET, "/api/history/7?start=yesterday", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, all) = call(&state, Method::GET, "/api/history/last", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(all.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_history_with_offset_timestamp() {
        let state = state(Arc::new(MemoryStore::new()));
        let report = r#"{"device_id":3,"latitude":4.6548,"longitude":-74.0543,"captured_at":"2024-05-01T10:00:00Z"}"#;
        assert_eq!(call(&state, Method::POST, "/api/location", report).await.0, StatusCode::OK);

        // 10:30+01:00 is 09:30Z, so the 10:00Z report is in range
        let (status, history) =
            call(&state, Method::GET, "/api/history/3?start=2024-05-01T10:30:00+01:00", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["count"], 1);

        let (status, _) = call(&state, Method::GET, "/api/alerts?limit=abc", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, alerts) = call(&state, Method::GET, "/api/alerts?device_id=3&limit=10", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(alerts.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_device_admin() {
        let state = state(Arc::new(MemoryStore::new()));
        let (status, body) = call(&state, Method::GET, "/api/admin/devices", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["devices"].as_array().unwrap().is_empty());

        for device in [1, 2] {
            let report = format!(r#"{{"device_id":{device},"latitude":4.6548,"longitude":-74.0543}}"#);
            assert_eq!(call(&state, Method::POST, "/api/location", &report).await.0, StatusCode::OK);
        }
        let (_, body) = call(&state, Method::GET, "/api/admin/devices", "").await;
        let devices = body["devices"].as_array().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0]["device_id"], 1);
        assert_eq!(devices[0]["active"], true);

        let (status, body) =
            call(&state, Method::PUT, "/api/admin/devices/2/status", r#"{"active":false}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["device"]["active"], false);

        // Deactivated devices drop out of the latest-positions view
        let (_, latest) = call(&state, Method::GET, "/api/history/last", "").await;
        let latest = latest.as_array().unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0]["device_id"], 1);

        let (status, body) =
            call(&state, Method::PUT, "/api/admin/devices/99/status", r#"{"active":true}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Device not found.");
        let (status, _) = call(&state, Method::PUT, "/api/admin/devices/2/status", "{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) =
            call(&state, Method::PUT, "/api/admin/devices/x/status", r#"{"active":true}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_location_rejects_bad_coordinates() {
        let state = state(Arc::new(MemoryStore::new()));
        let body = r#"{"device_id":1,"latitude":123.0,"longitude":0.0}"#;
        let (status, reply) = call(&state, Method::POST, "/api/location", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(reply["message"].as_str().unwrap().contains("invalid coordinate"));
    }

    #[tokio::test]
    async fn test_store_failure_is_500() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let state = state(store);
        let (status, body) = call(&state, Method::GET, "/api/zones", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "Internal server error.");
    }

    #[tokio::test]
    async fn test_health_metrics_and_unknown() {
        let state = state(Arc::new(MemoryStore::new()));

        let response = route(&state, &Method::GET, "/health", None, Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = route(&state, &Method::GET, "/metrics", None, Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = response.into_body().collect().await.unwrap().to_bytes();
        assert!(std::str::from_utf8(&text).unwrap().contains("geofence_evaluations_total{site=\"test\"}"));

        assert_eq!(call(&state, Method::GET, "/nope", "").await.0, StatusCode::NOT_FOUND);
        assert_eq!(call(&state, Method::PATCH, "/api/zones/1", "").await.0, StatusCode::NOT_FOUND);
    }
}
