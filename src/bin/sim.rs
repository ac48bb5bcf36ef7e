//! Device simulator - posts a route of location reports to the engine
//!
//! Walks a fixed route (by default a short walk in Bogotá that starts at the
//! center of the sample zone and leaves it) and posts one report per
//! interval to `POST /api/location`.
//!
//! Usage:
//!   cargo run --bin geofence-sim -- --device-id 7 --interval-ms 500
//!   cargo run --bin geofence-sim -- --loop --seed-zone

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Default route: leaves a 50 m zone centered on the first point
const ROUTE: [(f64, f64); 7] = [
    (4.6548, -74.0543),
    (4.6548, -74.0530),
    (4.6549, -74.0520),
    (4.6555, -74.0515),
    (4.6560, -74.0510),
    (4.6565, -74.0505),
    (4.6570, -74.0500),
];

#[derive(Parser, Debug)]
#[command(name = "geofence-sim")]
#[command(about = "Device simulator for the geofence engine")]
struct Args {
    /// Engine base URL
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    url: String,

    /// Device id to report as
    #[arg(long, default_value_t = 1)]
    device_id: i64,

    /// Delay between reports in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Walk the route back and forth until interrupted
    #[arg(long = "loop")]
    repeat: bool,

    /// Create the sample zone around the route start before reporting
    #[arg(long)]
    seed_zone: bool,

    /// HTTP request timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,
}

struct Simulator {
    client: reqwest::Client,
    base_url: String,
    device_id: i64,
}

impl Simulator {
    fn new(args: &Args) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(args.timeout_ms))
            .http1_only()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: args.url.trim_end_matches('/').to_string(),
            device_id: args.device_id,
        })
    }

    async fn seed_zone(&self) -> anyhow::Result<()> {
        let (lat, lon) = ROUTE[0];
        let response = self
            .client
            .post(format!("{}/api/zones", self.base_url))
            .json(&json!({
                "name": "Zone A",
                "center_latitude": lat,
                "center_longitude": lon,
                "radius_meters": 50.0,
            }))
            .send()
            .await
            .context("Failed to create zone")?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            anyhow::bail!("zone creation rejected ({status}): {body}");
        }
        info!(zone_id = %body["zone_id"], "sim_zone_created");
        Ok(())
    }

    async fn send_location(&self, lat: f64, lon: f64) {
        let report = json!({
            "device_id": self.device_id,
            "latitude": lat,
            "longitude": lon,
            "captured_at": Utc::now().to_rfc3339(),
        });

        match self.client.post(format!("{}/api/location", self.base_url)).json(&report).send().await {
            Ok(response) if response.status().is_success() => {
                info!(device_id = %self.device_id, lat = %lat, lon = %lon, "sim_location_sent");
            }
            Ok(response) => {
                let status = response.status();
                let body: Value = response.json().await.unwrap_or(Value::Null);
                warn!(status = %status, message = %body["message"], "sim_location_rejected");
            }
            Err(e) => error!(error = %e, lat = %lat, lon = %lon, "sim_location_failed"),
        }
    }

    async fn print_alerts(&self) {
        let url = format!("{}/api/alerts?device_id={}&limit=20", self.base_url, self.device_id);
        match self.client.get(url).send().await {
            Ok(response) => match response.json::<Vec<Value>>().await {
                Ok(alerts) => {
                    for alert in alerts.iter().rev() {
                        info!(
                            kind = %alert["kind"],
                            description = %alert["description"],
                            position_at = %alert["position_at"],
                            "sim_alert"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "sim_alerts_unreadable"),
            },
            Err(e) => warn!(error = %e, "sim_alerts_failed"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let sim = Simulator::new(&args)?;
    let interval = Duration::from_millis(args.interval_ms);

    info!(url = %sim.base_url, device_id = %sim.device_id, points = %ROUTE.len(), "sim_starting");

    if args.seed_zone {
        sim.seed_zone().await?;
    }

    let mut forward = true;
    loop {
        let points: Vec<(f64, f64)> =
            if forward { ROUTE.to_vec() } else { ROUTE.iter().rev().copied().collect() };
        for (lat, lon) in points {
            sim.send_location(lat, lon).await;
            tokio::time::sleep(interval).await;
        }
        if !args.repeat {
            break;
        }
        forward = !forward;
    }

    sim.print_alerts().await;
    info!("sim_finished");
    Ok(())
}
