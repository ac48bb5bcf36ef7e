//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument (parsed by clap in main)
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::NewZone;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Sqlite => "sqlite",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Site identifier used as the metrics label
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "geofence".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { bind_address: default_bind_address(), port: default_http_port() }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    /// Database file for the sqlite backend
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Upper bound for a single store call made by the evaluator
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_store_path() -> String {
    "data/geofence.db".to_string()
}

fn default_store_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeofenceConfig {
    /// Number of evaluation shards (one worker task each)
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bounded queue size per shard
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self { workers: default_workers(), queue_capacity: default_queue_capacity() }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AlertsConfig {
    /// JSONL mirror of recorded alerts (empty to disable)
    #[serde(default)]
    pub egress_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub geofence: GeofenceConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Zones created at startup when the store holds none
    #[serde(default)]
    pub zones: Vec<NewZone>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    http_bind_address: String,
    http_port: u16,
    store_backend: StoreBackend,
    store_path: String,
    store_timeout_ms: u64,
    geofence_workers: usize,
    geofence_queue_capacity: usize,
    alerts_egress_file: String,
    metrics_interval_secs: u64,
    seed_zones: Vec<NewZone>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            http_bind_address: toml_config.http.bind_address,
            http_port: toml_config.http.port,
            store_backend: toml_config.store.backend,
            store_path: toml_config.store.path,
            store_timeout_ms: toml_config.store.timeout_ms.max(1),
            geofence_workers: toml_config.geofence.workers.max(1),
            geofence_queue_capacity: toml_config.geofence.queue_capacity.max(1),
            alerts_egress_file: toml_config.alerts.egress_file,
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            seed_zones: toml_config.zones,
            config_file,
        }
    }

    /// Config file path when none is given on the command line
    pub fn default_config_path() -> String {
        env::var("CONFIG_FILE").unwrap_or_else(|_| "config/dev.toml".to_string())
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        for (i, zone) in toml_config.zones.iter().enumerate() {
            zone.validate()
                .with_context(|| format!("Invalid seed zone #{} ({}) in {}", i, zone.name, path.display()))?;
        }

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration from a path, falling back to defaults on error
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed: using defaults");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn http_bind_address(&self) -> &str {
        &self.http_bind_address
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn store_backend(&self) -> StoreBackend {
        self.store_backend
    }

    pub fn store_path(&self) -> &str {
        &self.store_path
    }

    pub fn store_timeout_ms(&self) -> u64 {
        self.store_timeout_ms
    }

    pub fn geofence_workers(&self) -> usize {
        self.geofence_workers
    }

    pub fn geofence_queue_capacity(&self) -> usize {
        self.geofence_queue_capacity
    }

    /// JSONL alert mirror path, `None` when disabled
    pub fn alerts_egress_file(&self) -> Option<&str> {
        if self.alerts_egress_file.is_empty() {
            None
        } else {
            Some(&self.alerts_egress_file)
        }
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn seed_zones(&self) -> &[NewZone] {
        &self.seed_zones
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}
