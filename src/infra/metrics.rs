//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Counter updates are lock-free; reporting swaps the per-interval values
//! to get a consistent snapshot. The Prometheus exposition reads a
//! cumulative latency histogram and never resets anything.
//!
//! NOTE: All atomics use Relaxed ordering - these are statistical counters
//! only. Do NOT use them for coordination or logic decisions.

use crate::domain::TransitionKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Positions accepted by ingestion (monotonic)
    positions_ingested: AtomicU64,
    /// Positions rejected for invalid coordinates (monotonic)
    positions_rejected: AtomicU64,
    /// Evaluation passes completed (monotonic)
    evaluations_total: AtomicU64,
    /// Evaluation passes aborted on store failure (monotonic)
    evaluations_aborted: AtomicU64,
    /// Zones skipped because of invalid geometry (monotonic)
    zone_errors: AtomicU64,
    transitions_entered: AtomicU64,
    transitions_exited: AtomicU64,
    alerts_recorded: AtomicU64,
    /// Alerts suppressed by the natural-key check (monotonic)
    alerts_duplicate: AtomicU64,
    alerts_failed: AtomicU64,
    /// Evaluation jobs merged into a shard backlog because the queue was full (monotonic)
    eval_jobs_deferred: AtomicU64,
    /// Evaluations since last report (reset on report)
    evals_since_report: AtomicU64,
    /// Sum of evaluation latencies in microseconds (reset on report)
    eval_latency_sum_us: AtomicU64,
    /// Max evaluation latency in microseconds (reset on report)
    eval_latency_max_us: AtomicU64,
    /// Evaluation latency histogram buckets (reset on report)
    eval_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Evaluation latency histogram since start (monotonic)
    eval_latency_buckets_total: [AtomicU64; NUM_BUCKETS],
    /// Sum of all evaluation latencies in microseconds (monotonic)
    eval_latency_sum_total_us: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            positions_ingested: AtomicU64::new(0),
            positions_rejected: AtomicU64::new(0),
            evaluations_total: AtomicU64::new(0),
            evaluations_aborted: AtomicU64::new(0),
            zone_errors: AtomicU64::new(0),
            transitions_entered: AtomicU64::new(0),
            transitions_exited: AtomicU64::new(0),
            alerts_recorded: AtomicU64::new(0),
            alerts_duplicate: AtomicU64::new(0),
            alerts_failed: AtomicU64::new(0),
            eval_jobs_deferred: AtomicU64::new(0),
            evals_since_report: AtomicU64::new(0),
            eval_latency_sum_us: AtomicU64::new(0),
            eval_latency_max_us: AtomicU64::new(0),
            eval_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            eval_latency_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            eval_latency_sum_total_us: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_position_ingested(&self) {
        self.positions_ingested.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_position_rejected(&self) {
        self.positions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed evaluation pass with its latency (lock-free)
    #[inline]
    pub fn record_evaluation(&self, latency_us: u64) {
        self.evaluations_total.fetch_add(1, Ordering::Relaxed);
        self.evals_since_report.fetch_add(1, Ordering::Relaxed);
        self.eval_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.eval_latency_sum_total_us.fetch_add(latency_us, Ordering::Relaxed);
        let bucket = bucket_index(latency_us);
        self.eval_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.eval_latency_buckets_total[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.eval_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_evaluation_aborted(&self) {
        self.evaluations_aborted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_zone_error(&self) {
        self.zone_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transition(&self, kind: TransitionKind) {
        match kind {
            TransitionKind::Entered => self.transitions_entered.fetch_add(1, Ordering::Relaxed),
            TransitionKind::Exited => self.transitions_exited.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[inline]
    pub fn record_alert_recorded(&self) {
        self.alerts_recorded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_duplicate(&self) {
        self.alerts_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_failed(&self) {
        self.alerts_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_eval_job_deferred(&self) {
        self.eval_jobs_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn positions_ingested(&self) -> u64 {
        self.positions_ingested.load(Ordering::Relaxed)
    }

    pub fn evaluations_total(&self) -> u64 {
        self.evaluations_total.load(Ordering::Relaxed)
    }

    pub fn evaluations_aborted(&self) -> u64 {
        self.evaluations_aborted.load(Ordering::Relaxed)
    }

    pub fn zone_errors(&self) -> u64 {
        self.zone_errors.load(Ordering::Relaxed)
    }

    pub fn alerts_recorded(&self) -> u64 {
        self.alerts_recorded.load(Ordering::Relaxed)
    }

    pub fn alerts_duplicate(&self) -> u64 {
        self.alerts_duplicate.load(Ordering::Relaxed)
    }

    pub fn alerts_failed(&self) -> u64 {
        self.alerts_failed.load(Ordering::Relaxed)
    }

    pub fn eval_jobs_deferred(&self) -> u64 {
        self.eval_jobs_deferred.load(Ordering::Relaxed)
    }

    /// Take a snapshot; per-interval values (latency histogram) are reset
    pub fn report(&self) -> MetricsSummary {
        let now = Instant::now();
        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = now.duration_since(*last).as_secs_f64();
            *last = now;
            elapsed
        };

        let interval = IntervalValues {
            evals: self.evals_since_report.swap(0, Ordering::Relaxed),
            latency_sum: self.eval_latency_sum_us.swap(0, Ordering::Relaxed),
            latency_max: self.eval_latency_max_us.swap(0, Ordering::Relaxed),
            buckets: swap_buckets(&self.eval_latency_buckets),
        };
        self.summarize(interval, elapsed_secs)
    }

    /// Read the current values without starting a new interval
    pub fn snapshot(&self) -> MetricsSummary {
        let elapsed_secs = self.last_report_time.lock().elapsed().as_secs_f64();
        let interval = IntervalValues {
            evals: self.evals_since_report.load(Ordering::Relaxed),
            latency_sum: self.eval_latency_sum_us.load(Ordering::Relaxed),
            latency_max: self.eval_latency_max_us.load(Ordering::Relaxed),
            buckets: load_buckets(&self.eval_latency_buckets),
        };
        self.summarize(interval, elapsed_secs)
    }

    fn summarize(&self, interval: IntervalValues, elapsed_secs: f64) -> MetricsSummary {
        let evals = interval.evals;
        MetricsSummary {
            positions_ingested: self.positions_ingested.load(Ordering::Relaxed),
            positions_rejected: self.positions_rejected.load(Ordering::Relaxed),
            evaluations_total: self.evaluations_total.load(Ordering::Relaxed),
            evaluations_aborted: self.evaluations_aborted.load(Ordering::Relaxed),
            zone_errors: self.zone_errors.load(Ordering::Relaxed),
            transitions_entered: self.transitions_entered.load(Ordering::Relaxed),
            transitions_exited: self.transitions_exited.load(Ordering::Relaxed),
            alerts_recorded: self.alerts_recorded.load(Ordering::Relaxed),
            alerts_duplicate: self.alerts_duplicate.load(Ordering::Relaxed),
            alerts_failed: self.alerts_failed.load(Ordering::Relaxed),
            eval_jobs_deferred: self.eval_jobs_deferred.load(Ordering::Relaxed),
            evals_per_sec: if elapsed_secs > 0.0 { evals as f64 / elapsed_secs } else { 0.0 },
            eval_latency_avg_us: if evals > 0 { interval.latency_sum / evals } else { 0 },
            eval_latency_max_us: interval.latency_max,
            eval_latency_p50_us: percentile_from_buckets(&interval.buckets, 0.50),
            eval_latency_p99_us: percentile_from_buckets(&interval.buckets, 0.99),
            eval_latency_buckets: interval.buckets,
            eval_latency_buckets_total: load_buckets(&self.eval_latency_buckets_total),
            eval_latency_sum_total_us: self.eval_latency_sum_total_us.load(Ordering::Relaxed),
        }
    }
}

struct IntervalValues {
    evals: u64,
    latency_sum: u64,
    latency_max: u64,
    buckets: [u64; NUM_BUCKETS],
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub positions_ingested: u64,
    pub positions_rejected: u64,
    pub evaluations_total: u64,
    pub evaluations_aborted: u64,
    pub zone_errors: u64,
    pub transitions_entered: u64,
    pub transitions_exited: u64,
    pub alerts_recorded: u64,
    pub alerts_duplicate: u64,
    pub alerts_failed: u64,
    pub eval_jobs_deferred: u64,
    pub evals_per_sec: f64,
    pub eval_latency_avg_us: u64,
    pub eval_latency_max_us: u64,
    pub eval_latency_p50_us: u64,
    pub eval_latency_p99_us: u64,
    /// Interval histogram (reset on report)
    pub eval_latency_buckets: [u64; NUM_BUCKETS],
    /// Histogram since start
    pub eval_latency_buckets_total: [u64; NUM_BUCKETS],
    pub eval_latency_sum_total_us: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            positions_ingested = %self.positions_ingested,
            positions_rejected = %self.positions_rejected,
            evaluations = %self.evaluations_total,
            evaluations_aborted = %self.evaluations_aborted,
            evals_per_sec = %format!("{:.1}", self.evals_per_sec),
            eval_avg_us = %self.eval_latency_avg_us,
            eval_p99_us = %self.eval_latency_p99_us,
            eval_max_us = %self.eval_latency_max_us,
            entered = %self.transitions_entered,
            exited = %self.transitions_exited,
            alerts_recorded = %self.alerts_recorded,
            alerts_duplicate = %self.alerts_duplicate,
            alerts_failed = %self.alerts_failed,
            zone_errors = %self.zone_errors,
            jobs_deferred = %self.eval_jobs_deferred,
            "metrics"
        );
    }
}
