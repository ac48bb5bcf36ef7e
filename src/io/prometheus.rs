//! Prometheus text exposition for engine metrics
//!
//! Served by the HTTP API at /metrics. Every series carries a `site` label.
//! A scrape only reads; the periodic log summary keeps its own interval.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use std::fmt::Write;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a counter split by a single extra label
fn write_labeled_counter(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    label: &str,
    values: &[(&str, u64)],
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (value, count) in values {
        let _ = writeln!(output, "{name}{{site=\"{site}\",{label}=\"{value}\"}} {count}");
    }
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_ingest_metrics(&mut output, site_id, &summary);
    write_evaluation_metrics(&mut output, site_id, &summary);
    write_alert_metrics(&mut output, site_id, &summary);

    output
}

fn write_ingest_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_positions_ingested_total",
        "Location reports stored",
        MetricType::Counter,
        site,
        summary.positions_ingested,
    );
    write_metric(
        output,
        "geofence_positions_rejected_total",
        "Location reports rejected for invalid coordinates",
        MetricType::Counter,
        site,
        summary.positions_rejected,
    );
    write_metric(
        output,
        "geofence_eval_jobs_deferred_total",
        "Evaluation jobs merged into a shard backlog because the queue was full",
        MetricType::Counter,
        site,
        summary.eval_jobs_deferred,
    );
}

fn write_evaluation_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_evaluations_total",
        "Completed evaluation passes",
        MetricType::Counter,
        site,
        summary.evaluations_total,
    );
    write_metric(
        output,
        "geofence_evaluations_aborted_total",
        "Evaluation passes aborted by a store failure",
        MetricType::Counter,
        site,
        summary.evaluations_aborted,
    );
    write_metric(
        output,
        "geofence_zone_errors_total",
        "Zones skipped for invalid geometry",
        MetricType::Counter,
        site,
        summary.zone_errors,
    );
    write_labeled_counter(
        output,
        "geofence_transitions_total",
        "Detected zone transitions",
        site,
        "kind",
        &[("ZONE_ENTRY", summary.transitions_entered), ("ZONE_EXIT", summary.transitions_exited)],
    );

    write_histogram(
        output,
        "geofence_eval_latency_us",
        "Evaluation pass latency in microseconds",
        site,
        &summary.eval_latency_buckets_total,
        summary.eval_latency_sum_total_us,
    );
    write_metric(
        output,
        "geofence_eval_latency_p99_us",
        "99th percentile evaluation latency since the last log summary",
        MetricType::Gauge,
        site,
        summary.eval_latency_p99_us,
    );
    write_metric(
        output,
        "geofence_eval_latency_max_us",
        "Maximum evaluation latency since the last log summary",
        MetricType::Gauge,
        site,
        summary.eval_latency_max_us,
    );
}

fn write_alert_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_alerts_recorded_total",
        "Alerts persisted",
        MetricType::Counter,
        site,
        summary.alerts_recorded,
    );
    write_metric(
        output,
        "geofence_alerts_duplicate_total",
        "Alerts skipped because the same transition was already recorded",
        MetricType::Counter,
        site,
        summary.alerts_duplicate,
    );
    write_metric(
        output,
        "geofence_alerts_failed_total",
        "Alert writes that failed",
        MetricType::Counter,
        site,
        summary.alerts_failed,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransitionKind;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_position_ingested();
        metrics.record_evaluation(150);
        metrics.record_evaluation(250);
        metrics.record_transition(TransitionKind::Exited);
        metrics.record_alert_recorded();

        let output = format_prometheus_metrics(&metrics, "bogota");

        assert!(output.contains("geofence_positions_ingested_total{site=\"bogota\"} 1"));
        assert!(output.contains("geofence_evaluations_total{site=\"bogota\"} 2"));
        assert!(output.contains("geofence_transitions_total{site=\"bogota\",kind=\"ZONE_EXIT\"} 1"));
        assert!(output.contains("geofence_transitions_total{site=\"bogota\",kind=\"ZONE_ENTRY\"} 0"));
        assert!(output.contains("geofence_eval_latency_us_bucket{site=\"bogota\",le=\"+Inf\"} 2"));
        assert!(output.contains("geofence_alerts_recorded_total{site=\"bogota\"} 1"));
        assert!(output.contains("geofence_eval_latency_us_sum{site=\"bogota\"} 400"));
    }

    #[test]
    fn test_scrape_does_not_reset_histogram() {
        let metrics = Metrics::new();
        metrics.record_evaluation(150);

        let first = format_prometheus_metrics(&metrics, "bogota");
        let second = format_prometheus_metrics(&metrics, "bogota");
        assert_eq!(first, second);

        metrics.report();
        let after_log = format_prometheus_metrics(&metrics, "bogota");
        assert!(after_log.contains("geofence_eval_latency_us_count{site=\"bogota\"} 1"));
    }
}
