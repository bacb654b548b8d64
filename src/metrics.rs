//! Prometheus metrics for resource engine observability.

use metrics::{counter, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a check build creation.
pub fn check_build_created(trigger: &str) {
    counter!("resource_check_builds_total", "trigger" => trigger.to_string()).increment(1);
}

/// Record a suppressed check build (a prior check is still running).
pub fn check_build_suppressed() {
    counter!("resource_check_builds_suppressed_total").increment(1);
}

/// Record versions appended to a scope ledger.
pub fn versions_saved(count: usize) {
    counter!("resource_versions_saved_total").increment(count as u64);
}

/// Record check step duration.
pub fn check_duration(duration_ms: u64) {
    histogram!("resource_check_duration_ms").record(duration_ms as f64);
}

/// Record jobs bumped for rescheduling.
pub fn schedule_requested(count: usize) {
    counter!("resource_schedule_requested_total").increment(count as u64);
}

/// Record a processed watch notification.
pub fn watch_event(table: &str) {
    counter!("resource_watch_events_total", "table" => table.to_string()).increment(1);
}

/// Record a bus reconnect (subscribers were reset).
pub fn bus_reconnect() {
    counter!("resource_bus_reconnects_total").increment(1);
}
