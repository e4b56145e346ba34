//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_connections_accepted_total` (counter)
//! - `proxy_active_connections` (gauge)
//! - `proxy_rejections_total` (counter): by error kind
//! - `proxy_relay_outcomes_total` (counter): by end reason
//! - `proxy_relay_bytes_total` (counter): by direction
//! - `proxy_relay_duration_seconds` (histogram)
//! - `proxy_pool_leases_total` (counter): by result
//! - `proxy_config_reloads_total` (counter): by result
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed
//! - Labels are low-cardinality (kinds and reasons, never targets or peers)

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with its own HTTP listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_accepted() {
    counter!("proxy_connections_accepted_total").increment(1);
}

pub fn record_active_connections(active: usize) {
    gauge!("proxy_active_connections").set(active as f64);
}

pub fn record_rejection(kind: &'static str) {
    counter!("proxy_rejections_total", "kind" => kind).increment(1);
}

pub fn record_relay(end: &'static str, to_upstream: u64, to_client: u64, elapsed: Duration) {
    counter!("proxy_relay_outcomes_total", "end" => end).increment(1);
    counter!("proxy_relay_bytes_total", "direction" => "to_upstream").increment(to_upstream);
    counter!("proxy_relay_bytes_total", "direction" => "to_client").increment(to_client);
    histogram!("proxy_relay_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_pool_lease(result: &'static str) {
    counter!("proxy_pool_leases_total", "result" => result).increment(1);
}

pub fn record_reload(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!("proxy_config_reloads_total", "result" => result).increment(1);
}
