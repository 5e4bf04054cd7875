//! Metrics collection and exposition.
//!
//! # Metrics
//! - `nodeplane_provisioning_total` (counter): document mutations by op, outcome
//! - `nodeplane_restarts_total` (counter): proxy restarts by outcome
//! - `nodeplane_node_reachable` (gauge): 1=reachable, 0=unreachable, per node
//! - `nodeplane_active_sessions` (gauge): credentials with live counters, per node
//! - `nodeplane_log_lines_skipped_total` (counter): unreadable usage lines
//! - `nodeplane_usage_regressions_total` (counter): measured usage below stored usage
//! - `nodeplane_deactivations_total` (counter): automatic deactivations by reason
//! - `nodeplane_cycle_seconds` (histogram): periodic job duration by job
//!
//! Recording is a no-op until a recorder is installed.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::registry::NodeId;

/// Install the Prometheus recorder with an HTTP scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_provisioning(op: &'static str, outcome: &'static str) {
    counter!("nodeplane_provisioning_total", "op" => op, "outcome" => outcome).increment(1);
}

pub fn record_restart(ok: bool) {
    let outcome = if ok { "ok" } else { "failed" };
    counter!("nodeplane_restarts_total", "outcome" => outcome).increment(1);
}

pub fn set_node_reachable(node: NodeId, reachable: bool) {
    gauge!("nodeplane_node_reachable", "node" => node.to_string())
        .set(if reachable { 1.0 } else { 0.0 });
}

pub fn set_active_sessions(node: NodeId, count: usize) {
    gauge!("nodeplane_active_sessions", "node" => node.to_string()).set(count as f64);
}

pub fn record_skipped_log_lines(count: u64) {
    counter!("nodeplane_log_lines_skipped_total").increment(count);
}

pub fn record_usage_regression() {
    counter!("nodeplane_usage_regressions_total").increment(1);
}

pub fn record_deactivation(reason: &'static str) {
    counter!("nodeplane_deactivations_total", "reason" => reason).increment(1);
}

pub fn record_cycle(job: &'static str, elapsed: Duration) {
    histogram!("nodeplane_cycle_seconds", "job" => job).record(elapsed.as_secs_f64());
}
