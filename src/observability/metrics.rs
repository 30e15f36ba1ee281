//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define balancer metrics (connections, operations, backend pools)
//! - Expose Prometheus-compatible metrics endpoint
//! - Track per-backend and aggregate metrics
//!
//! # Metrics
//! - `ldap_balancer_connections_total` (counter): accepted or opened, by kind
//! - `ldap_balancer_connections_closed_total` (counter): torn down, by kind
//! - `ldap_balancer_operations_total` (counter): freed operations, by outcome
//! - `ldap_balancer_backend_connects_total` (counter): by backend, result
//! - `ldap_balancer_backend_connections` (gauge): ready connections, by backend and pool
//! - `ldap_balancer_backend_waiting` (gauge): queued requests, by backend
//! - `ldap_balancer_backend_failed` (gauge): 1 while in backoff
//! - `ldap_balancer_listener_muted_total` (counter): descriptor exhaustion events

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::load_balancer::backend::BackendStats;
use crate::net::connection::ConnectionKind;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection_opened(kind: ConnectionKind) {
    metrics::counter!("ldap_balancer_connections_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_connection_closed(kind: ConnectionKind) {
    metrics::counter!("ldap_balancer_connections_closed_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_operation(outcome: &'static str) {
    metrics::counter!("ldap_balancer_operations_total", "outcome" => outcome).increment(1);
}

pub fn record_backend_connect(backend: &str, success: bool) {
    let result = if success { "success" } else { "failure" };
    metrics::counter!(
        "ldap_balancer_backend_connects_total",
        "backend" => backend.to_string(),
        "result" => result
    )
    .increment(1);
}

pub fn record_backend_pool(backend: &str, stats: &BackendStats) {
    metrics::gauge!("ldap_balancer_backend_connections", "backend" => backend.to_string(), "pool" => "open")
        .set(stats.open as f64);
    metrics::gauge!("ldap_balancer_backend_connections", "backend" => backend.to_string(), "pool" => "bind")
        .set(stats.bind as f64);
    metrics::gauge!("ldap_balancer_backend_waiting", "backend" => backend.to_string()).set(stats.waiting as f64);
    metrics::gauge!("ldap_balancer_backend_failed", "backend" => backend.to_string())
        .set(if stats.failed { 1.0 } else { 0.0 });
}

pub fn record_listener_muted(url: &str) {
    metrics::counter!("ldap_balancer_listener_muted_total", "listener" => url.to_string()).increment(1);
}
