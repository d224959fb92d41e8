//! Prometheus metrics (`metrics` + `metrics-exporter-prometheus`): one
//! global recorder installed at startup, a `/metrics` handler rendering it,
//! and named helper functions at each call site rather than inline
//! `counter!`/`gauge!` calls scattered through business logic.

use axum::{http::StatusCode, response::IntoResponse};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() {
    let handle = PrometheusBuilder::new().install_recorder().expect("failed to install prometheus recorder");
    PROMETHEUS_HANDLE.set(handle).expect("prometheus handle already initialized");
    tracing::info!("prometheus metrics initialized");
}

pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized".to_string()),
    }
}

// ------------------------------------------------------------
// Rate limiter (§4.1)
// ------------------------------------------------------------

pub fn record_rate_limit_decision(allowed: bool) {
    let outcome = if allowed { "allowed" } else { "denied" };
    counter!("veza_rate_limit_decisions_total", "outcome" => outcome).increment(1);
}

pub fn record_rate_limit_degraded(degraded: bool) {
    gauge!("veza_rate_limit_degraded").set(if degraded { 1.0 } else { 0.0 });
}

pub fn record_ban_set() {
    counter!("veza_rate_limit_bans_total").increment(1);
}

// ------------------------------------------------------------
// RPC fabric (§4.2)
// ------------------------------------------------------------

pub fn record_rpc_call(service: &str, outcome: &str) {
    counter!("veza_rpc_calls_total", "service" => service.to_string(), "outcome" => outcome.to_string()).increment(1);
}

pub fn record_circuit_state(service: &str, state: &str) {
    gauge!("veza_circuit_state", "service" => service.to_string(), "state" => state.to_string()).set(1.0);
}

// ------------------------------------------------------------
// Event bus (§4.3)
// ------------------------------------------------------------

pub fn record_event_published(subject: &str) {
    counter!("veza_events_published_total", "subject" => subject.to_string()).increment(1);
}

pub fn record_event_dlq(subject: &str) {
    counter!("veza_events_dlq_total", "subject" => subject.to_string()).increment(1);
}

// ------------------------------------------------------------
// Notifications (§4.5)
// ------------------------------------------------------------

pub fn record_notification_delivered(kind: &str) {
    counter!("veza_notifications_delivered_total", "type" => kind.to_string()).increment(1);
}

pub fn record_notification_dlq(kind: &str) {
    counter!("veza_notifications_dlq_total", "type" => kind.to_string()).increment(1);
}

// ------------------------------------------------------------
// Analytics / read-replica router (§4.7)
// ------------------------------------------------------------

pub fn record_query_duration(category: &str, replica: &str, duration_seconds: f64) {
    histogram!("veza_analytics_query_duration_seconds", "category" => category.to_string(), "replica" => replica.to_string())
        .record(duration_seconds);
}

pub fn record_slow_query(category: &str) {
    counter!("veza_analytics_slow_queries_total", "category" => category.to_string()).increment(1);
}

pub fn set_replica_health(replica: &str, healthy: bool) {
    gauge!("veza_analytics_replica_health", "replica" => replica.to_string()).set(if healthy { 1.0 } else { 0.0 });
}

pub fn set_concurrent_queries(count: i64) {
    gauge!("veza_analytics_concurrent_queries").set(count as f64);
}

pub fn record_data_volume(category: &str, rows: f64) {
    histogram!("veza_analytics_data_volume_rows", "category" => category.to_string()).record(rows);
}

/// Times a request/query and records duration on drop.
pub struct QueryTimer {
    start: Instant,
    category: String,
    replica: String,
}

impl QueryTimer {
    pub fn start(category: &str, replica: &str) -> Self {
        Self { start: Instant::now(), category: category.to_string(), replica: replica.to_string() }
    }
}

impl Drop for QueryTimer {
    fn drop(&mut self) {
        record_query_duration(&self.category, &self.replica, self.start.elapsed().as_secs_f64());
    }
}
