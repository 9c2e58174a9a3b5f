//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Ledger submissions and precondition rejections
//! - Settlement outcomes, latency and status-query errors
//! - Finished workflows
//! - Dependency health

use crate::error::{CoordinatorError, CoordinatorResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, register_histogram,
    Counter, CounterVec, Encoder, GaugeVec, Histogram, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    pub static ref OPERATIONS_SUBMITTED: CounterVec = register_counter_vec!(
        "microloan_operations_submitted_total",
        "Ledger operations submitted",
        &["task_type", "action"]
    ).unwrap();

    pub static ref PRECONDITION_REJECTIONS: CounterVec = register_counter_vec!(
        "microloan_precondition_rejections_total",
        "Ledger operations rejected before submission",
        &["action"]
    ).unwrap();

    pub static ref SETTLEMENTS: CounterVec = register_counter_vec!(
        "microloan_settlements_total",
        "Terminal settlement observations by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref SETTLEMENT_POLL_ERRORS: Counter = register_counter!(
        "microloan_settlement_poll_errors_total",
        "Failed settlement status queries"
    ).unwrap();

    pub static ref SETTLEMENT_LATENCY: Histogram = register_histogram!(
        "microloan_settlement_latency_seconds",
        "Time from the start of a wait to the terminal status",
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).unwrap();

    pub static ref TASKS_FINISHED: CounterVec = register_counter_vec!(
        "microloan_tasks_finished_total",
        "Tasks reaching a terminal progress",
        &["task_type", "progress"]
    ).unwrap();

    pub static ref COMPONENT_HEALTHY: GaugeVec = register_gauge_vec!(
        "microloan_component_healthy",
        "Dependency health (1=healthy, 0=unhealthy)",
        &["component"]
    ).unwrap();

    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "microloan_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "microloan_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> CoordinatorResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CoordinatorError::Config(format!("binding {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| CoordinatorError::Internal(format!("metrics server: {}", e)))
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Text exposition of every registered collector
pub fn render() -> CoordinatorResult<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| CoordinatorError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| CoordinatorError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_operation_submitted(task_type: &str, action: &str) {
    OPERATIONS_SUBMITTED
        .with_label_values(&[task_type, action])
        .inc();
}

pub fn record_precondition_rejection(action: &str) {
    PRECONDITION_REJECTIONS.with_label_values(&[action]).inc();
}

pub fn record_settlement(outcome: &str, latency_secs: f64) {
    SETTLEMENTS.with_label_values(&[outcome]).inc();
    SETTLEMENT_LATENCY.observe(latency_secs);
}

pub fn record_poll_error() {
    SETTLEMENT_POLL_ERRORS.inc();
}

pub fn record_task_finished(task_type: &str, progress: &str) {
    TASKS_FINISHED
        .with_label_values(&[task_type, progress])
        .inc();
}

pub fn record_component_health(component: &str, healthy: bool) {
    COMPONENT_HEALTHY
        .with_label_values(&[component])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
