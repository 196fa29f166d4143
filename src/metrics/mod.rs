//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and block height
//! - Contract events seen by the monitors
//! - Order evaluation and execution outcomes
//! - Execution step latency

use crate::error::{ResolverError, ResolverResult};
use crate::events::ContractEvent;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "fusion_resolver_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "fusion_resolver_chain_block_height",
        "Last processed block per chain",
        &["chain_id"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "fusion_resolver_events_received_total",
        "Total events received by type",
        &["chain_id", "event_type"]
    ).unwrap();

    // Order metrics
    pub static ref ORDERS_EVALUATED: CounterVec = register_counter_vec!(
        "fusion_resolver_orders_evaluated_total",
        "Total orders evaluated by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref ORDERS_FINISHED: CounterVec = register_counter_vec!(
        "fusion_resolver_orders_finished_total",
        "Total executed orders by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref ORDERS_EXECUTING: Gauge = register_gauge!(
        "fusion_resolver_orders_executing",
        "Orders currently executing"
    ).unwrap();

    pub static ref SECRETS_RECEIVED: CounterVec = register_counter_vec!(
        "fusion_resolver_secrets_received_total",
        "Total valid secrets accepted",
        &[]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "fusion_resolver_transactions_submitted_total",
        "Total transactions submitted",
        &["chain_id"]
    ).unwrap();

    pub static ref STEP_LATENCY: HistogramVec = register_histogram_vec!(
        "fusion_resolver_step_latency_seconds",
        "Execution step latency including retries",
        &["step", "outcome"],
        vec![0.05, 0.25, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "fusion_resolver_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "fusion_resolver_health_check_failure_total",
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

    pub fn router() -> Router {
        Router::new().route("/metrics", get(metrics_handler))
    }

    pub async fn run(&self) -> ResolverResult<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ResolverError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, Self::router())
            .await
            .map_err(|e| ResolverError::Internal(format!("metrics server: {}", e)))
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_block_height(chain_id: u64, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_event(chain_id: u64, event: &ContractEvent) {
    EVENTS_RECEIVED
        .with_label_values(&[&chain_id.to_string(), event.name()])
        .inc();
}

pub fn record_order_evaluated(profitable: bool) {
    let outcome = if profitable { "accepted" } else { "rejected" };
    ORDERS_EVALUATED.with_label_values(&[outcome]).inc();
    if profitable {
        ORDERS_EXECUTING.inc();
    }
}

pub fn record_order_finished(completed: bool) {
    let outcome = if completed { "completed" } else { "failed" };
    ORDERS_FINISHED.with_label_values(&[outcome]).inc();
    ORDERS_EXECUTING.dec();
}

pub fn record_secret_received() {
    SECRETS_RECEIVED.with_label_values(&[]).inc();
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_step(step: &str, success: bool, elapsed: Duration) {
    let outcome = if success { "ok" } else { "error" };
    STEP_LATENCY
        .with_label_values(&[step, outcome])
        .observe(elapsed.as_secs_f64());
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
