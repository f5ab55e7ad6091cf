//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Gas prices and chain head
//! - Load and funding transactions
//! - RPC retries

use crate::error::{LoadError, LoadResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Gas metrics
    pub static ref GAS_PRICE: GaugeVec = register_gauge_vec!(
        "ethload_gas_price_gwei",
        "Latest oracle gas price per tier",
        &["tier"]
    ).unwrap();

    // Chain metrics
    pub static ref CHAIN_HEAD: Gauge = register_gauge!(
        "ethload_chain_head",
        "Latest observed block number"
    ).unwrap();

    pub static ref BLOCKS_OBSERVED: Counter = register_counter!(
        "ethload_blocks_observed_total",
        "Total blocks recorded by the block monitor"
    ).unwrap();

    pub static ref RPC_RETRIES: CounterVec = register_counter_vec!(
        "ethload_rpc_retries_total",
        "Total RPC calls retried after a timeout",
        &["method"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "ethload_transactions_submitted_total",
        "Total transactions accepted by the node",
        &["phase"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "ethload_transactions_failed_total",
        "Total transactions rejected or skipped",
        &["phase"]
    ).unwrap();

    pub static ref DISPATCH_LAG: Histogram = register_histogram!(
        "ethload_dispatch_lag_seconds",
        "Delay between a load transaction's scheduled and actual submission",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();

    // Funding metrics
    pub static ref FUNDING_SPENT: Gauge = register_gauge!(
        "ethload_funding_spent_eth",
        "Native currency spent by the funder during funding"
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

    pub async fn run(&self) -> LoadResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| LoadError::Internal(format!("metrics server cannot bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| LoadError::Internal(format!("metrics server failed: {}", e)))
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

pub fn record_gas_price(tier: &str, gwei: f64) {
    GAS_PRICE.with_label_values(&[tier]).set(gwei);
}

pub fn record_block_observed(block_number: u64) {
    CHAIN_HEAD.set(block_number as f64);
    BLOCKS_OBSERVED.inc();
}

pub fn record_rpc_retry(method: &str) {
    RPC_RETRIES.with_label_values(&[method]).inc();
}

pub fn record_tx_submitted(phase: &str) {
    TX_SUBMITTED.with_label_values(&[phase]).inc();
}

pub fn record_tx_failed(phase: &str) {
    TX_FAILED.with_label_values(&[phase]).inc();
}

pub fn record_dispatch_lag(lag_secs: f64) {
    DISPATCH_LAG.observe(lag_secs);
}

pub fn record_funding_spent(eth: f64) {
    FUNDING_SPENT.set(eth);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_exposes_recorded_metrics() {
        record_gas_price("safeLow", 12.5);
        record_rpc_retry("eth_getBalance");
        record_tx_submitted("load");
        record_block_observed(42);

        let body = metrics_handler().await.unwrap();
        assert!(body.contains("ethload_gas_price_gwei{tier=\"safeLow\"} 12.5"));
        assert!(body.contains("ethload_rpc_retries_total{method=\"eth_getBalance\"}"));
        assert!(body.contains("ethload_transactions_submitted_total{phase=\"load\"}"));
        assert!(body.contains("ethload_blocks_observed_total "));
    }

    #[tokio::test]
    async fn test_port_in_use_is_internal_error() {
        let taken = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = MetricsServer::new(port).run().await;
        assert!(matches!(result, Err(LoadError::Internal(msg)) if msg.contains("cannot bind")));
    }
}
