/*!
 * # Metrics Module
 *
 * Prometheus counters for the checkout pipeline, exposed in text format at
 * `/metrics`. All counters live in one registry so tests and the server
 * export the same set.
 */

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to export metrics: {0}")]
    ExportError(String),
}

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref CART_MUTATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("cart_mutations_total", "Cart mutations by operation"),
        &["operation"]
    )
    .expect("metric can be created");

    pub static ref OUT_OF_STOCK_REJECTIONS: IntCounter = IntCounter::new(
        "cart_out_of_stock_rejections_total",
        "Cart mutations rejected by the stock guard"
    )
    .expect("metric can be created");

    pub static ref ORDERS_BUILT: IntCounterVec = IntCounterVec::new(
        Opts::new("orders_built_total", "Orders persisted by source"),
        &["source"]
    )
    .expect("metric can be created");

    pub static ref GATEWAY_SESSIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("gateway_sessions_total", "Gateway sessions created by provider"),
        &["provider"]
    )
    .expect("metric can be created");

    pub static ref GATEWAY_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("gateway_failures_total", "Failed gateway calls by provider"),
        &["provider"]
    )
    .expect("metric can be created");

    pub static ref ORDER_CONFIRMATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("order_confirmations_total", "Confirmation attempts by outcome"),
        &["outcome"]
    )
    .expect("metric can be created");

    pub static ref SIGNATURE_REJECTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("payment_signature_rejections_total", "Rejected payment signatures by provider"),
        &["provider"]
    )
    .expect("metric can be created");

    pub static ref AMOUNT_MISMATCHES: IntCounterVec = IntCounterVec::new(
        Opts::new("payment_amount_mismatches_total", "Verified payments whose amount differs from the order total"),
        &["provider"]
    )
    .expect("metric can be created");

    pub static ref ORDERS_EXPIRED: IntCounter = IntCounter::new(
        "orders_expired_total",
        "Stale unpaid orders moved to expired"
    )
    .expect("metric can be created");
}

/// Registers every collector with the shared registry. Safe to call twice.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(CART_MUTATIONS.clone()),
        Box::new(OUT_OF_STOCK_REJECTIONS.clone()),
        Box::new(ORDERS_BUILT.clone()),
        Box::new(GATEWAY_SESSIONS.clone()),
        Box::new(GATEWAY_FAILURES.clone()),
        Box::new(ORDER_CONFIRMATIONS.clone()),
        Box::new(SIGNATURE_REJECTIONS.clone()),
        Box::new(AMOUNT_MISMATCHES.clone()),
        Box::new(ORDERS_EXPIRED.clone()),
    ];
    for collector in collectors {
        // AlreadyReg on repeated calls is expected
        let _ = REGISTRY.register(collector);
    }
}

/// Renders the registry in Prometheus text format
pub async fn metrics_handler() -> Result<String, MetricsError> {
    register_metrics();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| MetricsError::ExportError(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MetricsError::ExportError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exports_registered_counters() {
        register_metrics();
        register_metrics();
        CART_MUTATIONS.with_label_values(&["add"]).inc();
        ORDERS_EXPIRED.inc();

        let text = metrics_handler().await.unwrap();
        assert!(text.contains("cart_mutations_total"));
        assert!(text.contains("orders_expired_total"));
    }
}
