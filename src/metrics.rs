//! Prometheus counters for settlement outcomes, exposed as text at `/metrics`.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref ORDERS_CREATED: IntCounter =
        IntCounter::new("orders_created_total", "Total number of orders placed")
            .expect("metric can be created");
    pub static ref CHECKOUT_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("checkout_failures_total", "Checkouts rejected, by error code"),
        &["error_code"]
    )
    .expect("metric can be created");
    pub static ref REFUNDS_PROCESSED: IntCounter =
        IntCounter::new("refunds_processed_total", "Refunds settled through the gateway")
            .expect("metric can be created");
    pub static ref REFUND_FAILURES: IntCounter = IntCounter::new(
        "refund_failures_total",
        "Refund attempts aborted by a gateway failure"
    )
    .expect("metric can be created");
    pub static ref CARRIER_CANCELLATION_FAILURES: IntCounter = IntCounter::new(
        "carrier_cancellation_failures_total",
        "Carrier cancellations that failed and need an operator retry"
    )
    .expect("metric can be created");
    pub static ref WEBHOOK_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("payment_webhook_events_total", "Payment webhook deliveries"),
        &["event", "outcome"]
    )
    .expect("metric can be created");
}

/// Registers every collector with [`REGISTRY`]. Safe to call more than once.
pub fn register() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ORDERS_CREATED.clone()),
        Box::new(CHECKOUT_FAILURES.clone()),
        Box::new(REFUNDS_PROCESSED.clone()),
        Box::new(REFUND_FAILURES.clone()),
        Box::new(CARRIER_CANCELLATION_FAILURES.clone()),
        Box::new(WEBHOOK_EVENTS.clone()),
    ];
    for collector in collectors {
        // AlreadyReg on repeated calls is expected
        let _ = REGISTRY.register(collector);
    }
}

/// Renders the registry in the Prometheus text exposition format.
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
