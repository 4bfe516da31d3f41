//! Process-wide Prometheus metrics registry, exposed at `/metrics`.
//! Grounded on `examples/Thoralf-M-iota/Cargo.toml`'s use of the
//! `prometheus` crate; the registry itself is the one piece of deliberately
//! global state per the design notes (everything else is passed through
//! constructors).

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static QUEUE_LENGTH: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("queue_length", "Number of wallets waiting in the priority queue").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static INFLIGHT_WALLETS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("in_flight_wallets", "Number of wallets currently claimed by a worker").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static ACTIVE_WORKERS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("active_workers", "Number of currently running worker tasks").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static HEALTHY_ENDPOINTS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("healthy_endpoints", "Number of RPC endpoints currently eligible for selection").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static TRANSACTIONS_PROCESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("transactions_processed_total", "Transactions successfully fetched, decoded, and persisted"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static RPC_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("rpc_requests_total", "Outgoing JSON-RPC requests by disposition"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub fn set_queue_length(n: u64) {
    QUEUE_LENGTH.set(n as i64);
}

pub fn set_inflight_wallets(n: u64) {
    INFLIGHT_WALLETS.set(n as i64);
}

pub fn set_active_workers(n: u64) {
    ACTIVE_WORKERS.set(n as i64);
}

pub fn set_healthy_endpoints(n: u64) {
    HEALTHY_ENDPOINTS.set(n as i64);
}

pub fn record_transaction_outcome(outcome: &str) {
    TRANSACTIONS_PROCESSED.with_label_values(&[outcome]).inc();
}

pub fn record_rpc_outcome(outcome: &str) {
    RPC_REQUESTS.with_label_values(&[outcome]).inc();
}

/// Render the registry in Prometheus text exposition format.
pub fn encode() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_includes_registered_metrics() {
        set_queue_length(42);
        let text = encode();
        assert!(text.contains("queue_length 42"));
    }
}
