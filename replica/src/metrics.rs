//! Prometheus metrics for the replication layer.

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Node-to-node messages received, by wire type
    pub static ref MESSAGE_COUNTER_VEC: IntCounterVec = IntCounterVec::new(
        Opts::new("tob_messages_received", "messages received by type"),
        &["type"]
    )
    .unwrap();

    pub static ref MALFORMED_COUNTER: IntCounter =
        IntCounter::new("tob_messages_malformed", "messages dropped as malformed").unwrap();

    pub static ref COMMITTED_COUNTER: IntCounter =
        IntCounter::new("tob_proposals_committed", "proposals acknowledged by every member")
            .unwrap();

    /// Requests buffered on the leader and not yet proposed
    pub static ref PENDING_GAUGE: IntGauge =
        IntGauge::new("tob_pending_requests", "requests waiting to be proposed").unwrap();

    pub static ref OUTSTANDING_GAUGE: IntGauge =
        IntGauge::new("tob_outstanding_acks", "acks owed for the proposal in flight").unwrap();

    pub static ref REQ_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("request_counter", "request counter"), &["method"]).unwrap();

    pub static ref METHOD_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("method_cost", "method cost"),
        &["method"]
    )
    .unwrap();
}

/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(MESSAGE_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(MALFORMED_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(COMMITTED_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(PENDING_GAUGE.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(OUTSTANDING_GAUGE.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(METHOD_HISTOGRAM_VEC.clone()));
}

/// Counts a call to `method_name` and records how long `handler` took.
pub fn record_metrics<F, T>(method_name: &'static str, handler: F) -> T
where
    F: FnOnce() -> T,
{
    let start = Instant::now();
    REQ_COUNTER_VEC.with_label_values(&[method_name]).inc();
    let result = handler();

    let elapsed = start.elapsed();
    METHOD_HISTOGRAM_VEC
        .with_label_values(&[method_name])
        .observe(elapsed.as_secs_f64());

    result
}
