use prometheus::{TextEncoder, Encoder, Registry, IntCounter, IntCounterVec, IntGauge, opts};
use once_cell::sync::Lazy;
use axum::{response::IntoResponse, http::StatusCode};

use crate::state::WeightSnapshot;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static WEIGHT_DESIRED: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::with_opts(opts!("cluster_traffic_controller_ingress_weight_desired", "Desired traffic weight for this cluster")).expect("valid gauge opts");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});
pub static WEIGHT_CURRENT: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::with_opts(opts!("cluster_traffic_controller_ingress_weight_current", "Traffic weight this cluster last acted upon")).expect("valid gauge opts");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});
pub static ROUTE_RECONCILIATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("route_reconciliations_total", "Route reconciliations by outcome"), &["outcome"]).expect("valid counter opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static WEIGHT_POLL_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(opts!("weight_poll_failures_total", "Weight store polls that failed")).expect("valid counter opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn record_weights(snapshot: &WeightSnapshot) {
    WEIGHT_DESIRED.set(snapshot.desired);
    WEIGHT_CURRENT.set(snapshot.current);
}

/// Touch every collector so `/metrics` lists them before the first event.
pub fn register_all() {
    Lazy::force(&WEIGHT_DESIRED);
    Lazy::force(&WEIGHT_CURRENT);
    Lazy::force(&ROUTE_RECONCILIATIONS);
    Lazy::force(&WEIGHT_POLL_FAILURES);
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() { return StatusCode::INTERNAL_SERVER_ERROR.into_response(); }
    ([("Content-Type","text/plain; version=0.0.4")], buf).into_response()
}
