pub mod cluster;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod k8s_watch;
pub mod logging;
pub mod reconcile_loop;
pub mod records;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod test_support;
pub mod weight;

use axum::{Router, routing::get};
use handlers::{health::health, readiness::readiness};
use crate::state::WeightReader;
use crate::telemetry::metrics_handler;

#[derive(Clone)]
pub struct AppState { pub weights: WeightReader }

/// Probe and metrics endpoints served next to the controller.
pub fn build_router(state: AppState) -> Router {
    telemetry::register_all();
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readiness))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
