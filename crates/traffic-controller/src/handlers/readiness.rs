use axum::{Json, extract::State};
use serde::Serialize;
use crate::AppState;

#[derive(Serialize)]
pub struct ReadinessResponse {
	pub status: &'static str,
	pub desired_weight: i64,
	pub current_weight: i64,
	pub version: u64,
}

/// Readiness probe: ready once the weight state has been seeded from the store.
pub async fn readiness(State(state): State<AppState>) -> (axum::http::StatusCode, Json<ReadinessResponse>) {
	let snap = state.weights.snapshot();
	let body = |status| ReadinessResponse { status, desired_weight: snap.desired, current_weight: snap.current, version: snap.version };
	if snap.version > 0 { (axum::http::StatusCode::OK, Json(body("ready"))) }
	else { (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(body("starting"))) }
}
