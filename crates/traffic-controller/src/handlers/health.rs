use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse { pub status: &'static str }

/// Liveness: the process is up and serving.
pub async fn health() -> Json<HealthResponse> { Json(HealthResponse { status: "ok" }) }
