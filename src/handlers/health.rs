use axum::{response::IntoResponse, Json};
use serde_json::json;

/// Handle /health. Liveness only; no dependency checks.
pub async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}
