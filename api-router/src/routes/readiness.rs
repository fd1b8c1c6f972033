use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use common::storage::types::job_record::JobRecord;
use serde_json::json;

use crate::api_state::ApiState;

/// Readiness probe: returns 200 if the status store answers, else 503. The
/// richer payload carries the number of jobs still in flight.
pub async fn ready(State(state): State<ApiState>) -> impl IntoResponse {
    match JobRecord::get_active(&state.db).await {
        Ok(active) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "checks": { "status_store": "ok" },
                "active_jobs": active.len()
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "error",
                "checks": { "status_store": "fail" },
                "reason": e.to_string()
            })),
        ),
    }
}
