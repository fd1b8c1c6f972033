use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::{api_state::ApiState, error::ApiError};

/// Polls the current snapshot of a job. A pure read against the status
/// store; unknown ids answer 404.
pub async fn job_status(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.orchestrator.status(&job_id).await?;
    Ok((StatusCode::OK, Json(snapshot)))
}
