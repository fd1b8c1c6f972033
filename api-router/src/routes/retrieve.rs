use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use scrape_pipeline::RetrievalRequest;
use tracing::info;

use crate::{api_state::ApiState, error::ApiError};

/// Starts a billing retrieval job. Answers 202 with the fresh job snapshot;
/// the actual scraping and uploading happens out of band.
pub async fn retrieve_billing(
    State(state): State<ApiState>,
    Json(request): Json<RetrievalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    info!("received billing retrieval request");

    let snapshot = state.orchestrator.start(request).await?;
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}
