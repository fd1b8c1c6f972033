use api_state::ApiState;
use axum::{
    extract::FromRef,
    routing::{get, post},
    Router,
};
use routes::{
    liveness::live, readiness::ready, retrieve::retrieve_billing, status::job_status,
};

pub mod api_state;
pub mod error;
mod routes;

/// Router for API functionality, version 1
pub fn api_routes_v1<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    // Public, unauthenticated endpoints (for k8s/systemd probes)
    let public = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live));

    let jobs = Router::new()
        .route("/billing/retrieve", post(retrieve_billing))
        .route("/billing/status/{job_id}", get(job_status));

    public.merge(jobs)
}
