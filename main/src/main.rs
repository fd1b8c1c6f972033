use api_router::{api_routes_v1, api_state::ApiState};
use axum::{extract::FromRef, Router};
use common::{
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::config::get_config,
};
use scrape_pipeline::{notify::WebhookNotifier, portal::PortalDriver, ScrapeOrchestrator};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Get config
    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );

    // Ensure db is initialized
    db.ensure_initialized().await?;

    // Global storage manager plus the orchestrator's collaborators
    let storage = StorageManager::new(&config).await?;
    let driver = Arc::new(PortalDriver::new(&config)?);
    let notifier = Arc::new(WebhookNotifier::from_config(&config)?);

    let orchestrator = Arc::new(ScrapeOrchestrator::new(
        Arc::clone(&db),
        storage,
        driver,
        notifier,
        &config,
    ));

    let api_state = ApiState::new(db, config.clone(), orchestrator);

    // Create Axum router
    let app = Router::new()
        .nest("/api/v1", api_routes_v1())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { api_state });

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Clone, FromRef)]
struct AppState {
    api_state: ApiState,
}
