use std::sync::Arc;

use common::{storage::db::SurrealDbClient, utils::config::AppConfig};
use scrape_pipeline::ScrapeOrchestrator;

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub orchestrator: Arc<ScrapeOrchestrator>,
}

impl ApiState {
    pub fn new(
        db: Arc<SurrealDbClient>,
        config: AppConfig,
        orchestrator: Arc<ScrapeOrchestrator>,
    ) -> Self {
        Self {
            db,
            config,
            orchestrator,
        }
    }
}
