use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, info};
use url::Url;

use common::{storage::types::job_record::JobSnapshot, utils::config::AppConfig};

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("webhook transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("webhook endpoint answered {0}")]
    Endpoint(StatusCode),
}

/// Delivery of a terminal job snapshot to an external receiver. At-least-once:
/// the receiver must tolerate duplicates.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, snapshot: &JobSnapshot) -> Result<(), NotificationError>;
}

/// POSTs terminal snapshots to the configured webhook with bounded,
/// jittered exponential backoff.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: Url,
    max_attempts: usize,
    base_delay_ms: u64,
}

impl WebhookNotifier {
    pub fn new(endpoint: Url, max_attempts: usize, base_delay_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, url::ParseError> {
        let endpoint = Url::parse(&config.webhook_url)?;
        Ok(Self::new(
            endpoint,
            config.notify_max_attempts,
            config.notify_base_delay_ms,
        ))
    }

    async fn post_once(&self, snapshot: &JobSnapshot) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(snapshot)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            debug!(job_id = %snapshot.job_id, %status, "webhook attempt rejected");
            Err(NotificationError::Endpoint(status))
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, snapshot: &JobSnapshot) -> Result<(), NotificationError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.base_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_attempts.saturating_sub(1));

        Retry::spawn(retry_strategy, || self.post_once(snapshot)).await?;

        info!(
            job_id = %snapshot.job_id,
            status = snapshot.status.as_str(),
            "terminal notification delivered"
        );
        Ok(())
    }
}
