use std::sync::Arc;

use futures::StreamExt;
use tracing::{error, info, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::job_record::{Carrier, JobErrorInfo, JobErrorKind, JobRecord, JobSnapshot},
    },
    utils::config::AppConfig,
};

use crate::{
    driver::{PortalCredentials, RetrievalDriver},
    notify::NotificationSink,
    uploader::ArtifactUploader,
};

/// Inbound retrieval request. Credentials are consumed by the background
/// task and never persisted beyond the job record's digest.
#[derive(Clone, serde::Deserialize)]
pub struct RetrievalRequest {
    pub username: String,
    pub password: String,
    pub carrier: Carrier,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

/// Central state machine of the service: accepts retrieval requests, runs
/// each retrieval-and-upload sequence as an independent background task, and
/// keeps the status store as the single source of truth while doing so.
#[derive(Clone)]
pub struct ScrapeOrchestrator {
    db: Arc<SurrealDbClient>,
    driver: Arc<dyn RetrievalDriver>,
    notifier: Arc<dyn NotificationSink>,
    uploader: ArtifactUploader,
    page_ceiling: u32,
}

impl ScrapeOrchestrator {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        driver: Arc<dyn RetrievalDriver>,
        notifier: Arc<dyn NotificationSink>,
        config: &AppConfig,
    ) -> Self {
        Self {
            db,
            driver,
            notifier,
            uploader: ArtifactUploader::new(storage),
            page_ceiling: config.max_pages,
        }
    }

    /// Accepts a retrieval request: validates it, creates the job record and
    /// launches the background sequence. Returns as soon as the record is
    /// durable; every later failure is recorded on the record, never thrown
    /// back to the caller.
    pub async fn start(&self, request: RetrievalRequest) -> Result<JobSnapshot, AppError> {
        if request.username.trim().is_empty() || request.password.trim().is_empty() {
            return Err(AppError::Validation(
                "username and password are required".into(),
            ));
        }

        let RetrievalRequest {
            username,
            password,
            carrier,
            max_pages,
        } = request;
        let credentials = PortalCredentials { username, password };

        let record = JobRecord::new(carrier, credentials.digest())
            .create(&self.db)
            .await?;
        let snapshot = record.snapshot();

        // A caller override can narrow the walk but never widen it past the
        // configured ceiling.
        let page_ceiling = max_pages
            .unwrap_or(self.page_ceiling)
            .min(self.page_ceiling);

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.execute(record, credentials, page_ceiling).await;
        });

        info!(job_id = %snapshot.job_id, carrier = carrier.as_str(), "retrieval job accepted");
        Ok(snapshot)
    }

    /// Reads the current snapshot straight from the status store.
    pub async fn status(&self, job_id: &str) -> Result<JobSnapshot, AppError> {
        Ok(JobRecord::get(&self.db, job_id).await?.snapshot())
    }

    /// The background sequence for one job: download, upload each artifact,
    /// settle into a terminal state, notify. Strictly sequential per job;
    /// this is the record's only writer.
    #[tracing::instrument(skip_all, fields(job_id = %record.id))]
    pub async fn execute(
        &self,
        record: JobRecord,
        credentials: PortalCredentials,
        page_ceiling: u32,
    ) {
        let record = match record.mark_downloading(&self.db).await {
            Ok(record) => record,
            Err(err) => {
                error!(error = %err, "failed to move job into downloading");
                return;
            }
        };

        let mut stream = match self.driver.fetch(&credentials, page_ceiling).await {
            Ok(stream) => stream,
            Err(err) => {
                let error = JobErrorInfo {
                    kind: err.kind(),
                    message: err.to_string(),
                };
                self.fail(record, error).await;
                return;
            }
        };
        drop(credentials);

        let mut record = record;
        let mut sequence: usize = 0;
        while let Some(item) = stream.next().await {
            let artifact = match item {
                Ok(artifact) => artifact,
                Err(err) => {
                    let error = JobErrorInfo {
                        kind: err.kind(),
                        message: err.to_string(),
                    };
                    self.fail(record, error).await;
                    return;
                }
            };

            if sequence == 0 {
                record = match record.mark_uploading(&self.db).await {
                    Ok(updated) => updated,
                    Err(err) => {
                        error!(error = %err, "failed to move job into uploading");
                        return;
                    }
                };
            }

            let reference = match self.uploader.store(&record.id, sequence, &artifact).await {
                Ok(reference) => reference,
                Err(err) => {
                    let error = JobErrorInfo {
                        kind: JobErrorKind::UploadFailed,
                        message: err.to_string(),
                    };
                    self.fail(record, error).await;
                    return;
                }
            };

            record = match record.append_uploaded_file(&self.db, &reference).await {
                Ok(updated) => updated,
                Err(err) => {
                    error!(error = %err, "failed to persist uploaded reference");
                    return;
                }
            };
            info!(sequence, reference = %reference, "artifact stored");
            sequence += 1;
        }

        match record.mark_completed(&self.db).await {
            Ok(completed) => {
                info!(
                    uploaded = completed.uploaded_files.len(),
                    "retrieval job completed"
                );
                self.dispatch(completed.snapshot()).await;
            }
            Err(err) => error!(error = %err, "failed to move job into completed"),
        }
    }

    async fn fail(&self, record: JobRecord, error: JobErrorInfo) {
        warn!(
            job_id = %record.id,
            kind = error.kind.as_str(),
            message = %error.message,
            "retrieval job failed"
        );
        match record.mark_failed(error, &self.db).await {
            Ok(failed) => self.dispatch(failed.snapshot()).await,
            Err(err) => error!(job_id = %record.id, error = %err, "failed to record job failure"),
        }
    }

    /// Terminal notifications are best effort: the job's durable status is
    /// authoritative, so a dispatch failure is logged and swallowed.
    async fn dispatch(&self, snapshot: JobSnapshot) {
        if let Err(err) = self.notifier.notify(&snapshot).await {
            warn!(
                job_id = %snapshot.job_id,
                error = %err,
                "terminal notification was not delivered"
            );
        }
    }
}
