use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    #[serde(rename = "pending")]
    #[default]
    Pending,
    #[serde(rename = "downloading")]
    Downloading,
    #[serde(rename = "uploading")]
    Uploading,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Uploading => "uploading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Carrier portals the service knows how to talk to.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum Carrier {
    #[serde(rename = "UPS", alias = "ups")]
    Ups,
    #[serde(rename = "FEDEX", alias = "fedex")]
    Fedex,
}

impl Carrier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Carrier::Ups => "UPS",
            Carrier::Fedex => "FEDEX",
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    AuthFailure,
    Timeout,
    PartialFailure,
    UploadFailed,
    Internal,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobErrorKind::AuthFailure => "auth_failure",
            JobErrorKind::Timeout => "timeout",
            JobErrorKind::PartialFailure => "partial_failure",
            JobErrorKind::UploadFailed => "upload_failed",
            JobErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct JobErrorInfo {
    pub kind: JobErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
enum JobTransition {
    BeginDownload,
    BeginUpload,
    Complete,
    Fail,
}

impl JobTransition {
    fn as_str(&self) -> &'static str {
        match self {
            JobTransition::BeginDownload => "begin_download",
            JobTransition::BeginUpload => "begin_upload",
            JobTransition::Complete => "complete",
            JobTransition::Fail => "fail",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: JobLifecycleMachine,
        initial: Pending,
        states: [Pending, Downloading, Uploading, Completed, Failed],
        events {
            begin_download {
                transition: { from: Pending, to: Downloading }
            }
            begin_upload {
                transition: { from: Downloading, to: Uploading }
            }
            complete {
                transition: { from: Downloading, to: Completed }
                transition: { from: Uploading, to: Completed }
            }
            fail {
                transition: { from: Pending, to: Failed }
                transition: { from: Downloading, to: Failed }
                transition: { from: Uploading, to: Failed }
            }
        }
    }

    pub(super) fn pending() -> JobLifecycleMachine<(), Pending> {
        JobLifecycleMachine::new(())
    }

    pub(super) fn downloading() -> JobLifecycleMachine<(), Downloading> {
        pending()
            .begin_download()
            .expect("begin_download transition from Pending should exist")
    }

    pub(super) fn uploading() -> JobLifecycleMachine<(), Uploading> {
        downloading()
            .begin_upload()
            .expect("begin_upload transition from Downloading should exist")
    }
}

fn rejected_transition(state: &JobStatus, event: JobTransition) -> AppError {
    AppError::Conflict(format!(
        "Job transition rejected: {} -> {}",
        state.as_str(),
        event.as_str()
    ))
}

fn compute_next_state(state: &JobStatus, event: JobTransition) -> Result<JobStatus, AppError> {
    use lifecycle::*;
    match (state, event) {
        (JobStatus::Pending, JobTransition::BeginDownload) => pending()
            .begin_download()
            .map(|_| JobStatus::Downloading)
            .map_err(|_| rejected_transition(state, event)),
        (JobStatus::Downloading, JobTransition::BeginUpload) => downloading()
            .begin_upload()
            .map(|_| JobStatus::Uploading)
            .map_err(|_| rejected_transition(state, event)),
        (JobStatus::Downloading, JobTransition::Complete) => downloading()
            .complete()
            .map(|_| JobStatus::Completed)
            .map_err(|_| rejected_transition(state, event)),
        (JobStatus::Uploading, JobTransition::Complete) => uploading()
            .complete()
            .map(|_| JobStatus::Completed)
            .map_err(|_| rejected_transition(state, event)),
        (JobStatus::Pending, JobTransition::Fail) => pending()
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| rejected_transition(state, event)),
        (JobStatus::Downloading, JobTransition::Fail) => downloading()
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| rejected_transition(state, event)),
        (JobStatus::Uploading, JobTransition::Fail) => uploading()
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| rejected_transition(state, event)),
        _ => Err(rejected_transition(state, event)),
    }
}

stored_object!(JobRecord, "job_record", {
    status: JobStatus,
    uploaded_files: Vec<String>,
    #[serde(default)]
    error: Option<JobErrorInfo>,
    carrier: Carrier,
    credentials_digest: String
});

/// Externally visible projection of a [`JobRecord`]. Credentials material
/// never crosses this boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub uploaded_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<JobErrorInfo>,
}

impl JobRecord {
    pub fn new(carrier: Carrier, credentials_digest: String) -> Self {
        let now = chrono::Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            uploaded_files: Vec::new(),
            error: None,
            carrier,
            credentials_digest,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id.clone(),
            status: self.status.clone(),
            uploaded_files: self.uploaded_files.clone(),
            error: self.error.clone(),
        }
    }

    /// Atomic create. A colliding id is practically unreachable with v4 ids
    /// but is still surfaced as its own error.
    pub async fn create(self, db: &SurrealDbClient) -> Result<JobRecord, AppError> {
        let id = self.id.clone();
        match db.store_item(self).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(AppError::InternalError(format!(
                "job record {id} was not returned on create"
            ))),
            Err(err) if err.to_string().contains("already exists") => {
                Err(AppError::AlreadyExists(id))
            }
            Err(err) => Err(AppError::Database(err)),
        }
    }

    pub async fn get(db: &SurrealDbClient, job_id: &str) -> Result<JobRecord, AppError> {
        db.get_item::<JobRecord>(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))
    }

    pub async fn get_active(db: &SurrealDbClient) -> Result<Vec<JobRecord>, AppError> {
        let jobs: Vec<JobRecord> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE status IN $active_states
                 ORDER BY created_at ASC",
            )
            .bind(("table", Self::table_name()))
            .bind((
                "active_states",
                vec![
                    JobStatus::Pending.as_str(),
                    JobStatus::Downloading.as_str(),
                    JobStatus::Uploading.as_str(),
                ],
            ))
            .await?
            .take(0)?;

        Ok(jobs)
    }

    pub async fn mark_downloading(&self, db: &SurrealDbClient) -> Result<JobRecord, AppError> {
        let next = compute_next_state(&self.status, JobTransition::BeginDownload)?;
        debug_assert_eq!(next, JobStatus::Downloading);

        const BEGIN_DOWNLOAD_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $downloading,
                updated_at = $now
            WHERE status = $pending
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(BEGIN_DOWNLOAD_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("downloading", JobStatus::Downloading.as_str()))
            .bind(("pending", JobStatus::Pending.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<JobRecord> = result.take(0)?;
        updated.ok_or_else(|| rejected_transition(&self.status, JobTransition::BeginDownload))
    }

    pub async fn mark_uploading(&self, db: &SurrealDbClient) -> Result<JobRecord, AppError> {
        let next = compute_next_state(&self.status, JobTransition::BeginUpload)?;
        debug_assert_eq!(next, JobStatus::Uploading);

        const BEGIN_UPLOAD_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $uploading,
                updated_at = $now
            WHERE status = $downloading
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(BEGIN_UPLOAD_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("uploading", JobStatus::Uploading.as_str()))
            .bind(("downloading", JobStatus::Downloading.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<JobRecord> = result.take(0)?;
        updated.ok_or_else(|| rejected_transition(&self.status, JobTransition::BeginUpload))
    }

    /// Appends a storage reference and persists it in the same statement, so a
    /// concurrent poll always observes a consistent record.
    pub async fn append_uploaded_file(
        &self,
        db: &SurrealDbClient,
        reference: &str,
    ) -> Result<JobRecord, AppError> {
        const APPEND_FILE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET uploaded_files += $reference,
                updated_at = $now
            WHERE status = $uploading
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(APPEND_FILE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("reference", reference.to_string()))
            .bind(("uploading", JobStatus::Uploading.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<JobRecord> = result.take(0)?;
        updated.ok_or_else(|| {
            AppError::Conflict(format!(
                "uploaded reference rejected while job is {}",
                self.status.as_str()
            ))
        })
    }

    pub async fn mark_completed(&self, db: &SurrealDbClient) -> Result<JobRecord, AppError> {
        let next = compute_next_state(&self.status, JobTransition::Complete)?;
        debug_assert_eq!(next, JobStatus::Completed);

        const COMPLETE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $completed,
                updated_at = $now
            WHERE status IN $from_states
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(COMPLETE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("completed", JobStatus::Completed.as_str()))
            .bind((
                "from_states",
                vec![
                    JobStatus::Downloading.as_str(),
                    JobStatus::Uploading.as_str(),
                ],
            ))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<JobRecord> = result.take(0)?;
        updated.ok_or_else(|| rejected_transition(&self.status, JobTransition::Complete))
    }

    /// Terminal failure. The structured error is written together with the
    /// status in one statement and is never cleared afterwards.
    pub async fn mark_failed(
        &self,
        error: JobErrorInfo,
        db: &SurrealDbClient,
    ) -> Result<JobRecord, AppError> {
        let next = compute_next_state(&self.status, JobTransition::Fail)?;
        debug_assert_eq!(next, JobStatus::Failed);

        const FAIL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $failed,
                error = $error,
                updated_at = $now
            WHERE status IN $active_states
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(FAIL_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("failed", JobStatus::Failed.as_str()))
            .bind(("error", error))
            .bind((
                "active_states",
                vec![
                    JobStatus::Pending.as_str(),
                    JobStatus::Downloading.as_str(),
                    JobStatus::Uploading.as_str(),
                ],
            ))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<JobRecord> = result.take(0)?;
        updated.ok_or_else(|| rejected_transition(&self.status, JobTransition::Fail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> SurrealDbClient {
        let namespace = "test_ns";
        let database = Uuid::new_v4().to_string();
        SurrealDbClient::memory(namespace, &database)
            .await
            .expect("in-memory surrealdb")
    }

    fn new_record() -> JobRecord {
        JobRecord::new(Carrier::Ups, "digest".into())
    }

    #[test]
    fn test_new_record_defaults() {
        let record = new_record();

        assert_eq!(record.status, JobStatus::Pending);
        assert!(record.uploaded_files.is_empty());
        assert!(record.error.is_none());
        assert_eq!(record.carrier, Carrier::Ups);
        assert_eq!(record.credentials_digest, "digest");
    }

    #[test]
    fn test_snapshot_excludes_credentials_digest() {
        let record = new_record();
        let value = serde_json::to_value(record.snapshot()).expect("serialize");

        let object = value.as_object().expect("object");
        assert!(object.contains_key("job_id"));
        assert!(!object.contains_key("credentials_digest"));
        // a pending job has no error, and the field is omitted entirely
        assert!(!object.contains_key("error"));
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let db = memory_db().await;
        let created = new_record().create(&db).await.expect("create");

        let fetched = JobRecord::get(&db, &created.id).await.expect("get");
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_create_duplicate_is_rejected() {
        let db = memory_db().await;
        let record = new_record();
        let clone = record.clone();

        record.create(&db).await.expect("first create");
        let second = clone.create(&db).await;
        assert!(matches!(second, Err(AppError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let db = memory_db().await;
        let missing = JobRecord::get(&db, "no-such-job").await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_full_lifecycle_to_completed() {
        let db = memory_db().await;
        let record = new_record().create(&db).await.expect("create");

        let downloading = record.mark_downloading(&db).await.expect("downloading");
        assert_eq!(downloading.status, JobStatus::Downloading);
        assert!(downloading.updated_at >= record.updated_at);

        let uploading = downloading.mark_uploading(&db).await.expect("uploading");
        assert_eq!(uploading.status, JobStatus::Uploading);

        let one = uploading
            .append_uploaded_file(&db, "jobs/a/0000-invoice.csv")
            .await
            .expect("append first");
        let two = one
            .append_uploaded_file(&db, "jobs/a/0001-invoice.csv")
            .await
            .expect("append second");
        assert_eq!(
            two.uploaded_files,
            vec![
                "jobs/a/0000-invoice.csv".to_string(),
                "jobs/a/0001-invoice.csv".to_string()
            ]
        );

        let completed = two.mark_completed(&db).await.expect("completed");
        assert_eq!(completed.status, JobStatus::Completed);
        assert!(completed.error.is_none());
        assert_eq!(completed.uploaded_files.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_download_completes_without_uploading() {
        let db = memory_db().await;
        let record = new_record().create(&db).await.expect("create");

        let downloading = record.mark_downloading(&db).await.expect("downloading");
        let completed = downloading.mark_completed(&db).await.expect("completed");
        assert_eq!(completed.status, JobStatus::Completed);
        assert!(completed.uploaded_files.is_empty());
    }

    #[tokio::test]
    async fn test_failure_records_error_once() {
        let db = memory_db().await;
        let record = new_record().create(&db).await.expect("create");
        let downloading = record.mark_downloading(&db).await.expect("downloading");

        let error = JobErrorInfo {
            kind: JobErrorKind::AuthFailure,
            message: "portal rejected sign-in".into(),
        };
        let failed = downloading
            .mark_failed(error.clone(), &db)
            .await
            .expect("failed");
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error, Some(error));

        // terminal states are sticky in both directions
        let error_again = JobErrorInfo {
            kind: JobErrorKind::Internal,
            message: "second failure".into(),
        };
        assert!(matches!(
            failed.mark_failed(error_again, &db).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            failed.mark_completed(&db).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_completed_job_cannot_fail() {
        let db = memory_db().await;
        let record = new_record().create(&db).await.expect("create");
        let downloading = record.mark_downloading(&db).await.expect("downloading");
        let completed = downloading.mark_completed(&db).await.expect("completed");

        let error = JobErrorInfo {
            kind: JobErrorKind::Internal,
            message: "late failure".into(),
        };
        assert!(matches!(
            completed.mark_failed(error, &db).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_backward_transitions_are_rejected() {
        let db = memory_db().await;
        let record = new_record().create(&db).await.expect("create");
        let downloading = record.mark_downloading(&db).await.expect("downloading");
        let uploading = downloading.mark_uploading(&db).await.expect("uploading");

        assert!(matches!(
            uploading.mark_downloading(&db).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            uploading.mark_uploading(&db).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_append_requires_uploading_status() {
        let db = memory_db().await;
        let record = new_record().create(&db).await.expect("create");

        let rejected = record.append_uploaded_file(&db, "jobs/x/0000-file").await;
        assert!(matches!(rejected, Err(AppError::Conflict(_))));

        let fetched = JobRecord::get(&db, &record.id).await.expect("get");
        assert!(fetched.uploaded_files.is_empty());
    }

    #[tokio::test]
    async fn test_stale_handle_cannot_transition_twice() {
        let db = memory_db().await;
        let record = new_record().create(&db).await.expect("create");

        let first = record.mark_downloading(&db).await.expect("downloading");
        assert_eq!(first.status, JobStatus::Downloading);

        // the compare-and-set refuses a second writer using a stale snapshot
        let stale = record.mark_downloading(&db).await;
        assert!(matches!(stale, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_get_active_filters_terminal_jobs() {
        let db = memory_db().await;

        let active = new_record().create(&db).await.expect("create active");
        let done = new_record().create(&db).await.expect("create done");
        let done = done.mark_downloading(&db).await.expect("downloading");
        done.mark_completed(&db).await.expect("completed");

        let listed = JobRecord::get_active(&db).await.expect("active list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed.first().map(|j| j.id.clone()), Some(active.id));
    }
}
