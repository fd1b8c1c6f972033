use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use sha2::{Digest, Sha256};
use thiserror::Error;

use common::storage::types::job_record::JobErrorKind;

/// Portal sign-in material. Lives only for the duration of one retrieval and
/// never reaches the status store or the logs.
#[derive(Clone)]
pub struct PortalCredentials {
    pub username: String,
    pub password: String,
}

impl PortalCredentials {
    /// One-way fingerprint retained on the job record for audit purposes.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.username.as_bytes());
        hasher.update(b":");
        hasher.update(self.password.as_bytes());
        let digest = hasher.finalize();
        format!("{:x}", digest)
    }
}

impl fmt::Debug for PortalCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One downloaded billing statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub file_name: String,
    pub bytes: Bytes,
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("portal rejected the supplied credentials: {0}")]
    AuthFailure(String),
    #[error("portal did not respond in time: {0}")]
    Timeout(String),
    #[error("retrieval aborted after {downloaded} artifact(s): {message}")]
    PartialFailure { downloaded: usize, message: String },
    #[error("browser automation failed: {0}")]
    Browser(String),
}

impl DriverError {
    pub fn kind(&self) -> JobErrorKind {
        match self {
            DriverError::AuthFailure(_) => JobErrorKind::AuthFailure,
            DriverError::Timeout(_) => JobErrorKind::Timeout,
            DriverError::PartialFailure { .. } => JobErrorKind::PartialFailure,
            DriverError::Browser(_) => JobErrorKind::Internal,
        }
    }
}

/// Lazy, finite sequence of downloaded statements. The producer may fail
/// mid-sequence; everything yielded before the failure is still valid.
pub type ArtifactStream = BoxStream<'static, Result<Artifact, DriverError>>;

/// Authenticated, paginated download against a carrier portal. `max_pages`
/// bounds the pagination walk; reaching it truncates the result rather than
/// failing the retrieval.
#[async_trait]
pub trait RetrievalDriver: Send + Sync {
    async fn fetch(
        &self,
        credentials: &PortalCredentials,
        max_pages: u32,
    ) -> Result<ArtifactStream, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(username: &str, password: &str) -> PortalCredentials {
        PortalCredentials {
            username: username.into(),
            password: password.into(),
        }
    }

    #[test]
    fn digest_is_stable_and_distinct() {
        let a = credentials("a@b.com", "secret");
        let same = credentials("a@b.com", "secret");
        let other = credentials("a@b.com", "different");

        assert_eq!(a.digest(), same.digest());
        assert_ne!(a.digest(), other.digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn digest_never_contains_the_password() {
        let creds = credentials("a@b.com", "hunter2-password");
        assert!(!creds.digest().contains("hunter2"));
    }

    #[test]
    fn debug_output_redacts_password() {
        let creds = credentials("a@b.com", "hunter2-password");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("a@b.com"));
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn error_kinds_map_to_persisted_taxonomy() {
        assert_eq!(
            DriverError::AuthFailure("nope".into()).kind(),
            JobErrorKind::AuthFailure
        );
        assert_eq!(
            DriverError::Timeout("slow".into()).kind(),
            JobErrorKind::Timeout
        );
        assert_eq!(
            DriverError::PartialFailure {
                downloaded: 2,
                message: "connection reset".into()
            }
            .kind(),
            JobErrorKind::PartialFailure
        );
        assert_eq!(
            DriverError::Browser("chrome went away".into()).kind(),
            JobErrorKind::Internal
        );
    }
}
