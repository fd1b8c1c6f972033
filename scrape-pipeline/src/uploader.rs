use thiserror::Error;
use tracing::debug;

use common::storage::store::StorageManager;

use crate::driver::Artifact;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("artifact {file_name} is empty")]
    EmptyArtifact { file_name: String },
    #[error("object store rejected {location}: {source}")]
    Backend {
        location: String,
        #[source]
        source: object_store::Error,
    },
}

/// Persists downloaded statements under a deterministic, per-job key space.
///
/// Keys are `{job_id}/{sequence:04}-{file_name}`: stable on retry, collision
/// free across concurrent jobs. There is no retry policy here; a failed
/// upload aborts the job instead of dropping the artifact silently.
#[derive(Clone)]
pub struct ArtifactUploader {
    storage: StorageManager,
}

impl ArtifactUploader {
    pub fn new(storage: StorageManager) -> Self {
        Self { storage }
    }

    pub async fn store(
        &self,
        job_id: &str,
        sequence: usize,
        artifact: &Artifact,
    ) -> Result<String, UploadError> {
        if artifact.bytes.is_empty() {
            return Err(UploadError::EmptyArtifact {
                file_name: artifact.file_name.clone(),
            });
        }

        let location = Self::object_key(job_id, sequence, &artifact.file_name);
        self.storage
            .put(&location, artifact.bytes.clone())
            .await
            .map_err(|source| UploadError::Backend {
                location: location.clone(),
                source,
            })?;

        debug!(%location, bytes = artifact.bytes.len(), "artifact persisted");
        Ok(self.storage.reference(&location))
    }

    fn object_key(job_id: &str, sequence: usize, file_name: &str) -> String {
        format!("{job_id}/{sequence:04}-{}", sanitize_file_name(file_name))
    }
}

fn sanitize_file_name(file_name: &str) -> String {
    if let Some(idx) = file_name.rfind('.') {
        let (name, ext) = file_name.split_at(idx);
        let sanitized_name: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", sanitized_name, ext)
    } else {
        // No extension
        file_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::utils::config::StorageKind;
    use object_store::memory::InMemory;
    use std::sync::Arc;

    fn memory_uploader() -> ArtifactUploader {
        let storage =
            StorageManager::with_backend(Arc::new(InMemory::new()), StorageKind::Memory);
        ArtifactUploader::new(storage)
    }

    fn artifact(file_name: &str, contents: &[u8]) -> Artifact {
        Artifact {
            file_name: file_name.into(),
            bytes: Bytes::from(contents.to_vec()),
        }
    }

    #[test]
    fn object_keys_are_deterministic_and_job_scoped() {
        let key = ArtifactUploader::object_key("job-1", 0, "march invoice.csv");
        assert_eq!(key, "job-1/0000-march_invoice.csv");

        let again = ArtifactUploader::object_key("job-1", 0, "march invoice.csv");
        assert_eq!(key, again);

        let other_job = ArtifactUploader::object_key("job-2", 0, "march invoice.csv");
        assert_ne!(key, other_job);
    }

    #[test]
    fn sanitize_keeps_extension_and_replaces_odd_characters() {
        assert_eq!(sanitize_file_name("inv/march 2024.csv"), "inv_march_2024.csv");
        assert_eq!(sanitize_file_name("statement-42"), "statement-42");
    }

    #[tokio::test]
    async fn stores_artifact_and_returns_reference() {
        let uploader = memory_uploader();
        let artifact = artifact("invoice.csv", b"billing,data");

        let reference = uploader
            .store("job-a", 0, &artifact)
            .await
            .expect("store artifact");
        assert_eq!(reference, "job-a/0000-invoice.csv");

        let stored = uploader
            .storage
            .get("job-a/0000-invoice.csv")
            .await
            .expect("read back");
        assert_eq!(stored.as_ref(), b"billing,data");
    }

    #[tokio::test]
    async fn sequence_numbers_keep_artifacts_ordered_and_distinct() {
        let uploader = memory_uploader();

        let first = uploader
            .store("job-a", 0, &artifact("invoice.csv", b"one"))
            .await
            .expect("first");
        let second = uploader
            .store("job-a", 1, &artifact("invoice.csv", b"two"))
            .await
            .expect("second");

        assert_ne!(first, second);
        assert!(first < second, "sequence keys sort in upload order");
    }

    #[tokio::test]
    async fn empty_artifacts_are_rejected() {
        let uploader = memory_uploader();
        let empty = artifact("invoice.csv", b"");

        let result = uploader.store("job-a", 0, &empty).await;
        assert!(matches!(result, Err(UploadError::EmptyArtifact { .. })));
    }
}
