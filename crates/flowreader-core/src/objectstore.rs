//! Object-Store Adapter (C4).
//!
//! The managed object-storage provider itself is an external collaborator
//! (§1 "out of scope"); this module only owns key-prefix scoping, signed-URL
//! issuance, and the narrow download contract the rest of the crate depends
//! on.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct SignedUpload {
    pub signed_url: String,
    pub upload_key: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Issues a signed upload URL scoped to
    /// `users/{userId}/uploads/{uuid}/{sanitizedFileName}`. The caller cannot
    /// choose another user's prefix because the prefix is derived entirely
    /// from `user_id`, never from client input.
    async fn issue_signed_upload(
        &self,
        user_id: &str,
        sanitized_file_name: &str,
        ttl: std::time::Duration,
    ) -> AppResult<SignedUpload>;

    async fn download(&self, key: &str) -> AppResult<Vec<u8>>;
}

/// Local filesystem-backed flavor for development and tests: builds the same
/// user-scoped key layout the production bucket would, but serves bytes from
/// a local directory instead of signing a request to the managed provider.
pub struct LocalObjectStore {
    base_dir: std::path::PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(base_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            public_base_url: "http://localhost/uploads".to_string(),
        }
    }

    pub fn with_public_base_url(mut self, url: impl Into<String>) -> Self {
        self.public_base_url = url.into();
        self
    }

    fn path_for(&self, key: &str) -> std::path::PathBuf {
        self.base_dir.join(key)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn issue_signed_upload(
        &self,
        user_id: &str,
        sanitized_file_name: &str,
        ttl: std::time::Duration,
    ) -> AppResult<SignedUpload> {
        let upload_key = format!(
            "users/{user_id}/uploads/{}/{sanitized_file_name}",
            Uuid::new_v4()
        );
        let expires_at = Utc::now()
            + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::minutes(15));
        let parent = self.path_for(&upload_key);
        if let Some(dir) = parent.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| AppError::Internal(e.into()))?;
        }
        Ok(SignedUpload {
            signed_url: format!("{}/{upload_key}", self.public_base_url),
            upload_key,
            expires_at,
        })
    }

    async fn download(&self, key: &str) -> AppResult<Vec<u8>> {
        tokio::fs::read(self.path_for(key))
            .await
            .map_err(|_| AppError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signed_url_expires_at_least_14_minutes_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let signed = store
            .issue_signed_upload("user-1", "alice.epub", std::time::Duration::from_secs(900))
            .await
            .unwrap();
        assert!(signed.upload_key.starts_with("users/user-1/uploads/"));
        assert!(signed.upload_key.ends_with("/alice.epub"));
        assert!(signed.expires_at > Utc::now() + ChronoDuration::minutes(14));
    }
}
