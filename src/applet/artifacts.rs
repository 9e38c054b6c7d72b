//! Registration of uploaded logs with the artifact service.

use crate::retry::{self, RetryPolicy, retry_async};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Body of `POST /v1/artifacts` for one uploaded container log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogArtifactDescriptor {
    pub artifact_id: String,
    pub service_instance_id: String,
    pub workflow_id: String,
    pub full_path: String,
    pub name: String,
    pub description: String,
    pub storage_method: String,
    /// JSON `{"bucket": .., "key": ..}`.
    pub storage_path: String,
    pub num_byte: u64,
    pub num_dir: u64,
    pub num_file: u64,
    pub num_other: u64,
    pub num_skip_byte: u64,
    pub num_skip: u64,
    pub pod_name: String,
    pub container_name: String,
    pub compression_mode: String,
    pub archive_mode: String,
    pub stored_byte: u64,
    /// JSON copy of the object metadata.
    pub meta: String,
    pub timestamp: i64,
    pub checksum: String,
    pub tags: String,
    pub retention_tags: String,
    pub artifact_type: String,
    pub deleted: u8,
}

/// Everything about an uploaded object the descriptor needs.
#[derive(Debug, Clone)]
pub struct UploadedLog<'a> {
    pub artifact_id: &'a str,
    pub deployment_id: &'a str,
    pub app_id: &'a str,
    pub full_name: &'a str,
    pub artifact_name: &'a str,
    pub bucket: &'a str,
    pub key: &'a str,
    pub size: u64,
    pub compressed: bool,
    pub pod_name: &'a str,
    pub container_name: &'a str,
    pub metadata: &'a BTreeMap<String, String>,
    pub timestamp: i64,
    pub retention_tag: &'a str,
    pub artifact_type: &'a str,
}

impl LogArtifactDescriptor {
    pub fn for_upload(u: &UploadedLog<'_>) -> Self {
        Self {
            artifact_id: u.artifact_id.to_string(),
            service_instance_id: u.deployment_id.to_string(),
            workflow_id: u.app_id.to_string(),
            full_path: u.full_name.to_string(),
            name: u.artifact_name.to_string(),
            description: "ax container log".to_string(),
            storage_method: "s3".to_string(),
            storage_path: serde_json::json!({"bucket": u.bucket, "key": u.key}).to_string(),
            num_byte: u.size,
            num_dir: 0,
            num_file: 1,
            num_other: 0,
            num_skip_byte: 0,
            num_skip: 0,
            pod_name: u.pod_name.to_string(),
            container_name: u.container_name.to_string(),
            compression_mode: if u.compressed { "gz" } else { "" }.to_string(),
            archive_mode: String::new(),
            stored_byte: u.size,
            meta: serde_json::to_string(u.metadata).unwrap_or_else(|_| "{}".to_string()),
            timestamp: u.timestamp,
            checksum: String::new(),
            tags: "[]".to_string(),
            retention_tags: u.retention_tag.to_string(),
            artifact_type: u.artifact_type.to_string(),
            deleted: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact service rejected {0}: {1}")]
    InvalidParam(String, String),

    #[error("artifact service error: {0}")]
    Transient(String),
}

impl ArtifactError {
    fn is_retryable(&self) -> bool {
        matches!(self, ArtifactError::Transient(_))
    }
}

pub struct ArtifactClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl ArtifactClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: retry::NETWORK,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn create_artifact(&self, artifact: &LogArtifactDescriptor) -> Result<(), ArtifactError> {
        retry_async(
            self.retry,
            "create artifact",
            || self.post(artifact),
            ArtifactError::is_retryable,
        )
        .await
    }

    async fn post(&self, artifact: &LogArtifactDescriptor) -> Result<(), ArtifactError> {
        let url = format!("{}/v1/artifacts", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(artifact)
            .send()
            .await
            .map_err(|e| ArtifactError::Transient(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            debug!("Registered artifact {}", artifact.artifact_id);
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        if body.contains("ERR_API_INVALID_PARAM") || status == reqwest::StatusCode::BAD_REQUEST {
            return Err(ArtifactError::InvalidParam(artifact.artifact_id.clone(), body));
        }
        Err(ArtifactError::Transient(format!("{}: {}", status, body)))
    }
}
