use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ObjectCannedAcl, ServerSideEncryption};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Per-object options for a PUT.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutOptions {
    pub metadata: HashMap<String, String>,
    pub content_disposition: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> anyhow::Result<bool>;

    /// Upload a local file. Returns the number of bytes stored.
    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        opts: &PutOptions,
    ) -> anyhow::Result<u64>;

    /// Fetch a small object as text, or None when the key does not exist.
    async fn get_string(&self, bucket: &str, key: &str) -> anyhow::Result<Option<String>>;
}

/// S3 backed store. Objects are encrypted at rest and owned by the bucket owner.
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn bucket_exists(&self, bucket: &str) -> anyhow::Result<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    Ok(false)
                } else {
                    Err(err.into())
                }
            }
        }
    }

    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        opts: &PutOptions,
    ) -> anyhow::Result<u64> {
        let size = tokio::fs::metadata(path).await?.len();
        let body = ByteStream::from_path(path).await?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .server_side_encryption(ServerSideEncryption::Aes256)
            .acl(ObjectCannedAcl::BucketOwnerFullControl)
            .set_metadata(Some(opts.metadata.clone()))
            .set_content_disposition(opts.content_disposition.clone())
            .send()
            .await?;
        debug!("Uploaded {} to s3://{}/{} ({} bytes)", path.display(), bucket, key, size);
        Ok(size)
    }

    async fn get_string(&self, bucket: &str, key: &str) -> anyhow::Result<Option<String>> {
        match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(out) => {
                let bytes = out.body.collect().await?.into_bytes();
                Ok(Some(String::from_utf8(bytes.to_vec())?))
            }
            Err(err) => {
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    Ok(None)
                } else {
                    Err(err.into())
                }
            }
        }
    }
}
