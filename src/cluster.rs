//! Cluster identity and where this cluster's logs land in the object store.

use crate::config::AppletConfig;
use crate::objstore::ObjectStore;
use crate::types::{ClusterNameId, is_aux_container};
use anyhow::Context;
use tracing::info;

pub const RETENTION_USER_LOG: &str = "user-log";
pub const RETENTION_AX_LOG: &str = "ax-log";
pub const RETENTION_AX_LOG_EXTERNAL: &str = "ax-log-external";

/// Where one container's logs are uploaded and how they are tagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDestination {
    pub bucket: String,
    /// Platform logs are partitioned by upload date; user logs are not.
    pub dated: bool,
    pub retention_tag: &'static str,
    pub artifact_type: &'static str,
}

#[derive(Debug, Clone)]
pub struct ClusterLayout {
    pub name_id: ClusterNameId,
    pub data_bucket: String,
    pub log_bucket: String,
    pub log_bucket_external: bool,
}

impl ClusterLayout {
    pub fn new(
        name_id: ClusterNameId,
        data_bucket: impl Into<String>,
        log_bucket: impl Into<String>,
        log_bucket_external: bool,
    ) -> Self {
        Self {
            name_id,
            data_bucket: data_bucket.into(),
            log_bucket: log_bucket.into(),
            log_bucket_external,
        }
    }

    /// Resolve identity and buckets. Both buckets must exist.
    pub async fn resolve(config: &AppletConfig, store: &dyn ObjectStore) -> anyhow::Result<Self> {
        let cluster_bucket = format!("applatix-cluster-{}-0", config.customer_id);

        let name_id = match &config.cluster_name_id {
            Some(s) => ClusterNameId::parse(s)?,
            None => {
                let name = config.cluster_name.as_deref().ok_or_else(|| {
                    anyhow::anyhow!("Neither AX_CLUSTER_NAME_ID nor AX_CLUSTER_NAME is set")
                })?;
                let key = format!("{}/id", name);
                let raw = store
                    .get_string(&cluster_bucket, &key)
                    .await
                    .with_context(|| format!("reading s3://{}/{}", cluster_bucket, key))?
                    .ok_or_else(|| {
                        anyhow::anyhow!("Cluster id not found at s3://{}/{}", cluster_bucket, key)
                    })?;
                ClusterNameId::parse(&raw)?
            }
        };

        let data_bucket = config
            .data_bucket
            .clone()
            .unwrap_or_else(|| format!("applatix-data-{}-0", config.customer_id));
        let (log_bucket, external) = match &config.log_bucket {
            Some(b) => (b.clone(), true),
            None => (cluster_bucket, false),
        };

        for bucket in [&data_bucket, &log_bucket] {
            if !store.bucket_exists(bucket).await? {
                anyhow::bail!("Bucket {} does not exist", bucket);
            }
        }

        info!(
            "Cluster {} data bucket {} log bucket {} (external: {})",
            name_id, data_bucket, log_bucket, external
        );
        Ok(Self::new(name_id, data_bucket, log_bucket, external))
    }

    pub fn artifact_prefix(&self) -> String {
        self.name_id.artifact_prefix()
    }

    pub fn log_destination(&self, container_name: &str) -> LogDestination {
        if is_aux_container(container_name) {
            let tag = if self.log_bucket_external {
                RETENTION_AX_LOG_EXTERNAL
            } else {
                RETENTION_AX_LOG
            };
            LogDestination {
                bucket: self.log_bucket.clone(),
                dated: true,
                retention_tag: tag,
                artifact_type: tag,
            }
        } else {
            LogDestination {
                bucket: self.data_bucket.clone(),
                dated: false,
                retention_tag: RETENTION_USER_LOG,
                artifact_type: RETENTION_USER_LOG,
            }
        }
    }
}
