//! Application records: which containers this node has committed to shipping
//! logs for, and the last rotated file shipped for each.

use crate::retry::{self, RetryPolicy, retry_async};
use crate::types::{ContainerRef, PodKey, PodMeta};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create {}: {}", .0.display(), .1)]
    CreateDir(PathBuf, #[source] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// One row per container. Rows are scoped to the store's record version.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AppRecord {
    pub app_name: String,
    pub app_id: String,
    pub deployment_name: String,
    pub deployment_id: String,
    pub pod_name: String,
    pub container_name: String,
    pub container_id: String,
    pub last_done: String,
}

impl AppRecord {
    pub fn new(pod: &PodKey, meta: &PodMeta, container: &ContainerRef) -> Self {
        Self {
            app_name: pod.namespace.clone(),
            app_id: meta.app_id.clone(),
            deployment_name: meta.deployment_name.clone(),
            deployment_id: meta.deployment_id.clone(),
            pod_name: pod.pod_name.clone(),
            container_name: container.name.clone(),
            container_id: container.id.clone(),
            last_done: String::new(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            app_name: self.app_name.clone(),
            pod_name: self.pod_name.clone(),
            container_id: self.container_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub app_name: String,
    pub pod_name: String,
    pub container_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub container: ContainerRef,
    pub last_done: String,
}

/// All rows of one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRecord {
    pub pod: PodKey,
    pub meta: PodMeta,
    pub containers: Vec<ContainerRecord>,
}

impl PodRecord {
    pub fn container_ids(&self) -> HashSet<&str> {
        self.containers
            .iter()
            .map(|c| c.container.id.as_str())
            .collect()
    }

    pub fn keys(&self) -> Vec<RecordKey> {
        self.containers
            .iter()
            .map(|c| RecordKey {
                app_name: self.pod.namespace.clone(),
                pod_name: self.pod.pod_name.clone(),
                container_id: c.container.id.clone(),
            })
            .collect()
    }
}

pub struct ApplicationRecord {
    pool: SqlitePool,
    version: String,
    retry: RetryPolicy,
}

impl ApplicationRecord {
    /// Open or create the database file. A single connection serializes access.
    pub async fn open(path: &Path, version: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::CreateDir(parent.to_path_buf(), e))?;
        }
        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;
        MIGRATOR.run(&pool).await?;
        info!("Application records at {} (version {})", path.display(), version);
        Ok(Self {
            pool,
            version: version.to_string(),
            retry: retry::STORE,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Insert rows; rows already present are left untouched.
    pub async fn add(&self, rows: &[AppRecord]) -> Result<(), StoreError> {
        self.refresh(rows, &[]).await
    }

    pub async fn delete(&self, keys: &[RecordKey]) -> Result<(), StoreError> {
        self.refresh(&[], keys).await
    }

    /// Insert `to_add` and delete `to_delete` in one transaction.
    pub async fn refresh(
        &self,
        to_add: &[AppRecord],
        to_delete: &[RecordKey],
    ) -> Result<(), StoreError> {
        if to_add.is_empty() && to_delete.is_empty() {
            return Ok(());
        }
        retry_async(
            self.retry,
            "refresh application records",
            || self.refresh_once(to_add, to_delete),
            retry::always,
        )
        .await
    }

    async fn refresh_once(
        &self,
        to_add: &[AppRecord],
        to_delete: &[RecordKey],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in to_add {
            insert_row(&mut tx, &self.version, row).await?;
        }
        for key in to_delete {
            sqlx::query(
                r#"
                DELETE FROM app_records
                WHERE version = ? AND app_name = ? AND pod_name = ? AND container_id = ?
                "#,
            )
            .bind(&self.version)
            .bind(&key.app_name)
            .bind(&key.pod_name)
            .bind(&key.container_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!("Added {} and deleted {} application records", to_add.len(), to_delete.len());
        Ok(())
    }

    /// Make the pod's rows match `current` exactly. Existing rows keep their
    /// `last_done`.
    pub async fn update_application(
        &self,
        pod: &PodKey,
        meta: &PodMeta,
        current: &[ContainerRef],
    ) -> Result<(), StoreError> {
        retry_async(
            self.retry,
            "update application records",
            || self.update_application_once(pod, meta, current),
            retry::always,
        )
        .await
    }

    async fn update_application_once(
        &self,
        pod: &PodKey,
        meta: &PodMeta,
        current: &[ContainerRef],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let existing: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT container_id FROM app_records
            WHERE version = ? AND app_name = ? AND pod_name = ?
            "#,
        )
        .bind(&self.version)
        .bind(&pod.namespace)
        .bind(&pod.pod_name)
        .fetch_all(&mut *tx)
        .await?;

        let keep: HashSet<&str> = current.iter().map(|c| c.id.as_str()).collect();
        for (cid,) in existing.iter().filter(|(cid,)| !keep.contains(cid.as_str())) {
            sqlx::query(
                r#"
                DELETE FROM app_records
                WHERE version = ? AND app_name = ? AND pod_name = ? AND container_id = ?
                "#,
            )
            .bind(&self.version)
            .bind(&pod.namespace)
            .bind(&pod.pod_name)
            .bind(cid)
            .execute(&mut *tx)
            .await?;
        }
        for c in current {
            insert_row(&mut tx, &self.version, &AppRecord::new(pod, meta, c)).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Record the last rotated file shipped for a container. `watermark` is
    /// the mtime in nanoseconds up to which every rotated file has been
    /// shipped; it never moves backwards.
    pub async fn record_done(
        &self,
        pod: &PodKey,
        container_id: &str,
        path: &str,
        watermark: i64,
    ) -> Result<(), StoreError> {
        retry_async(
            self.retry,
            "record last shipped log",
            || async {
                sqlx::query(
                    r#"
                    UPDATE app_records
                    SET last_done = ?, last_done_mtime = MAX(last_done_mtime, ?)
                    WHERE version = ? AND app_name = ? AND pod_name = ? AND container_id = ?
                    "#,
                )
                .bind(path)
                .bind(watermark)
                .bind(&self.version)
                .bind(&pod.namespace)
                .bind(&pod.pod_name)
                .bind(container_id)
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(StoreError::from)
            },
            retry::always,
        )
        .await
    }

    pub async fn last_done(
        &self,
        pod: &PodKey,
        container_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT last_done FROM app_records
            WHERE version = ? AND app_name = ? AND pod_name = ? AND container_id = ?
            "#,
        )
        .bind(&self.version)
        .bind(&pod.namespace)
        .bind(&pod.pod_name)
        .bind(container_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(s,)| s))
    }

    /// Rotated files last modified at or before this mtime (nanoseconds) have
    /// been shipped. Zero when nothing is recorded.
    pub async fn shipped_watermark(
        &self,
        pod: &PodKey,
        container_id: &str,
    ) -> Result<i64, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT last_done_mtime FROM app_records
            WHERE version = ? AND app_name = ? AND pod_name = ? AND container_id = ?
            "#,
        )
        .bind(&self.version)
        .bind(&pod.namespace)
        .bind(&pod.pod_name)
        .bind(container_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(m,)| m).unwrap_or(0))
    }

    /// All rows grouped by pod.
    pub async fn load_all(&self) -> Result<BTreeMap<PodKey, PodRecord>, StoreError> {
        let rows = sqlx::query_as::<_, AppRecord>(
            r#"
            SELECT app_name, app_id, deployment_name, deployment_id, pod_name,
                   container_name, container_id, last_done
            FROM app_records
            WHERE version = ?
            ORDER BY app_name, pod_name, container_name, container_id
            "#,
        )
        .bind(&self.version)
        .fetch_all(&self.pool)
        .await?;

        let mut pods: BTreeMap<PodKey, PodRecord> = BTreeMap::new();
        for row in rows {
            let pod = PodKey::new(row.app_name, row.pod_name);
            let entry = pods.entry(pod.clone()).or_insert_with(|| PodRecord {
                pod,
                meta: PodMeta {
                    app_id: row.app_id,
                    deployment_id: row.deployment_id,
                    deployment_name: row.deployment_name,
                },
                containers: Vec::new(),
            });
            entry.containers.push(ContainerRecord {
                container: ContainerRef::new(row.container_name, row.container_id),
                last_done: row.last_done,
            });
        }
        Ok(pods)
    }
}

async fn insert_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    version: &str,
    row: &AppRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO app_records
            (version, app_name, app_id, deployment_name, deployment_id,
             pod_name, container_name, container_id, last_done)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(version)
    .bind(&row.app_name)
    .bind(&row.app_id)
    .bind(&row.deployment_name)
    .bind(&row.deployment_id)
    .bind(&row.pod_name)
    .bind(&row.container_name)
    .bind(&row.container_id)
    .bind(&row.last_done)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
