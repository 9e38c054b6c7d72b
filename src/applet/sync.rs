//! Periodic reconciliation of the persisted pods against kubelet.

use crate::applet::amclient::AmClient;
use crate::applet::plm::PodLogManagerPool;
use crate::applet::store::{AppRecord, ApplicationRecord, PodRecord, RecordKey};
use crate::kubernetes::{PodSource, current_containers, pod_meta, pod_status_payload, skeleton_status};
use crate::types::{ContainerRef, HeartBeatType, PodKey, PodMeta};
use crate::utils::epoch_secs;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What changed for one pod between the store and kubelet.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PodDiff {
    /// Every started container, new or not.
    pub live: Vec<ContainerRef>,
    /// Rows for containers not yet recorded.
    pub to_add: Vec<AppRecord>,
    /// Recorded container ids kubelet no longer reports.
    pub to_remove: Vec<String>,
}

pub fn diff_pod(record: &PodRecord, live: Vec<ContainerRef>, meta: &PodMeta) -> PodDiff {
    let recorded = record.container_ids();
    let live_ids: HashSet<&str> = live.iter().map(|c| c.id.as_str()).collect();
    let to_add = live
        .iter()
        .filter(|c| !recorded.contains(c.id.as_str()))
        .map(|c| AppRecord::new(&record.pod, meta, c))
        .collect();
    let mut to_remove: Vec<String> = recorded
        .iter()
        .filter(|id| !live_ids.contains(*id))
        .map(|id| id.to_string())
        .collect();
    to_remove.sort();
    PodDiff {
        live,
        to_add,
        to_remove,
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    pub retired: usize,
    pub failed: usize,
}

pub struct PodSync {
    pods: Arc<dyn PodSource>,
    store: Arc<ApplicationRecord>,
    pool: Arc<PodLogManagerPool>,
    am: Arc<AmClient>,
}

impl PodSync {
    pub fn new(
        pods: Arc<dyn PodSource>,
        store: Arc<ApplicationRecord>,
        pool: Arc<PodLogManagerPool>,
        am: Arc<AmClient>,
    ) -> Self {
        Self {
            pods,
            store,
            pool,
            am,
        }
    }

    /// Run a sync every `period` forever. A failed tick is logged and the next
    /// one proceeds normally.
    pub async fn run(&self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.sync_once().await {
                Ok(report) => debug!("Pod sync done: {:?}", report),
                Err(e) => error!("Pod sync failed: {:#}", e),
            }
        }
    }

    /// Re-create collectors for everything persisted, before serving.
    pub async fn nanny_existing_pods(&self) -> anyhow::Result<()> {
        let persisted = self.store.load_all().await?;
        for record in persisted.values() {
            let containers: Vec<ContainerRef> =
                record.containers.iter().map(|c| c.container.clone()).collect();
            self.pool
                .create_or_update(&record.pod, &record.meta, &containers, &[])
                .await;
        }
        info!("Resumed log collection for {} pods", persisted.len());
        Ok(())
    }

    pub async fn sync_once(&self) -> anyhow::Result<SyncReport> {
        let mut persisted = self.store.load_all().await?;
        let mut report = SyncReport::default();
        if persisted.is_empty() {
            return Ok(report);
        }
        let live_pods = self.pods.list_pods().await?;
        let ts = epoch_secs();

        for pod in &live_pods {
            let key = PodKey::new(pod.namespace().unwrap_or_default(), pod.name_any());
            let Some(record) = persisted.remove(&key) else {
                continue;
            };
            match self.sync_pod(&record, pod, ts).await {
                Ok(()) => report.synced += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(pod = %key, "Failed to sync pod: {:#}", e);
                }
            }
        }

        for (key, record) in persisted {
            match self.retire_pod(&record, ts).await {
                Ok(()) => report.retired += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(pod = %key, "Failed to retire pod: {:#}", e);
                }
            }
        }
        Ok(report)
    }

    async fn sync_pod(&self, record: &PodRecord, pod: &Pod, ts: i64) -> anyhow::Result<()> {
        let meta = pod_meta(pod);
        let diff = diff_pod(record, current_containers(pod), &meta);
        if !diff.to_add.is_empty() || !diff.to_remove.is_empty() {
            info!(
                pod = %record.pod,
                "Containers added: {:?}, removed: {:?}",
                diff.to_add.iter().map(|r| &r.container_id).collect::<Vec<_>>(),
                diff.to_remove
            );
        }

        // Collectors stop before their rows go; rows exist before collectors start.
        self.pool
            .create_or_update(&record.pod, &meta, &[], &diff.to_remove)
            .await;
        let to_delete: Vec<RecordKey> = diff
            .to_remove
            .iter()
            .map(|cid| RecordKey {
                app_name: record.pod.namespace.clone(),
                pod_name: record.pod.pod_name.clone(),
                container_id: cid.clone(),
            })
            .collect();
        self.store.refresh(&diff.to_add, &to_delete).await?;
        self.pool
            .create_or_update(&record.pod, &meta, &diff.live, &[])
            .await;

        if let Err(e) = self
            .am
            .send_heartbeat(
                &record.pod.namespace,
                &meta.deployment_id,
                HeartBeatType::HeartBeat,
                ts,
                pod_status_payload(pod),
            )
            .await
        {
            warn!(pod = %record.pod, "Heartbeat failed: {}", e);
        }
        Ok(())
    }

    async fn retire_pod(&self, record: &PodRecord, ts: i64) -> anyhow::Result<()> {
        info!(pod = %record.pod, "Pod is gone, stopping log collection");
        self.pool.remove(&record.pod).await;
        self.store.refresh(&[], &record.keys()).await?;
        if let Err(e) = self
            .am
            .send_heartbeat(
                &record.pod.namespace,
                &record.meta.deployment_id,
                HeartBeatType::TombStone,
                ts,
                skeleton_status(&record.pod.pod_name),
            )
            .await
        {
            warn!(pod = %record.pod, "Tombstone failed: {}", e);
        }
        Ok(())
    }
}
