//! Pod log managers: the live collectors of each pod on the node.

use crate::applet::collector::{CollectorContext, CollectorHandle, ContainerLogCollector};
use crate::types::{ContainerRef, PodKey, PodMeta, is_aux_container};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Owns the collectors of one pod, keyed by container id.
pub struct PodLogManager {
    pod: PodKey,
    meta: PodMeta,
    ctx: Arc<CollectorContext>,
    collectors: Mutex<HashMap<String, CollectorHandle>>,
}

impl PodLogManager {
    fn new(pod: PodKey, meta: PodMeta, ctx: Arc<CollectorContext>) -> Self {
        Self {
            pod,
            meta,
            ctx,
            collectors: Mutex::new(HashMap::new()),
        }
    }

    /// Start a collector unless one already runs for this container id.
    pub fn start_collector(&self, container: &ContainerRef) -> anyhow::Result<()> {
        let mut collectors = self.collectors.lock().unwrap_or_else(|e| e.into_inner());
        if collectors.contains_key(&container.id) {
            return Ok(());
        }
        let handle = ContainerLogCollector::spawn(
            self.ctx.clone(),
            self.pod.clone(),
            self.meta.clone(),
            container.clone(),
        )?;
        info!(
            container_id = %container.id,
            "Started log collector for {} container {}", self.pod, container.name
        );
        collectors.insert(container.id.clone(), handle);
        Ok(())
    }

    /// Stop a collector and wait until it has exited.
    pub async fn stop_collector(&self, container_id: &str) {
        let handle = self
            .collectors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(container_id);
        if let Some(handle) = handle {
            handle.stop().await;
            info!(container_id = %container_id, "Stopped log collector for {}", self.pod);
        }
    }

    /// Stop every collector of the pod and wait for all of them.
    pub async fn terminate(&self) {
        let handles: Vec<CollectorHandle> = self
            .collectors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, h)| h)
            .collect();
        futures::future::join_all(handles.into_iter().map(CollectorHandle::stop)).await;
        info!("All log collectors for {} terminated", self.pod);
    }

    pub fn containers(&self) -> Vec<ContainerRef> {
        self.collectors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|h| h.container().clone())
            .collect()
    }
}

/// All pod log managers on the node, keyed by `"{pod}.{namespace}"`. The map
/// lock is only held for lookup and insert.
pub struct PodLogManagerPool {
    ctx: Arc<CollectorContext>,
    managers: Mutex<HashMap<String, Arc<PodLogManager>>>,
    collect_aux_logs: bool,
}

impl PodLogManagerPool {
    pub fn new(ctx: Arc<CollectorContext>, collect_aux_logs: bool) -> Self {
        Self {
            ctx,
            managers: Mutex::new(HashMap::new()),
            collect_aux_logs,
        }
    }

    fn get_or_create(&self, pod: &PodKey, meta: &PodMeta) -> Arc<PodLogManager> {
        self.managers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(pod.to_string())
            .or_insert_with(|| {
                debug!("Creating pod log manager for {}", pod);
                Arc::new(PodLogManager::new(pod.clone(), meta.clone(), self.ctx.clone()))
            })
            .clone()
    }

    /// Stop `to_remove` collectors, then start `to_add` ones. Starting is
    /// idempotent; a container whose collector fails to start is retried on
    /// the next call.
    pub async fn create_or_update(
        &self,
        pod: &PodKey,
        meta: &PodMeta,
        to_add: &[ContainerRef],
        to_remove: &[String],
    ) {
        let plm = self.get_or_create(pod, meta);
        for cid in to_remove {
            plm.stop_collector(cid).await;
        }
        for container in to_add {
            if is_aux_container(&container.name) && !self.collect_aux_logs {
                debug!("Skipping platform container {} in {}", container.name, pod);
                continue;
            }
            if let Err(e) = plm.start_collector(container) {
                warn!(
                    container_id = %container.id,
                    "Cannot start log collector for {}: {:#}", pod, e
                );
            }
        }
    }

    /// Drop the pod's manager after all its collectors have exited.
    pub async fn remove(&self, pod: &PodKey) {
        let plm = self
            .managers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pod.to_string());
        if let Some(plm) = plm {
            plm.terminate().await;
        }
    }

    /// Container ids with a live collector, across all pods.
    pub fn containers(&self) -> Vec<String> {
        let managers: Vec<Arc<PodLogManager>> = self
            .managers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut ids: Vec<String> = managers
            .iter()
            .flat_map(|m| m.containers())
            .map(|c| c.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn has_pod(&self, pod: &PodKey) -> bool {
        self.managers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&pod.to_string())
    }
}
