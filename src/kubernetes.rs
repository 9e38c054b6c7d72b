use crate::retry::{self, retry_async};
use crate::types::{ContainerRef, PodMeta};
use crate::utils::strip_runtime_prefix;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::debug;

pub const APPLICATION_LABEL: &str = "application";
pub const DEPLOYMENT_LABEL: &str = "deployment";
pub const DEPLOYMENT_ID_LABEL: &str = "deployment_id";
pub const IDENTIFIERS_ANNOTATION: &str = "AX_IDENTIFIERS";

/// Read access to the pods kubelet runs on this node.
#[async_trait]
pub trait PodSource: Send + Sync {
    /// Pods on this node carrying the `application` label.
    async fn list_pods(&self) -> anyhow::Result<Vec<Pod>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Pod>>;
}

pub struct NodePods {
    client: Client,
    node_name: String,
}

impl NodePods {
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }
}

#[async_trait]
impl PodSource for NodePods {
    async fn list_pods(&self) -> anyhow::Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default()
            .labels(APPLICATION_LABEL)
            .fields(&format!("spec.nodeName={}", self.node_name));
        let pods = retry_async(retry::NETWORK, "list pods", || api.list(&lp), retry::always).await?;
        debug!("kubelet reports {} pods on {}", pods.items.len(), self.node_name);
        Ok(pods.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = retry_async(retry::NETWORK, "get pod", || api.get_opt(name), retry::always).await?;
        Ok(pod)
    }
}

/// Containers that have started: running or terminated, with a runtime id.
pub fn current_containers(pod: &Pod) -> Vec<ContainerRef> {
    let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) else {
        return Vec::new();
    };
    statuses
        .iter()
        .filter(|cs| {
            cs.state
                .as_ref()
                .is_some_and(|st| st.running.is_some() || st.terminated.is_some())
        })
        .filter_map(|cs| {
            let id = cs.container_id.as_deref().map(strip_runtime_prefix)?;
            if id.is_empty() {
                return None;
            }
            Some(ContainerRef::new(cs.name.clone(), id))
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct Identifiers {
    #[serde(default)]
    application_id: Option<String>,
    #[serde(default)]
    deployment_id: Option<String>,
}

/// Platform identifiers: the `AX_IDENTIFIERS` annotation first, then labels.
pub fn pod_meta(pod: &Pod) -> PodMeta {
    let labels = pod.labels();
    let ids: Identifiers = pod
        .annotations()
        .get(IDENTIFIERS_ANNOTATION)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    let label = |k: &str| labels.get(k).cloned();
    PodMeta {
        app_id: ids.application_id.unwrap_or_default(),
        deployment_id: ids
            .deployment_id
            .or_else(|| label(DEPLOYMENT_ID_LABEL))
            .unwrap_or_default(),
        deployment_name: label(DEPLOYMENT_LABEL).unwrap_or_default(),
    }
}

/// Pod status as sent with BIRTH_CRY and HEART_BEAT. Only plain JSON values,
/// with the pod name added.
pub fn pod_status_payload(pod: &Pod) -> Value {
    let mut status = pod
        .status
        .as_ref()
        .and_then(|s| serde_json::to_value(s).ok())
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({}));
    if let Some(obj) = status.as_object_mut() {
        obj.retain(|_, v| !v.is_null());
        obj.insert("name".into(), Value::String(pod.name_any()));
    }
    status
}

/// Minimal status for a pod that is gone or has no status to report.
pub fn skeleton_status(pod_name: &str) -> Value {
    json!({ "name": pod_name })
}

pub fn skeleton_status_with_reason(pod_name: &str, reason: &str, message: &str) -> Value {
    json!({ "name": pod_name, "reason": reason, "message": message })
}

/// Spot settings persisted in a ConfigMap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpotSettings {
    pub enabled: String,
    pub asgs: String,
}

pub const SPOT_ENABLED_KEY: &str = "MM_SPOT_INSTANCE_ENABLED";
pub const SCALING_GROUPS_KEY: &str = "MM_SCALING_GROUPS";

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<SpotSettings>;

    /// Store `enabled` and, when given, a new ASG list.
    async fn save(&self, enabled: &str, asgs: Option<&str>) -> anyhow::Result<()>;
}

pub struct ConfigMapSettings {
    api: Api<ConfigMap>,
    name: String,
}

impl ConfigMapSettings {
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
        }
    }
}

#[async_trait]
impl SettingsStore for ConfigMapSettings {
    async fn load(&self) -> anyhow::Result<SpotSettings> {
        let cm = self.api.get(&self.name).await?;
        let data = cm.data.unwrap_or_default();
        Ok(SpotSettings {
            enabled: data.get(SPOT_ENABLED_KEY).cloned().unwrap_or_default(),
            asgs: data.get(SCALING_GROUPS_KEY).cloned().unwrap_or_default(),
        })
    }

    async fn save(&self, enabled: &str, asgs: Option<&str>) -> anyhow::Result<()> {
        let mut cm = self.api.get(&self.name).await?;
        let data = cm.data.get_or_insert_with(BTreeMap::new);
        data.insert(SPOT_ENABLED_KEY.to_string(), enabled.to_string());
        if let Some(asgs) = asgs {
            data.insert(SCALING_GROUPS_KEY.to_string(), asgs.to_string());
        }
        self.api.replace(&self.name, &PostParams::default(), &cm).await?;
        Ok(())
    }
}
