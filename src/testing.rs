//! In-memory stand-ins for the external services, shared by the unit tests.

use crate::kubernetes::{PodSource, SettingsStore, SpotSettings};
use crate::minion::bid_advisor::{PriceFeed, SpotPrice};
use crate::minion::scaling::{GroupInfo, InstanceInfo, LaunchConfigInfo, ScalingApi};
use crate::objstore::{ObjectStore, PutOptions};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
    ContainerStatus, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, PartialEq)]
pub struct PutRecord {
    pub bucket: String,
    pub key: String,
    pub body: Vec<u8>,
    pub opts: PutOptions,
}

#[derive(Default)]
pub struct MemoryStore {
    buckets: Mutex<HashSet<String>>,
    objects: Mutex<HashMap<(String, String), String>>,
    puts: Mutex<Vec<PutRecord>>,
    fail_puts: AtomicU32,
}

impl MemoryStore {
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let store = Self::default();
        store
            .buckets
            .lock()
            .unwrap()
            .extend(buckets.iter().map(|b| b.to_string()));
        store
    }

    pub fn put_object(&self, bucket: &str, key: &str, body: &str) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), body.to_string());
    }

    /// Fail the next `n` uploads.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    pub fn puts(&self) -> Vec<PutRecord> {
        self.puts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn bucket_exists(&self, bucket: &str) -> anyhow::Result<bool> {
        Ok(self.buckets.lock().unwrap().contains(bucket))
    }

    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        opts: &PutOptions,
    ) -> anyhow::Result<u64> {
        let remaining = self.fail_puts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_puts.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("injected upload failure");
        }
        let body = tokio::fs::read(path).await?;
        let len = body.len() as u64;
        self.puts.lock().unwrap().push(PutRecord {
            bucket: bucket.to_string(),
            key: key.to_string(),
            body,
            opts: opts.clone(),
        });
        Ok(len)
    }

    async fn get_string(&self, bucket: &str, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned())
    }
}

/// Pods the fake kubelet reports, keyed by (namespace, name).
#[derive(Default)]
pub struct FakePods {
    pods: Mutex<BTreeMap<(String, String), Pod>>,
    pub fail_list: std::sync::atomic::AtomicBool,
}

impl FakePods {
    pub fn set(&self, pod: Pod) {
        let key = (
            pod.metadata.namespace.clone().unwrap_or_default(),
            pod.metadata.name.clone().unwrap_or_default(),
        );
        self.pods.lock().unwrap().insert(key, pod);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.pods
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

#[async_trait]
impl PodSource for FakePods {
    async fn list_pods(&self) -> anyhow::Result<Vec<Pod>> {
        if self.fail_list.load(Ordering::SeqCst) {
            anyhow::bail!("kubelet unavailable");
        }
        Ok(self.pods.lock().unwrap().values().cloned().collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Pod>> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

pub enum State {
    Running,
    Terminated,
    Waiting,
}

/// Build a pod in `app` with the given `(container name, id, state)` list.
pub fn make_pod(app: &str, name: &str, containers: &[(&str, &str, State)]) -> Pod {
    let statuses = containers
        .iter()
        .map(|(cname, cid, state)| {
            let st = match state {
                State::Running => ContainerState {
                    running: Some(ContainerStateRunning::default()),
                    ..Default::default()
                },
                State::Terminated => ContainerState {
                    terminated: Some(ContainerStateTerminated::default()),
                    ..Default::default()
                },
                State::Waiting => ContainerState {
                    waiting: Some(ContainerStateWaiting::default()),
                    ..Default::default()
                },
            };
            ContainerStatus {
                name: cname.to_string(),
                container_id: Some(format!("docker://{}", cid)),
                state: Some(st),
                ..Default::default()
            }
        })
        .collect();
    let mut labels = BTreeMap::new();
    labels.insert("application".to_string(), app.to_string());
    labels.insert("deployment".to_string(), "web".to_string());
    let mut annotations = BTreeMap::new();
    annotations.insert(
        "AX_IDENTIFIERS".to_string(),
        r#"{"application_id": "app-id-1", "deployment_id": "dep-id-1"}"#.to_string(),
    );
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(app.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(statuses),
            ..Default::default()
        }),
    }
}

/// Collector services over a temp dir: logs under `<dir>/logs`, records in
/// `<dir>/applet.db`, artifacts posted to `artifact_url`.
pub async fn collector_context(
    dir: &Path,
    objects: std::sync::Arc<MemoryStore>,
    artifact_url: &str,
    app_mode: bool,
) -> (
    std::sync::Arc<crate::applet::collector::CollectorContext>,
    std::sync::Arc<crate::applet::store::ApplicationRecord>,
) {
    use crate::retry::RetryPolicy;
    use std::sync::Arc;

    std::fs::create_dir_all(dir.join("logs")).unwrap();
    let store = Arc::new(
        crate::applet::store::ApplicationRecord::open(&dir.join("applet.db"), "v1")
            .await
            .unwrap()
            .with_retry(RetryPolicy::immediate(3)),
    );
    let layout = crate::cluster::ClusterLayout::new(
        crate::types::ClusterNameId::parse("prod-1b4e28ba-2fa1-11d2-883f-0016d3cca427").unwrap(),
        "applatix-data-acme-0",
        "applatix-cluster-acme-0",
        false,
    );
    let ctx = Arc::new(crate::applet::collector::CollectorContext {
        log_root: dir.join("logs"),
        layout,
        objstore: objects,
        artifacts: crate::applet::artifacts::ArtifactClient::new(artifact_url)
            .unwrap()
            .with_retry(RetryPolicy::immediate(1)),
        store: store.clone(),
        upload_retry: RetryPolicy::immediate(3),
        app_mode,
        rewatch_delay: std::time::Duration::from_millis(50),
    });
    (ctx, store)
}

/// Poll `cond` every 20ms for up to 5s.
pub async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

/// Price feed with settable tables. Clones share state.
#[derive(Clone, Default)]
pub struct FakeFeed {
    inner: std::sync::Arc<FeedState>,
}

#[derive(Default)]
struct FeedState {
    on_demand: Mutex<HashMap<String, f64>>,
    spot: Mutex<Vec<SpotPrice>>,
    failing: std::sync::atomic::AtomicBool,
}

impl FakeFeed {
    pub fn set_on_demand(&self, instance_type: &str, price: f64) {
        self.inner
            .on_demand
            .lock()
            .unwrap()
            .insert(instance_type.to_string(), price);
    }

    pub fn add_spot(&self, zone: &str, instance_type: &str, price: f64, timestamp: i64) {
        self.inner.spot.lock().unwrap().push(SpotPrice {
            zone: zone.to_string(),
            instance_type: instance_type.to_string(),
            price,
            timestamp,
        });
    }

    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PriceFeed for FakeFeed {
    async fn on_demand_prices(&self) -> anyhow::Result<HashMap<String, f64>> {
        if self.inner.failing.load(Ordering::SeqCst) {
            anyhow::bail!("price list unavailable");
        }
        Ok(self.inner.on_demand.lock().unwrap().clone())
    }

    async fn spot_prices(&self) -> anyhow::Result<Vec<SpotPrice>> {
        if self.inner.failing.load(Ordering::SeqCst) {
            anyhow::bail!("spot price history unavailable");
        }
        Ok(self.inner.spot.lock().unwrap().clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScalingCall {
    CreateLaunchConfig {
        from: String,
        name: String,
        spot_price: Option<String>,
    },
    UpdateGroup {
        group: String,
        launch_config: String,
    },
    DeleteLaunchConfig(String),
}

/// Autoscaling groups, launch configs and instances held in memory.
#[derive(Default)]
pub struct FakeScaling {
    groups: Mutex<Vec<GroupInfo>>,
    launch_configs: Mutex<HashMap<String, LaunchConfigInfo>>,
    instances: Mutex<HashMap<String, InstanceInfo>>,
    mutations: Mutex<Vec<ScalingCall>>,
    terminated: Mutex<Vec<String>>,
}

impl FakeScaling {
    /// A group in `us-west-2a` running `m3.large` from launch config `lc`.
    pub fn add_group(&self, name: &str, lc: &str, spot_price: Option<&str>, desired: i32) {
        self.groups.lock().unwrap().push(GroupInfo {
            name: name.to_string(),
            launch_config_name: Some(lc.to_string()),
            zones: vec!["us-west-2a".to_string()],
            desired_capacity: desired,
            instance_ids: Vec::new(),
        });
        self.launch_configs.lock().unwrap().insert(
            lc.to_string(),
            LaunchConfigInfo {
                name: lc.to_string(),
                instance_type: "m3.large".to_string(),
                spot_price: spot_price.map(str::to_string),
            },
        );
    }

    pub fn add_instance(
        &self,
        group: &str,
        id: &str,
        spot: bool,
        launch_time: chrono::DateTime<chrono::Utc>,
    ) {
        let mut groups = self.groups.lock().unwrap();
        if let Some(g) = groups.iter_mut().find(|g| g.name == group) {
            g.instance_ids.push(id.to_string());
        }
        self.instances.lock().unwrap().insert(
            id.to_string(),
            InstanceInfo {
                id: id.to_string(),
                zone: "us-west-2a".to_string(),
                instance_type: "m3.large".to_string(),
                launch_time,
                spot,
            },
        );
    }

    /// Drop an instance from its group without recording a termination.
    pub fn remove_instance(&self, group: &str, id: &str) {
        if let Some(g) = self.groups.lock().unwrap().iter_mut().find(|g| g.name == group) {
            g.instance_ids.retain(|i| i != id);
        }
        self.instances.lock().unwrap().remove(id);
    }

    pub fn set_desired(&self, group: &str, desired: i32) {
        if let Some(g) = self.groups.lock().unwrap().iter_mut().find(|g| g.name == group) {
            g.desired_capacity = desired;
        }
    }

    pub fn mutations(&self) -> Vec<ScalingCall> {
        self.mutations.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScalingApi for FakeScaling {
    async fn describe_groups(&self, names: &[String]) -> anyhow::Result<Vec<GroupInfo>> {
        let groups = self.groups.lock().unwrap();
        Ok(names
            .iter()
            .filter_map(|n| groups.iter().find(|g| &g.name == n).cloned())
            .collect())
    }

    async fn describe_launch_config(&self, name: &str) -> anyhow::Result<LaunchConfigInfo> {
        self.launch_configs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no launch configuration {}", name))
    }

    async fn create_launch_config(
        &self,
        from: &str,
        new_name: &str,
        spot_price: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut lcs = self.launch_configs.lock().unwrap();
        let source = lcs
            .get(from)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no launch configuration {}", from))?;
        lcs.entry(new_name.to_string()).or_insert(LaunchConfigInfo {
            name: new_name.to_string(),
            instance_type: source.instance_type,
            spot_price: spot_price.map(str::to_string),
        });
        self.mutations.lock().unwrap().push(ScalingCall::CreateLaunchConfig {
            from: from.to_string(),
            name: new_name.to_string(),
            spot_price: spot_price.map(str::to_string),
        });
        Ok(())
    }

    async fn update_group_launch_config(
        &self,
        group: &str,
        launch_config: &str,
    ) -> anyhow::Result<()> {
        if let Some(g) = self.groups.lock().unwrap().iter_mut().find(|g| g.name == group) {
            g.launch_config_name = Some(launch_config.to_string());
        }
        self.mutations.lock().unwrap().push(ScalingCall::UpdateGroup {
            group: group.to_string(),
            launch_config: launch_config.to_string(),
        });
        Ok(())
    }

    async fn delete_launch_config(&self, name: &str) -> anyhow::Result<()> {
        self.launch_configs.lock().unwrap().remove(name);
        self.mutations
            .lock()
            .unwrap()
            .push(ScalingCall::DeleteLaunchConfig(name.to_string()));
        Ok(())
    }

    async fn describe_instances(&self, ids: &[String]) -> anyhow::Result<Vec<InstanceInfo>> {
        let instances = self.instances.lock().unwrap();
        Ok(ids.iter().filter_map(|id| instances.get(id).cloned()).collect())
    }

    async fn terminate_instance(&self, id: &str) -> anyhow::Result<()> {
        self.instances.lock().unwrap().remove(id);
        for g in self.groups.lock().unwrap().iter_mut() {
            g.instance_ids.retain(|i| i != id);
        }
        self.terminated.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

/// Spot settings kept in memory.
#[derive(Default)]
pub struct MemorySettings {
    pub settings: Mutex<SpotSettings>,
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn load(&self) -> anyhow::Result<SpotSettings> {
        Ok(self.settings.lock().unwrap().clone())
    }

    async fn save(&self, enabled: &str, asgs: Option<&str>) -> anyhow::Result<()> {
        let mut s = self.settings.lock().unwrap();
        s.enabled = enabled.to_string();
        if let Some(asgs) = asgs {
            s.asgs = asgs.to_string();
        }
        Ok(())
    }
}
