//! Spot minion manager: moves autoscaling groups between spot and on-demand
//! instances as prices change, and retires on-demand instances late in their
//! billing hour once spot is cheaper.

pub mod aws;
pub mod bid_advisor;
pub mod price_reporter;
pub mod rest;
pub mod scaling;

use crate::config::MinionConfig;
use crate::kubernetes::ConfigMapSettings;
use crate::retry::{self, RetryPolicy, retry_async};
use anyhow::Context;
use aws::{AwsPriceFeed, AwsScaling};
use bid_advisor::{Bid, BidAdvisor, are_bids_equal};
use chrono::{DateTime, Utc};
use price_reporter::PriceReporter;
use rand::Rng;
use rest::RestState;
use scaling::{InstanceInfo, LaunchConfigInfo, ScalingApi, rotated_launch_config_name};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SECONDS_PER_HOUR: i64 = 3600;
const CONVERGE_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum MinionError {
    #[error("autoscaling group {0} not found")]
    GroupNotFound(String),

    #[error("autoscaling group {0} has no launch configuration")]
    NoLaunchConfig(String),

    #[error("autoscaling group {0} has no availability zone")]
    NoZone(String),
}

/// What the manager knows about one autoscaling group.
#[derive(Debug, Clone)]
pub struct GroupState {
    pub launch_config: LaunchConfigInfo,
    pub bid: Bid,
    pub instances: HashMap<String, InstanceInfo>,
}

pub struct ScalingGroup {
    pub name: String,
    pub zones: Vec<String>,
    state: Mutex<GroupState>,
}

impl ScalingGroup {
    pub fn new(name: impl Into<String>, zones: Vec<String>, launch_config: LaunchConfigInfo) -> Self {
        let bid = Bid::from_spot_price(launch_config.spot_price.as_deref());
        Self {
            name: name.into(),
            zones,
            state: Mutex::new(GroupState {
                launch_config,
                bid,
                instances: HashMap::new(),
            }),
        }
    }

    pub fn state(&self) -> GroupState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Make `instances` the group's instance set. Returns the ids that left.
    fn replace_instances(&self, instances: Vec<InstanceInfo>) -> Vec<String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let fresh: HashMap<String, InstanceInfo> =
            instances.into_iter().map(|i| (i.id.clone(), i)).collect();
        let mut gone: Vec<String> = state
            .instances
            .keys()
            .filter(|id| !fresh.contains_key(*id))
            .cloned()
            .collect();
        gone.sort();
        state.instances = fresh;
        gone
    }

    fn remove_instance(&self, id: &str) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .instances
            .remove(id);
    }

    fn set_launch_config(&self, launch_config: LaunchConfigInfo, bid: Bid) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.launch_config = launch_config;
        state.bid = bid;
    }
}

/// Seconds from `now` until minute `target_minute` of the instance's current
/// billing hour. Once that minute has passed, the same minute of the next
/// billing hour is used.
pub fn kill_delay(launch_time: DateTime<Utc>, now: DateTime<Utc>, target_minute: u32) -> Duration {
    let elapsed_in_hour = (now - launch_time).num_seconds().rem_euclid(SECONDS_PER_HOUR);
    let target = i64::from(target_minute) * 60;
    let secs = if target >= elapsed_in_hour {
        target - elapsed_in_hour
    } else {
        SECONDS_PER_HOUR - elapsed_in_hour + target
    };
    Duration::from_secs(secs as u64)
}

pub struct MinionManager {
    scaling: Arc<dyn ScalingApi>,
    advisor: Arc<BidAdvisor>,
    group_names: RwLock<Vec<String>>,
    groups: RwLock<Vec<Arc<ScalingGroup>>>,
    kill_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    retry: RetryPolicy,
    converge_delay: Duration,
}

impl MinionManager {
    pub fn new(scaling: Arc<dyn ScalingApi>, advisor: Arc<BidAdvisor>, group_names: Vec<String>) -> Self {
        Self {
            scaling,
            advisor,
            group_names: RwLock::new(group_names),
            groups: RwLock::new(Vec::new()),
            kill_timers: Mutex::new(HashMap::new()),
            retry: retry::NETWORK,
            converge_delay: Duration::from_secs(60),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Wait between capacity checks of a spot group.
    pub fn with_converge_delay(mut self, delay: Duration) -> Self {
        self.converge_delay = delay;
        self
    }

    pub fn advisor(&self) -> &Arc<BidAdvisor> {
        &self.advisor
    }

    pub fn group_names(&self) -> Vec<String> {
        self.group_names
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn groups(&self) -> Vec<Arc<ScalingGroup>> {
        self.groups.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Look up the configured groups and their current launch configs.
    pub async fn discover(&self) -> anyhow::Result<()> {
        let names = self.group_names();
        let infos = retry_async(
            self.retry,
            "describe autoscaling groups",
            || self.scaling.describe_groups(&names),
            retry::always,
        )
        .await?;

        let mut groups = Vec::with_capacity(infos.len());
        for info in infos {
            let lc_name = info
                .launch_config_name
                .clone()
                .ok_or_else(|| MinionError::NoLaunchConfig(info.name.clone()))?;
            let lc = retry_async(
                self.retry,
                "describe launch configuration",
                || self.scaling.describe_launch_config(&lc_name),
                retry::always,
            )
            .await?;
            let group = ScalingGroup::new(info.name, info.zones, lc);
            info!(
                asg = %group.name,
                "Using launch config {} with bid {}",
                lc_name,
                group.state().bid
            );
            groups.push(Arc::new(group));
        }
        for name in &names {
            if !groups.iter().any(|g| &g.name == name) {
                warn!("{}", MinionError::GroupNotFound(name.clone()));
            }
        }
        *self.groups.write().unwrap_or_else(|e| e.into_inner()) = groups;
        Ok(())
    }

    /// Replace the managed group set and rediscover it.
    pub async fn set_scaling_groups(&self, names: Vec<String>) -> anyhow::Result<()> {
        info!("Managing autoscaling groups {:?}", names);
        *self.group_names.write().unwrap_or_else(|e| e.into_inner()) = names;
        self.discover().await
    }

    /// Refresh the instances running in a group. Instances that left the
    /// group are forgotten and their kill checks cancelled.
    pub async fn populate_instances(&self, group: &ScalingGroup) -> anyhow::Result<()> {
        let info = self.describe_group(&group.name).await?;
        let instances = if info.desired_capacity == 0 {
            info!(asg = %group.name, "Desired capacity is 0");
            Vec::new()
        } else if info.instance_ids.is_empty() {
            info!(asg = %group.name, "No instances found");
            Vec::new()
        } else {
            retry_async(
                self.retry,
                "describe instances",
                || self.scaling.describe_instances(&info.instance_ids),
                retry::always,
            )
            .await?
        };
        let gone = group.replace_instances(instances);
        if !gone.is_empty() {
            info!(asg = %group.name, "Instances left the group: {:?}", gone);
            self.cancel_kills(&gone);
        }
        Ok(())
    }

    fn cancel_kills(&self, ids: &[String]) {
        let mut timers = self.kill_timers.lock().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            if let Some(handle) = timers.remove(id) {
                handle.abort();
            }
        }
    }

    async fn describe_group(&self, name: &str) -> anyhow::Result<scaling::GroupInfo> {
        let names = [name.to_string()];
        retry_async(
            self.retry,
            "describe autoscaling group",
            || self.scaling.describe_groups(&names),
            retry::always,
        )
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| MinionError::GroupNotFound(name.to_string()).into())
    }

    /// Arm one kill timer per on-demand instance not already armed.
    pub fn schedule_instance_termination(self: &Arc<Self>, group: &Arc<ScalingGroup>) {
        let instances: Vec<InstanceInfo> = group.state().instances.into_values().collect();
        let mut timers = self.kill_timers.lock().unwrap_or_else(|e| e.into_inner());
        for instance in instances.into_iter().filter(|i| !i.spot) {
            if timers.contains_key(&instance.id) {
                continue;
            }
            let minute = 40 + rand::thread_rng().gen_range(0..20);
            let delay = kill_delay(instance.launch_time, Utc::now(), minute);
            info!(
                asg = %group.name,
                "Checking on-demand instance {} in {}s", instance.id, delay.as_secs()
            );
            let manager = self.clone();
            let group = group.clone();
            let id = instance.id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                manager.run_or_die(&group, &instance).await;
            });
            timers.insert(id, handle);
        }
    }

    pub fn pending_kills(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .kill_timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Terminate an on-demand instance if spot is the current recommendation.
    pub async fn run_or_die(&self, group: &ScalingGroup, instance: &InstanceInfo) {
        let bid = self.advisor.new_bid(&instance.zone, &instance.instance_type);
        if bid.is_spot() {
            let res = retry_async(
                self.retry,
                "terminate instance",
                || self.scaling.terminate_instance(&instance.id),
                retry::always,
            )
            .await;
            match res {
                Ok(()) => {
                    info!(asg = %group.name, "Terminated on-demand instance {}", instance.id);
                    group.remove_instance(&instance.id);
                }
                Err(e) => error!(asg = %group.name, "Terminating {} failed: {:#}", instance.id, e),
            }
        } else {
            info!(asg = %group.name, "Continuing to run {}", instance.id);
        }
        self.kill_timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&instance.id);
    }

    /// Whether the desired number of instances runs, checked a few times to
    /// let a scale-up settle.
    pub async fn check_group_instances(&self, group: &ScalingGroup) -> anyhow::Result<bool> {
        for attempt in 1..=CONVERGE_ATTEMPTS {
            let info = self.describe_group(&group.name).await?;
            let running = info.instance_ids.len();
            // Scale-down leaves more instances than desired for a while.
            if info.desired_capacity as usize <= running {
                return Ok(true);
            }
            info!(
                asg = %group.name,
                "Desired {} instances, {} running", info.desired_capacity, running
            );
            if attempt < CONVERGE_ATTEMPTS {
                tokio::time::sleep(self.converge_delay).await;
            }
        }
        Ok(false)
    }

    /// On-demand groups are always re-evaluated, spot groups only when they
    /// cannot reach their desired capacity.
    pub async fn update_needed(&self, group: &ScalingGroup) -> bool {
        if !group.state().bid.is_spot() {
            return true;
        }
        match self.check_group_instances(group).await {
            Ok(converged) => !converged,
            Err(e) => {
                error!(asg = %group.name, "Checking instances failed: {:#}", e);
                false
            }
        }
    }

    /// Point the group at a fresh launch config carrying `bid`, then drop the
    /// old launch config.
    pub async fn update_scaling_group(&self, group: &ScalingGroup, bid: &Bid) -> anyhow::Result<()> {
        let current = group.state().launch_config;
        let new_name = rotated_launch_config_name(&current.name);
        info!(asg = %group.name, "Switching to bid {} with launch config {}", bid, new_name);

        retry_async(
            self.retry,
            "create launch configuration",
            || {
                self.scaling
                    .create_launch_config(&current.name, &new_name, bid.spot_price())
            },
            retry::always,
        )
        .await?;
        retry_async(
            self.retry,
            "update autoscaling group",
            || self.scaling.update_group_launch_config(&group.name, &new_name),
            retry::always,
        )
        .await?;
        retry_async(
            self.retry,
            "delete launch configuration",
            || self.scaling.delete_launch_config(&current.name),
            retry::always,
        )
        .await?;

        group.set_launch_config(
            LaunchConfigInfo {
                name: new_name,
                instance_type: current.instance_type,
                spot_price: bid.spot_price().map(str::to_string),
            },
            bid.clone(),
        );
        info!(asg = %group.name, "Updated to bid {}", bid);
        Ok(())
    }

    async fn reconcile_group(self: &Arc<Self>, group: &Arc<ScalingGroup>) -> anyhow::Result<()> {
        self.populate_instances(group).await?;
        self.schedule_instance_termination(group);
        if !self.update_needed(group).await {
            info!(asg = %group.name, "No update needed");
            return Ok(());
        }

        // Only single-zone groups are managed; the first zone prices the bid.
        let zone = group
            .zones
            .first()
            .ok_or_else(|| MinionError::NoZone(group.name.clone()))?;
        let state = group.state();
        let bid = self.advisor.new_bid(zone, &state.launch_config.instance_type);
        if are_bids_equal(&state.bid, &bid) {
            info!(asg = %group.name, "Bid {} unchanged", bid);
            return Ok(());
        }
        self.update_scaling_group(group, &bid).await
    }

    /// One pass over every managed group. A failing group does not stop the
    /// others.
    pub async fn reconcile_once(self: &Arc<Self>) {
        for group in self.groups() {
            info!(asg = %group.name, "Processing autoscaling group");
            if let Err(e) = self.reconcile_group(&group).await {
                error!(asg = %group.name, "Reconciling failed: {:#}", e);
            }
        }
        let pending = self.pending_kills();
        if !pending.is_empty() {
            debug!("Kill checks pending for {:?}", pending);
        }
    }

    pub async fn run(self: Arc<Self>, period: Duration) {
        loop {
            self.reconcile_once().await;
            tokio::time::sleep(period).await;
        }
    }
}

/// Run the price refreshers, price reporter, REST API and reconciler until
/// interrupted.
pub async fn run(config: MinionConfig) -> anyhow::Result<()> {
    let sdk = aws_config::from_env()
        .region(aws_config::Region::new(config.region.clone()))
        .load()
        .await;
    let feed = AwsPriceFeed::new(&sdk, &config.region)?;
    let advisor = Arc::new(BidAdvisor::new(
        Box::new(feed),
        config.spot_threshold,
        config.spot_enabled,
    ));
    let manager = Arc::new(MinionManager::new(
        Arc::new(AwsScaling::new(&sdk)),
        advisor.clone(),
        config.scaling_groups.clone(),
    ));
    manager
        .discover()
        .await
        .context("discovering autoscaling groups")?;

    let client = kube::Client::try_default()
        .await
        .context("creating Kubernetes client")?;
    let settings = Arc::new(ConfigMapSettings::new(
        client,
        &config.config_map_namespace,
        config.config_map_name.clone(),
    ));

    let refresher = advisor.clone();
    let (on_demand_every, spot_every) = (config.on_demand_refresh, config.spot_refresh);
    tokio::spawn(async move { refresher.run(on_demand_every, spot_every).await });
    advisor.wait_for_prices(Duration::from_secs(60)).await;

    let reporter = PriceReporter::new(manager.clone());
    let report_period = config.report_period;
    tokio::spawn(async move { reporter.run(report_period).await });

    let state = RestState {
        settings,
        manager: manager.clone(),
    };
    let rest_addr = config.rest_addr;
    tokio::spawn(async move {
        if let Err(e) = rest::serve(rest_addr, state).await {
            error!("REST API stopped: {:#}", e);
        }
    });

    info!("Managing autoscaling groups {:?}", manager.group_names());
    tokio::select! {
        _ = manager.run(config.reconcile_period) => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Interrupted, shutting down");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFeed, FakeScaling, ScalingCall};
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn kill_delay_in_current_hour() {
        // Launched at 10:00, now 12:10: 10 minutes into the billing hour.
        let d = kill_delay(at(10, 0, 0), at(12, 10, 0), 45);
        assert_eq!(d, Duration::from_secs(35 * 60));
        let d = kill_delay(at(10, 5, 30), at(10, 5, 30), 40);
        assert_eq!(d, Duration::from_secs(40 * 60));
    }

    #[test]
    fn kill_delay_rolls_into_next_hour() {
        let d = kill_delay(at(10, 0, 0), at(10, 50, 0), 45);
        assert_eq!(d, Duration::from_secs(55 * 60));
    }

    async fn priced_advisor(spot: f64) -> Arc<BidAdvisor> {
        let feed = FakeFeed::default();
        feed.set_on_demand("m3.large", 0.133);
        feed.add_spot("us-west-2a", "m3.large", spot, 100);
        let advisor = BidAdvisor::new(Box::new(feed), 0.8, true).with_retry(RetryPolicy::immediate(1));
        advisor.refresh_on_demand().await.unwrap();
        advisor.refresh_spot().await.unwrap();
        Arc::new(advisor)
    }

    fn manager(scaling: &Arc<FakeScaling>, advisor: Arc<BidAdvisor>) -> Arc<MinionManager> {
        Arc::new(
            MinionManager::new(scaling.clone(), advisor, vec!["minions".to_string()])
                .with_retry(RetryPolicy::immediate(2))
                .with_converge_delay(Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn cheap_spot_rewrites_launch_config() {
        let scaling = Arc::new(FakeScaling::default());
        scaling.add_group("minions", "minion-lc", None, 2);
        scaling.add_instance("minions", "i-1", true, Utc::now());
        scaling.add_instance("minions", "i-2", true, Utc::now());
        let mm = manager(&scaling, priced_advisor(0.03).await);

        mm.discover().await.unwrap();
        assert_eq!(mm.groups()[0].state().bid, Bid::OnDemand);
        mm.reconcile_once().await;

        let calls = scaling.mutations();
        assert_eq!(
            calls,
            vec![
                ScalingCall::CreateLaunchConfig {
                    from: "minion-lc".into(),
                    name: "minion-lc-0".into(),
                    spot_price: Some("0.133".into()),
                },
                ScalingCall::UpdateGroup {
                    group: "minions".into(),
                    launch_config: "minion-lc-0".into(),
                },
                ScalingCall::DeleteLaunchConfig("minion-lc".into()),
            ]
        );
        let state = mm.groups()[0].state();
        assert_eq!(state.launch_config.name, "minion-lc-0");
        assert_eq!(state.launch_config.spot_price.as_deref(), Some("0.133"));
        assert!(state.bid.is_spot());
    }

    #[tokio::test]
    async fn expensive_spot_keeps_on_demand() {
        let scaling = Arc::new(FakeScaling::default());
        scaling.add_group("minions", "minion-lc", None, 1);
        let mm = manager(&scaling, priced_advisor(0.13).await);

        mm.discover().await.unwrap();
        mm.reconcile_once().await;
        assert!(scaling.mutations().is_empty());
    }

    #[tokio::test]
    async fn converged_spot_group_is_left_alone() {
        let scaling = Arc::new(FakeScaling::default());
        scaling.add_group("minions", "minion-lc-0", Some("0.5"), 1);
        scaling.add_instance("minions", "i-1", true, Utc::now());
        let mm = manager(&scaling, priced_advisor(0.03).await);

        mm.discover().await.unwrap();
        let group = mm.groups()[0].clone();
        assert!(!mm.update_needed(&group).await);
        mm.reconcile_once().await;
        assert!(scaling.mutations().is_empty());
    }

    #[tokio::test]
    async fn starved_spot_group_falls_back_to_on_demand() {
        let scaling = Arc::new(FakeScaling::default());
        scaling.add_group("minions", "minion-lc-0", Some("0.133"), 2);
        let mm = manager(&scaling, priced_advisor(0.12).await);

        mm.discover().await.unwrap();
        mm.reconcile_once().await;

        assert_eq!(
            scaling.mutations()[0],
            ScalingCall::CreateLaunchConfig {
                from: "minion-lc-0".into(),
                name: "minion-lc".into(),
                spot_price: None,
            }
        );
        assert_eq!(mm.groups()[0].state().bid, Bid::OnDemand);
    }

    #[tokio::test]
    async fn on_demand_instances_get_one_timer_each() {
        let scaling = Arc::new(FakeScaling::default());
        scaling.add_group("minions", "minion-lc", None, 2);
        scaling.add_instance("minions", "i-od", false, Utc::now());
        scaling.add_instance("minions", "i-spot", true, Utc::now());
        let mm = manager(&scaling, priced_advisor(0.13).await);
        mm.discover().await.unwrap();

        mm.reconcile_once().await;
        mm.reconcile_once().await;
        assert_eq!(mm.pending_kills(), vec!["i-od"]);
    }

    #[tokio::test]
    async fn run_or_die_terminates_only_when_spot_wins() {
        let scaling = Arc::new(FakeScaling::default());
        scaling.add_group("minions", "minion-lc", None, 1);
        scaling.add_instance("minions", "i-od", false, Utc::now());

        let keep = manager(&scaling, priced_advisor(0.13).await);
        keep.discover().await.unwrap();
        let group = keep.groups()[0].clone();
        keep.populate_instances(&group).await.unwrap();
        let instance = group.state().instances["i-od"].clone();
        keep.run_or_die(&group, &instance).await;
        assert!(scaling.terminated().is_empty());
        assert!(group.state().instances.contains_key("i-od"));

        let kill = manager(&scaling, priced_advisor(0.03).await);
        kill.discover().await.unwrap();
        let group = kill.groups()[0].clone();
        kill.populate_instances(&group).await.unwrap();
        kill.run_or_die(&group, &instance).await;
        assert_eq!(scaling.terminated(), vec!["i-od"]);
        assert!(!group.state().instances.contains_key("i-od"));
        assert!(kill.pending_kills().is_empty());
    }

    #[tokio::test]
    async fn departed_instances_are_forgotten() {
        let scaling = Arc::new(FakeScaling::default());
        scaling.add_group("minions", "minion-lc", None, 2);
        scaling.add_instance("minions", "i-od", false, Utc::now());
        let mm = manager(&scaling, priced_advisor(0.13).await);
        mm.discover().await.unwrap();
        let group = mm.groups()[0].clone();

        mm.reconcile_once().await;
        assert_eq!(mm.pending_kills(), vec!["i-od"]);

        scaling.remove_instance("minions", "i-od");
        scaling.add_instance("minions", "i-new", true, Utc::now());
        mm.populate_instances(&group).await.unwrap();
        let ids: Vec<String> = group.state().instances.into_keys().collect();
        assert_eq!(ids, vec!["i-new"]);
        assert!(mm.pending_kills().is_empty());

        scaling.set_desired("minions", 0);
        mm.populate_instances(&group).await.unwrap();
        assert!(group.state().instances.is_empty());
        assert!(scaling.terminated().is_empty());
    }

    #[tokio::test]
    async fn reload_replaces_group_set() {
        let scaling = Arc::new(FakeScaling::default());
        scaling.add_group("minions", "minion-lc", None, 1);
        scaling.add_group("workers", "worker-lc", Some("0.2"), 1);
        let mm = manager(&scaling, priced_advisor(0.13).await);
        mm.discover().await.unwrap();
        assert_eq!(mm.groups().len(), 1);

        mm.set_scaling_groups(vec!["minions".into(), "workers".into()])
            .await
            .unwrap();
        let names: Vec<String> = mm.groups().iter().map(|g| g.name.clone()).collect();
        assert_eq!(names, vec!["minions", "workers"]);
        assert!(mm.groups()[1].state().bid.is_spot());
    }
}
