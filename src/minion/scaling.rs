//! The autoscaling and compute operations the minion manager drives.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct GroupInfo {
    pub name: String,
    pub launch_config_name: Option<String>,
    pub zones: Vec<String>,
    pub desired_capacity: i32,
    pub instance_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchConfigInfo {
    pub name: String,
    pub instance_type: String,
    pub spot_price: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceInfo {
    pub id: String,
    pub zone: String,
    pub instance_type: String,
    pub launch_time: DateTime<Utc>,
    /// Spot instances carry a lifecycle marker, on-demand ones do not.
    pub spot: bool,
}

#[async_trait]
pub trait ScalingApi: Send + Sync {
    async fn describe_groups(&self, names: &[String]) -> anyhow::Result<Vec<GroupInfo>>;

    async fn describe_launch_config(&self, name: &str) -> anyhow::Result<LaunchConfigInfo>;

    /// Copy launch config `from` to `new_name`, with `spot_price` set or
    /// cleared. An existing `new_name` is reused.
    async fn create_launch_config(
        &self,
        from: &str,
        new_name: &str,
        spot_price: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn update_group_launch_config(&self, group: &str, launch_config: &str)
    -> anyhow::Result<()>;

    async fn delete_launch_config(&self, name: &str) -> anyhow::Result<()>;

    async fn describe_instances(&self, ids: &[String]) -> anyhow::Result<Vec<InstanceInfo>>;

    async fn terminate_instance(&self, id: &str) -> anyhow::Result<()>;
}

/// Launch configs alternate between `name` and `name-0`.
pub fn rotated_launch_config_name(current: &str) -> String {
    match current.strip_suffix("-0") {
        Some(base) => base.to_string(),
        None => format!("{}-0", current),
    }
}
