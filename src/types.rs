use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform containers injected into every pod. Their logs are not user logs.
pub const AUX_CONTAINERS: [&str; 5] = [
    "axworkflowexecutor",
    "axsidekickwait",
    "axinit",
    "axpull",
    "axdindhelper",
];

pub fn is_aux_container(name: &str) -> bool {
    AUX_CONTAINERS.contains(&name)
}

/// A pod on this node. The namespace is the application name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub pod_name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, pod_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pod_name, self.namespace)
    }
}

/// A container instance. A restart yields a new id under the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerRef {
    pub name: String,
    pub id: String,
}

impl ContainerRef {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }
}

/// Identifiers the platform attaches to every deployment pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodMeta {
    pub app_id: String,
    pub deployment_id: String,
    pub deployment_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeartBeatType {
    BirthCry,
    HeartBeat,
    TombStone,
    ArtifactLoadStart,
    ArtifactLoadFailed,
}

impl fmt::Display for HeartBeatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HeartBeatType::BirthCry => "BIRTH_CRY",
            HeartBeatType::HeartBeat => "HEART_BEAT",
            HeartBeatType::TombStone => "TOMB_STONE",
            HeartBeatType::ArtifactLoadStart => "ARTIFACT_LOAD_START",
            HeartBeatType::ArtifactLoadFailed => "ARTIFACT_LOAD_FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartBeat {
    pub key: String,
    pub date: i64,
    pub data: HeartBeatData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartBeatData {
    pub version: String,
    #[serde(rename = "type")]
    pub kind: HeartBeatType,
    #[serde(rename = "podStatus")]
    pub pod_status: serde_json::Value,
}

/// `<name>-<uuid>` cluster identity; every artifact path is prefixed with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNameId {
    pub name: String,
    pub id: String,
}

impl ClusterNameId {
    const UUID_LEN: usize = 36;

    pub fn parse(name_id: &str) -> Result<Self, ConfigError> {
        let name_id = name_id.trim();
        let invalid = |why: &str| {
            ConfigError::Invalid("AX_CLUSTER_NAME_ID", format!("{}: {}", name_id, why))
        };
        let split = name_id
            .len()
            .checked_sub(Self::UUID_LEN)
            .filter(|&at| at >= 2 && name_id.is_char_boundary(at))
            .ok_or_else(|| invalid("expected <name>-<uuid>"))?;
        let (name, id) = name_id.split_at(split);
        let name = name
            .strip_suffix('-')
            .ok_or_else(|| invalid("expected <name>-<uuid>"))?;
        uuid::Uuid::parse_str(id).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            id: id.to_string(),
        })
    }

    pub fn artifact_prefix(&self) -> String {
        format!("{}/{}/artifacts", self.name, self.id)
    }
}

impl fmt::Display for ClusterNameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.id)
    }
}
