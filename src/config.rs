//! Configuration: built-in defaults, then an optional YAML file, then the
//! environment.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SOCKET: &str = "/var/run/applet.sock";
pub const DEFAULT_DB: &str = "/ax/applet/applet.db";
pub const DEFAULT_ARTIFACT_URL: &str = "http://axartifactmanager.axsys:9892";
pub const DEFAULT_AM_URL_TEMPLATE: &str = "http://axam.{app}:8968";
pub const RECORD_VERSION: &str = "v1";
pub const HANDSHAKE_VERSION: &str = "V1";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),

    #[error("failed to read config file {}: {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file {}: {}", .0.display(), .1)]
    Parse(PathBuf, #[source] serde_yaml::Error),
}

/// Optional YAML overrides. Every key is optional; the environment wins.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub applet: AppletFileConfig,
    pub minion_manager: MinionFileConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppletFileConfig {
    pub log_root: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub sync_period_secs: Option<u64>,
    pub artifact_url: Option<String>,
    pub am_url_template: Option<String>,
    pub collect_aux_logs: Option<bool>,
    pub app_mode: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MinionFileConfig {
    pub region: Option<String>,
    pub scaling_groups: Option<Vec<String>>,
    pub spot_enabled: Option<bool>,
    pub spot_threshold: Option<f64>,
    pub rest_addr: Option<SocketAddr>,
    pub reconcile_period_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.into(), e))?;
        Self::parse(path, &raw)
    }

    pub fn parse(path: &Path, raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(path.into(), e))
    }
}

#[derive(Debug, Clone)]
pub struct AppletConfig {
    pub node_name: String,
    pub log_root: PathBuf,
    pub socket_path: PathBuf,
    pub db_path: PathBuf,
    pub sync_period: Duration,
    pub record_version: String,
    pub handshake_version: String,
    pub customer_id: String,
    pub cluster_name_id: Option<String>,
    pub cluster_name: Option<String>,
    pub data_bucket: Option<String>,
    pub log_bucket: Option<String>,
    pub artifact_url: String,
    pub am_url_template: String,
    /// Upload the unrotated tail of a log when its collector stops.
    pub app_mode: bool,
    pub collect_aux_logs: bool,
}

impl AppletConfig {
    pub fn from_env(file: &FileConfig) -> Result<Self, ConfigError> {
        Self::from_lookup(file, |k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(file: &FileConfig, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let f = &file.applet;
        let log_root = env("LOGMOUNT_PATH")
            .map(PathBuf::from)
            .or_else(|| f.log_root.clone())
            .ok_or(ConfigError::Missing("LOGMOUNT_PATH"))?;
        let customer_id = env("AX_CUSTOMER_ID").ok_or(ConfigError::Missing("AX_CUSTOMER_ID"))?;
        let node_name = env("NODE_NAME")
            .or_else(|| env("HOSTNAME"))
            .ok_or(ConfigError::Missing("NODE_NAME"))?;

        let sync_secs = match env("APPLET_SYNC_PERIOD") {
            Some(v) => parse_secs("APPLET_SYNC_PERIOD", &v)?,
            None => f.sync_period_secs.unwrap_or(10),
        };
        if sync_secs == 0 {
            return Err(ConfigError::Invalid(
                "APPLET_SYNC_PERIOD",
                "must be greater than zero".into(),
            ));
        }

        Ok(Self {
            node_name,
            log_root,
            socket_path: env("APPLET_SOCK")
                .map(PathBuf::from)
                .or_else(|| f.socket_path.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET)),
            db_path: env("APPLET_DB")
                .map(PathBuf::from)
                .or_else(|| f.db_path.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB)),
            sync_period: Duration::from_secs(sync_secs),
            record_version: RECORD_VERSION.to_string(),
            handshake_version: HANDSHAKE_VERSION.to_string(),
            customer_id,
            cluster_name_id: env("AX_CLUSTER_NAME_ID").filter(|s| !s.is_empty()),
            cluster_name: env("AX_CLUSTER_NAME").filter(|s| !s.is_empty()),
            data_bucket: env("ARGO_DATA_BUCKET_NAME").filter(|s| !s.is_empty()),
            log_bucket: env("ARGO_LOG_BUCKET_NAME").filter(|s| !s.is_empty()),
            artifact_url: env("AX_ARTIFACT_MANAGER_URL")
                .or_else(|| f.artifact_url.clone())
                .unwrap_or_else(|| DEFAULT_ARTIFACT_URL.to_string()),
            am_url_template: am_url_template(file, &env),
            app_mode: f.app_mode.unwrap_or(true),
            collect_aux_logs: f.collect_aux_logs.unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MinionConfig {
    pub region: String,
    pub scaling_groups: Vec<String>,
    pub spot_enabled: bool,
    /// Spot is chosen when spot price <= threshold * on-demand price.
    pub spot_threshold: f64,
    pub rest_addr: SocketAddr,
    pub config_map_name: String,
    pub config_map_namespace: String,
    pub reconcile_period: Duration,
    pub on_demand_refresh: Duration,
    pub spot_refresh: Duration,
    pub report_period: Duration,
}

impl MinionConfig {
    pub fn from_env(file: &FileConfig) -> Result<Self, ConfigError> {
        Self::from_lookup(file, |k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(file: &FileConfig, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let f = &file.minion_manager;
        let region = env("AWS_REGION")
            .or_else(|| f.region.clone())
            .ok_or(ConfigError::Missing("AWS_REGION"))?;

        let scaling_groups = match env("MM_SCALING_GROUPS") {
            Some(v) => crate::utils::split_names(&v),
            None => f.scaling_groups.clone().unwrap_or_default(),
        };
        if scaling_groups.is_empty() {
            return Err(ConfigError::Missing("MM_SCALING_GROUPS"));
        }

        let spot_enabled = match env("MM_SPOT_INSTANCE_ENABLED") {
            Some(v) => parse_bool("MM_SPOT_INSTANCE_ENABLED", &v)?,
            None => f.spot_enabled.unwrap_or(true),
        };

        let spot_threshold = match env("MM_SPOT_THRESHOLD") {
            Some(v) => v.parse::<f64>().map_err(|_| {
                ConfigError::Invalid("MM_SPOT_THRESHOLD", format!("not a number: {}", v))
            })?,
            None => f.spot_threshold.unwrap_or(0.8),
        };
        if !(spot_threshold > 0.0 && spot_threshold <= 1.0) {
            return Err(ConfigError::Invalid(
                "MM_SPOT_THRESHOLD",
                format!("must be in (0, 1], got {}", spot_threshold),
            ));
        }

        let rest_addr = match env("MM_REST_ADDR") {
            Some(v) => v.parse().map_err(|_| {
                ConfigError::Invalid("MM_REST_ADDR", format!("not a socket address: {}", v))
            })?,
            None => f
                .rest_addr
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 6000))),
        };

        let reconcile_secs = match env("MM_RECONCILE_PERIOD") {
            Some(v) => parse_secs("MM_RECONCILE_PERIOD", &v)?,
            None => f.reconcile_period_secs.unwrap_or(600),
        };

        Ok(Self {
            region,
            scaling_groups,
            spot_enabled,
            spot_threshold,
            rest_addr,
            config_map_name: env("MM_CONFIG_MAP_NAME")
                .unwrap_or_else(|| "minion-manager-config".to_string()),
            config_map_namespace: env("MM_CONFIG_MAP_NAMESPACE")
                .unwrap_or_else(|| "kube-system".to_string()),
            reconcile_period: Duration::from_secs(reconcile_secs),
            on_demand_refresh: Duration::from_secs(4 * 3600),
            spot_refresh: Duration::from_secs(15 * 60),
            report_period: Duration::from_secs(15 * 60),
        })
    }
}

/// Application manager URL template, with `{app}` standing for the
/// application name.
pub fn am_url_template<F>(file: &FileConfig, env: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    env("AX_AM_URL_TEMPLATE")
        .or_else(|| file.applet.am_url_template.clone())
        .unwrap_or_else(|| DEFAULT_AM_URL_TEMPLATE.to_string())
}

fn parse_secs(key: &'static str, v: &str) -> Result<u64, ConfigError> {
    v.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(key, format!("not a number of seconds: {}", v)))
}

/// Accepts `true`/`false` in any case, the way the config map stores them.
pub fn parse_bool(key: &'static str, v: &str) -> Result<bool, ConfigError> {
    match v.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::Invalid(key, format!("not a boolean: {}", v))),
    }
}
