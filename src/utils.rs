use chrono::{DateTime, Utc};
use regex::Regex;

/// Strip the runtime scheme (`docker://`, `containerd://`) from a container id.
pub fn strip_runtime_prefix(container_id: &str) -> &str {
    match container_id.find("://") {
        Some(pos) => &container_id[pos + 3..],
        None => container_id,
    }
}

pub fn epoch_secs() -> i64 {
    Utc::now().timestamp()
}

pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Split a whitespace separated list of names.
pub fn split_names(s: &str) -> Vec<String> {
    s.split_whitespace().map(|s| s.to_string()).collect()
}

/// Rotated log file name matcher for a single container id.
#[derive(Debug, Clone)]
pub struct RotatedLogMatcher {
    re: Regex,
}

impl RotatedLogMatcher {
    pub fn new(container_id: &str) -> Result<Self, regex::Error> {
        let pattern = format!(r"^{}-json\.log\.(\d+)(\.gz)?$", regex::escape(container_id));
        Ok(Self {
            re: Regex::new(&pattern)?,
        })
    }

    /// Rotation index of a rotated log file name, or None for anything else.
    pub fn rotation_index(&self, file_name: &str) -> Option<u32> {
        self.re
            .captures(file_name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.rotation_index(file_name).is_some()
    }
}

/// Object key for an uploaded artifact.
pub fn artifact_key(
    prefix: &str,
    date: Option<DateTime<Utc>>,
    root_id: &str,
    service_id: &str,
    name: &str,
) -> String {
    match date {
        Some(d) => format!(
            "{}/{}/{}/{}/{}",
            prefix,
            d.format("%Y/%m/%d"),
            root_id,
            service_id,
            name
        ),
        None => format!("{}/{}/{}/{}", prefix, root_id, service_id, name),
    }
}

/// Does an error message say the host name could not be resolved?
pub fn is_name_resolution_failure(msg: &str) -> bool {
    const MARKERS: [&str; 4] = [
        "dns error",
        "failed to lookup address",
        "Name or service not known",
        "No address associated with hostname",
    ];
    MARKERS.iter().any(|m| msg.contains(m))
}
