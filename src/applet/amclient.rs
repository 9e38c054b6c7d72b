//! Heartbeats to the per-application manager.

use crate::kubernetes::skeleton_status_with_reason;
use crate::retry::{self, RetryPolicy, retry_async};
use crate::types::{HeartBeat, HeartBeatData, HeartBeatType};
use crate::utils::{epoch_secs, is_name_resolution_failure};
use std::error::Error as _;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// The application manager's service name no longer resolves.
    #[error("application manager for {0} is gone")]
    AmGone(String),

    #[error("heartbeat request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("application manager returned {0}")]
    Status(reqwest::StatusCode),
}

impl HeartbeatError {
    fn is_retryable(&self) -> bool {
        match self {
            HeartbeatError::AmGone(_) => false,
            HeartbeatError::Http(_) => true,
            HeartbeatError::Status(s) => s.is_server_error(),
        }
    }
}

pub struct AmClient {
    http: reqwest::Client,
    url_template: String,
    version: String,
    retry: RetryPolicy,
}

impl AmClient {
    /// `url_template` contains `{app}`, replaced by the application name.
    pub fn new(url_template: impl Into<String>, version: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            url_template: url_template.into(),
            version: version.into(),
            retry: retry::NETWORK,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, app_name: &str) -> String {
        format!(
            "{}/v1/heartbeats",
            self.url_template.replace("{app}", app_name).trim_end_matches('/')
        )
    }

    /// Send one heartbeat. A manager that no longer resolves is not an error.
    pub async fn send_heartbeat(
        &self,
        app_name: &str,
        deployment_id: &str,
        kind: HeartBeatType,
        timestamp: i64,
        pod_status: serde_json::Value,
    ) -> Result<(), HeartbeatError> {
        let hb = HeartBeat {
            key: deployment_id.to_string(),
            date: timestamp,
            data: HeartBeatData {
                version: self.version.clone(),
                kind,
                pod_status,
            },
        };
        let url = self.url(app_name);
        let res = retry_async(
            self.retry,
            "heartbeat",
            || self.post(&url, app_name, &hb),
            HeartbeatError::is_retryable,
        )
        .await;
        match res {
            Err(HeartbeatError::AmGone(app)) => {
                debug!("Application manager for {} is gone, dropping {}", app, kind);
                Ok(())
            }
            other => other,
        }
    }

    /// Report artifact loading progress of a pod: started, or failed with
    /// `failure` as the message.
    pub async fn send_artifact_load(
        &self,
        app_name: &str,
        deployment_id: &str,
        pod_name: &str,
        failure: Option<&str>,
    ) -> Result<(), HeartbeatError> {
        let (kind, status) = match failure {
            None => (
                HeartBeatType::ArtifactLoadStart,
                skeleton_status_with_reason(pod_name, "Init", "Starting to load artifacts"),
            ),
            Some(msg) => (
                HeartBeatType::ArtifactLoadFailed,
                skeleton_status_with_reason(pod_name, "ArtifactPullFailed", msg),
            ),
        };
        self.send_heartbeat(app_name, deployment_id, kind, epoch_secs(), status)
            .await
    }

    async fn post(&self, url: &str, app_name: &str, hb: &HeartBeat) -> Result<(), HeartbeatError> {
        let resp = match self.http.post(url).json(hb).send().await {
            Ok(r) => r,
            Err(e) => {
                if e.is_connect() && is_name_resolution_failure(&error_chain(&e)) {
                    return Err(HeartbeatError::AmGone(app_name.to_string()));
                }
                return Err(e.into());
            }
        };
        let status = resp.status();
        if !status.is_success() {
            return Err(HeartbeatError::Status(status));
        }
        debug!("Sent {} for {} to {}", hb.data.kind, hb.key, url);
        Ok(())
    }
}

fn error_chain(e: &reqwest::Error) -> String {
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn posts_heartbeat_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/heartbeats"))
            .and(body_partial_json(json!({
                "key": "dep1",
                "date": 1234,
                "data": {"version": "v1", "type": "HEART_BEAT", "podStatus": {"name": "web-0"}}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = AmClient::new(server.uri(), "v1").unwrap();
        client
            .send_heartbeat("app1", "dep1", HeartBeatType::HeartBeat, 1234, json!({"name": "web-0"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retries_server_errors_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/heartbeats"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = AmClient::new(server.uri(), "v1")
            .unwrap()
            .with_retry(RetryPolicy::immediate(3));
        let err = client
            .send_heartbeat("app1", "dep1", HeartBeatType::BirthCry, 1, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, HeartbeatError::Status(s) if s.as_u16() == 503));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let client = AmClient::new(server.uri(), "v1")
            .unwrap()
            .with_retry(RetryPolicy::immediate(3));
        assert!(
            client
                .send_heartbeat("app1", "dep1", HeartBeatType::TombStone, 1, json!({}))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn artifact_load_events_carry_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "key": "dep1",
                "data": {
                    "type": "ARTIFACT_LOAD_FAILED",
                    "podStatus": {"name": "web-0", "reason": "ArtifactPullFailed", "message": "no such tag"}
                }
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "data": {"type": "ARTIFACT_LOAD_START", "podStatus": {"reason": "Init"}}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = AmClient::new(server.uri(), "v1").unwrap();
        client
            .send_artifact_load("app1", "dep1", "web-0", None)
            .await
            .unwrap();
        client
            .send_artifact_load("app1", "dep1", "web-0", Some("no such tag"))
            .await
            .unwrap();
    }

    #[test]
    fn url_substitutes_app_name() {
        let client = AmClient::new("http://axam.{app}:8968", "v1").unwrap();
        assert_eq!(client.url("shop"), "http://axam.shop:8968/v1/heartbeats");
    }

    #[test]
    fn resolution_failures_are_recognized() {
        assert!(is_name_resolution_failure(
            "error sending request: client error (Connect): dns error: failed to lookup address information: Name or service not known"
        ));
        assert!(!is_name_resolution_failure("connection refused"));
    }
}
