//! Ready-to-start handshake over a unix socket. A user container asks
//! `V1##RTS##<pod>##<app>` and gets `OTS` once its logs are being collected.

use crate::applet::amclient::AmClient;
use crate::applet::plm::PodLogManagerPool;
use crate::applet::store::ApplicationRecord;
use crate::kubernetes::{PodSource, current_containers, pod_meta, pod_status_payload};
use crate::retry::{self, RetryPolicy, retry_async};
use crate::types::{HeartBeatType, PodKey};
use crate::utils::epoch_secs;
use anyhow::Context;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tracing::{debug, error, info, warn};

pub const MAX_MESSAGE: usize = 512;
pub const OK_TO_START: &str = "OTS";
const SEPARATOR: &str = "##";
const READY_TO_START: &str = "RTS";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message is not ASCII")]
    NotAscii,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unsupported version {0}")]
    Version(String),

    #[error("unsupported request {0}")]
    Request(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtsRequest {
    pub pod_name: String,
    pub app_name: String,
}

pub fn parse_request(raw: &str, version: &str) -> Result<RtsRequest, ProtocolError> {
    if !raw.is_ascii() {
        return Err(ProtocolError::NotAscii);
    }
    let parts: Vec<&str> = raw.trim().split(SEPARATOR).collect();
    let [ver, req, pod_name, app_name] = parts.as_slice() else {
        return Err(ProtocolError::Malformed(raw.trim().to_string()));
    };
    if *ver != version {
        return Err(ProtocolError::Version(ver.to_string()));
    }
    if *req != READY_TO_START {
        return Err(ProtocolError::Request(req.to_string()));
    }
    if pod_name.is_empty() || app_name.is_empty() {
        return Err(ProtocolError::Malformed(raw.trim().to_string()));
    }
    Ok(RtsRequest {
        pod_name: pod_name.to_string(),
        app_name: app_name.to_string(),
    })
}

/// Does the work behind an RTS: record the pod's containers, start their
/// collectors, and announce the pod to its application manager.
pub struct RtsHandler {
    pods: Arc<dyn PodSource>,
    store: Arc<ApplicationRecord>,
    pool: Arc<PodLogManagerPool>,
    am: Arc<AmClient>,
    retry: RetryPolicy,
}

impl RtsHandler {
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
            retry: retry::READY_TO_START,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn handle(&self, req: &RtsRequest) -> anyhow::Result<()> {
        retry_async(self.retry, "ready to start", || self.handle_once(req), retry::always).await
    }

    async fn handle_once(&self, req: &RtsRequest) -> anyhow::Result<()> {
        let key = PodKey::new(&req.app_name, &req.pod_name);
        let pod = self
            .pods
            .get_pod(&req.app_name, &req.pod_name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Pod {} not found", key))?;
        let containers = current_containers(&pod);
        if containers.is_empty() {
            anyhow::bail!("Pod {} has no started containers yet", key);
        }
        let meta = pod_meta(&pod);

        // Collectors of containers that are gone stop before their rows go.
        let stale: Vec<String> = self
            .store
            .load_all()
            .await?
            .get(&key)
            .map(|rec| {
                rec.containers
                    .iter()
                    .map(|c| c.container.id.clone())
                    .filter(|id| !containers.iter().any(|c| &c.id == id))
                    .collect()
            })
            .unwrap_or_default();
        self.pool.create_or_update(&key, &meta, &[], &stale).await;
        self.store.update_application(&key, &meta, &containers).await?;
        self.pool.create_or_update(&key, &meta, &containers, &[]).await;

        self.am
            .send_heartbeat(
                &req.app_name,
                &meta.deployment_id,
                HeartBeatType::BirthCry,
                epoch_secs(),
                pod_status_payload(&pod),
            )
            .await
            .context("sending birth cry")?;
        info!(pod = %key, "Ready to start with {} containers", containers.len());
        Ok(())
    }
}

pub struct HandshakeServer {
    socket_path: PathBuf,
    version: String,
    handler: RtsHandler,
    read_timeout: Duration,
}

impl HandshakeServer {
    pub fn new(socket_path: impl Into<PathBuf>, version: impl Into<String>, handler: RtsHandler) -> Self {
        Self {
            socket_path: socket_path.into(),
            version: version.into(),
            handler,
            read_timeout: Duration::from_secs(5),
        }
    }

    /// Bind the socket. A stale socket file from a previous run is replaced.
    pub fn bind(&self) -> anyhow::Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!("Removed stale socket {}", self.socket_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("removing {}", self.socket_path.display()));
            }
        }
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("binding {}", self.socket_path.display()))?;
        info!("Handshake server listening on {}", self.socket_path.display());
        Ok(listener)
    }

    /// Serve connections one at a time, forever.
    pub async fn serve(&self, listener: UnixListener) {
        let mut incoming = UnixListenerStream::new(listener);
        while let Some(conn) = incoming.next().await {
            match conn {
                Ok(stream) => self.handle_connection(stream).await,
                Err(e) => warn!("Handshake accept failed: {}", e),
            }
        }
    }

    async fn handle_connection(&self, mut stream: UnixStream) {
        let mut buf = vec![0u8; MAX_MESSAGE];
        let n = match tokio::time::timeout(self.read_timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                warn!("Handshake read failed: {}", e);
                return;
            }
            Err(_) => {
                warn!("Handshake read timed out");
                return;
            }
        };
        let raw = String::from_utf8_lossy(&buf[..n]);
        let reply = match parse_request(&raw, &self.version) {
            Ok(req) => match self.handler.handle(&req).await {
                Ok(()) => OK_TO_START,
                Err(e) => {
                    error!("Ready to start for {}.{} failed: {:#}", req.pod_name, req.app_name, e);
                    ""
                }
            },
            Err(e) => {
                warn!("Bad handshake message {:?}: {}", raw, e);
                ""
            }
        };
        if let Err(e) = stream.write_all(reply.as_bytes()).await {
            warn!("Handshake reply failed: {}", e);
        }
        if let Err(e) = stream.shutdown().await {
            debug!("Handshake shutdown failed: {}", e);
        }
    }
}

/// Client side of the handshake: send one message, return the reply.
pub async fn request(socket: &Path, message: &str, timeout: Duration) -> anyhow::Result<String> {
    let exchange = async {
        let mut stream = UnixStream::connect(socket)
            .await
            .with_context(|| format!("connecting to {}", socket.display()))?;
        stream.write_all(message.as_bytes()).await?;
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await?;
        anyhow::Ok(reply)
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| anyhow::anyhow!("No reply from {} within {:?}", socket.display(), timeout))?
}
