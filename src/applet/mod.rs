//! The per-node applet: ships container logs and keeps application managers
//! informed about the pods on this node.

pub mod amclient;
pub mod artifacts;
pub mod collector;
pub mod handshake;
pub mod plm;
pub mod store;
pub mod sync;

use crate::cluster::ClusterLayout;
use crate::config::AppletConfig;
use crate::kubernetes::{NodePods, PodSource};
use crate::objstore::{ObjectStore, S3Store};
use crate::retry;
use amclient::AmClient;
use anyhow::Context;
use artifacts::ArtifactClient;
use collector::CollectorContext;
use handshake::{HandshakeServer, RtsHandler};
use plm::PodLogManagerPool;
use std::sync::Arc;
use std::time::Duration;
use store::ApplicationRecord;
use sync::PodSync;
use tracing::{error, info};

pub struct Applet {
    sync: Arc<PodSync>,
    handshake: HandshakeServer,
    sync_period: Duration,
}

impl Applet {
    /// Connect to every external service. Fails when the record store cannot
    /// be opened or the cluster buckets are missing.
    pub async fn new(config: AppletConfig) -> anyhow::Result<Self> {
        let sdk = aws_config::load_from_env().await;
        let objstore: Arc<dyn ObjectStore> = Arc::new(S3Store::new(&sdk));
        let layout = ClusterLayout::resolve(&config, objstore.as_ref()).await?;
        info!(
            "Cluster {} shipping to {} and {}",
            layout.name_id, layout.data_bucket, layout.log_bucket
        );

        let client = kube::Client::try_default()
            .await
            .context("creating Kubernetes client")?;
        let pods: Arc<dyn PodSource> = Arc::new(NodePods::new(client, config.node_name.clone()));

        let store = Arc::new(
            ApplicationRecord::open(&config.db_path, &config.record_version)
                .await
                .with_context(|| format!("opening record store {}", config.db_path.display()))?,
        );
        let ctx = Arc::new(CollectorContext {
            log_root: config.log_root.clone(),
            layout,
            objstore,
            artifacts: ArtifactClient::new(config.artifact_url.clone())?,
            store: store.clone(),
            upload_retry: retry::NETWORK,
            app_mode: config.app_mode,
            rewatch_delay: Duration::from_secs(5),
        });
        let pool = Arc::new(PodLogManagerPool::new(ctx, config.collect_aux_logs));
        let am = Arc::new(AmClient::new(
            config.am_url_template.clone(),
            config.record_version.clone(),
        )?);

        let handler = RtsHandler::new(pods.clone(), store.clone(), pool.clone(), am.clone());
        let handshake = HandshakeServer::new(
            config.socket_path.clone(),
            config.handshake_version.clone(),
            handler,
        );
        Ok(Self {
            sync: Arc::new(PodSync::new(pods, store, pool, am)),
            handshake,
            sync_period: config.sync_period,
        })
    }

    /// Restore collectors for persisted pods, then serve handshakes and sync
    /// until interrupted.
    pub async fn run(self) -> anyhow::Result<()> {
        if let Err(e) = self.sync.nanny_existing_pods().await {
            error!("Restoring collectors for persisted pods failed: {:#}", e);
        }
        let listener = self.handshake.bind()?;

        let sync = self.sync.clone();
        let period = self.sync_period;
        tokio::spawn(async move { sync.run(period).await });

        tokio::select! {
            _ = self.handshake.serve(listener) => {}
            res = tokio::signal::ctrl_c() => {
                res?;
                info!("Interrupted, shutting down");
            }
        }
        Ok(())
    }
}
