mod applet;
mod cli;
mod cluster;
mod config;
mod kubernetes;
mod minion;
mod objstore;
mod retry;
#[cfg(test)]
mod testing;
mod types;
mod utils;

use applet::Applet;
use applet::amclient::AmClient;
use applet::handshake::{self, OK_TO_START};
use clap::Parser;
use cli::{Cli, Command};
use config::{AppletConfig, FileConfig, MinionConfig};
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Applet => {
            let file = FileConfig::load(cli.config.as_deref())?;
            let config = AppletConfig::from_env(&file)?;
            info!(
                "Starting applet on node {} watching {}",
                config.node_name,
                config.log_root.display()
            );
            Applet::new(config).await?.run().await
        }
        Command::MinionManager => {
            let file = FileConfig::load(cli.config.as_deref())?;
            let config = MinionConfig::from_env(&file)?;
            info!("Starting minion manager in {}", config.region);
            minion::run(config).await
        }
        Command::Handshake {
            socket,
            message,
            timeout,
        } => {
            let reply = handshake::request(&socket, &message, Duration::from_secs(timeout)).await?;
            println!("{}", reply);
            if reply != OK_TO_START {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::ArtifactLoad {
            app,
            pod,
            deployment_id,
            failed,
        } => {
            let file = FileConfig::load(cli.config.as_deref())?;
            let am = AmClient::new(
                config::am_url_template(&file, |k| std::env::var(k).ok()),
                config::RECORD_VERSION,
            )?;
            am.send_artifact_load(&app, &deployment_id, &pod, failed.as_deref())
                .await?;
            Ok(())
        }
    }
}
