use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ax-applet")]
#[command(about = "Per-node log shipping applet and spot minion manager")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// YAML file overriding built-in defaults
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the per-node applet
    Applet,

    /// Run the spot minion manager
    MinionManager,

    /// Send one handshake message and print the reply
    Handshake {
        /// Applet socket path
        socket: PathBuf,

        /// Message to send, e.g. V1##RTS##<pod>##<app>
        message: String,

        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 3)]
        timeout: u64,
    },

    /// Tell a pod's application manager that artifact loading started or failed
    ArtifactLoad {
        /// Application name
        app: String,

        /// Pod name
        pod: String,

        /// Deployment id
        deployment_id: String,

        /// Report a failure with this message
        #[arg(long)]
        failed: Option<String>,
    },
}
