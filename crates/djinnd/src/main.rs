//! djinnd — the Djinn daemon.
//!
//! One binary, two roles:
//! - `controller`: the per-node Djinn controller (reconciliation loop,
//!   control plane, proxies, supervised services)
//! - `coordinator`: a standalone coordination server for deployments
//!   that do not embed one in their head node
//!
//! # Usage
//!
//! ```text
//! djinnd controller --config /etc/appscale/djinn.toml
//! djinnd coordinator --port 2181 --data-dir /opt/appscale/coordination
//! ```

mod controller;
mod coordinator;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use djinn_core::config::{LoggingConfig, ReconcileConfig};
use djinn_core::{DjinnConfig, LogFormat};

#[derive(Parser)]
#[command(name = "djinnd", about = "Djinn cluster controller daemon")]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = "/etc/appscale/djinn.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node controller.
    Controller {
        /// Control-plane listen port.
        #[arg(long)]
        port: Option<u16>,

        /// This node's private address.
        #[arg(long)]
        private_ip: Option<String>,

        /// This node's public address.
        #[arg(long)]
        public_ip: Option<String>,
    },
    /// Run a standalone coordination server.
    Coordinator {
        /// Listen port.
        #[arg(long)]
        port: Option<u16>,

        /// Directory for the persistent tree.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            if let Command::Controller { private_ip, .. } = &cli.command {
                let path = ReconcileConfig::default().crash_record_path;
                controller::leave_crash_record(&path, private_ip.as_deref().unwrap_or(""), &e);
            }
            return Err(e);
        }
    };
    init_tracing(&config.logging);

    match cli.command {
        Command::Controller {
            port,
            private_ip,
            public_ip,
        } => {
            if let Some(port) = port {
                config.control.port = port;
            }
            if let Some(ip) = private_ip {
                config.node.private_ip = ip;
            }
            if let Some(ip) = public_ip {
                config.node.public_ip = ip;
            }
            controller::run(config).await
        }
        Command::Coordinator { port, data_dir } => {
            if let Some(port) = port {
                config.coordination.port = port;
            }
            if let Some(dir) = data_dir {
                config.coordination.data_dir = dir;
            }
            coordinator::run(config).await
        }
    }
}

/// A missing file is fine when the node addresses come from flags.
fn load_config(cli: &Cli) -> anyhow::Result<DjinnConfig> {
    if cli.config.exists() {
        return DjinnConfig::from_file(&cli.config)
            .map_err(|e| anyhow::anyhow!("loading {}: {e}", cli.config.display()));
    }
    Ok(DjinnConfig::for_node("", ""))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
