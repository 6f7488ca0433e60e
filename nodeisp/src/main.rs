//! nodeisp: runs the nodeisp service stack on a single host.
//!
//! This daemon:
//! - Loads the YAML configuration
//! - Converges redis, postgres, gotenberg, the app and its worker as containers
//! - Points the reverse proxy at the app
//! - Runs the app scheduler every minute and persists state
//! - Reopens log files on SIGHUP

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod proxy;
mod server;
mod stack;

use config::Config;
use proxy::ProxyTarget;
use server::Server;

/// nodeisp daemon
#[derive(Parser, Debug)]
#[command(name = "nodeisp", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(long, env = "NODEISP_CONFIG", default_value = "/etc/node-isp/config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    std::fs::create_dir_all(&config.storage.logs)
        .with_context(|| format!("Failed to create {}", config.storage.logs.display()))?;
    let log_path = config.storage.logs.join("nodeisp.log");
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open {}", log_path.display()))?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nodeisp=info,nodeisp_service=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(log_file)),
        )
        .init();

    info!("Starting nodeisp {}", env!("CARGO_PKG_VERSION"));
    info!("Config: {}", args.config.display());

    let proxy = ProxyTarget::new();
    let server = Server::new(config, proxy).await?;
    server.run().await
}
