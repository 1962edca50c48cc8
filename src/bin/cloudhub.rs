//! `cloudhub` server binary.
//!
//! Loads the TOML configuration (plus `CLOUDHUB_*` environment overrides and command-line
//! flags), binds the TLS listener and serves edge nodes until interrupted.

use clap::Parser;
use cloudhub::{CloudHub, HubConfig, HubError};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Cloud-side hub for edge nodes.
#[derive(Parser, Debug)]
#[command(name = "cloudhub")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to accept edge connections on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Maximum number of connected nodes
    #[arg(long)]
    node_limit: Option<usize>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(cli: &Cli) -> Result<HubConfig, HubError> {
    let mut config = HubConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(limit) = cli.node_limit {
        config.node_limit = limit;
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<(), HubError> {
    let hub = CloudHub::from_config(load_config(&cli)?)?;
    hub.start();
    let listener = hub.bind().await?;

    let served = tokio::select! {
        served = hub.serve(listener) => served,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(target: "cloudhub::hub", "interrupt received");
            Ok(())
        }
    };
    hub.shutdown().await;
    served
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(target: "cloudhub::hub", error = %err, "cloudhub exited");
            ExitCode::FAILURE
        }
    }
}
