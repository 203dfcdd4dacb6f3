use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use backhaul::{config::Config, metrics, server::Server};

#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Reverse HTTP proxy with pluggable upstream load balancing")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "backhaul.yaml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Loading configuration from {:?}", args.config);

    let config = Config::load(&args.config)?;

    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    if let Some(ref metrics_config) = config.metrics {
        info!("Starting metrics endpoint on {}", metrics_config.address);
        if let Err(e) = metrics::start_metrics_server(&metrics_config.address) {
            warn!("Failed to start metrics endpoint: {}. Continuing without metrics.", e);
        }
    }

    let server = Server::new(&config)?;
    server.run().await?;

    Ok(())
}
