//! fleetgate - an intercepting SSH gateway for fleetctl.
//!
//! Speaks enough sshd to satisfy a fleetctl client: answers its control
//! channel with a filtered fleet API, and masquerades as the SSH server of
//! whatever node the client tunnels to.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use fleetgate::config::GatewayConfig;
use fleetgate::policy::StaticResolver;
use fleetgate::ssh;

/// fleetgate - policy-enforcing SSH gateway for fleet clusters
#[derive(Parser, Debug)]
#[command(name = "fleetgate", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/fleetgate/gateway.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Handle --generate-config
    if cli.generate_config {
        let config = GatewayConfig::default();
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        return Ok(());
    }

    // Load configuration
    let mut config = GatewayConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    // Ensure required directories exist
    config.ensure_dirs()?;

    info!("Starting fleetgate");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Fleet socket: {}", config.fleet_socket_path.display());
    info!("  Identities: {}", config.identities.len());

    if config.identities.is_empty() {
        info!("No identities configured; every connection will be rejected");
    }

    let config = Arc::new(config);
    let resolver = Arc::new(StaticResolver::from_config(&config));

    ssh::run_server(config, resolver).await?;

    Ok(())
}
