//! Zabbix to Cachet bridge binary

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zabbix_cachet::{Config, Result, StatusBridge};

#[derive(Debug, Parser)]
#[command(name = "zabbix-cachet", version, about = "Publish Zabbix IT services and problems to Cachet")]
struct Cli {
    /// YAML configuration file; environment variables override its values
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Validate the configuration and templates, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path),
        None => Ok(Config::from_env()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    initialize_tracing(&config);

    info!("Starting zabbix-cachet v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    let templates = match config.templates() {
        Ok(templates) => templates,
        Err(e) => {
            error!("Template validation failed: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Bridge configuration - Zabbix: {}, Cachet: {}, Root service: {}",
        config.zabbix.server,
        config.cachet.server,
        config.settings.root_service().unwrap_or("<all services>")
    );

    if cli.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let bridge = StatusBridge::new(config, templates).await?;

    if let Err(e) = bridge.start().await {
        error!("Bridge failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Structured JSON logging; RUST_LOG wins over the configured levels
fn initialize_tracing(config: &Config) {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(config.settings.log_filter()))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
