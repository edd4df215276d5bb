mod cli;
mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use localci_engine::EngineConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let config_path = cli.config.or_else(config::find_default_config);

    let config = if let Some(path) = config_path {
        tracing::info!("Loading config from: {}", path.display());
        config::load_engine_config(&path)?
    } else {
        tracing::debug!("No config file found, using defaults");
        EngineConfig::default()
    };

    match commands::execute_command(cli.command, config).await {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
