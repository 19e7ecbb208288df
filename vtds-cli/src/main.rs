use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vtds_cli::cli::Cli;
use vtds_cli::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments first so logging flags apply.
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // Load configuration - respect the --config flag if provided
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_file(config_path)?
    } else {
        Config::load()?
    };

    info!("Starting vtds CLI application");

    // Execute the command
    cli.execute(&config).await
}
