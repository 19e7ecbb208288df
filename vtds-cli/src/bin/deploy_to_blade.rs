//! Blade agent entrypoint. Runs on a blade against the uploaded plan
//! and reconciles the blade's networks, DHCP service and virtual nodes.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Deploy the cluster layer onto this blade
#[derive(Parser)]
#[command(name = "deploy_to_blade")]
#[command(about = "Reconcile one blade against a serialized cluster plan")]
#[command(version)]
struct Cli {
    /// Name of the blade class this blade belongs to
    blade_class: String,

    /// Instance number of this blade within its class
    blade_instance: usize,

    /// Path to the serialized cluster plan to apply
    config_path: PathBuf,

    /// Directory holding the blade SSH keys
    ssh_keys_dir: PathBuf,
}

fn main() -> ExitCode {
    // Everything goes to stderr so the controller's per-blade log
    // capture picks it up.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match vtds_cli::agent::deploy_to_blade(
        &cli.blade_class,
        cli.blade_instance,
        &cli.config_path,
        &cli.ssh_keys_dir,
    ) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ERROR: {}", err);
            ExitCode::from(1)
        }
    }
}
