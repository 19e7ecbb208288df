use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Config;

mod cluster;

pub use cluster::*;

/// vtds - virtual test and development cluster deployment
///
/// Deploys a declaratively configured cluster of KVM guests onto an
/// already-provisioned fleet of hypervisor blades, wiring the guests
/// together over VXLAN overlay networks.
#[derive(Parser)]
#[command(name = "vtds")]
#[command(about = "Deploy virtual test clusters onto hypervisor blades")]
#[command(
    long_about = "vtds materializes a declarative cluster configuration into a per-blade\n\
plan, builds an L2 overlay mesh of virtual networks across the blades,\n\
provisions KVM guests with disks, netplan and addressing, and stands up\n\
DHCPv4 service on the blades that own each subnet."
)]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file path
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Materialize the per-blade plan from a cluster configuration
    Prepare(PrepareArgs),

    /// Validate a prepared cluster configuration
    Validate(ValidateArgs),

    /// Deploy the prepared cluster to all blades
    Deploy(DeployArgs),

    /// Remove cluster layer resources
    Remove(RemoveArgs),

    /// Show virtual nodes or networks from the plan
    Show(ShowArgs),
}

impl Cli {
    pub async fn execute(&self, config: &Config) -> Result<()> {
        match &self.command {
            Some(Commands::Prepare(args)) => args.execute(config).await,
            Some(Commands::Validate(args)) => args.execute(config).await,
            Some(Commands::Deploy(args)) => args.execute(config).await,
            Some(Commands::Remove(args)) => args.execute(config).await,
            Some(Commands::Show(args)) => args.execute(config).await,
            None => {
                println!("Use --help to see available commands");
                Ok(())
            }
        }
    }
}
