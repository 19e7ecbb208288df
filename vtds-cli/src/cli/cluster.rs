use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{ClusterConfig, Config};
use crate::core::cluster::Cluster;
use crate::core::provider::StaticProvider;

/// Materialize the per-blade plan from a cluster configuration
#[derive(Args)]
pub struct PrepareArgs {
    /// Cluster configuration file
    pub cluster_config: PathBuf,

    /// Provider definition file (defaults to the configured one)
    #[arg(long, value_name = "FILE")]
    pub provider: Option<PathBuf>,
}

impl PrepareArgs {
    pub async fn execute(&self, config: &Config) -> Result<()> {
        let mut cluster = load_cluster(config, &self.cluster_config, self.provider.as_deref())?;
        cluster.prepare()?;
        println!("plan written to {}", cluster.plan_path().display());
        Ok(())
    }
}

/// Validate a cluster configuration
#[derive(Args)]
pub struct ValidateArgs {
    /// Cluster configuration file
    pub cluster_config: PathBuf,

    /// Provider definition file (defaults to the configured one)
    #[arg(long, value_name = "FILE")]
    pub provider: Option<PathBuf>,
}

impl ValidateArgs {
    pub async fn execute(&self, config: &Config) -> Result<()> {
        let mut cluster = load_cluster(config, &self.cluster_config, self.provider.as_deref())?;
        cluster.prepare()?;
        cluster.validate()?;
        println!("cluster configuration is valid");
        Ok(())
    }
}

/// Deploy the cluster to all blades
#[derive(Args)]
pub struct DeployArgs {
    /// Cluster configuration file
    pub cluster_config: PathBuf,

    /// Provider definition file (defaults to the configured one)
    #[arg(long, value_name = "FILE")]
    pub provider: Option<PathBuf>,
}

impl DeployArgs {
    pub async fn execute(&self, config: &Config) -> Result<()> {
        let mut cluster = load_cluster(config, &self.cluster_config, self.provider.as_deref())?;
        cluster.prepare()?;
        cluster.deploy().await?;
        println!("cluster deployed");
        Ok(())
    }
}

/// Remove cluster layer resources
#[derive(Args)]
pub struct RemoveArgs {
    /// Cluster configuration file
    pub cluster_config: PathBuf,

    /// Provider definition file (defaults to the configured one)
    #[arg(long, value_name = "FILE")]
    pub provider: Option<PathBuf>,
}

impl RemoveArgs {
    pub async fn execute(&self, config: &Config) -> Result<()> {
        let mut cluster = load_cluster(config, &self.cluster_config, self.provider.as_deref())?;
        cluster.prepare()?;
        cluster.remove()?;
        Ok(())
    }
}

/// Show virtual nodes or networks from the plan
#[derive(Args)]
pub struct ShowArgs {
    /// What to show
    #[arg(value_enum)]
    pub resource: ShowResource,

    /// Cluster configuration file
    pub cluster_config: PathBuf,

    /// Provider definition file (defaults to the configured one)
    #[arg(long, value_name = "FILE")]
    pub provider: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ShowResource {
    Nodes,
    Networks,
}

impl ShowArgs {
    pub async fn execute(&self, config: &Config) -> Result<()> {
        let mut cluster = load_cluster(config, &self.cluster_config, self.provider.as_deref())?;
        cluster.prepare()?;
        match self.resource {
            ShowResource::Nodes => {
                let nodes = cluster.virtual_nodes()?;
                for node_class in nodes.node_classes() {
                    println!("{}:", node_class);
                    for instance in 0..nodes.node_count(&node_class)? {
                        println!("  {}", nodes.node_hostname(&node_class, instance, None)?);
                    }
                }
            }
            ShowResource::Networks => {
                let networks = cluster.virtual_networks()?;
                for name in networks.network_names() {
                    match networks.ipv4_cidr(&name)? {
                        Some(cidr) => println!("{}  {}", name, cidr),
                        None => println!("{}", name),
                    }
                }
            }
        }
        Ok(())
    }
}

fn load_cluster(
    config: &Config,
    cluster_config: &Path,
    provider: Option<&Path>,
) -> Result<Cluster> {
    let provider_path = provider
        .map(Path::to_path_buf)
        .or_else(|| config.cluster.provider_config.clone())
        .context(
            "no provider definition given; pass --provider or set 'provider_config' \
             in the vtds configuration",
        )?;
    let provider = StaticProvider::from_file(&provider_path, &config.cluster.build_dir)?;
    let document = ClusterConfig::from_file(cluster_config)?;
    Ok(Cluster::new(config, document, Arc::new(provider)))
}
