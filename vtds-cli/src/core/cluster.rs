//! Cluster lifecycle: prepare, validate, deploy, remove, and access to
//! the API objects. `prepare()` must run before everything else; it is
//! the step that turns the declarative configuration into the plan the
//! blades consume.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::cluster_config::{ClusterConfig, ClusterPlan};
use crate::config::Config;
use crate::core::fanout::BladeFanout;
use crate::core::nodes::{Common, VirtualNetworks, VirtualNodes};
use crate::core::plan::PlanBuilder;
use crate::core::provider::BladeProvider;
use crate::errors::{ClusterError, ConfigError, VtdsResult};

/// Name of the serialized plan file under the build directory.
pub const PLAN_FILE_NAME: &str = "blade_core_config.yaml";

pub struct Cluster {
    config: ClusterConfig,
    provider: Arc<dyn BladeProvider>,
    build_dir: PathBuf,
    plan_path: PathBuf,
    vm_xml_template: PathBuf,
    agent_path: PathBuf,
    agent_name: String,
    deploy_timeout: Option<Duration>,
    common: Option<Arc<Common>>,
}

impl Cluster {
    pub fn new(
        settings: &Config,
        config: ClusterConfig,
        provider: Arc<dyn BladeProvider>,
    ) -> Self {
        let build_dir = settings.cluster.build_dir.clone();
        let plan_path = build_dir.join(PLAN_FILE_NAME);
        Self {
            config,
            provider,
            build_dir,
            plan_path,
            vm_xml_template: settings.cluster.vm_xml_template.clone(),
            agent_path: settings.cluster.agent_path.clone(),
            agent_name: settings.cluster.agent_name.clone(),
            deploy_timeout: settings.cluster.deploy_timeout.map(Duration::from_secs),
            common: None,
        }
    }

    /// Materialize the plan and write it to the build directory.
    pub fn prepare(&mut self) -> VtdsResult<()> {
        let vm_xml = std::fs::read_to_string(&self.vm_xml_template).map_err(|_| {
            ConfigError::FileNotFound {
                path: self.vm_xml_template.display().to_string(),
            }
        })?;
        let builder = PlanBuilder::new(self.provider.as_ref(), vm_xml);
        let plan = builder.build(self.config.clone())?;
        plan.to_file(&self.plan_path)?;
        info!("cluster plan written to '{}'", self.plan_path.display());
        self.common = Some(Arc::new(Common::new(
            plan,
            self.provider.clone(),
            &self.build_dir,
        )));
        Ok(())
    }

    fn common(&self, operation: &str) -> VtdsResult<&Arc<Common>> {
        self.common.as_ref().ok_or_else(|| {
            ClusterError::NotPrepared {
                operation: operation.to_string(),
            }
            .into()
        })
    }

    pub fn validate(&self) -> VtdsResult<()> {
        self.common("validate")?;
        info!("validating kvm cluster layer");
        Ok(())
    }

    /// Fan the plan and the agent out to every blade and run the agent
    /// everywhere.
    pub async fn deploy(&self) -> VtdsResult<()> {
        self.common("deploy")?;
        let fanout = BladeFanout::new(self.provider.as_ref(), self.deploy_timeout);
        fanout
            .deploy(&self.plan_path, &self.agent_path, &self.agent_name)
            .await
    }

    /// Resources created on the blades are removed when the blades
    /// themselves are, so removal only verifies preparation.
    pub fn remove(&self) -> VtdsResult<()> {
        self.common("remove")?;
        info!("nothing to remove at the cluster layer");
        Ok(())
    }

    pub fn virtual_nodes(&self) -> VtdsResult<VirtualNodes> {
        Ok(VirtualNodes::new(self.common("query nodes on")?.clone()))
    }

    pub fn virtual_networks(&self) -> VtdsResult<VirtualNetworks> {
        Ok(VirtualNetworks::new(self.common("query networks on")?.clone()))
    }

    pub fn plan(&self) -> VtdsResult<&ClusterPlan> {
        Ok(self.common("inspect")?.plan())
    }

    pub fn plan_path(&self) -> &Path {
        &self.plan_path
    }
}
